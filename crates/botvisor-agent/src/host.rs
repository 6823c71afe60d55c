use std::{process::Stdio, sync::Arc};

use botvisor_process::{BotId, BotState, Credential, OwnerId, Plan, ResourceSample};
use tokio::{
    process::Command,
    sync::{Mutex, mpsc},
    task::JoinHandle,
};

use crate::{
    config::AgentConfig,
    error::{HostError, Result},
    installer::Installer,
    logs::LogHub,
    monitor::ResourceMonitor,
    plans::{PlanProvider, effective_plan},
    quota,
    registry::{HostedBotRecord, Registry, Transition},
    restart::RestartController,
    store::RecordStore,
    supervisor::{ExitEvent, Supervisor},
};

const REQUIREMENTS_FILE: &str = "requirements.txt";

/// Everything the outward layer talks to: deploy, lifecycle operations,
/// logs and usage. Cheap to share behind an `Arc`.
pub struct Host {
    config: Arc<AgentConfig>,
    registry: Registry,
    plans: Arc<dyn PlanProvider>,
    installer: Installer,
    logs: LogHub,
    supervisor: Supervisor,
    monitor: ResourceMonitor,
    restarts: RestartController,
    exits: Mutex<Option<mpsc::UnboundedReceiver<ExitEvent>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Host {
    /// Loads persisted records from `data_root` and reconciles them.
    pub async fn open(config: AgentConfig, plans: Arc<dyn PlanProvider>) -> anyhow::Result<Self> {
        let store = RecordStore::new(config.records_dir());
        let registry = Registry::open(store).await?;
        Ok(Self::assemble(Arc::new(config), registry, plans))
    }

    /// A host without persistence.
    pub fn in_memory(config: AgentConfig, plans: Arc<dyn PlanProvider>) -> Self {
        Self::assemble(Arc::new(config), Registry::in_memory(), plans)
    }

    fn assemble(config: Arc<AgentConfig>, registry: Registry, plans: Arc<dyn PlanProvider>) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let logs = LogHub::new(config.clone());
        let supervisor = Supervisor::new(
            config.clone(),
            registry.clone(),
            logs.clone(),
            plans.clone(),
            exit_tx,
        );
        let monitor = ResourceMonitor::new(
            config.clone(),
            registry.clone(),
            supervisor.clone(),
            plans.clone(),
        );
        let restarts = RestartController::new(
            &config,
            registry.clone(),
            supervisor.clone(),
            logs.clone(),
            plans.clone(),
        );
        Self {
            installer: Installer::new(config.clone(), registry.clone()),
            config,
            registry,
            plans,
            logs,
            supervisor,
            monitor,
            restarts,
            exits: Mutex::new(Some(exit_rx)),
            background: Mutex::new(Vec::new()),
        }
    }

    /// Starts the resource monitor sweep and the auto-restart controller.
    /// Calling it twice is a no-op.
    pub async fn spawn_background(&self) {
        let Some(exits) = self.exits.lock().await.take() else {
            return;
        };
        let mut tasks = self.background.lock().await;
        tasks.push(tokio::spawn(self.monitor.clone().run()));
        tasks.push(tokio::spawn(self.restarts.clone().run(exits)));
        tracing::info!(
            sample_interval_ms = self.config.sample_interval.as_millis() as u64,
            "background tasks started"
        );
    }

    pub fn plan_for(&self, owner_id: &OwnerId) -> Plan {
        effective_plan(self.plans.as_ref(), owner_id)
    }

    /// Install plus credential supply in one call. A rejected credential
    /// never creates a record.
    pub async fn deploy(
        &self,
        owner_id: &OwnerId,
        plan: &Plan,
        archive_bytes: Vec<u8>,
        credential: &str,
    ) -> Result<HostedBotRecord> {
        let credential = Credential::parse(credential).ok_or(HostError::InvalidCredential)?;
        let plan = plan.effective(chrono::Utc::now());
        let record = self.installer.install(owner_id, &plan, archive_bytes).await?;
        match self.supply_with_plan(&record.id, credential, &plan).await {
            Ok(rec) => Ok(rec),
            Err(err) => {
                self.discard_install(&record).await;
                Err(err)
            }
        }
    }

    /// Undoes an install whose credential step failed: no record, no bundle,
    /// no logs. Leaves the record alone if something else already moved it on.
    async fn discard_install(&self, record: &HostedBotRecord) {
        if self
            .registry
            .remove(&record.id, BotState::AwaitingCredential)
            .await
            .is_none()
        {
            tracing::warn!(bot_id = %record.id, "deploy rollback skipped: record changed state");
            return;
        }
        if let Err(err) = tokio::fs::remove_dir_all(&record.working_dir).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(bot_id = %record.id, dir = %record.working_dir.display(), %err, "failed to remove bundle");
        }
        self.logs.remove(&record.id).await;
        tracing::info!(bot_id = %record.id, owner_id = %record.owner_id, "deploy rolled back");
    }

    /// Installs a bundle; the record waits in `awaiting_credential`.
    pub async fn install(&self, owner_id: &OwnerId, archive_bytes: Vec<u8>) -> Result<HostedBotRecord> {
        let plan = self.plan_for(owner_id);
        self.installer.install(owner_id, &plan, archive_bytes).await
    }

    pub async fn supply_credential(&self, id: &BotId, raw: &str) -> Result<HostedBotRecord> {
        let credential = Credential::parse(raw).ok_or(HostError::InvalidCredential)?;
        let record = self.get(id).await?;
        let plan = self.plan_for(&record.owner_id);
        self.supply_with_plan(id, credential, &plan).await
    }

    async fn supply_with_plan(
        &self,
        id: &BotId,
        credential: Credential,
        plan: &Plan,
    ) -> Result<HostedBotRecord> {
        let record = self.get(id).await?;
        if record.state() != BotState::AwaitingCredential {
            return Err(HostError::invalid_transition(id, "supply_credential", record.state()));
        }
        self.run_prelaunch(&record).await;

        let owner = record.owner_id.clone();
        match self
            .registry
            .transition(
                id,
                BotState::AwaitingCredential,
                BotState::Ready,
                |others| quota::can_start(&owner, plan, others, id),
                |r| {
                    r.credential = Some(credential);
                    r.message = None;
                },
            )
            .await
        {
            Transition::Applied(rec) => {
                tracing::info!(bot_id = %id, owner_id = %owner, "credential supplied");
                Ok(rec)
            }
            Transition::Denied => Err(HostError::QuotaExceeded {
                max_bots: plan.max_bots,
            }),
            Transition::Mismatch(None) => Err(HostError::NotFound(id.clone())),
            Transition::Mismatch(Some(state)) => {
                Err(HostError::invalid_transition(id, "supply_credential", state))
            }
        }
    }

    /// Dependency hook. Its outcome only ever lands in the bot's log.
    async fn run_prelaunch(&self, record: &HostedBotRecord) {
        let Some((program, args)) = self
            .config
            .prelaunch_cmd
            .as_ref()
            .and_then(|c| c.split_first())
        else {
            return;
        };
        let dir = record.launch_dir();
        if !dir.join(REQUIREMENTS_FILE).is_file() {
            return;
        }

        let sink = self.logs.sink(&record.id).await;
        sink.emit(format!("[botvisor] prelaunch: {program} {}", args.join(" ")))
            .await;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.config.prelaunch_timeout, cmd.output()).await;
        let status = match output {
            Ok(Ok(out)) => {
                for line in String::from_utf8_lossy(&out.stdout)
                    .lines()
                    .chain(String::from_utf8_lossy(&out.stderr).lines())
                {
                    sink.emit(format!("[prelaunch] {line}")).await;
                }
                if out.status.success() {
                    "ok".to_string()
                } else {
                    format!("failed ({})", out.status)
                }
            }
            Ok(Err(err)) => format!("failed to run: {err}"),
            Err(_) => format!(
                "timed out after {}s",
                self.config.prelaunch_timeout.as_secs()
            ),
        };
        tracing::info!(bot_id = %record.id, %status, "prelaunch hook finished");
        sink.emit(format!("[botvisor] prelaunch {status}")).await;
    }

    /// The owner's bots, oldest first. Deleted records are kept on disk but
    /// not listed.
    pub async fn list_bots(&self, owner_id: &OwnerId) -> Vec<HostedBotRecord> {
        self.registry
            .list_by_owner(owner_id)
            .await
            .into_iter()
            .filter(|r| r.state() != BotState::Deleted)
            .collect()
    }

    pub async fn get(&self, id: &BotId) -> Result<HostedBotRecord> {
        self.registry
            .get(id)
            .await
            .ok_or_else(|| HostError::NotFound(id.clone()))
    }

    pub async fn start(&self, id: &BotId) -> Result<HostedBotRecord> {
        self.supervisor.start(id).await
    }

    pub async fn stop(&self, id: &BotId) -> Result<HostedBotRecord> {
        self.supervisor.stop(id).await
    }

    pub async fn restart(&self, id: &BotId) -> Result<HostedBotRecord> {
        self.supervisor.restart(id).await
    }

    pub async fn delete(&self, id: &BotId) -> Result<HostedBotRecord> {
        let rec = self.supervisor.delete(id).await?;
        self.restarts.forget(id).await;
        Ok(rec)
    }

    pub async fn tail_log(&self, id: &BotId, max_lines: usize) -> Result<Vec<String>> {
        self.get(id).await?;
        Ok(self.logs.tail(id, max_lines).await)
    }

    pub async fn current_usage(&self, id: &BotId) -> Result<ResourceSample> {
        self.monitor.current_usage(id).await
    }

    /// Stops background tasks, then every running bot.
    pub async fn shutdown(&self) {
        for task in self.background.lock().await.drain(..) {
            task.abort();
        }
        self.supervisor.shutdown().await;
        tracing::info!("host shut down");
    }
}
