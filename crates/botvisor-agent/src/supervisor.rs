use std::{collections::HashMap, process::Stdio, sync::Arc, time::Duration};

use botvisor_process::{BotId, BotState, ExitInfo, ExitReason, OwnerId};
use chrono::{DateTime, Utc};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    sync::{Mutex, Notify, OwnedMutexGuard, mpsc, watch},
};

use crate::{
    config::AgentConfig,
    error::{HostError, Result},
    logs::{LogHub, LogSink},
    plans::{PlanProvider, effective_plan},
    quota::{self, LimitViolation},
    registry::{HostedBotRecord, Registry, Transition},
    sandbox,
};

/// Published whenever a supervised process is gone for good.
#[derive(Debug, Clone)]
pub struct ExitEvent {
    pub bot_id: BotId,
    pub owner_id: OwnerId,
    pub reason: ExitReason,
    pub exit_code: Option<i32>,
    /// Same instant as the record's `last_exit.at`; identifies this exit.
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default)]
struct ExitOutcome {
    code: Option<i32>,
    signal: Option<i32>,
}

impl ExitOutcome {
    fn from_status(status: &std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }

    fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(c), _) => format!("exit_code={c}"),
            (None, Some(s)) => format!("signal={s}"),
            (None, None) => "exit status unknown".to_string(),
        }
    }
}

struct LiveProcess {
    pid: u32,
    exited: watch::Receiver<Option<ExitOutcome>>,
    poke: Arc<Notify>,
}

async fn wait_exit(
    rx: &mut watch::Receiver<Option<ExitOutcome>>,
    limit: Duration,
) -> Option<ExitOutcome> {
    match tokio::time::timeout(limit, rx.wait_for(Option::is_some)).await {
        Ok(Ok(v)) => Some((*v).unwrap_or_default()),
        // The watcher only drops its sender after reaping the child.
        Ok(Err(_)) => Some(ExitOutcome::default()),
        Err(_) => None,
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, sig: libc::c_int) {
    let Ok(pgid) = i32::try_from(pid) else {
        return;
    };
    if pgid <= 1 {
        return;
    }
    // Children run in their own session, so pgid == pid.
    unsafe {
        libc::kill(-pgid, sig);
    }
}

/// Owns every child process: start, stop, restart, delete and exit detection.
///
/// Operations on one bot are serialised by a per-bot lock; different bots
/// never wait on each other.
#[derive(Clone)]
pub struct Supervisor {
    config: Arc<AgentConfig>,
    registry: Registry,
    logs: LogHub,
    plans: Arc<dyn PlanProvider>,
    live: Arc<Mutex<HashMap<BotId, LiveProcess>>>,
    op_locks: Arc<Mutex<HashMap<BotId, Arc<Mutex<()>>>>>,
    exits: mpsc::UnboundedSender<ExitEvent>,
}

impl Supervisor {
    pub fn new(
        config: Arc<AgentConfig>,
        registry: Registry,
        logs: LogHub,
        plans: Arc<dyn PlanProvider>,
        exits: mpsc::UnboundedSender<ExitEvent>,
    ) -> Self {
        Self {
            config,
            registry,
            logs,
            plans,
            live: Arc::new(Mutex::new(HashMap::new())),
            op_locks: Arc::new(Mutex::new(HashMap::new())),
            exits,
        }
    }

    async fn op_lock(&self, id: &BotId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.op_locks.lock().await;
            locks.entry(id.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    async fn record(&self, id: &BotId) -> Result<HostedBotRecord> {
        self.registry
            .get(id)
            .await
            .ok_or_else(|| HostError::NotFound(id.clone()))
    }

    pub async fn live_pid(&self, id: &BotId) -> Option<u32> {
        self.live.lock().await.get(id).map(|lp| lp.pid)
    }

    pub async fn live_pids(&self) -> Vec<(BotId, u32)> {
        self.live
            .lock()
            .await
            .iter()
            .map(|(id, lp)| (id.clone(), lp.pid))
            .collect()
    }

    /// Hint from the monitor that `pid` could not be sampled: the watcher
    /// re-checks the child right away instead of waiting for the next signal.
    pub async fn nudge(&self, id: &BotId, pid: u32) {
        if let Some(lp) = self.live.lock().await.get(id)
            && lp.pid == pid
        {
            lp.poke.notify_one();
        }
    }

    /// Removes the live handle if it still belongs to `pid`. Whoever removes it
    /// owns the final state transition for that process.
    async fn claim(&self, id: &BotId, pid: u32) -> bool {
        let mut live = self.live.lock().await;
        if live.get(id).is_some_and(|lp| lp.pid == pid) {
            live.remove(id);
            return true;
        }
        false
    }

    async fn finish(
        &self,
        id: &BotId,
        from: BotState,
        next: BotState,
        reason: ExitReason,
        outcome: ExitOutcome,
        message: String,
    ) -> Option<HostedBotRecord> {
        let info = ExitInfo {
            reason,
            exit_code: outcome.code,
            at: Utc::now(),
        };
        let at = info.at;
        let t = self
            .registry
            .transition(
                id,
                from,
                next,
                |_| true,
                |r| {
                    r.pid = None;
                    r.last_exit = Some(info);
                    r.message = Some(message);
                },
            )
            .await;
        sandbox::release(id, &self.config.sandbox);

        match t {
            Transition::Applied(rec) => {
                tracing::info!(bot_id = %id, state = %next, %reason, "bot process finished");
                let _ = self.exits.send(ExitEvent {
                    bot_id: id.clone(),
                    owner_id: rec.owner_id.clone(),
                    reason,
                    exit_code: outcome.code,
                    at,
                });
                Some(rec)
            }
            other => {
                tracing::debug!(bot_id = %id, from = %from, to = %next, result = ?other, "exit transition lost");
                None
            }
        }
    }

    pub async fn start(&self, id: &BotId) -> Result<HostedBotRecord> {
        let _guard = self.op_lock(id).await;
        self.start_locked(id).await
    }

    async fn start_locked(&self, id: &BotId) -> Result<HostedBotRecord> {
        let record = self.record(id).await?;
        let from = record.state();
        if !from.can_transition_to(BotState::Starting) {
            return Err(HostError::invalid_transition(id, "start", from));
        }
        let Some(credential) = record.credential.clone() else {
            return Err(HostError::invalid_transition(id, "start", from));
        };
        if self.live.lock().await.contains_key(id) {
            // Previous process not reaped yet.
            return Err(HostError::invalid_transition(id, "start", BotState::Stopping));
        }

        let owner = record.owner_id.clone();
        let plan = effective_plan(self.plans.as_ref(), &owner);
        match self
            .registry
            .transition(
                id,
                from,
                BotState::Starting,
                |others| quota::can_start(&owner, &plan, others, id),
                |r| r.message = Some("starting".to_string()),
            )
            .await
        {
            Transition::Applied(_) => {}
            Transition::Denied => {
                return Err(HostError::QuotaExceeded {
                    max_bots: plan.max_bots,
                });
            }
            Transition::Mismatch(None) => return Err(HostError::NotFound(id.clone())),
            Transition::Mismatch(Some(state)) => {
                return Err(HostError::invalid_transition(id, "start", state));
            }
        }

        let sink = self.logs.sink(id).await;
        let launch = sandbox::prepare(id, &plan, &self.config.sandbox);
        for w in launch.warnings() {
            tracing::warn!(bot_id = %id, warning = %w, "sandbox degraded");
            sink.emit(format!("[botvisor] warning: {w}")).await;
        }

        let launch_dir = record.launch_dir();
        let entry_file = record.entry_file();
        let mut cmd = Command::new(&self.config.runtime);
        cmd.arg(&entry_file)
            .current_dir(&launch_dir)
            .env_clear()
            .envs(sandbox::child_env(&self.config.credential_env, &credential))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            let limits = launch.limits.clone();
            unsafe {
                cmd.pre_exec(move || limits.apply_pre_exec());
            }
        }

        sink.emit(format!(
            "[botvisor] exec: {} {} (cwd {}) {}",
            self.config.runtime,
            entry_file.display(),
            launch_dir.display(),
            launch.summary()
        ))
        .await;

        let spawned = cmd
            .spawn()
            .map_err(|err| {
                format!(
                    "spawn {} {}: {err}",
                    self.config.runtime,
                    record.entry_point.display()
                )
            })
            .and_then(|child| match child.id() {
                Some(pid) => Ok((child, pid)),
                None => Err("child exited before its pid was read".to_string()),
            });
        let pid = match spawned {
            Ok((child, pid)) => {
                self.attach(id, child, pid, &launch, &sink).await;
                pid
            }
            Err(msg) => {
                sink.emit(format!("[botvisor] launch failed: {msg}")).await;
                self.finish(
                    id,
                    BotState::Starting,
                    BotState::Crashed,
                    ExitReason::LaunchFailed,
                    ExitOutcome::default(),
                    format!("launch failed: {msg}"),
                )
                .await;
                return Err(HostError::LaunchFailure(msg));
            }
        };

        let mut exited = match self.live.lock().await.get(id) {
            Some(lp) => lp.exited.clone(),
            None => return Err(HostError::LaunchFailure("process handle lost".to_string())),
        };
        if let Some(outcome) = wait_exit(&mut exited, self.config.launch_probe).await
            && self.claim(id, pid).await
        {
            let msg = format!("exited during startup ({})", outcome.describe());
            self.finish(
                id,
                BotState::Starting,
                BotState::Crashed,
                ExitReason::LaunchFailed,
                outcome,
                msg.clone(),
            )
            .await;
            return Err(HostError::LaunchFailure(msg));
        }

        let now = Utc::now();
        match self
            .registry
            .transition(
                id,
                BotState::Starting,
                BotState::Running,
                |_| true,
                |r| {
                    r.pid = Some(pid);
                    r.last_started_at = Some(now);
                    r.message = None;
                },
            )
            .await
        {
            Transition::Applied(rec) => {
                tracing::info!(bot_id = %id, pid, "bot running");
                sink.emit(format!("[botvisor] running (pid {pid})")).await;
                Ok(rec)
            }
            _ => {
                let rec = self.record(id).await?;
                Err(HostError::invalid_transition(id, "start", rec.state()))
            }
        }
    }

    /// Registers the live handle and spawns the output pumps and the exit watcher.
    async fn attach(
        &self,
        id: &BotId,
        mut child: Child,
        pid: u32,
        launch: &sandbox::SandboxLaunch,
        sink: &LogSink,
    ) {
        if let Some(w) = launch.attach_pid(pid) {
            tracing::warn!(bot_id = %id, warning = %w, "cgroup attach failed");
            sink.emit(format!("[botvisor] warning: {w}")).await;
        }

        if let Some(out) = child.stdout.take() {
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.emit(format!("[stdout] {line}")).await;
                }
            });
        }
        if let Some(err) = child.stderr.take() {
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.emit(format!("[stderr] {line}")).await;
                }
            });
        }

        let (exit_tx, exit_rx) = watch::channel(None::<ExitOutcome>);
        let poke = Arc::new(Notify::new());
        self.live.lock().await.insert(
            id.clone(),
            LiveProcess {
                pid,
                exited: exit_rx,
                poke: poke.clone(),
            },
        );
        self.registry.update(id, |r| r.pid = Some(pid)).await;

        let supervisor = self.clone();
        let id = id.clone();
        let sink = sink.clone();
        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let status = loop {
                let waited = tokio::select! {
                    res = child.wait() => Some(res),
                    _ = poke.notified() => None,
                };
                match waited {
                    Some(res) => break res,
                    None => match child.try_wait() {
                        Ok(Some(status)) => break Ok(status),
                        Ok(None) => continue,
                        Err(err) => break Err(err),
                    },
                }
            };
            let outcome = match &status {
                Ok(st) => ExitOutcome::from_status(st),
                Err(err) => {
                    tracing::warn!(bot_id = %id, pid, %err, "wait failed");
                    ExitOutcome::default()
                }
            };
            // Nothing the bot forked may outlive it.
            #[cfg(unix)]
            signal_group(pid, libc::SIGKILL);
            let _ = exit_tx.send(Some(outcome));
            sink.emit(format!(
                "[botvisor] process exited: {} runtime_ms={}",
                outcome.describe(),
                started.elapsed().as_millis()
            ))
            .await;
            supervisor.observe_exit(&id, pid, outcome).await;
        });
    }

    /// Exit detection for processes nobody asked to stop. A stop in flight
    /// holds the bot lock and claims the handle itself, so this becomes a no-op.
    async fn observe_exit(&self, id: &BotId, pid: u32, outcome: ExitOutcome) {
        let _guard = self.op_lock(id).await;
        if !self.claim(id, pid).await {
            return;
        }
        let Some(record) = self.registry.get(id).await else {
            return;
        };
        let from = record.state();
        let (next, reason, message) = match from {
            BotState::Running => (
                BotState::Crashed,
                ExitReason::UnexpectedCrash,
                format!("crashed ({})", outcome.describe()),
            ),
            BotState::Starting => (
                BotState::Crashed,
                ExitReason::LaunchFailed,
                format!("exited during startup ({})", outcome.describe()),
            ),
            BotState::Stopping => (
                BotState::Stopped,
                ExitReason::StopRequested,
                "stopped".to_string(),
            ),
            other => {
                tracing::debug!(bot_id = %id, state = %other, "exit observed in non-live state");
                return;
            }
        };
        if reason == ExitReason::UnexpectedCrash {
            tracing::warn!(bot_id = %id, pid, outcome = %outcome.describe(), "bot crashed");
        }
        self.finish(id, from, next, reason, outcome, message).await;
    }

    pub async fn stop(&self, id: &BotId) -> Result<HostedBotRecord> {
        let _guard = self.op_lock(id).await;
        self.stop_locked(id, ExitReason::StopRequested, self.config.stop_grace, "stopped")
            .await
    }

    /// Graceful termination: SIGTERM, wait `grace`, then SIGKILL.
    /// `reason` decides the resting state: `stop_requested` ends `stopped`,
    /// anything else ends `crashed`.
    async fn stop_locked(
        &self,
        id: &BotId,
        reason: ExitReason,
        grace: Duration,
        message: impl Into<String>,
    ) -> Result<HostedBotRecord> {
        let message = message.into();
        let record = self.record(id).await?;
        match record.state() {
            BotState::Stopped | BotState::Crashed => return Ok(record),
            BotState::Running => {
                let moved = self
                    .registry
                    .compare_and_set(id, BotState::Running, BotState::Stopping, |r| {
                        r.message = Some("stopping".to_string())
                    })
                    .await;
                if !moved {
                    let rec = self.record(id).await?;
                    return match rec.state() {
                        BotState::Stopped | BotState::Crashed => Ok(rec),
                        s => Err(HostError::invalid_transition(id, "stop", s)),
                    };
                }
            }
            // An earlier stop could not confirm the exit; try again.
            BotState::Stopping => {}
            s => return Err(HostError::invalid_transition(id, "stop", s)),
        }

        let (pid, outcome) = match self.terminate(id, grace).await? {
            Some(v) => v,
            None => (0, ExitOutcome::default()),
        };
        if pid != 0 {
            self.claim(id, pid).await;
        }

        let next = match reason {
            ExitReason::StopRequested => BotState::Stopped,
            _ => BotState::Crashed,
        };
        self.finish(id, BotState::Stopping, next, reason, outcome, message)
            .await;
        self.record(id).await
    }

    /// Signals the process group and waits for the watcher to confirm the exit.
    /// Returns `None` when there was no live process.
    async fn terminate(&self, id: &BotId, grace: Duration) -> Result<Option<(u32, ExitOutcome)>> {
        let handle = self
            .live
            .lock()
            .await
            .get(id)
            .map(|lp| (lp.pid, lp.exited.clone()));
        let Some((pid, mut exited)) = handle else {
            return Ok(None);
        };
        let sink = self.logs.sink(id).await;

        if !grace.is_zero() {
            sink.emit(format!(
                "[botvisor] stop requested (grace_ms={})",
                grace.as_millis()
            ))
            .await;
            #[cfg(unix)]
            signal_group(pid, libc::SIGTERM);
            if let Some(outcome) = wait_exit(&mut exited, grace).await {
                return Ok(Some((pid, outcome)));
            }
            tracing::info!(bot_id = %id, pid, "grace period elapsed; killing");
        }

        sink.emit("[botvisor] sending SIGKILL").await;
        #[cfg(unix)]
        signal_group(pid, libc::SIGKILL);
        match wait_exit(&mut exited, self.config.kill_confirm).await {
            Some(outcome) => Ok(Some((pid, outcome))),
            None => {
                tracing::error!(bot_id = %id, pid, "process survived SIGKILL");
                Err(HostError::GracefulStopTimeout(id.clone()))
            }
        }
    }

    /// Restart path for the auto-restart controller. Starts the bot only while
    /// it still sits in the crash recorded at `crashed_at`; returns `None` when
    /// anything else has happened to it since.
    pub async fn start_after_crash(
        &self,
        id: &BotId,
        crashed_at: DateTime<Utc>,
    ) -> Result<Option<HostedBotRecord>> {
        let _guard = self.op_lock(id).await;
        let Some(record) = self.registry.get(id).await else {
            return Ok(None);
        };
        let same_crash = record.state() == BotState::Crashed
            && record.last_exit.as_ref().is_some_and(|e| e.at == crashed_at);
        if !same_crash {
            tracing::debug!(bot_id = %id, state = %record.state(), "crash superseded; not restarting");
            return Ok(None);
        }
        self.start_locked(id).await.map(Some)
    }

    /// Stop then start, under one lock so no second process can appear in between.
    pub async fn restart(&self, id: &BotId) -> Result<HostedBotRecord> {
        let _guard = self.op_lock(id).await;
        let record = self.record(id).await?;
        match record.state() {
            BotState::Running | BotState::Stopping => {
                self.stop_locked(id, ExitReason::StopRequested, self.config.stop_grace, "stopped")
                    .await?;
            }
            BotState::Ready | BotState::Stopped | BotState::Crashed => {}
            s => return Err(HostError::invalid_transition(id, "restart", s)),
        }
        self.start_locked(id).await
    }

    /// Force-stops if needed, marks the record deleted and removes its files.
    pub async fn delete(&self, id: &BotId) -> Result<HostedBotRecord> {
        let _guard = self.op_lock(id).await;
        let record = self.record(id).await?;
        if record.state().has_process() {
            self.stop_locked(id, ExitReason::StopRequested, Duration::ZERO, "stopped")
                .await?;
        }

        let current = self.record(id).await?.state();
        if !current.can_transition_to(BotState::Deleted) {
            return Err(HostError::invalid_transition(id, "delete", current));
        }
        let moved = self
            .registry
            .compare_and_set(id, current, BotState::Deleted, |r| {
                r.pid = None;
                r.credential = None;
                r.message = Some("deleted".to_string());
            })
            .await;
        if !moved {
            let s = self.record(id).await?.state();
            return Err(HostError::invalid_transition(id, "delete", s));
        }

        if let Err(err) = tokio::fs::remove_dir_all(&record.working_dir).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(bot_id = %id, dir = %record.working_dir.display(), %err, "failed to remove bundle");
        }
        self.logs.remove(id).await;
        self.op_locks.lock().await.remove(id);
        tracing::info!(bot_id = %id, owner_id = %record.owner_id, "bot deleted");
        self.record(id).await
    }

    /// Policy kill requested by the resource monitor. Loses silently if the
    /// bot is no longer running the sampled process.
    pub async fn enforce_limit(
        &self,
        id: &BotId,
        pid: u32,
        violation: &LimitViolation,
    ) -> Result<Option<HostedBotRecord>> {
        let _guard = self.op_lock(id).await;
        let Some(record) = self.registry.get(id).await else {
            return Ok(None);
        };
        if record.state() != BotState::Running || self.live_pid(id).await != Some(pid) {
            return Ok(None);
        }

        let what = violation.describe();
        tracing::warn!(bot_id = %id, pid, violation = %what, "resource limit exceeded");
        self.logs
            .emit(id, format!("[botvisor] resource limit exceeded: {what}"))
            .await;
        self.stop_locked(
            id,
            ExitReason::ResourceExceeded,
            self.config.stop_grace,
            format!("resource limit exceeded: {what}"),
        )
        .await
        .map(Some)
    }

    /// Stops every live bot concurrently. Used on daemon shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<BotId> = self.live_pids().await.into_iter().map(|(id, _)| id).collect();
        let stops = ids.iter().map(|id| async move {
            if let Err(err) = self.stop(id).await {
                tracing::warn!(bot_id = %id, error = %err, "stop on shutdown failed");
            }
        });
        futures_util::future::join_all(stops).await;
    }
}
