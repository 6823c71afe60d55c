use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use botvisor_process::{BotId, ExitReason};
use tokio::{
    sync::{Mutex, Semaphore, mpsc},
    time::Instant,
};

use crate::{
    config::{AgentConfig, RestartTuning},
    error::HostError,
    logs::LogHub,
    plans::{PlanProvider, effective_plan},
    registry::Registry,
    supervisor::{ExitEvent, Supervisor},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Not an unexpected crash.
    Ignored,
    /// The owner's plan does not include auto-restart.
    NotEntitled,
    Scheduled { attempt: u32, delay: Duration },
    /// Too many restarts inside the window; the bot stays crashed.
    CeilingReached,
}

/// Reacts to unexpected crashes with bounded, backed-off restarts.
#[derive(Clone)]
pub struct RestartController {
    tuning: RestartTuning,
    registry: Registry,
    supervisor: Supervisor,
    logs: LogHub,
    plans: Arc<dyn PlanProvider>,
    windows: Arc<Mutex<HashMap<BotId, VecDeque<Instant>>>>,
    workers: Arc<Semaphore>,
}

impl RestartController {
    pub fn new(
        config: &AgentConfig,
        registry: Registry,
        supervisor: Supervisor,
        logs: LogHub,
        plans: Arc<dyn PlanProvider>,
    ) -> Self {
        Self {
            tuning: config.restart.clone(),
            registry,
            supervisor,
            logs,
            plans,
            windows: Arc::new(Mutex::new(HashMap::new())),
            workers: Arc::new(Semaphore::new(config.restart.workers.max(1))),
        }
    }

    pub async fn run(self, mut exits: mpsc::UnboundedReceiver<ExitEvent>) {
        while let Some(ev) = exits.recv().await {
            let decision = self.handle(&ev).await;
            tracing::debug!(bot_id = %ev.bot_id, reason = %ev.reason, ?decision, "exit handled");
        }
    }

    /// Drops the crash history of a bot, e.g. once it is deleted.
    pub async fn forget(&self, id: &BotId) {
        self.windows.lock().await.remove(id);
    }

    pub async fn handle(&self, ev: &ExitEvent) -> RestartDecision {
        if ev.reason != ExitReason::UnexpectedCrash {
            return RestartDecision::Ignored;
        }
        let id = &ev.bot_id;
        let plan = effective_plan(self.plans.as_ref(), &ev.owner_id);
        if !plan.auto_restart {
            self.logs
                .emit(id, "[botvisor] crashed; auto-restart not included in plan")
                .await;
            return RestartDecision::NotEntitled;
        }

        let max = self.tuning.max_restarts;
        let window = self.tuning.window;
        let now = Instant::now();
        let attempt = {
            let mut windows = self.windows.lock().await;
            let recent = windows.entry(id.clone()).or_default();
            while recent
                .front()
                .is_some_and(|t| now.duration_since(*t) > window)
            {
                recent.pop_front();
            }
            if recent.len() >= max as usize {
                None
            } else {
                recent.push_back(now);
                Some(recent.len() as u32)
            }
        };

        let Some(attempt) = attempt else {
            let msg = format!(
                "repeated crash: {max} restarts within {}s, giving up",
                window.as_secs()
            );
            let err = HostError::RestartCeilingReached(id.clone());
            tracing::warn!(bot_id = %id, max_restarts = max, code = err.code(), "{err}");
            self.logs.emit(id, format!("[botvisor] {msg}")).await;
            self.registry
                .update(id, |r| r.message = Some(msg))
                .await;
            return RestartDecision::CeilingReached;
        };

        let delay = self.tuning.backoff(attempt);
        let note = format!(
            "restarting in {}ms (attempt {attempt}/{max})",
            delay.as_millis()
        );
        self.registry
            .update(id, |r| {
                r.restart_count = r.restart_count.saturating_add(1);
                r.message = Some(note.clone());
            })
            .await;
        self.logs
            .emit(id, format!("[botvisor] auto-restart scheduled: {note}"))
            .await;

        let supervisor = self.supervisor.clone();
        let logs = self.logs.clone();
        let workers = self.workers.clone();
        let bot_id = id.clone();
        let crashed_at = ev.at;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Ok(_permit) = workers.acquire_owned().await else {
                return;
            };
            match supervisor.start_after_crash(&bot_id, crashed_at).await {
                Ok(Some(_)) => tracing::info!(bot_id = %bot_id, attempt, "auto-restart succeeded"),
                Ok(None) => tracing::info!(bot_id = %bot_id, attempt, "auto-restart dropped; bot moved on"),
                Err(err) => {
                    tracing::debug!(bot_id = %bot_id, attempt, error = %err, "auto-restart skipped");
                    logs.emit(&bot_id, format!("[botvisor] auto-restart failed: {err}"))
                        .await;
                }
            }
        });

        RestartDecision::Scheduled { attempt, delay }
    }
}
