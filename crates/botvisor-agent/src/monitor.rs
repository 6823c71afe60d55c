use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use botvisor_process::{BotId, BotState, ResourceSample};
use chrono::Utc;
use tokio::{sync::Mutex, time::Instant};

use crate::{
    config::AgentConfig,
    error::{HostError, Result},
    plans::{PlanProvider, effective_plan},
    proc_stats,
    quota::{self, LimitViolation},
    registry::Registry,
    supervisor::Supervisor,
};

#[derive(Debug)]
struct Track {
    pid: u32,
    last: Option<(u64, Instant)>,
    history: VecDeque<ResourceSample>,
}

impl Track {
    fn new(pid: u32) -> Self {
        Self {
            pid,
            last: None,
            history: VecDeque::new(),
        }
    }
}

/// Periodically samples every running bot and enforces its plan's ceilings.
#[derive(Clone)]
pub struct ResourceMonitor {
    config: Arc<AgentConfig>,
    registry: Registry,
    supervisor: Supervisor,
    plans: Arc<dyn PlanProvider>,
    tracks: Arc<Mutex<HashMap<BotId, Track>>>,
}

impl ResourceMonitor {
    pub fn new(
        config: Arc<AgentConfig>,
        registry: Registry,
        supervisor: Supervisor,
        plans: Arc<dyn PlanProvider>,
    ) -> Self {
        Self {
            config,
            registry,
            supervisor,
            plans,
            tracks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.config.sample_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep_once().await;
        }
    }

    /// One sampling pass. Violations are handed to the supervisor on their own
    /// tasks so a slow stop never delays sampling of other bots.
    pub async fn sweep_once(&self) -> Vec<(BotId, LimitViolation)> {
        let live = self.supervisor.live_pids().await;
        {
            let mut tracks = self.tracks.lock().await;
            tracks.retain(|id, t| live.iter().any(|(lid, pid)| lid == id && *pid == t.pid));
        }

        let mut violations = Vec::new();
        for (id, pid) in live {
            let Some(record) = self.registry.get(&id).await else {
                continue;
            };
            if record.state() != BotState::Running {
                continue;
            }

            let Some(reading) = proc_stats::read(pid).await else {
                self.supervisor.nudge(&id, pid).await;
                continue;
            };
            let now = Instant::now();
            let sample = {
                let mut tracks = self.tracks.lock().await;
                let track = tracks.entry(id.clone()).or_insert_with(|| Track::new(pid));
                let cpu_percent = track
                    .last
                    .map(|(ticks, at)| proc_stats::cpu_percent(ticks, at, reading.cpu_ticks, now))
                    .unwrap_or(0.0);
                track.last = Some((reading.cpu_ticks, now));
                let sample = ResourceSample {
                    pid,
                    rss_bytes: reading.rss_bytes,
                    cpu_percent,
                    at: Utc::now(),
                };
                track.history.push_back(sample.clone());
                while track.history.len() > self.config.sample_history.max(1) {
                    track.history.pop_front();
                }
                sample
            };

            let plan = effective_plan(self.plans.as_ref(), &record.owner_id);
            if let Some(violation) = quota::check_limits(&sample, &plan) {
                let supervisor = self.supervisor.clone();
                let bot_id = id.clone();
                let v = violation.clone();
                tokio::spawn(async move {
                    if let Err(err) = supervisor.enforce_limit(&bot_id, pid, &v).await {
                        tracing::warn!(bot_id = %bot_id, error = %err, "limit enforcement failed");
                    }
                });
                violations.push((id, violation));
            }
        }
        violations
    }

    /// Latest sample for a running bot. Reads procfs on demand when the bot
    /// has not been swept yet.
    pub async fn current_usage(&self, id: &BotId) -> Result<ResourceSample> {
        let record = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| HostError::NotFound(id.clone()))?;
        if record.state() != BotState::Running {
            return Err(HostError::NotRunning(id.clone()));
        }
        let Some(pid) = self.supervisor.live_pid(id).await else {
            return Err(HostError::NotRunning(id.clone()));
        };

        if let Some(t) = self.tracks.lock().await.get(id)
            && t.pid == pid
            && let Some(s) = t.history.back()
        {
            return Ok(s.clone());
        }

        let reading = proc_stats::read(pid)
            .await
            .ok_or_else(|| HostError::NotRunning(id.clone()))?;
        Ok(ResourceSample {
            pid,
            rss_bytes: reading.rss_bytes,
            cpu_percent: 0.0,
            at: Utc::now(),
        })
    }

    pub async fn history(&self, id: &BotId) -> Vec<ResourceSample> {
        self.tracks
            .lock()
            .await
            .get(id)
            .map(|t| t.history.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use std::time::Duration;

    use botvisor_process::ExitReason;

    use super::*;
    use crate::{plans::PlanBook, supervisor::tests::*};

    const LOOP: &str = "echo up\nwhile true; do sleep 0.1; done\n";

    fn monitor(h: &Harness) -> ResourceMonitor {
        ResourceMonitor::new(
            h.config.clone(),
            h.registry.clone(),
            h.supervisor.clone(),
            h.plans.clone(),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn samples_running_bots() {
        let h = harness_with(|c| c.sample_history = 2);
        let m = monitor(&h);
        let id = h.ready_bot("o", LOOP).await;

        assert!(matches!(
            m.current_usage(&id).await,
            Err(HostError::NotRunning(_))
        ));

        let pid = h.supervisor.start(&id).await.unwrap().pid.unwrap();
        for _ in 0..3 {
            assert!(m.sweep_once().await.is_empty());
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let usage = m.current_usage(&id).await.unwrap();
        assert_eq!(usage.pid, pid);
        assert!(usage.rss_bytes > 0);
        assert!(usage.cpu_percent >= 0.0);
        assert_eq!(m.history(&id).await.len(), 2);

        h.supervisor.stop(&id).await.unwrap();
        assert!(matches!(
            m.current_usage(&id).await,
            Err(HostError::NotRunning(_))
        ));
        m.sweep_once().await;
        assert!(m.history(&id).await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn memory_violation_crashes_the_bot() {
        let book = PlanBook::from_toml_str("[tiers.free]\nmax_ram_mb = 0\n").unwrap();
        let h = harness_with_plans(book, |c| c.stop_grace = Duration::from_millis(300));
        let m = monitor(&h);
        let id = h.ready_bot("o", LOOP).await;
        h.supervisor.start(&id).await.unwrap();

        let found = m.sweep_once().await;
        assert_eq!(found.len(), 1);
        assert!(matches!(found[0].1, LimitViolation::Memory { .. }));

        h.wait_for_state(&id, BotState::Crashed, Duration::from_secs(5))
            .await;
        let rec = h.registry.get(&id).await.unwrap();
        assert_eq!(
            rec.last_exit.map(|e| e.reason),
            Some(ExitReason::ResourceExceeded)
        );
        assert!(
            rec.message
                .unwrap_or_default()
                .starts_with("resource limit exceeded: memory")
        );

        let out = h.logs.tail(&id, 100).await;
        assert!(out.iter().any(|l| l == "[stdout] up"));
        assert!(out.iter().any(|l| l.contains("resource limit exceeded")));
    }
}
