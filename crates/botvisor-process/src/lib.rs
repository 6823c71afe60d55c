use std::fmt;

use chrono::{DateTime, Utc};

/// Opaque identifier of a hosted bot. Assigned once at install time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct BotId(pub String);

impl BotId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for BotId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque tenant identifier supplied by the outward-facing layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub String);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Secret handed to the child process through its environment.
///
/// Never printed: `Debug` is redacted.
#[derive(Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    /// Accepts chat bot tokens of the form `<digits>:<[A-Za-z0-9_-]+>`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (id, secret) = raw.split_once(':')?;
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        if secret.is_empty()
            || !secret
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
        {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotState {
    AwaitingCredential,
    Ready,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
    Deleted,
}

impl BotState {
    /// Transition table of the record lifecycle. Anything not listed here is illegal.
    pub fn can_transition_to(self, next: BotState) -> bool {
        use BotState::*;
        matches!(
            (self, next),
            (AwaitingCredential, Ready)
                | (AwaitingCredential, Deleted)
                | (Ready, Starting)
                | (Ready, Deleted)
                | (Starting, Running)
                | (Starting, Crashed)
                | (Running, Stopping)
                | (Running, Crashed)
                | (Stopping, Stopped)
                | (Stopping, Crashed)
                | (Stopped, Starting)
                | (Stopped, Deleted)
                | (Crashed, Starting)
                | (Crashed, Deleted)
        )
    }

    /// States that hold (or are about to hold) a plan slot for a live process.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            BotState::Ready | BotState::Starting | BotState::Running | BotState::Stopping
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BotState::Deleted)
    }

    /// States in which the supervisor owns a process handle.
    pub fn has_process(self) -> bool {
        matches!(
            self,
            BotState::Starting | BotState::Running | BotState::Stopping
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BotState::AwaitingCredential => "awaiting_credential",
            BotState::Ready => "ready",
            BotState::Starting => "starting",
            BotState::Running => "running",
            BotState::Stopping => "stopping",
            BotState::Stopped => "stopped",
            BotState::Crashed => "crashed",
            BotState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for BotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a supervised process went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopRequested,
    ResourceExceeded,
    UnexpectedCrash,
    LaunchFailed,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::StopRequested => "stop_requested",
            ExitReason::ResourceExceeded => "resource_exceeded",
            ExitReason::UnexpectedCrash => "unexpected_crash",
            ExitReason::LaunchFailed => "launch_failed",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ExitInfo {
    pub reason: ExitReason,
    pub exit_code: Option<i32>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Free,
    Starter,
    Pro,
    Enterprise,
}

impl PlanTier {
    pub const ALL: [PlanTier; 4] = [
        PlanTier::Free,
        PlanTier::Starter,
        PlanTier::Pro,
        PlanTier::Enterprise,
    ];

    pub fn default_plan(self) -> Plan {
        let (max_bots, max_ram_mb, max_cpu_percent, auto_restart) = match self {
            PlanTier::Free => (1, 256, 50, false),
            PlanTier::Starter => (3, 512, 80, true),
            PlanTier::Pro => (10, 1024, 100, true),
            PlanTier::Enterprise => (999, 2048, 100, true),
        };
        Plan {
            tier: self,
            max_bots,
            max_ram_mb,
            max_cpu_percent,
            auto_restart,
            expiry: None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Starter => "starter",
            PlanTier::Pro => "pro",
            PlanTier::Enterprise => "enterprise",
        }
    }
}

/// Entitlement snapshot for one owner at decision time. Never mutated by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Plan {
    pub tier: PlanTier,
    pub max_bots: u32,
    pub max_ram_mb: u64,
    pub max_cpu_percent: u32,
    pub auto_restart: bool,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
}

impl Plan {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|at| at <= now)
    }

    /// Expired plans fall back to the most restrictive tier.
    pub fn effective(&self, now: DateTime<Utc>) -> Plan {
        if self.is_expired(now) {
            PlanTier::Free.default_plan()
        } else {
            self.clone()
        }
    }
}

impl Default for Plan {
    fn default() -> Self {
        PlanTier::Free.default_plan()
    }
}

/// One CPU/memory observation of a running bot.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ResourceSample {
    pub pid: u32,
    pub rss_bytes: u64,
    pub cpu_percent: f64,
    pub at: DateTime<Utc>,
}

impl ResourceSample {
    pub fn rss_mb(&self) -> f64 {
        self.rss_bytes as f64 / (1024.0 * 1024.0)
    }
}
