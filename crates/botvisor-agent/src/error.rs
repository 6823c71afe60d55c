use botvisor_process::{BotId, BotState};

pub type Result<T> = std::result::Result<T, HostError>;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    #[error("archive entry escapes the bundle directory: {0}")]
    PathTraversal(String),

    #[error("entry point {0} not found in archive")]
    MissingEntryPoint(String),

    #[error("bot limit reached ({max_bots})")]
    QuotaExceeded { max_bots: u32 },

    #[error("cannot {op} bot {id} while {state}")]
    InvalidStateTransition {
        id: BotId,
        op: &'static str,
        state: BotState,
    },

    #[error("launch failed: {0}")]
    LaunchFailure(String),

    #[error("bot {0} did not exit after forced kill")]
    GracefulStopTimeout(BotId),

    #[error("bot {0} keeps crashing; manual restart required")]
    RestartCeilingReached(BotId),

    #[error("invalid credential format")]
    InvalidCredential,

    #[error("invalid owner id")]
    InvalidOwnerId,

    #[error("bot not found: {0}")]
    NotFound(BotId),

    #[error("bot {0} is not running")]
    NotRunning(BotId),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl HostError {
    /// Stable machine-readable code for the outward-facing layer.
    pub fn code(&self) -> &'static str {
        match self {
            HostError::InvalidArchive(_) => "invalid_archive",
            HostError::PathTraversal(_) => "path_traversal",
            HostError::MissingEntryPoint(_) => "missing_entry_point",
            HostError::QuotaExceeded { .. } => "quota_exceeded",
            HostError::InvalidStateTransition { .. } => "invalid_state_transition",
            HostError::LaunchFailure(_) => "launch_failure",
            HostError::GracefulStopTimeout(_) => "graceful_stop_timeout",
            HostError::RestartCeilingReached(_) => "restart_ceiling_reached",
            HostError::InvalidCredential => "invalid_credential",
            HostError::InvalidOwnerId => "invalid_owner_id",
            HostError::NotFound(_) => "not_found",
            HostError::NotRunning(_) => "not_running",
            HostError::Internal(_) => "internal",
        }
    }

    pub(crate) fn invalid_transition(id: &BotId, op: &'static str, state: BotState) -> Self {
        HostError::InvalidStateTransition {
            id: id.clone(),
            op,
            state,
        }
    }
}

pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            HostError::QuotaExceeded { max_bots: 1 }.code(),
            "quota_exceeded"
        );
        assert_eq!(
            HostError::PathTraversal("../x".into()).code(),
            "path_traversal"
        );
        let e = HostError::invalid_transition(&BotId("b".into()), "start", BotState::Deleted);
        assert_eq!(e.code(), "invalid_state_transition");
        assert_eq!(e.to_string(), "cannot start bot b while deleted");
    }

    #[test]
    fn error_chain_is_flattened() {
        let err = Err::<(), _>(std::io::Error::other("disk full"))
            .context("write record")
            .unwrap_err();
        assert_eq!(format_error_chain(&err), "write record: disk full");
    }
}
