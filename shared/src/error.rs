//! Session error taxonomy

use crate::SessionState;
use thiserror::Error;

/// Errors surfaced by a session manager
///
/// `ConnectFailed` and `StreamFault` are recoverable: the manager reports them
/// as notices and falls back to `NONE` (or listening again). A
/// `FramingAmbiguity` variant is deliberately absent: a payload split across
/// two reads is delivered as two messages and never detected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Transport unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Stream fault: {0}")]
    StreamFault(String),

    #[error("Operation not valid in state {state}: {operation}")]
    InvalidStateUsage {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Session manager has shut down")]
    Closed,
}

impl SessionError {
    /// Whether the session can carry on after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::ConnectFailed(_)
                | SessionError::StreamFault(_)
                | SessionError::InvalidStateUsage { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable() {
        assert!(SessionError::ConnectFailed("refused".into()).is_recoverable());
        assert!(SessionError::StreamFault("reset".into()).is_recoverable());
        assert!(!SessionError::AdapterUnavailable("no adapter".into()).is_recoverable());
        assert!(!SessionError::Closed.is_recoverable());
    }

    #[test]
    fn test_invalid_state_message() {
        let err = SessionError::InvalidStateUsage {
            operation: "send",
            state: SessionState::Listening,
        };
        assert_eq!(err.to_string(), "Operation not valid in state LISTENING: send");
    }
}
