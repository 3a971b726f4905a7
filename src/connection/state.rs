//! Connection state machine (C4, §4.4): the legal-command matrix governing
//! what a `Connection` handle may send while in each mode.

use crate::error::{ErrorKind, RedisError, RedisResult};

/// Subscriber mode is deliberately not a member of this enum (§4.4, §4.9):
/// a subscribing connection is never a `Connection` wearing a different
/// state, it is a distinct `SubscriberConnection` handed its own codec and
/// its own `run`/`supervise` reconnect loop. Nothing here ever transitions
/// a live `Connection` into a subscribe-only mode, so folding that mode
/// into this matrix would only add a variant `check` could reach but
/// `Connection` never could.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Normal,
    Transaction,
    Pipeline,
    Closed,
}

impl ConnectionState {
    /// A pool dispatcher skips any connection not in `Normal` (§4.5).
    pub fn is_reserved(self) -> bool {
        !matches!(self, ConnectionState::Normal)
    }

    /// Checks whether `command` may be issued while in this state, per the
    /// legal-command matrix in §4.4.
    pub fn check(self, command: &str) -> RedisResult<()> {
        match self {
            ConnectionState::Normal | ConnectionState::Transaction | ConnectionState::Pipeline => Ok(()),
            ConnectionState::Closed => Err(RedisError::new(ErrorKind::ConnectionError, "connection is closed")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_state_allows_anything() {
        assert!(ConnectionState::Normal.check("GET").is_ok());
    }

    #[test]
    fn closed_state_rejects_everything() {
        let err = ConnectionState::Closed.check("PING").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionError);
    }

    #[test]
    fn reserved_states_are_not_normal() {
        assert!(!ConnectionState::Normal.is_reserved());
        assert!(ConnectionState::Transaction.is_reserved());
        assert!(ConnectionState::Pipeline.is_reserved());
    }
}
