//! Connection lifecycle states.
//!
//! `Disconnected → Connecting → AwaitingAuth → Authenticated`, with `Closed`
//! for an explicit user disconnect. Every attempt gets its own number so
//! signals from a superseded transport can be told apart and dropped.

use serde::Serialize;

use crate::credentials::Credential;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Fetching a credential (`credential: None`) or opening the transport.
    Connecting {
        attempt: u64,
        credential: Option<Credential>,
    },
    /// Transport open, `auth` frame sent, waiting for `auth_success`.
    AwaitingAuth {
        attempt: u64,
    },
    Authenticated {
        attempt: u64,
    },
    Closed,
}

impl ConnectionState {
    /// The attempt this state belongs to, if any.
    pub fn attempt(&self) -> Option<u64> {
        match self {
            ConnectionState::Connecting { attempt, .. }
            | ConnectionState::AwaitingAuth { attempt }
            | ConnectionState::Authenticated { attempt } => Some(*attempt),
            ConnectionState::Disconnected | ConnectionState::Closed => None,
        }
    }

    /// True while an attempt is in flight or established.
    pub fn is_live(&self) -> bool {
        self.attempt().is_some()
    }

    /// True once the transport is open.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::AwaitingAuth { .. } | ConnectionState::Authenticated { .. }
        )
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, ConnectionState::Authenticated { .. })
    }

    pub fn status(&self) -> ConnectionStatus {
        match self {
            ConnectionState::Disconnected => ConnectionStatus::Disconnected,
            ConnectionState::Connecting { .. } => ConnectionStatus::Connecting,
            ConnectionState::AwaitingAuth { .. } => ConnectionStatus::AwaitingAuth,
            ConnectionState::Authenticated { .. } => ConnectionStatus::Authenticated,
            ConnectionState::Closed => ConnectionStatus::Closed,
        }
    }
}

/// Public, secret-free view of [`ConnectionState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    AwaitingAuth,
    Authenticated,
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_and_connected_flags_follow_state() {
        let connecting = ConnectionState::Connecting {
            attempt: 1,
            credential: None,
        };
        assert!(connecting.is_live());
        assert!(!connecting.is_connected());

        let awaiting = ConnectionState::AwaitingAuth { attempt: 1 };
        assert!(awaiting.is_connected());
        assert!(!awaiting.is_authenticated());

        let authed = ConnectionState::Authenticated { attempt: 1 };
        assert!(authed.is_connected());
        assert!(authed.is_authenticated());

        assert!(!ConnectionState::Disconnected.is_live());
        assert!(!ConnectionState::Closed.is_live());
        assert_eq!(ConnectionState::Closed.attempt(), None);
    }
}
