//! Session error taxonomy

use thiserror::Error;

/// Errors surfaced by session operations.
///
/// Every variant is terminal only to the operation that raised it; the
/// session stays usable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The short-lived credential could not be fetched; no transport was opened.
    #[error("Authentication setup failed: {0}")]
    AuthSetup(String),

    /// The connection errored or closed uncleanly.
    #[error("Connection error: {0}")]
    Transport(String),

    /// An inbound frame could not be parsed.
    #[error("Failed to parse message from server: {0}")]
    Protocol(String),

    /// An error reported by the engine through a domain event.
    #[error("{0}")]
    Domain(String),

    /// A command was attempted before the connection was authenticated.
    #[error("Cannot send {command}: not connected to the server")]
    CommandRejected { command: &'static str },

    /// The session actor is no longer running.
    #[error("Session is closed")]
    SessionClosed,
}
