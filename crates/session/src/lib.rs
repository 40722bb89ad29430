//! Taskpilot Session
//!
//! Client side of the agent session protocol: connection lifecycle with a
//! short-lived credential handshake, gated command dispatch, inbound event
//! routing, log projection, chat transcript assembly and approval prompts.
//!
//! [`SessionMachine`] holds the rules and performs no IO. [`SessionHandle`]
//! runs it inside an actor task wired to a [`Transport`] and a
//! [`CredentialSource`].

pub mod approval;
pub mod chat;
pub mod classifier;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod projection;
pub mod session_actor;
pub mod session_command;
pub mod transition;
pub mod transport;

pub use approval::{ApprovalPrompt, ApprovalState};
pub use connection::{ConnectionState, ConnectionStatus};
pub use credentials::{
    Credential, CredentialError, CredentialSource, HttpCredentialSource, StaticCredentialSource,
};
pub use error::SessionError;
pub use session_actor::SessionHandle;
pub use transition::{SessionMachine, SessionSnapshot, SessionStatus, SessionUpdate};
pub use transport::{Transport, TransportEvent, WebSocketTransport};
