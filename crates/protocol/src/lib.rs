//! Taskpilot Protocol
//!
//! Wire types for the agent session protocol spoken between a taskpilot
//! client and the backend execution engine. Frames are JSON over WebSocket,
//! discriminated by a `type` field.

use uuid::Uuid;

pub mod client;
pub mod server;
pub mod types;

pub use client::ClientCommand;
pub use server::{ControlFrame, EventPayload, InboundFrame};
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
