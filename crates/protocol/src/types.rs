//! Core types shared across the protocol

use serde::{Deserialize, Serialize};

use crate::server::EventPayload;

/// Parameters for a `run` command. Passed through to the engine untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartParams {
    pub task: String,
    pub mode: String,
    pub model: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    pub project_path: String,
    #[serde(default)]
    pub write_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    #[serde(default)]
    pub debug_prompt: bool,
    #[serde(default)]
    pub no_approval: bool,
    #[serde(default)]
    pub frontend: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Author of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

/// A message in the chat transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub role: ChatRole,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    pub is_streaming: bool,
}

/// A normalized, immutable record derived from one inbound domain frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub id: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    /// Wire name of the event type
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}
