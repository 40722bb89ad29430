//! Client → Server commands

use serde::{Deserialize, Serialize};

use crate::types::StartParams;

/// Commands sent from the client to the backend engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    // Handshake
    Auth {
        token: String,
    },

    // Run control
    Run {
        payload: StartParams,
    },
    Stop {},
    Stdin {
        payload: StdinPayload,
    },
    UserInterrupt {
        payload: InterruptPayload,
    },

    // Chat
    ChatMessage {
        payload: ChatMessagePayload,
    },

    // Approval
    ApprovalResponse {
        payload: ApprovalResponsePayload,
    },
}

impl ClientCommand {
    /// Wire name of the command, as it appears in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientCommand::Auth { .. } => "auth",
            ClientCommand::Run { .. } => "run",
            ClientCommand::Stop {} => "stop",
            ClientCommand::Stdin { .. } => "stdin",
            ClientCommand::UserInterrupt { .. } => "user_interrupt",
            ClientCommand::ChatMessage { .. } => "chat_message",
            ClientCommand::ApprovalResponse { .. } => "approval_response",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdinPayload {
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptPayload {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessagePayload {
    pub session_id: String,
    pub message: String,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResponsePayload {
    pub approval_id: String,
    pub approved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
