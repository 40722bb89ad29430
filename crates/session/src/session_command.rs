//! Commands sent to a session actor from [`SessionHandle`](crate::SessionHandle) callers.

use taskpilot_protocol::StartParams;
use tokio::sync::oneshot;

use crate::error::SessionError;

pub type Reply<T = ()> = oneshot::Sender<Result<T, SessionError>>;

/// A command that can be sent to a session actor.
///
/// Every variant carries a reply channel. Replies are sent once the state
/// change is applied and any transport write is queued, except `Connect`,
/// which resolves when the credential fetch for the attempt completes.
pub enum SessionCommand {
    // -- Lifecycle --
    Connect {
        reply: Reply,
    },
    Disconnect {
        reply: Reply,
    },
    Clear {
        reply: Reply,
    },

    // -- Run control --
    /// Reply carries the session id generated for the run.
    Start {
        params: Box<StartParams>,
        reply: Reply<String>,
    },
    Stop {
        reply: Reply,
    },
    Stdin {
        data: String,
        reply: Reply,
    },
    Interrupt {
        message: String,
        reply: Reply,
    },

    // -- Chat and approvals --
    ChatMessage {
        text: String,
        reply: Reply,
    },
    ApprovalResponse {
        approval_id: String,
        approved: bool,
        message: Option<String>,
        reply: Reply,
    },
}

impl SessionCommand {
    pub fn name(&self) -> &'static str {
        match self {
            SessionCommand::Connect { .. } => "connect",
            SessionCommand::Disconnect { .. } => "disconnect",
            SessionCommand::Clear { .. } => "clear",
            SessionCommand::Start { .. } => "start",
            SessionCommand::Stop { .. } => "stop",
            SessionCommand::Stdin { .. } => "stdin",
            SessionCommand::Interrupt { .. } => "user_interrupt",
            SessionCommand::ChatMessage { .. } => "chat_message",
            SessionCommand::ApprovalResponse { .. } => "approval_response",
        }
    }
}
