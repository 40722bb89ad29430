//! Server → Client frames
//!
//! Every inbound frame is `{ "type": ..., "payload": {...} }`. Control frames
//! (handshake, process output, terminal signals) are kept apart from the
//! closed domain taxonomy in [`EventPayload`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// A raw inbound frame: the discriminant plus whatever else arrived.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    /// Top-level fields other than `type` and `payload`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Look a field up in `payload` first, then at the top level.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload
            .get(name)
            .filter(|v| !v.is_null())
            .or_else(|| self.extra.get(name).filter(|v| !v.is_null()))
    }

    /// A field rendered as text. Numbers and booleans are stringified.
    pub fn text_field(&self, name: &str) -> Option<String> {
        match self.field(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn frame_id(&self) -> Option<String> {
        self.text_field("id")
    }

    pub fn timestamp(&self) -> Option<String> {
        self.text_field("timestamp")
    }

    /// The payload object with any field it lacks filled in from the top
    /// level, as `field` reads them. Without a `payload` the top-level
    /// fields are the payload. The frame's own `id` and `timestamp` are not
    /// copied into a payload that exists.
    pub fn payload_or_extra(&self) -> Value {
        let mut payload = match &self.payload {
            Value::Null => return Value::Object(self.extra.clone()),
            Value::Object(map) => map.clone(),
            other => return other.clone(),
        };
        for (key, value) in &self.extra {
            if value.is_null() || key == "id" || key == "timestamp" {
                continue;
            }
            let missing = payload.get(key).map_or(true, Value::is_null);
            if missing {
                payload.insert(key.clone(), value.clone());
            }
        }
        Value::Object(payload)
    }
}

/// Connection-level frames that are not part of the event taxonomy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    AuthSuccess { message: Option<String> },
    Status { message: String },
    Warning { message: String },
    Error { message: String },
    Stdout { data: String },
    Stderr { data: String },
    End { exit_code: Option<i64> },
}

impl ControlFrame {
    /// Returns `None` when the frame is not a control frame.
    pub fn from_frame(frame: &InboundFrame) -> Option<Self> {
        let message = || frame.text_field("message").unwrap_or_default();
        let data = || frame.text_field("data").unwrap_or_default();
        let control = match frame.kind.as_str() {
            "auth_success" => ControlFrame::AuthSuccess {
                message: frame.text_field("message"),
            },
            "status" => ControlFrame::Status { message: message() },
            "warning" => ControlFrame::Warning { message: message() },
            "error" => ControlFrame::Error { message: message() },
            "stdout" => ControlFrame::Stdout { data: data() },
            "stderr" => ControlFrame::Stderr { data: data() },
            "end" => ControlFrame::End {
                exit_code: frame.field("exitCode").and_then(Value::as_i64),
            },
            _ => return None,
        };
        Some(control)
    }
}

/// The closed taxonomy of domain events emitted by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    // Process lifecycle
    ProcessStart(ProcessStart),
    ProcessEnd(ProcessEnd),
    PhaseChange(PhaseChange),

    // LLM requests
    LlmRequestStart(LlmRequestStart),
    LlmRequestSuccess(LlmRequestSuccess),
    LlmRequestError(LlmRequestError),

    // Tools and files
    ToolExecutionStart(ToolExecutionStart),
    ToolExecutionResult(ToolExecutionResult),
    FileOperationStart(FileOperationStart),
    FileOperationComplete(FileOperationComplete),

    SystemLog(SystemLog),

    // Approval
    WaitingForApproval(WaitingForApproval),
    ApprovalResponseReceived(ApprovalResponseReceived),

    // Chat
    ChatResponse(ChatResponse),
    ChatResponseChunk(ChatResponseChunk),
    ChatError(ChatError),
    ChatRequest(ChatRequest),

    // Suggested actions
    LlmActionsAvailable(LlmActionsAvailable),
    LlmActionStarted(LlmActionStarted),
    LlmActionProgress(LlmActionProgress),
    LlmActionCompleted(LlmActionCompleted),
    LlmActionFailed(LlmActionFailed),
}

impl EventPayload {
    /// Every `type` value that belongs to the taxonomy.
    pub const KINDS: &'static [&'static str] = &[
        "process_start",
        "process_end",
        "phase_change",
        "llm_request_start",
        "llm_request_success",
        "llm_request_error",
        "tool_execution_start",
        "tool_execution_result",
        "file_operation_start",
        "file_operation_complete",
        "system_log",
        "waiting_for_approval",
        "approval_response_received",
        "chat_response",
        "chat_response_chunk",
        "chat_error",
        "chat_request",
        "llm_actions_available",
        "llm_action_started",
        "llm_action_progress",
        "llm_action_completed",
        "llm_action_failed",
    ];

    pub fn is_known_kind(kind: &str) -> bool {
        Self::KINDS.contains(&kind)
    }

    /// Decode a frame into a domain event.
    ///
    /// `Ok(None)` means the frame's type is outside the taxonomy; `Err` means
    /// the type is known but the payload does not fit its shape.
    pub fn from_frame(frame: &InboundFrame) -> Result<Option<Self>, serde_json::Error> {
        if !Self::is_known_kind(&frame.kind) {
            return Ok(None);
        }
        let payload = match frame.payload_or_extra() {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        serde_json::from_value(json!({ "type": frame.kind, "payload": payload })).map(Some)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::ProcessStart(_) => "process_start",
            EventPayload::ProcessEnd(_) => "process_end",
            EventPayload::PhaseChange(_) => "phase_change",
            EventPayload::LlmRequestStart(_) => "llm_request_start",
            EventPayload::LlmRequestSuccess(_) => "llm_request_success",
            EventPayload::LlmRequestError(_) => "llm_request_error",
            EventPayload::ToolExecutionStart(_) => "tool_execution_start",
            EventPayload::ToolExecutionResult(_) => "tool_execution_result",
            EventPayload::FileOperationStart(_) => "file_operation_start",
            EventPayload::FileOperationComplete(_) => "file_operation_complete",
            EventPayload::SystemLog(_) => "system_log",
            EventPayload::WaitingForApproval(_) => "waiting_for_approval",
            EventPayload::ApprovalResponseReceived(_) => "approval_response_received",
            EventPayload::ChatResponse(_) => "chat_response",
            EventPayload::ChatResponseChunk(_) => "chat_response_chunk",
            EventPayload::ChatError(_) => "chat_error",
            EventPayload::ChatRequest(_) => "chat_request",
            EventPayload::LlmActionsAvailable(_) => "llm_actions_available",
            EventPayload::LlmActionStarted(_) => "llm_action_started",
            EventPayload::LlmActionProgress(_) => "llm_action_progress",
            EventPayload::LlmActionCompleted(_) => "llm_action_completed",
            EventPayload::LlmActionFailed(_) => "llm_action_failed",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStart {
    #[serde(default)]
    pub task_description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessEnd {
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseChange {
    #[serde(default)]
    pub phase_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmRequestStart {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub prompt_summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmRequestSuccess {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_summary: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmRequestError {
    #[serde(default)]
    pub error_message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutionStart {
    #[serde(default)]
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutionResult {
    #[serde(default)]
    pub tool_name: String,
    /// `"success"` or `"failure"`
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ToolExecutionResult {
    pub fn is_failure(&self) -> bool {
        self.status.eq_ignore_ascii_case("failure")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOperationStart {
    #[serde(default)]
    pub operation_type: String,
    #[serde(default)]
    pub file_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOperationComplete {
    #[serde(default)]
    pub operation_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemLog {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub message: String,
}

impl SystemLog {
    pub fn is_error(&self) -> bool {
        self.level.eq_ignore_ascii_case("error")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingForApproval {
    #[serde(default)]
    pub approval_id: String,
    #[serde(default)]
    pub action_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResponseReceived {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
    #[serde(default)]
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    #[serde(default)]
    pub message_id: String,
    #[serde(default, alias = "message")]
    pub content: String,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponseChunk {
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub chunk: String,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, alias = "content")]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmAction {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmActionsAvailable {
    #[serde(default)]
    pub actions: Vec<LlmAction>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmActionStarted {
    #[serde(default)]
    pub action_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmActionProgress {
    #[serde(default)]
    pub action_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmActionCompleted {
    #[serde(default)]
    pub action_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmActionFailed {
    #[serde(default)]
    pub action_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_name: Option<String>,
    #[serde(default)]
    pub error: String,
}
