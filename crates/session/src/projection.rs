//! Event → log line projection.
//!
//! Pure functions, no state. The output strings are part of the user-facing
//! contract and are asserted byte-for-byte in tests.

use serde_json::Value;
use taskpilot_protocol::{ControlFrame, EventPayload};

pub const PARSE_ERROR_LINE: &str = "[ERROR] Failed to parse message from server";

/// `value` unless it is missing or empty.
fn or<'a>(value: &'a Option<String>, fallback: &'a str) -> &'a str {
    match value.as_deref() {
        Some(v) if !v.is_empty() => v,
        _ => fallback,
    }
}

/// Action label: its name when present, its id otherwise.
fn action_label<'a>(name: &'a Option<String>, id: &'a str) -> &'a str {
    or(name, id)
}

/// Log lines for one domain event. Chat traffic produces none.
pub fn project_event(event: &EventPayload) -> Vec<String> {
    match event {
        EventPayload::ProcessStart(e) => {
            vec![format!("[PROCESS] Started: {}", e.task_description)]
        }
        EventPayload::ProcessEnd(e) => vec![format!(
            "[PROCESS] Ended: {} - {}",
            e.status,
            or(&e.message, "No message")
        )],
        EventPayload::PhaseChange(e) => {
            vec![format!("[PHASE] {}: {}", e.phase_name, or(&e.details, ""))]
        }
        EventPayload::LlmRequestStart(e) => vec![format!(
            "[LLM] Starting request to {}: {}",
            e.model, e.prompt_summary
        )],
        EventPayload::LlmRequestSuccess(e) => vec![format!(
            "[LLM] Request completed: {}",
            or(&e.response_summary, "Response received")
        )],
        EventPayload::LlmRequestError(e) => vec![format!("[LLM ERROR] {}", e.error_message)],
        EventPayload::ToolExecutionStart(e) => vec![format!(
            "[TOOL] Starting: {} - {}",
            e.tool_name,
            or(&e.explanation, "No details")
        )],
        EventPayload::ToolExecutionResult(e) => vec![format!(
            "[TOOL {}] {}: {}",
            e.status.to_uppercase(),
            e.tool_name,
            or(&e.result_summary, "Completed")
        )],
        EventPayload::FileOperationStart(e) => vec![format!(
            "[FILE] {} operation starting on {}",
            e.operation_type, e.file_path
        )],
        EventPayload::FileOperationComplete(e) => vec![format!(
            "[FILE {}] {}: {}",
            if e.success { "SUCCESS" } else { "FAILED" },
            e.operation_type,
            or(&e.details, "Operation completed")
        )],
        EventPayload::SystemLog(e) => {
            vec![format!("[{}] {}", e.level.to_uppercase(), e.message)]
        }
        EventPayload::WaitingForApproval(e) => {
            let mut lines = vec![format!("[APPROVAL REQUIRED] {}", e.action_description)];
            if let Some(command) = e.proposed_command.as_deref().filter(|c| !c.is_empty()) {
                lines.push(format!("[APPROVAL] Command: {}", command));
            }
            lines
        }
        EventPayload::ApprovalResponseReceived(e) => vec![format!(
            "[APPROVAL {}] {}",
            if e.approved { "APPROVED" } else { "DENIED" },
            or(&e.message, "No message")
        )],
        EventPayload::ChatResponse(_)
        | EventPayload::ChatResponseChunk(_)
        | EventPayload::ChatRequest(_) => Vec::new(),
        EventPayload::ChatError(e) => vec![format!("[CHAT ERROR] {}", e.error)],
        EventPayload::LlmActionsAvailable(e) => {
            let mut lines = vec![format!("[ACTIONS] {} action(s) available", e.actions.len())];
            lines.extend(e.actions.iter().map(|action| {
                let label = if action.name.is_empty() {
                    &action.id
                } else {
                    &action.name
                };
                format!("[ACTIONS] - {}", label)
            }));
            lines
        }
        EventPayload::LlmActionStarted(e) => vec![format!(
            "[ACTION] Started: {}",
            action_label(&e.action_name, &e.action_id)
        )],
        EventPayload::LlmActionProgress(e) => {
            let mut line = format!(
                "[ACTION] {}: {}",
                action_label(&e.action_name, &e.action_id),
                or(&e.message, "In progress")
            );
            if let Some(progress) = e.progress {
                line.push_str(&format!(" ({:.0}%)", progress));
            }
            vec![line]
        }
        EventPayload::LlmActionCompleted(e) => vec![format!(
            "[ACTION COMPLETED] {}: {}",
            action_label(&e.action_name, &e.action_id),
            or(&e.result, "Completed")
        )],
        EventPayload::LlmActionFailed(e) => vec![format!(
            "[ACTION FAILED] {}: {}",
            action_label(&e.action_name, &e.action_id),
            e.error
        )],
    }
}

/// Log lines for a control frame.
pub fn project_control(frame: &ControlFrame) -> Vec<String> {
    match frame {
        ControlFrame::AuthSuccess { message } => {
            vec![format!("[AUTH] {}", or(message, "Authenticated"))]
        }
        ControlFrame::Status { message } => vec![format!("[STATUS] {}", message)],
        ControlFrame::Warning { message } => vec![format!("[WARNING] {}", message)],
        ControlFrame::Error { message } => vec![format!("[ERROR] {}", message)],
        ControlFrame::Stdout { data } => vec![data.trim_end_matches(['\r', '\n']).to_string()],
        ControlFrame::Stderr { data } => {
            vec![format!("[STDERR] {}", data.trim_end_matches(['\r', '\n']))]
        }
        ControlFrame::End { exit_code } => match exit_code {
            Some(code) => vec![format!("[END] Process exited with code {}", code)],
            None => vec!["[END] Process finished".to_string()],
        },
    }
}

/// Line for a frame whose type is outside the taxonomy.
pub fn project_unknown(kind: &str, payload: &Value) -> String {
    let json = serde_json::to_string(payload).unwrap_or_else(|_| "null".to_string());
    format!("[UNKNOWN EVENT] {}: {}", kind, json)
}
