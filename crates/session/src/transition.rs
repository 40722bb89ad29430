//! Session state machine
//!
//! All protocol logic lives here as synchronous methods on
//! [`SessionMachine`]: each call mutates the session and returns the
//! effects (transport writes, credential fetches, broadcasts) the caller
//! must carry out. Nothing here performs IO, so every rule is unit-tested
//! directly below.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use taskpilot_protocol::client::{
    ApprovalResponsePayload, ChatMessagePayload, InterruptPayload, StdinPayload,
};
use taskpilot_protocol::{
    new_id, ChatMessage, ClientCommand, ControlFrame, Event, EventPayload, StartParams,
};
use tracing::{debug, info, warn};

use crate::approval::{ApprovalGate, ApprovalPrompt};
use crate::chat::ChatTranscript;
use crate::classifier::{classify, Classified};
use crate::connection::{ConnectionState, ConnectionStatus};
use crate::credentials::Credential;
use crate::error::SessionError;
use crate::projection::{project_control, project_event, project_unknown, PARSE_ERROR_LINE};
use crate::transport::TransportEvent;

// ---------------------------------------------------------------------------
// Effects and updates
// ---------------------------------------------------------------------------

/// Work the driver must perform after a transition, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    FetchCredential { attempt: u64 },
    OpenTransport { attempt: u64 },
    Send { attempt: u64, command: ClientCommand },
    CloseTransport { attempt: u64 },
    Emit(SessionUpdate),
}

/// Incremental notifications for session observers
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Output { lines: Vec<String> },
    OutputCleared,
    EventAppended(Box<Event>),
    Chat(ChatMessage),
    Approval(ApprovalPrompt),
    Status(SessionStatus),
    Cleared,
}

/// Scalar part of the session view
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: Option<String>,
    pub connection: ConnectionStatus,
    pub is_connected: bool,
    pub is_running: bool,
    pub is_typing: bool,
    pub error: Option<String>,
}

/// Full observable view of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    #[serde(flatten)]
    pub status: SessionStatus,
    pub output: Vec<String>,
    pub events: Vec<Event>,
    pub chat_messages: Vec<ChatMessage>,
    pub approvals: Vec<ApprovalPrompt>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        SessionMachine::new().snapshot()
    }
}

/// Result of one transition
#[must_use]
#[derive(Debug)]
pub struct Transition<T = ()> {
    pub effects: Vec<Effect>,
    pub outcome: Result<T, SessionError>,
}

impl<T> Transition<T> {
    fn ok(effects: Vec<Effect>, value: T) -> Self {
        Self {
            effects,
            outcome: Ok(value),
        }
    }

    fn err(effects: Vec<Effect>, error: SessionError) -> Self {
        Self {
            effects,
            outcome: Err(error),
        }
    }
}

fn system_now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// SessionMachine
// ---------------------------------------------------------------------------

pub struct SessionMachine {
    session_id: Option<String>,
    connection: ConnectionState,
    is_running: bool,
    error: Option<String>,
    output: Vec<String>,
    events: Vec<Event>,
    chat: ChatTranscript,
    approvals: ApprovalGate,
    /// Deferred `run`, flushed once on `auth_success`. Last writer wins.
    pending_run: Option<StartParams>,
    /// Attempt whose transport handle is still open, possibly stale.
    open_link: Option<u64>,
    last_attempt: u64,
    clock: fn() -> u128,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMachine {
    pub fn new() -> Self {
        Self::with_clock(system_now_ms)
    }

    pub fn with_clock(clock: fn() -> u128) -> Self {
        Self {
            session_id: None,
            connection: ConnectionState::Disconnected,
            is_running: false,
            error: None,
            output: Vec::new(),
            events: Vec::new(),
            chat: ChatTranscript::new(),
            approvals: ApprovalGate::new(),
            pending_run: None,
            open_link: None,
            last_attempt: 0,
            clock,
        }
    }

    // -- Reads ---------------------------------------------------------------

    pub fn connection(&self) -> &ConnectionState {
        &self.connection
    }

    pub fn is_running(&self) -> bool {
        self.is_running
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn output(&self) -> &[String] {
        &self.output
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn chat(&self) -> &ChatTranscript {
        &self.chat
    }

    pub fn approvals(&self) -> &ApprovalGate {
        &self.approvals
    }

    pub fn has_pending_run(&self) -> bool {
        self.pending_run.is_some()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.session_id.clone(),
            connection: self.connection.status(),
            is_connected: self.connection.is_connected(),
            is_running: self.is_running,
            is_typing: self.chat.is_typing(),
            error: self.error.clone(),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.status(),
            output: self.output.clone(),
            events: self.events.clone(),
            chat_messages: self.chat.messages().to_vec(),
            approvals: self.approvals.prompts().to_vec(),
        }
    }

    // -- Connection lifecycle -----------------------------------------------

    /// Begin a connection attempt unless one is already live.
    pub fn connect(&mut self) -> Transition {
        let before = self.status();
        let mut effects = Vec::new();
        self.begin_attempt(&mut effects);
        self.finish(before, &mut effects);
        Transition::ok(effects, ())
    }

    fn begin_attempt(&mut self, effects: &mut Vec<Effect>) {
        if self.connection.is_live() {
            debug!(
                component = "session",
                event = "session.connect.noop",
                attempt = ?self.connection.attempt(),
                "Connection already live"
            );
            return;
        }

        if let Some(stale) = self.open_link.take() {
            effects.push(Effect::CloseTransport { attempt: stale });
        }

        self.error = None;
        self.last_attempt += 1;
        let attempt = self.last_attempt;
        self.connection = ConnectionState::Connecting {
            attempt,
            credential: None,
        };
        info!(
            component = "session",
            event = "session.connect.started",
            attempt,
            "Fetching credential"
        );
        effects.push(Effect::FetchCredential { attempt });
    }

    /// Outcome of the credential fetch for `attempt`.
    pub fn on_credential(
        &mut self,
        attempt: u64,
        result: Result<Credential, String>,
    ) -> Transition {
        let before = self.status();
        let mut effects = Vec::new();

        let expected = matches!(
            self.connection,
            ConnectionState::Connecting { attempt: a, credential: None } if a == attempt
        );
        if !expected {
            debug!(
                component = "session",
                event = "session.credential.stale",
                attempt,
                "Ignoring credential for superseded attempt"
            );
            return Transition::ok(effects, ());
        }

        match result {
            Ok(credential) => {
                self.connection = ConnectionState::Connecting {
                    attempt,
                    credential: Some(credential),
                };
                self.open_link = Some(attempt);
                effects.push(Effect::OpenTransport { attempt });
            }
            Err(reason) => {
                warn!(
                    component = "session",
                    event = "session.credential.failed",
                    attempt,
                    error = %reason,
                    "Credential fetch failed, connection aborted"
                );
                self.connection = ConnectionState::Disconnected;
                self.pending_run = None;
                self.is_running = false;
                self.error = Some(SessionError::AuthSetup(reason.clone()).to_string());
                self.log(&mut effects, vec![format!("[AUTH ERROR] {}", reason)]);
            }
        }

        self.finish(before, &mut effects);
        Transition::ok(effects, ())
    }

    /// A signal from the transport opened for `attempt`.
    pub fn on_transport(&mut self, attempt: u64, event: TransportEvent) -> Transition {
        let before = self.status();
        let mut effects = Vec::new();

        if self.connection.attempt() != Some(attempt) {
            if matches!(event, TransportEvent::Closed { .. }) && self.open_link == Some(attempt) {
                self.open_link = None;
            }
            debug!(
                component = "session",
                event = "session.transport.stale",
                attempt,
                "Ignoring signal from superseded transport"
            );
            return Transition::ok(effects, ());
        }

        match event {
            TransportEvent::Opened => {
                if let ConnectionState::Connecting {
                    credential: Some(credential),
                    ..
                } = &self.connection
                {
                    let token = credential.expose().to_string();
                    self.connection = ConnectionState::AwaitingAuth { attempt };
                    effects.push(Effect::Send {
                        attempt,
                        command: ClientCommand::Auth { token },
                    });
                }
            }
            TransportEvent::Frame(text) => self.route_frame(&text, &mut effects),
            TransportEvent::Error(reason) => {
                self.open_link = None;
                effects.push(Effect::CloseTransport { attempt });
                self.fail_transport(reason, &mut effects);
            }
            // Closes this session asked for never reach here: `disconnect`
            // and `CloseTransport` retire the attempt first.
            TransportEvent::Closed { clean, reason } => {
                self.open_link = None;
                if clean && !self.is_running {
                    info!(
                        component = "session",
                        event = "session.transport.closed",
                        attempt,
                        "Connection closed"
                    );
                    self.connection = ConnectionState::Disconnected;
                    self.pending_run = None;
                    self.log(&mut effects, vec!["[CONNECTION] Connection closed".to_string()]);
                } else {
                    let fallback = if clean {
                        "server closed the connection"
                    } else {
                        "connection closed unexpectedly"
                    };
                    let reason = reason.unwrap_or_else(|| fallback.to_string());
                    self.fail_transport(reason, &mut effects);
                }
            }
        }

        self.finish(before, &mut effects);
        Transition::ok(effects, ())
    }

    fn fail_transport(&mut self, reason: String, effects: &mut Vec<Effect>) {
        warn!(
            component = "session",
            event = "session.transport.failed",
            error = %reason,
            was_running = self.is_running,
            "Connection lost"
        );
        self.connection = ConnectionState::Disconnected;
        self.pending_run = None;
        if self.is_running {
            self.is_running = false;
            self.error = Some(SessionError::Transport(reason.clone()).to_string());
        }
        self.log(effects, vec![format!("[CONNECTION ERROR] {}", reason)]);
    }

    /// Explicit user close. Discards any deferred run.
    pub fn disconnect(&mut self) -> Transition {
        let before = self.status();
        let mut effects = Vec::new();
        if let Some(attempt) = self.open_link.take() {
            effects.push(Effect::CloseTransport { attempt });
        }
        self.connection = ConnectionState::Closed;
        self.pending_run = None;
        self.is_running = false;
        self.finish(before, &mut effects);
        Transition::ok(effects, ())
    }

    /// Drop the accumulated session data. The connection is untouched.
    pub fn clear(&mut self) -> Transition {
        let before = self.status();
        let mut effects = Vec::new();
        self.output.clear();
        self.events.clear();
        self.chat.clear();
        self.approvals.clear();
        self.error = None;
        effects.push(Effect::Emit(SessionUpdate::Cleared));
        self.finish(before, &mut effects);
        Transition::ok(effects, ())
    }

    // -- Commands ------------------------------------------------------------

    /// Start a run. Sent at once when authenticated, deferred otherwise.
    /// Returns the fresh session id.
    pub fn start(&mut self, mut params: StartParams) -> Transition<String> {
        let before = self.status();
        let mut effects = Vec::new();

        self.output.clear();
        effects.push(Effect::Emit(SessionUpdate::OutputCleared));
        self.error = None;
        self.is_running = true;

        let session_id = new_id();
        self.session_id = Some(session_id.clone());
        params.session_id = Some(session_id.clone());

        if let ConnectionState::Authenticated { attempt } = self.connection {
            effects.push(Effect::Send {
                attempt,
                command: ClientCommand::Run { payload: params },
            });
        } else {
            if self.pending_run.replace(params).is_some() {
                debug!(
                    component = "session",
                    event = "session.run.replaced",
                    "Deferred run replaced by a newer start"
                );
            }
            self.begin_attempt(&mut effects);
        }

        info!(
            component = "session",
            event = "session.run.started",
            session_id = %session_id,
            deferred = self.pending_run.is_some(),
            "Run requested"
        );

        self.finish(before, &mut effects);
        Transition::ok(effects, session_id)
    }

    pub fn stop(&mut self) -> Transition {
        self.gated("stop", |_, effects, attempt| {
            effects.push(Effect::Send {
                attempt,
                command: ClientCommand::Stop {},
            });
            vec!["[STOP] Stop requested".to_string()]
        })
    }

    pub fn send_stdin(&mut self, data: &str) -> Transition {
        self.gated("stdin", |_, effects, attempt| {
            effects.push(Effect::Send {
                attempt,
                command: ClientCommand::Stdin {
                    payload: StdinPayload {
                        data: data.to_string(),
                    },
                },
            });
            vec![format!("> {}", data)]
        })
    }

    pub fn send_interrupt(&mut self, message: &str) -> Transition {
        self.gated("user_interrupt", |_, effects, attempt| {
            effects.push(Effect::Send {
                attempt,
                command: ClientCommand::UserInterrupt {
                    payload: InterruptPayload {
                        message: message.to_string(),
                    },
                },
            });
            vec![format!("[INTERRUPT] {}", message)]
        })
    }

    /// Blank messages are ignored without error.
    pub fn send_chat_message(&mut self, text: &str) -> Transition {
        if text.trim().is_empty() {
            return Transition::ok(Vec::new(), ());
        }
        self.gated("chat_message", |machine, effects, attempt| {
            let message_id = format!("user-{}", new_id());
            let timestamp = (machine.clock)().to_string();
            let echo = machine
                .chat
                .push_user(message_id.clone(), text.to_string(), timestamp)
                .clone();
            effects.push(Effect::Emit(SessionUpdate::Chat(echo)));

            let session_id = machine.session_id.get_or_insert_with(new_id).clone();
            effects.push(Effect::Send {
                attempt,
                command: ClientCommand::ChatMessage {
                    payload: ChatMessagePayload {
                        session_id,
                        message: text.to_string(),
                        message_id,
                    },
                },
            });
            Vec::new()
        })
    }

    pub fn send_approval_response(
        &mut self,
        approval_id: &str,
        approved: bool,
        message: Option<String>,
    ) -> Transition {
        self.gated("approval_response", |machine, effects, attempt| {
            if machine.approvals.answer(approval_id, approved) {
                if let Some(prompt) = machine.approvals.get(approval_id) {
                    effects.push(Effect::Emit(SessionUpdate::Approval(prompt.clone())));
                }
            } else {
                debug!(
                    component = "session",
                    event = "session.approval.unknown_id",
                    approval_id,
                    "Answering an approval the session has not seen"
                );
            }
            effects.push(Effect::Send {
                attempt,
                command: ClientCommand::ApprovalResponse {
                    payload: ApprovalResponsePayload {
                        approval_id: approval_id.to_string(),
                        approved,
                        message,
                    },
                },
            });
            vec![format!(
                "[APPROVAL] {} {}",
                if approved { "Approved" } else { "Denied" },
                approval_id
            )]
        })
    }

    /// Run `send` only when authenticated. Otherwise record a rejection and
    /// send nothing; the output log is left alone.
    fn gated<F>(&mut self, command: &'static str, send: F) -> Transition
    where
        F: FnOnce(&mut Self, &mut Vec<Effect>, u64) -> Vec<String>,
    {
        let before = self.status();
        let mut effects = Vec::new();

        let outcome = match self.connection {
            ConnectionState::Authenticated { attempt } => {
                let lines = send(self, &mut effects, attempt);
                self.log(&mut effects, lines);
                Ok(())
            }
            _ => {
                let error = SessionError::CommandRejected { command };
                warn!(
                    component = "session",
                    event = "session.command.rejected",
                    command,
                    connection = ?self.connection.status(),
                    "Command rejected before authentication"
                );
                self.error = Some(error.to_string());
                Err(error)
            }
        };

        self.finish(before, &mut effects);
        match outcome {
            Ok(()) => Transition::ok(effects, ()),
            Err(error) => Transition::err(effects, error),
        }
    }

    // -- Inbound routing -----------------------------------------------------

    fn route_frame(&mut self, text: &str, effects: &mut Vec<Effect>) {
        let now = (self.clock)();
        match classify(text, now) {
            Err(e) => {
                warn!(
                    component = "session",
                    event = "session.frame.parse_failed",
                    error = %e,
                    payload_bytes = text.len(),
                    "Failed to parse inbound frame"
                );
                self.log(effects, vec![PARSE_ERROR_LINE.to_string()]);
            }
            Ok(Classified::Control(frame)) => {
                let lines = project_control(&frame);
                self.log(effects, lines);
                self.apply_control(frame, effects);
            }
            Ok(Classified::Domain(event)) => {
                self.events.push(event.clone());
                effects.push(Effect::Emit(SessionUpdate::EventAppended(Box::new(
                    event.clone(),
                ))));
                let lines = project_event(&event.payload);
                self.log(effects, lines);
                self.apply_event(&event, effects);
            }
            Ok(Classified::Unknown { kind, payload }) => {
                debug!(
                    component = "session",
                    event = "session.frame.unknown_type",
                    kind = %kind,
                    "Unrecognized frame type"
                );
                self.log(effects, vec![project_unknown(&kind, &payload)]);
            }
        }
    }

    fn apply_control(&mut self, frame: ControlFrame, effects: &mut Vec<Effect>) {
        match frame {
            ControlFrame::AuthSuccess { .. } => {
                if let ConnectionState::AwaitingAuth { attempt } = self.connection {
                    self.connection = ConnectionState::Authenticated { attempt };
                    info!(
                        component = "session",
                        event = "session.authenticated",
                        attempt,
                        flush_run = self.pending_run.is_some(),
                        "Connection authenticated"
                    );
                    if let Some(params) = self.pending_run.take() {
                        effects.push(Effect::Send {
                            attempt,
                            command: ClientCommand::Run { payload: params },
                        });
                    }
                }
            }
            ControlFrame::Error { message } => {
                self.error = Some(message);
            }
            ControlFrame::End { .. } => {
                self.is_running = false;
            }
            ControlFrame::Status { .. }
            | ControlFrame::Warning { .. }
            | ControlFrame::Stdout { .. }
            | ControlFrame::Stderr { .. } => {}
        }
    }

    fn apply_event(&mut self, event: &Event, effects: &mut Vec<Effect>) {
        let timestamp = event.timestamp.clone();
        match &event.payload {
            EventPayload::ProcessEnd(_) => {
                self.is_running = false;
            }
            EventPayload::LlmRequestError(e) => {
                self.domain_error(format!("LLM Error: {}", e.error_message));
            }
            EventPayload::ToolExecutionResult(e) => {
                if let (true, Some(message)) = (e.is_failure(), e.error_message.as_deref()) {
                    self.domain_error(format!("Tool Error: {}", message));
                }
            }
            EventPayload::FileOperationComplete(e) => {
                if let (false, Some(error)) = (e.success, e.error.as_deref()) {
                    self.domain_error(format!("File Error: {}", error));
                }
            }
            EventPayload::SystemLog(e) => {
                if e.is_error() {
                    self.domain_error(e.message.clone());
                }
            }
            EventPayload::LlmActionFailed(e) => {
                self.domain_error(format!("Action failed: {}", e.error));
            }
            EventPayload::ChatError(e) => {
                self.chat.apply_error();
                self.domain_error(format!("Chat error: {}", e.error));
            }
            EventPayload::WaitingForApproval(request) => {
                if let Some(prompt) = self.approvals.request(request, timestamp) {
                    effects.push(Effect::Emit(SessionUpdate::Approval(prompt.clone())));
                }
            }
            EventPayload::ApprovalResponseReceived(response) => {
                if let Some(prompt) = self.approvals.resolve(response) {
                    effects.push(Effect::Emit(SessionUpdate::Approval(prompt.clone())));
                }
            }
            EventPayload::ChatResponse(response) => {
                if let Some(message) = self.chat.apply_response(response, timestamp) {
                    effects.push(Effect::Emit(SessionUpdate::Chat(message.clone())));
                }
            }
            EventPayload::ChatResponseChunk(chunk) => {
                if let Some(message) = self.chat.apply_chunk(chunk, timestamp) {
                    effects.push(Effect::Emit(SessionUpdate::Chat(message.clone())));
                }
            }
            EventPayload::ChatRequest(request) => {
                if let Some(message) = self.chat.apply_request(request, timestamp) {
                    effects.push(Effect::Emit(SessionUpdate::Chat(message.clone())));
                }
            }
            EventPayload::ProcessStart(_)
            | EventPayload::PhaseChange(_)
            | EventPayload::LlmRequestStart(_)
            | EventPayload::LlmRequestSuccess(_)
            | EventPayload::ToolExecutionStart(_)
            | EventPayload::FileOperationStart(_)
            | EventPayload::LlmActionsAvailable(_)
            | EventPayload::LlmActionStarted(_)
            | EventPayload::LlmActionProgress(_)
            | EventPayload::LlmActionCompleted(_) => {}
        }
    }

    fn domain_error(&mut self, message: String) {
        self.error = Some(SessionError::Domain(message).to_string());
    }

    // -- Helpers -------------------------------------------------------------

    fn log(&mut self, effects: &mut Vec<Effect>, lines: Vec<String>) {
        if lines.is_empty() {
            return;
        }
        self.output.extend(lines.iter().cloned());
        effects.push(Effect::Emit(SessionUpdate::Output { lines }));
    }

    fn finish(&self, before: SessionStatus, effects: &mut Vec<Effect>) {
        let after = self.status();
        if after != before {
            effects.push(Effect::Emit(SessionUpdate::Status(after)));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskpilot_protocol::ChatRole;

    const NOW: u128 = 1_700_000_000_000;

    fn fixed_clock() -> u128 {
        NOW
    }

    fn machine() -> SessionMachine {
        SessionMachine::with_clock(fixed_clock)
    }

    fn params() -> StartParams {
        StartParams {
            task: "Add a health endpoint".to_string(),
            mode: "agent".to_string(),
            model: "gpt-4o".to_string(),
            source: "cli".to_string(),
            project_path: "/tmp/project".to_string(),
            ..Default::default()
        }
    }

    fn sent(effects: &[Effect]) -> Vec<&ClientCommand> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send { command, .. } => Some(command),
                _ => None,
            })
            .collect()
    }

    fn frame(value: serde_json::Value) -> TransportEvent {
        TransportEvent::Frame(value.to_string())
    }

    /// Drive a fresh machine through credential, open and auth_success.
    fn authenticated() -> SessionMachine {
        let mut m = machine();
        let _ = m.connect();
        let _ = m.on_credential(1, Ok(Credential::new("tok")));
        let _ = m.on_transport(1, TransportEvent::Opened);
        let _ = m.on_transport(1, frame(json!({"type": "auth_success", "payload": {"message": "ok"}})));
        assert!(m.connection().is_authenticated());
        m
    }

    #[test]
    fn connect_fetches_credential_then_opens_then_authenticates() {
        let mut m = machine();

        let t = m.connect();
        assert!(t.effects.contains(&Effect::FetchCredential { attempt: 1 }));
        assert_eq!(m.connection().status(), ConnectionStatus::Connecting);

        let t = m.on_credential(1, Ok(Credential::new("tok-1")));
        assert!(t.effects.contains(&Effect::OpenTransport { attempt: 1 }));

        let t = m.on_transport(1, TransportEvent::Opened);
        assert_eq!(
            sent(&t.effects),
            vec![&ClientCommand::Auth {
                token: "tok-1".to_string()
            }]
        );
        assert_eq!(m.connection().status(), ConnectionStatus::AwaitingAuth);
        assert!(m.status().is_connected);

        let _ = m.on_transport(1, frame(json!({"type": "auth_success", "payload": {}})));
        assert!(m.connection().is_authenticated());
        assert_eq!(m.output().last().map(String::as_str), Some("[AUTH] Authenticated"));
    }

    #[test]
    fn connect_twice_is_a_noop() {
        let mut m = machine();
        let _ = m.connect();
        let t = m.connect();
        assert!(t.effects.is_empty());

        let mut m = authenticated();
        let t = m.connect();
        assert!(t.effects.is_empty());
    }

    #[test]
    fn credential_failure_fails_closed() {
        let mut m = machine();
        let started = m.start(params());
        assert!(started.outcome.is_ok());
        assert!(m.is_running());

        let t = m.on_credential(1, Err("HTTP 401".to_string()));
        assert!(!t
            .effects
            .iter()
            .any(|e| matches!(e, Effect::OpenTransport { .. })));
        assert_eq!(m.connection().status(), ConnectionStatus::Disconnected);
        assert!(!m.is_running());
        assert!(!m.has_pending_run());
        assert_eq!(m.error(), Some("Authentication setup failed: HTTP 401"));
        assert_eq!(m.output().last().map(String::as_str), Some("[AUTH ERROR] HTTP 401"));
    }

    #[test]
    fn session_is_reusable_after_credential_failure() {
        let mut m = machine();
        let _ = m.start(params());
        let _ = m.on_credential(1, Err("boom".to_string()));

        let t = m.start(params());
        assert!(t.effects.contains(&Effect::FetchCredential { attempt: 2 }));
        assert!(m.error().is_none());
        assert!(m.is_running());
    }

    #[test]
    fn start_while_disconnected_sends_exactly_one_run_after_auth() {
        let mut m = machine();
        let mut all_sent = Vec::new();

        let t = m.start(params());
        let session_id = t.outcome.expect("session id");
        all_sent.extend(sent(&t.effects).into_iter().cloned());
        assert!(all_sent.is_empty());

        let t = m.on_credential(1, Ok(Credential::new("tok")));
        all_sent.extend(sent(&t.effects).into_iter().cloned());
        let t = m.on_transport(1, TransportEvent::Opened);
        all_sent.extend(sent(&t.effects).into_iter().cloned());
        assert!(all_sent
            .iter()
            .all(|c| matches!(c, ClientCommand::Auth { .. })));

        let t = m.on_transport(1, frame(json!({"type": "auth_success"})));
        all_sent.extend(sent(&t.effects).into_iter().cloned());
        let t = m.on_transport(1, frame(json!({"type": "auth_success"})));
        all_sent.extend(sent(&t.effects).into_iter().cloned());

        let runs: Vec<_> = all_sent
            .iter()
            .filter_map(|c| match c {
                ClientCommand::Run { payload } => Some(payload),
                _ => None,
            })
            .collect();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].session_id.as_deref(), Some(session_id.as_str()));
        assert_eq!(runs[0].task, "Add a health endpoint");
    }

    #[test]
    fn second_start_before_auth_overwrites_pending_run() {
        let mut m = machine();
        let _ = m.start(params());
        let mut newer = params();
        newer.task = "Newer task".to_string();
        let t = m.start(newer);
        assert!(
            t.effects.iter().all(|e| !matches!(e, Effect::FetchCredential { .. })),
            "connect must not start a second attempt"
        );

        let _ = m.on_credential(1, Ok(Credential::new("tok")));
        let _ = m.on_transport(1, TransportEvent::Opened);
        let t = m.on_transport(1, frame(json!({"type": "auth_success"})));
        let runs: Vec<_> = sent(&t.effects)
            .into_iter()
            .filter_map(|c| match c {
                ClientCommand::Run { payload } => Some(payload.task.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(runs, vec!["Newer task".to_string()]);
    }

    #[test]
    fn start_when_authenticated_sends_run_immediately() {
        let mut m = authenticated();
        let t = m.start(params());
        assert!(matches!(
            sent(&t.effects).as_slice(),
            [ClientCommand::Run { .. }]
        ));
        assert!(m.output().is_empty());
        assert!(m.is_running());
    }

    #[test]
    fn gated_commands_before_auth_send_nothing_and_set_error() {
        for name in [
            "stop",
            "stdin",
            "chat_message",
            "user_interrupt",
            "approval_response",
        ] {
            let mut m = machine();
            let t = match name {
                "stop" => m.stop(),
                "stdin" => m.send_stdin("ls"),
                "chat_message" => m.send_chat_message("hello"),
                "user_interrupt" => m.send_interrupt("wait"),
                _ => m.send_approval_response("ap-1", true, None),
            };
            assert!(sent(&t.effects).is_empty(), "{name} sent a frame");
            assert_eq!(
                t.outcome,
                Err(SessionError::CommandRejected { command: name })
            );
            assert!(m.error().is_some(), "{name} left error unset");
            assert!(m.output().is_empty(), "{name} touched output");
        }
    }

    #[test]
    fn gated_commands_are_rejected_while_awaiting_auth() {
        let mut m = machine();
        let _ = m.connect();
        let _ = m.on_credential(1, Ok(Credential::new("tok")));
        let _ = m.on_transport(1, TransportEvent::Opened);

        let t = m.send_stdin("ls");
        assert!(sent(&t.effects).is_empty());
        assert!(t.outcome.is_err());
    }

    #[test]
    fn stdin_when_authenticated_is_sent_and_logged() {
        let mut m = authenticated();
        let t = m.send_stdin("ls");
        assert!(t.outcome.is_ok());
        assert_eq!(
            sent(&t.effects),
            vec![&ClientCommand::Stdin {
                payload: StdinPayload {
                    data: "ls".to_string()
                }
            }]
        );
        assert_eq!(m.output().last().map(String::as_str), Some("> ls"));
    }

    #[test]
    fn stop_and_interrupt_do_not_clear_running() {
        let mut m = authenticated();
        let _ = m.start(params());
        let _ = m.stop();
        let _ = m.send_interrupt("hold on");
        assert!(m.is_running());
        assert_eq!(
            m.output(),
            &["[STOP] Stop requested".to_string(), "[INTERRUPT] hold on".to_string()]
        );
    }

    #[test]
    fn process_start_scenario() {
        let mut m = authenticated();
        let _ = m.clear();
        let _ = m.on_transport(
            1,
            frame(json!({"type": "process_start", "payload": {"taskDescription": "Test task description"}})),
        );
        assert_eq!(m.output(), &["[PROCESS] Started: Test task description".to_string()]);
        assert!(m.error().is_none());
        assert_eq!(m.events().len(), 1);
        assert_eq!(m.events()[0].kind(), "process_start");
    }

    #[test]
    fn failing_tool_result_scenario() {
        let mut m = authenticated();
        let _ = m.on_transport(
            1,
            frame(json!({"type": "tool_execution_result", "payload": {
                "toolName": "execute_command",
                "status": "failure",
                "resultSummary": "Command failed",
                "errorMessage": "Permission denied"
            }})),
        );
        assert_eq!(
            m.output().last().map(String::as_str),
            Some("[TOOL FAILURE] execute_command: Command failed")
        );
        assert_eq!(m.error(), Some("Tool Error: Permission denied"));
    }

    #[test]
    fn unknown_frame_scenario() {
        let mut m = authenticated();
        let events_before = m.events().len();
        let _ = m.on_transport(1, frame(json!({"type": "foo", "payload": {"a": 1}})));
        assert_eq!(
            m.output().last().map(String::as_str),
            Some(r#"[UNKNOWN EVENT] foo: {"a":1}"#)
        );
        assert_eq!(m.events().len(), events_before);
    }

    #[test]
    fn unparseable_frame_logs_once_and_changes_nothing_else() {
        let mut m = authenticated();
        let _ = m.start(params());
        let before = m.status();
        let t = m.on_transport(1, TransportEvent::Frame("{not json".to_string()));
        assert_eq!(m.output(), &[PARSE_ERROR_LINE.to_string()]);
        assert_eq!(m.status(), before);
        assert!(m.events().is_empty());
        assert!(sent(&t.effects).is_empty());
    }

    #[test]
    fn aggregate_error_table() {
        let cases = vec![
            (json!({"type": "error", "payload": {"message": "bad request"}}), "bad request"),
            (json!({"type": "llm_request_error", "payload": {"errorMessage": "timeout"}}), "LLM Error: timeout"),
            (json!({"type": "file_operation_complete", "payload": {"operationType": "write", "success": false, "error": "EACCES"}}), "File Error: EACCES"),
            (json!({"type": "system_log", "payload": {"level": "error", "message": "disk full"}}), "disk full"),
            (json!({"type": "llm_action_failed", "payload": {"actionId": "a1", "error": "exit 2"}}), "Action failed: exit 2"),
            (json!({"type": "chat_error", "payload": {"error": "model offline"}}), "Chat error: model offline"),
        ];

        for (input, expected) in cases {
            let mut m = authenticated();
            let _ = m.start(params());
            let _ = m.on_transport(1, frame(input.clone()));
            assert_eq!(m.error(), Some(expected), "for {input}");
            assert!(m.is_running(), "domain errors must not stop the run: {input}");
        }
    }

    #[test]
    fn non_error_variants_leave_error_alone() {
        let mut m = authenticated();
        let _ = m.on_transport(1, frame(json!({"type": "system_log", "payload": {"level": "info", "message": "hi"}})));
        let _ = m.on_transport(1, frame(json!({"type": "tool_execution_result", "payload": {"toolName": "x", "status": "failure"}})));
        let _ = m.on_transport(1, frame(json!({"type": "file_operation_complete", "payload": {"operationType": "read", "success": true}})));
        assert!(m.error().is_none());
    }

    #[test]
    fn terminal_signals_clear_running() {
        for input in [
            json!({"type": "end", "payload": {"exitCode": 0}}),
            json!({"type": "process_end", "payload": {"status": "completed"}}),
        ] {
            let mut m = authenticated();
            let _ = m.start(params());
            let _ = m.on_transport(1, frame(input.clone()));
            assert!(!m.is_running(), "for {input}");
            assert!(m.error().is_none());
        }
    }

    #[test]
    fn transport_error_while_running_clears_running_and_records_error() {
        let mut m = authenticated();
        let _ = m.start(params());
        let t = m.on_transport(1, TransportEvent::Error("reset by peer".to_string()));

        assert!(t.effects.contains(&Effect::CloseTransport { attempt: 1 }));
        assert!(!m.is_running());
        assert!(!m.status().is_connected);
        assert_eq!(m.connection().status(), ConnectionStatus::Disconnected);
        assert_eq!(m.error(), Some("Connection error: reset by peer"));
    }

    #[test]
    fn unclean_close_while_idle_does_not_record_error() {
        let mut m = authenticated();
        let _ = m.on_transport(
            1,
            TransportEvent::Closed {
                clean: false,
                reason: None,
            },
        );
        assert_eq!(m.connection().status(), ConnectionStatus::Disconnected);
        assert!(m.error().is_none());
    }

    #[test]
    fn server_close_while_running_ends_the_run() {
        let mut m = authenticated();
        let _ = m.start(params());
        let _ = m.on_transport(
            1,
            TransportEvent::Closed {
                clean: true,
                reason: None,
            },
        );

        assert!(!m.is_running());
        assert_eq!(m.connection().status(), ConnectionStatus::Disconnected);
        assert_eq!(
            m.error(),
            Some("Connection error: server closed the connection")
        );
        assert_eq!(
            m.output().last().map(String::as_str),
            Some("[CONNECTION ERROR] server closed the connection")
        );

        // The session stays usable: a new start opens a fresh attempt.
        let t = m.start(params());
        assert!(t.effects.contains(&Effect::FetchCredential { attempt: 2 }));
    }

    #[test]
    fn clean_close_while_idle_is_not_an_error() {
        let mut m = authenticated();
        let _ = m.on_transport(
            1,
            TransportEvent::Closed {
                clean: true,
                reason: None,
            },
        );
        assert!(m.error().is_none());
        assert_eq!(
            m.output().last().map(String::as_str),
            Some("[CONNECTION] Connection closed")
        );
    }

    #[test]
    fn signals_from_superseded_attempt_are_ignored() {
        let mut m = authenticated();
        let _ = m.on_transport(1, TransportEvent::Error("gone".to_string()));
        let _ = m.connect();
        assert_eq!(m.connection().attempt(), Some(2));

        let output_len = m.output().len();
        let t = m.on_transport(1, frame(json!({"type": "process_start", "payload": {"taskDescription": "late"}})));
        assert!(t.effects.is_empty());
        assert_eq!(m.output().len(), output_len);
        assert!(m.events().is_empty());
    }

    #[test]
    fn reconnect_after_close_starts_a_fresh_attempt() {
        let mut m = machine();
        let _ = m.connect();
        let _ = m.on_credential(1, Ok(Credential::new("tok")));
        let _ = m.on_transport(
            1,
            TransportEvent::Closed {
                clean: true,
                reason: None,
            },
        );
        // Clean close dropped the handle, so a new attempt has nothing to close.
        let t = m.connect();
        assert_eq!(t.effects[0], Effect::FetchCredential { attempt: 2 });

        let mut m = authenticated();
        let _ = m.disconnect();
        assert_eq!(m.connection().status(), ConnectionStatus::Closed);
        let t = m.connect();
        assert_eq!(t.effects[0], Effect::FetchCredential { attempt: 2 });
    }

    #[test]
    fn disconnect_closes_live_handle_and_drops_pending_run() {
        let mut m = machine();
        let _ = m.start(params());
        let _ = m.on_credential(1, Ok(Credential::new("tok")));
        let t = m.disconnect();
        assert!(t.effects.contains(&Effect::CloseTransport { attempt: 1 }));
        assert!(!m.has_pending_run());
        assert_eq!(m.connection().status(), ConnectionStatus::Closed);
    }

    #[test]
    fn events_and_output_preserve_arrival_order() {
        let mut m = authenticated();
        let _ = m.clear();
        let frames = vec![
            json!({"type": "process_start", "payload": {"taskDescription": "t"}}),
            json!({"type": "phase_change", "payload": {"phaseName": "Plan"}}),
            json!({"type": "stdout", "payload": {"data": "building"}}),
            json!({"type": "tool_execution_start", "payload": {"toolName": "grep"}}),
            json!({"type": "process_end", "payload": {"status": "done"}}),
        ];
        for f in frames {
            let _ = m.on_transport(1, frame(f));
        }

        let kinds: Vec<&str> = m.events().iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec!["process_start", "phase_change", "tool_execution_start", "process_end"]
        );
        assert_eq!(
            m.output(),
            &[
                "[PROCESS] Started: t".to_string(),
                "[PHASE] Plan: ".to_string(),
                "building".to_string(),
                "[TOOL] Starting: grep - No details".to_string(),
                "[PROCESS] Ended: done - No message".to_string(),
            ]
        );
    }

    #[test]
    fn chunked_chat_scenario() {
        let mut m = authenticated();
        let _ = m.on_transport(1, frame(json!({"type": "chat_response", "payload": {"messageId": "m1", "content": "", "streaming": true}})));
        let _ = m.on_transport(1, frame(json!({"type": "chat_response_chunk", "payload": {"messageId": "m1", "chunk": "Hel", "done": false}})));
        assert!(m.chat().get("m1").expect("m1").is_streaming);
        assert!(m.status().is_typing);

        let _ = m.on_transport(1, frame(json!({"type": "chat_response_chunk", "payload": {"messageId": "m1", "chunk": "lo", "done": true}})));
        let message = m.chat().get("m1").expect("m1");
        assert_eq!(message.content, "Hello");
        assert!(!message.is_streaming);
        assert!(!m.status().is_typing);
    }

    #[test]
    fn chat_message_echoes_and_sends_with_session_id() {
        let mut m = authenticated();
        let session_id = m.start(params()).outcome.expect("session id");

        let t = m.send_chat_message("What's left?");
        assert!(t.outcome.is_ok());
        let echo = &m.chat().messages()[0];
        assert_eq!(echo.role, ChatRole::User);
        assert_eq!(echo.content, "What's left?");
        assert!(m.status().is_typing);

        match sent(&t.effects).as_slice() {
            [ClientCommand::ChatMessage { payload }] => {
                assert_eq!(payload.session_id, session_id);
                assert_eq!(payload.message, "What's left?");
                assert_eq!(payload.message_id, echo.id);
            }
            other => panic!("unexpected sends: {:?}", other),
        }
    }

    #[test]
    fn blank_chat_message_is_ignored() {
        let mut m = machine();
        let t = m.send_chat_message("   ");
        assert!(t.outcome.is_ok());
        assert!(t.effects.is_empty());
        assert!(m.error().is_none());
    }

    #[test]
    fn chat_error_clears_typing_and_keeps_transcript() {
        let mut m = authenticated();
        let _ = m.send_chat_message("hello");
        let _ = m.on_transport(1, frame(json!({"type": "chat_error", "payload": {"error": "model offline"}})));
        assert!(!m.status().is_typing);
        assert_eq!(m.chat().messages().len(), 1);
        assert_eq!(m.error(), Some("Chat error: model offline"));
    }

    #[test]
    fn approval_prompt_is_surfaced_and_answered() {
        let mut m = authenticated();
        let t = m.on_transport(1, frame(json!({"type": "waiting_for_approval", "payload": {
            "approvalId": "ap-1",
            "actionDescription": "Run migration",
            "proposedCommand": "make migrate"
        }})));
        assert!(t
            .effects
            .iter()
            .any(|e| matches!(e, Effect::Emit(SessionUpdate::Approval(p)) if p.approval_id == "ap-1")));
        assert_eq!(m.approvals().pending().count(), 1);

        let t = m.send_approval_response("ap-1", true, Some("ship it".to_string()));
        assert_eq!(
            sent(&t.effects),
            vec![&ClientCommand::ApprovalResponse {
                payload: ApprovalResponsePayload {
                    approval_id: "ap-1".to_string(),
                    approved: true,
                    message: Some("ship it".to_string()),
                }
            }]
        );
        assert_eq!(m.approvals().pending().count(), 0);
    }

    #[test]
    fn status_update_is_emitted_only_on_change() {
        let mut m = authenticated();
        let t = m.on_transport(1, frame(json!({"type": "phase_change", "payload": {"phaseName": "Plan"}})));
        assert!(!t
            .effects
            .iter()
            .any(|e| matches!(e, Effect::Emit(SessionUpdate::Status(_)))));

        let t = m.on_transport(1, frame(json!({"type": "llm_request_error", "payload": {"errorMessage": "x"}})));
        assert!(t
            .effects
            .iter()
            .any(|e| matches!(e, Effect::Emit(SessionUpdate::Status(s)) if s.error.as_deref() == Some("LLM Error: x"))));
    }

    #[test]
    fn clear_resets_view_but_keeps_connection() {
        let mut m = authenticated();
        let _ = m.on_transport(1, frame(json!({"type": "process_start", "payload": {"taskDescription": "t"}})));
        let _ = m.clear();
        assert!(m.output().is_empty());
        assert!(m.events().is_empty());
        assert!(m.connection().is_authenticated());
    }
}
