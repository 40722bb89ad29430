//! Session actor: owns a [`SessionMachine`] and processes commands sequentially.
//!
//! Each session runs as one tokio task. Callers talk to it through
//! [`SessionHandle`], which sends [`SessionCommand`] messages over an mpsc
//! channel. Transport signals and credential results are fed into the same
//! loop, so inbound frames are applied strictly in arrival order. Reads go
//! through `ArcSwap` and never wait on the actor.

use std::sync::Arc;

use arc_swap::ArcSwap;
use taskpilot_protocol::{ClientCommand, StartParams};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::connection::ConnectionState;
use crate::credentials::{Credential, CredentialSource};
use crate::error::SessionError;
use crate::session_command::{Reply, SessionCommand};
use crate::transition::{Effect, SessionMachine, SessionSnapshot, SessionUpdate, Transition};
use crate::transport::{OutboundFrame, Transport, TransportEvent, TransportLink};

const COMMAND_CHANNEL_CAPACITY: usize = 256;
const UPDATE_CHANNEL_CAPACITY: usize = 1024;

/// Handle to a running session actor (cheap to Clone).
#[derive(Clone)]
pub struct SessionHandle {
    command_tx: mpsc::Sender<SessionCommand>,
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
    updates: broadcast::Sender<SessionUpdate>,
}

impl SessionHandle {
    /// Spawn a session actor on the current runtime.
    pub fn spawn(transport: Arc<dyn Transport>, credentials: Arc<dyn CredentialSource>) -> Self {
        Self::spawn_with(SessionMachine::new(), transport, credentials)
    }

    pub fn spawn_with(
        machine: SessionMachine,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (credential_tx, credential_rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let snapshot = Arc::new(ArcSwap::from_pointee(machine.snapshot()));

        let actor = SessionActor {
            machine,
            transport,
            credentials,
            link: None,
            connect_waiters: Vec::new(),
            credential_tx,
            snapshot: snapshot.clone(),
            updates: updates.clone(),
        };
        tokio::spawn(actor.run(command_rx, credential_rx));

        Self {
            command_tx,
            snapshot,
            updates,
        }
    }

    /// Open and authenticate the connection if it is not already live.
    /// Resolves once the credential for the attempt has been fetched.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Connect { reply }).await
    }

    /// Start a run. Returns the generated session id.
    pub async fn start(&self, params: StartParams) -> Result<String, SessionError> {
        self.request(|reply| SessionCommand::Start {
            params: Box::new(params),
            reply,
        })
        .await
    }

    pub async fn stop(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Stop { reply }).await
    }

    pub async fn send_stdin(&self, data: impl Into<String>) -> Result<(), SessionError> {
        let data = data.into();
        self.request(|reply| SessionCommand::Stdin { data, reply })
            .await
    }

    pub async fn send_chat_message(&self, text: impl Into<String>) -> Result<(), SessionError> {
        let text = text.into();
        self.request(|reply| SessionCommand::ChatMessage { text, reply })
            .await
    }

    pub async fn send_interrupt(&self, message: impl Into<String>) -> Result<(), SessionError> {
        let message = message.into();
        self.request(|reply| SessionCommand::Interrupt { message, reply })
            .await
    }

    pub async fn send_approval_response(
        &self,
        approval_id: impl Into<String>,
        approved: bool,
        message: Option<String>,
    ) -> Result<(), SessionError> {
        let approval_id = approval_id.into();
        self.request(|reply| SessionCommand::ApprovalResponse {
            approval_id,
            approved,
            message,
            reply,
        })
        .await
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Disconnect { reply })
            .await
    }

    pub async fn clear(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Clear { reply }).await
    }

    /// Lock-free snapshot read.
    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.snapshot.load_full()
    }

    /// Receive every update applied after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = make(reply_tx);
        let name = command.name();
        if self.command_tx.send(command).await.is_err() {
            warn!(
                component = "session_actor",
                event = "session_actor.command.dropped",
                command = name,
                "Actor channel closed, command dropped"
            );
            return Err(SessionError::SessionClosed);
        }
        reply_rx.await.map_err(|_| SessionError::SessionClosed)?
    }
}

struct ActiveLink {
    attempt: u64,
    link: TransportLink,
}

type CredentialResult = (u64, Result<Credential, String>);

struct SessionActor {
    machine: SessionMachine,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialSource>,
    link: Option<ActiveLink>,
    connect_waiters: Vec<(u64, Reply)>,
    credential_tx: mpsc::UnboundedSender<CredentialResult>,
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
    updates: broadcast::Sender<SessionUpdate>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<SessionCommand>,
        mut credential_rx: mpsc::UnboundedReceiver<CredentialResult>,
    ) {
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },

                Some((attempt, result)) = credential_rx.recv() => {
                    self.handle_credential(attempt, result);
                }

                (attempt, event) = next_transport_event(&mut self.link) => {
                    let event = event.unwrap_or_else(|| TransportEvent::Closed {
                        clean: false,
                        reason: Some("transport ended".to_string()),
                    });
                    if matches!(event, TransportEvent::Closed { .. }) {
                        self.link = None;
                    }
                    let transition = self.machine.on_transport(attempt, event);
                    let _ = self.apply(transition);
                }
            }
        }

        if let Some(active) = self.link.take() {
            let _ = active.link.outbound.send(OutboundFrame::Close);
        }
        debug!(
            component = "session_actor",
            event = "session_actor.stopped",
            "All handles dropped, session actor exiting"
        );
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Connect { reply } => {
                let transition = self.machine.connect();
                let _ = self.apply(transition);
                self.wait_for_credential(reply);
            }
            SessionCommand::Disconnect { reply } => {
                let transition = self.machine.disconnect();
                let outcome = self.apply(transition);
                for (_, waiter) in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Err(SessionError::Transport(
                        "disconnected before the connection was established".to_string(),
                    )));
                }
                let _ = reply.send(outcome);
            }
            SessionCommand::Clear { reply } => {
                let transition = self.machine.clear();
                let _ = reply.send(self.apply(transition));
            }
            SessionCommand::Start { params, reply } => {
                let transition = self.machine.start(*params);
                let _ = reply.send(self.apply(transition));
            }
            SessionCommand::Stop { reply } => {
                let transition = self.machine.stop();
                let _ = reply.send(self.apply(transition));
            }
            SessionCommand::Stdin { data, reply } => {
                let transition = self.machine.send_stdin(&data);
                let _ = reply.send(self.apply(transition));
            }
            SessionCommand::Interrupt { message, reply } => {
                let transition = self.machine.send_interrupt(&message);
                let _ = reply.send(self.apply(transition));
            }
            SessionCommand::ChatMessage { text, reply } => {
                let transition = self.machine.send_chat_message(&text);
                let _ = reply.send(self.apply(transition));
            }
            SessionCommand::ApprovalResponse {
                approval_id,
                approved,
                message,
                reply,
            } => {
                let transition =
                    self.machine
                        .send_approval_response(&approval_id, approved, message);
                let _ = reply.send(self.apply(transition));
            }
        }
    }

    /// Park `reply` until the in-flight credential fetch settles, or resolve
    /// it now when nothing is being fetched.
    fn wait_for_credential(&mut self, reply: Reply) {
        match self.machine.connection() {
            ConnectionState::Connecting {
                attempt,
                credential: None,
            } => self.connect_waiters.push((*attempt, reply)),
            _ => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn handle_credential(&mut self, attempt: u64, result: Result<Credential, String>) {
        let waiter_result = match &result {
            Ok(_) => Ok(()),
            Err(reason) => Err(SessionError::AuthSetup(reason.clone())),
        };
        let transition = self.machine.on_credential(attempt, result);
        let _ = self.apply(transition);

        let (settled, pending): (Vec<_>, Vec<_>) = self
            .connect_waiters
            .drain(..)
            .partition(|(waiting_on, _)| *waiting_on == attempt);
        self.connect_waiters = pending;
        for (_, waiter) in settled {
            let _ = waiter.send(waiter_result.clone());
        }
    }

    /// Carry out a transition's effects, publish the new snapshot, then
    /// broadcast its updates.
    fn apply<T>(&mut self, transition: Transition<T>) -> Result<T, SessionError> {
        let mut updates = Vec::new();

        for effect in transition.effects {
            match effect {
                Effect::FetchCredential { attempt } => self.fetch_credential(attempt),
                Effect::OpenTransport { attempt } => self.open_transport(attempt),
                Effect::Send { attempt, command } => self.send_frame(attempt, &command),
                Effect::CloseTransport { attempt } => self.close_transport(attempt),
                Effect::Emit(update) => updates.push(update),
            }
        }

        if !updates.is_empty() {
            self.snapshot.store(Arc::new(self.machine.snapshot()));
            for update in updates {
                // No receivers is fine
                let _ = self.updates.send(update);
            }
        }

        transition.outcome
    }

    fn fetch_credential(&self, attempt: u64) {
        let fetch = self.credentials.fetch();
        let credential_tx = self.credential_tx.clone();
        tokio::spawn(async move {
            let result = fetch.await.map_err(|e| e.to_string());
            let _ = credential_tx.send((attempt, result));
        });
    }

    fn open_transport(&mut self, attempt: u64) {
        if let Some(stale) = self.link.take() {
            let _ = stale.link.outbound.send(OutboundFrame::Close);
        }
        info!(
            component = "session_actor",
            event = "session_actor.transport.open",
            attempt,
            "Opening transport"
        );
        self.link = Some(ActiveLink {
            attempt,
            link: self.transport.open(),
        });
    }

    fn send_frame(&mut self, attempt: u64, command: &ClientCommand) {
        let Some(active) = self.link.as_ref().filter(|a| a.attempt == attempt) else {
            warn!(
                component = "session_actor",
                event = "session_actor.send.no_link",
                attempt,
                command = command.kind(),
                "No open transport for command"
            );
            return;
        };

        let text = match serde_json::to_string(command) {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    component = "session_actor",
                    event = "session_actor.send.encode_failed",
                    command = command.kind(),
                    error = %e,
                    "Failed to encode command"
                );
                return;
            }
        };

        if active.link.outbound.send(OutboundFrame::Text(text)).is_err() {
            warn!(
                component = "session_actor",
                event = "session_actor.send.closed",
                attempt,
                command = command.kind(),
                "Transport closed, command dropped"
            );
        } else {
            debug!(
                component = "session_actor",
                event = "session_actor.send",
                attempt,
                command = command.kind(),
                "Command queued"
            );
        }
    }

    fn close_transport(&mut self, attempt: u64) {
        if self.link.as_ref().is_some_and(|a| a.attempt == attempt) {
            if let Some(active) = self.link.take() {
                let _ = active.link.outbound.send(OutboundFrame::Close);
            }
        }
    }
}

/// Next signal from the open transport; pends forever when there is none.
/// `None` means the transport dropped its sender without a close signal.
async fn next_transport_event(link: &mut Option<ActiveLink>) -> (u64, Option<TransportEvent>) {
    match link {
        Some(active) => {
            let event = active.link.inbound.recv().await;
            (active.attempt, event)
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::future::BoxFuture;
    use serde_json::{json, Value};
    use tokio::time::timeout;

    use crate::connection::ConnectionStatus;
    use crate::credentials::{CredentialError, StaticCredentialSource};

    const WAIT: Duration = Duration::from_secs(2);

    struct FakeLink {
        sent: mpsc::UnboundedReceiver<OutboundFrame>,
        events: mpsc::UnboundedSender<TransportEvent>,
    }

    impl FakeLink {
        async fn next_frame(&mut self) -> OutboundFrame {
            timeout(WAIT, self.sent.recv())
                .await
                .expect("timed out waiting for outbound frame")
                .expect("outbound channel closed")
        }

        async fn next_json(&mut self) -> Value {
            match self.next_frame().await {
                OutboundFrame::Text(text) => serde_json::from_str(&text).expect("valid json"),
                OutboundFrame::Close => panic!("expected a text frame, got close"),
            }
        }

        fn push(&self, value: Value) {
            self.events
                .send(TransportEvent::Frame(value.to_string()))
                .expect("actor listening");
        }
    }

    /// Opens in-memory links and hands the far end to the test.
    struct FakeTransport {
        opened: mpsc::UnboundedSender<FakeLink>,
    }

    impl Transport for FakeTransport {
        fn open(&self) -> TransportLink {
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let _ = event_tx.send(TransportEvent::Opened);
            let _ = self.opened.send(FakeLink {
                sent: outbound_rx,
                events: event_tx,
            });
            TransportLink {
                outbound: outbound_tx,
                inbound: event_rx,
            }
        }
    }

    struct FailingCredentials;

    impl CredentialSource for FailingCredentials {
        fn fetch(&self) -> BoxFuture<'static, Result<Credential, CredentialError>> {
            Box::pin(async { Err(CredentialError::Status(401)) })
        }
    }

    fn spawn_session(
        credentials: Arc<dyn CredentialSource>,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<FakeLink>) {
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(FakeTransport { opened: opened_tx });
        (SessionHandle::spawn(transport, credentials), opened_rx)
    }

    async fn next_link(links: &mut mpsc::UnboundedReceiver<FakeLink>) -> FakeLink {
        timeout(WAIT, links.recv())
            .await
            .expect("timed out waiting for transport open")
            .expect("transport dropped")
    }

    async fn wait_until(handle: &SessionHandle, check: impl Fn(&SessionSnapshot) -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if check(&handle.snapshot()) {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("condition not reached; snapshot: {:?}", handle.snapshot());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn authenticate(link: &mut FakeLink, handle: &SessionHandle) {
        let auth = link.next_json().await;
        assert_eq!(auth, json!({"type": "auth", "token": "tok"}));
        link.push(json!({"type": "auth_success", "payload": {"message": "Welcome"}}));
        wait_until(handle, |s| {
            s.status.connection == ConnectionStatus::Authenticated
        })
        .await;
    }

    fn params(task: &str) -> StartParams {
        StartParams {
            task: task.to_string(),
            mode: "agent".to_string(),
            model: "gpt-4o".to_string(),
            source: "cli".to_string(),
            project_path: "/tmp/project".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn start_while_disconnected_sends_run_after_auth_success() {
        let (handle, mut links) = spawn_session(Arc::new(StaticCredentialSource::new("tok")));

        let session_id = handle.start(params("Fix the build")).await.expect("start");
        assert!(handle.snapshot().status.is_running);

        let mut link = next_link(&mut links).await;
        assert_eq!(link.next_json().await["type"], "auth");
        assert!(link.sent.try_recv().is_err(), "run sent before auth_success");

        link.push(json!({"type": "auth_success"}));
        let run = link.next_json().await;
        assert_eq!(run["type"], "run");
        assert_eq!(run["payload"]["task"], "Fix the build");
        assert_eq!(run["payload"]["sessionId"], session_id.as_str());

        wait_until(&handle, |s| s.output == vec!["[AUTH] Authenticated".to_string()]).await;
        assert!(link.sent.try_recv().is_err(), "run sent twice");
    }

    #[tokio::test]
    async fn commands_before_auth_are_rejected_locally() {
        let (handle, mut links) = spawn_session(Arc::new(StaticCredentialSource::new("tok")));

        let err = handle.send_stdin("ls").await.expect_err("rejected");
        assert_eq!(err, SessionError::CommandRejected { command: "stdin" });

        let snapshot = handle.snapshot();
        assert!(snapshot.status.error.is_some());
        assert!(snapshot.output.is_empty());
        assert!(links.try_recv().is_err(), "no transport should be opened");
    }

    #[tokio::test]
    async fn credential_failure_opens_no_transport() {
        let (handle, mut links) = spawn_session(Arc::new(FailingCredentials));

        let err = handle.connect().await.expect_err("auth setup fails");
        assert!(matches!(err, SessionError::AuthSetup(_)));

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.status.connection, ConnectionStatus::Disconnected);
        assert_eq!(
            snapshot.status.error.as_deref(),
            Some("Authentication setup failed: token endpoint returned HTTP 401")
        );
        assert_eq!(
            snapshot.output,
            vec!["[AUTH ERROR] token endpoint returned HTTP 401".to_string()]
        );
        assert!(links.try_recv().is_err());
    }

    #[tokio::test]
    async fn connect_twice_opens_one_transport() {
        let (handle, mut links) = spawn_session(Arc::new(StaticCredentialSource::new("tok")));

        handle.connect().await.expect("connect");
        let mut link = next_link(&mut links).await;
        authenticate(&mut link, &handle).await;

        handle.connect().await.expect("second connect");
        assert!(links.try_recv().is_err(), "second transport opened");
        assert!(link.sent.try_recv().is_err(), "second auth sent");
    }

    #[tokio::test]
    async fn inbound_frames_update_snapshot_and_broadcast() {
        let (handle, mut links) = spawn_session(Arc::new(StaticCredentialSource::new("tok")));
        handle.connect().await.expect("connect");
        let mut link = next_link(&mut links).await;
        authenticate(&mut link, &handle).await;

        let mut updates = handle.subscribe();
        link.push(json!({"type": "process_start", "payload": {"taskDescription": "Test task description"}}));

        let mut saw_event = false;
        let mut saw_output = false;
        while !(saw_event && saw_output) {
            let update = timeout(WAIT, updates.recv())
                .await
                .expect("timed out waiting for update")
                .expect("update");
            match update {
                SessionUpdate::EventAppended(event) => {
                    assert_eq!(event.kind(), "process_start");
                    saw_event = true;
                }
                SessionUpdate::Output { lines } => {
                    assert_eq!(lines, vec!["[PROCESS] Started: Test task description".to_string()]);
                    saw_output = true;
                }
                _ => {}
            }
        }

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.events.len(), 1);
        assert_eq!(
            snapshot.output.last().map(String::as_str),
            Some("[PROCESS] Started: Test task description")
        );
    }

    #[tokio::test]
    async fn chat_message_is_sent_with_echo() {
        let (handle, mut links) = spawn_session(Arc::new(StaticCredentialSource::new("tok")));
        handle.connect().await.expect("connect");
        let mut link = next_link(&mut links).await;
        authenticate(&mut link, &handle).await;

        handle.send_chat_message("hello").await.expect("chat");
        let frame = link.next_json().await;
        assert_eq!(frame["type"], "chat_message");
        assert_eq!(frame["payload"]["message"], "hello");

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.chat_messages.len(), 1);
        assert_eq!(
            frame["payload"]["messageId"],
            snapshot.chat_messages[0].id.as_str()
        );
        assert!(snapshot.status.is_typing);
    }

    #[tokio::test]
    async fn unclean_close_while_running_clears_running() {
        let (handle, mut links) = spawn_session(Arc::new(StaticCredentialSource::new("tok")));
        handle.start(params("Long task")).await.expect("start");
        let mut link = next_link(&mut links).await;
        authenticate(&mut link, &handle).await;
        assert_eq!(link.next_json().await["type"], "run");

        link.events
            .send(TransportEvent::Closed {
                clean: false,
                reason: Some("abnormal closure".to_string()),
            })
            .expect("actor listening");

        wait_until(&handle, |s| !s.status.is_running).await;
        let snapshot = handle.snapshot();
        assert!(!snapshot.status.is_connected);
        assert_eq!(
            snapshot.status.error.as_deref(),
            Some("Connection error: abnormal closure")
        );
        assert_eq!(
            snapshot.output.last().map(String::as_str),
            Some("[CONNECTION ERROR] abnormal closure")
        );
    }

    #[tokio::test]
    async fn disconnect_closes_the_transport() {
        let (handle, mut links) = spawn_session(Arc::new(StaticCredentialSource::new("tok")));
        handle.connect().await.expect("connect");
        let mut link = next_link(&mut links).await;
        authenticate(&mut link, &handle).await;

        handle.disconnect().await.expect("disconnect");
        assert_eq!(link.next_frame().await, OutboundFrame::Close);
        assert_eq!(
            handle.snapshot().status.connection,
            ConnectionStatus::Closed
        );
    }
}
