//! Transport adapter.
//!
//! A [`Transport`] opens one persistent bidirectional channel per call.
//! The returned [`TransportLink`] is a pair of channels: text frames go out
//! through `outbound`, lifecycle signals and inbound frames come back on
//! `inbound`. Opening never blocks; the outcome arrives as
//! [`TransportEvent::Opened`] or as an error/close signal.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Signals reported by a transport, in the order they happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Frame(String),
    Error(String),
    Closed { clean: bool, reason: Option<String> },
}

/// Frames written to a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close,
}

pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

pub trait Transport: Send + Sync + 'static {
    fn open(&self) -> TransportLink;
}

/// WebSocket transport over `tokio-tungstenite`
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Transport for WebSocketTransport {
    fn open(&self) -> TransportLink {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_socket(self.url.clone(), outbound_rx, event_tx));
        TransportLink {
            outbound: outbound_tx,
            inbound: event_rx,
        }
    }
}

async fn run_socket(
    url: String,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundFrame>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let (socket, _) = match connect_async(url.as_str()).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(
                component = "transport",
                event = "transport.connect.failed",
                url = %url,
                error = %e,
                "WebSocket connect failed"
            );
            let _ = event_tx.send(TransportEvent::Error(e.to_string()));
            let _ = event_tx.send(TransportEvent::Closed {
                clean: false,
                reason: Some(e.to_string()),
            });
            return;
        }
    };

    info!(
        component = "transport",
        event = "transport.opened",
        url = %url,
        "WebSocket connection opened"
    );
    let _ = event_tx.send(TransportEvent::Opened);

    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => match frame {
                Some(OutboundFrame::Text(text)) => {
                    if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                        warn!(
                            component = "transport",
                            event = "transport.send.failed",
                            error = %e,
                            "WebSocket send failed"
                        );
                        let _ = event_tx.send(TransportEvent::Error(e.to_string()));
                        let _ = event_tx.send(TransportEvent::Closed {
                            clean: false,
                            reason: Some(e.to_string()),
                        });
                        return;
                    }
                }
                Some(OutboundFrame::Close) | None => {
                    debug!(
                        component = "transport",
                        event = "transport.close.requested",
                        "Closing WebSocket"
                    );
                    let _ = ws_tx.send(Message::Close(None)).await;
                    let _ = event_tx.send(TransportEvent::Closed {
                        clean: true,
                        reason: None,
                    });
                    return;
                }
            },

            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let _ = event_tx.send(TransportEvent::Frame(text.as_str().to_owned()));
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => {
                        let _ = event_tx.send(TransportEvent::Frame(text));
                    }
                    Err(_) => {
                        debug!(
                            component = "transport",
                            event = "transport.binary.ignored",
                            bytes = bytes.len(),
                            "Ignoring non-UTF-8 binary frame"
                        );
                    }
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws_tx.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    let (clean, reason) = close_signal(frame.as_ref());
                    info!(
                        component = "transport",
                        event = "transport.close_frame",
                        clean,
                        "Server sent close frame"
                    );
                    let _ = event_tx.send(TransportEvent::Closed { clean, reason });
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(
                        component = "transport",
                        event = "transport.error",
                        error = %e,
                        "WebSocket error"
                    );
                    let _ = event_tx.send(TransportEvent::Error(e.to_string()));
                    let _ = event_tx.send(TransportEvent::Closed {
                        clean: false,
                        reason: Some(e.to_string()),
                    });
                    return;
                }
                None => {
                    let _ = event_tx.send(TransportEvent::Closed {
                        clean: false,
                        reason: Some("connection dropped".to_string()),
                    });
                    return;
                }
            },
        }
    }
}

/// Whether a server close frame is orderly, and its reason if any. A frame
/// without a code counts as orderly.
fn close_signal(frame: Option<&CloseFrame>) -> (bool, Option<String>) {
    let clean = frame.map_or(true, |f| matches!(f.code, CloseCode::Normal | CloseCode::Away));
    let reason = frame
        .map(|f| f.reason.as_str().to_owned())
        .filter(|r| !r.is_empty());
    (clean, reason)
}
