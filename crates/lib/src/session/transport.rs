//! Transport session: one duplex WebSocket per connection handle.
//!
//! `open` returns immediately; connect progress, inbound frames and the final close are
//! reported as [`Inbound`] events tagged with the connection id, so the owner can drop events
//! from connections it has already replaced.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use super::SessionConfig;

/// Close code for intentional, client-initiated closure.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Peer closed without sending a status code.
pub const NO_STATUS_CLOSURE: u16 = 1005;
/// Connection dropped without a close frame (also used for connect and read failures).
pub const ABNORMAL_CLOSURE: u16 = 1006;

pub fn is_normal_closure(code: u16) -> bool {
    code == NORMAL_CLOSURE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Frame(String),
    Error(String),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub connection: ConnectionId,
    pub event: TransportEvent,
}

/// Where a connection reports its events.
#[derive(Debug, Clone)]
pub struct InboundSink {
    connection: ConnectionId,
    tx: mpsc::UnboundedSender<Inbound>,
}

impl InboundSink {
    pub fn new(connection: ConnectionId, tx: mpsc::UnboundedSender<Inbound>) -> Self {
        Self { connection, tx }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Returns false once the receiving side is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(Inbound {
                connection: self.connection,
                event,
            })
            .is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection is not open")]
    NotOpen,
    #[error("connection closed")]
    Closed,
}

/// One live (or connecting) connection.
pub trait Connection: Send {
    fn id(&self) -> ConnectionId;
    fn is_open(&self) -> bool;
    /// Queue a text payload. Fails with `NotOpen` unless the connection is open.
    fn send(&self, payload: String) -> Result<(), TransportError>;
    fn close(&mut self, code: u16, reason: &str);
}

/// Opens connections for a session config.
pub trait Transport: Send {
    fn open(&self, config: &SessionConfig, sink: InboundSink) -> Box<dyn Connection>;
}

enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// WebSocket transport (tokio-tungstenite). `SessionConfig::endpoint` is the ws/wss URL.
#[derive(Debug, Clone, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for WsTransport {
    fn open(&self, config: &SessionConfig, sink: InboundSink) -> Box<dyn Connection> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));
        let id = sink.connection();
        log::info!("transport: opening {} to {}", id, config.endpoint);
        tokio::spawn(run_connection(
            config.endpoint.clone(),
            sink,
            out_rx,
            open.clone(),
        ));
        Box::new(WsConnection {
            id,
            out_tx,
            open,
            closed: false,
        })
    }
}

struct WsConnection {
    id: ConnectionId,
    out_tx: mpsc::UnboundedSender<Outbound>,
    open: Arc<AtomicBool>,
    closed: bool,
}

impl Connection for WsConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_open(&self) -> bool {
        !self.closed && self.open.load(Ordering::SeqCst)
    }

    fn send(&self, payload: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        self.out_tx
            .send(Outbound::Text(payload))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&mut self, code: u16, reason: &str) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        let _ = self.out_tx.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.close(NORMAL_CLOSURE, "dropped");
    }
}

/// Connect, then pump outbound payloads and inbound frames until either side closes.
async fn run_connection(
    url: String,
    sink: InboundSink,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
    open: Arc<AtomicBool>,
) {
    let id = sink.connection();
    let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            log::warn!("transport: {} connect to {} failed: {}", id, url, e);
            sink.emit(TransportEvent::Error(e.to_string()));
            sink.emit(TransportEvent::Close {
                code: ABNORMAL_CLOSURE,
                reason: "connect failed".to_string(),
            });
            return;
        }
    };
    let (mut ws_tx, mut ws_rx) = ws.split();
    open.store(true, Ordering::SeqCst);
    sink.emit(TransportEvent::Open);

    let (code, reason) = loop {
        tokio::select! {
            out = out_rx.recv() => match out {
                Some(Outbound::Text(payload)) => {
                    if let Err(e) = ws_tx.send(Message::Text(payload)).await {
                        log::warn!("transport: {} send failed: {}", id, e);
                        sink.emit(TransportEvent::Error(e.to_string()));
                        break (ABNORMAL_CLOSURE, "send failed".to_string());
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.clone().into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    break (code, reason);
                }
                None => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break (NORMAL_CLOSURE, "handle dropped".to_string());
                }
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    sink.emit(TransportEvent::Frame(text));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    sink.emit(TransportEvent::Frame(String::from_utf8_lossy(&bytes).into_owned()));
                }
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(f) => (u16::from(f.code), f.reason.into_owned()),
                        None => (NO_STATUS_CLOSURE, String::new()),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("transport: {} read failed: {}", id, e);
                    sink.emit(TransportEvent::Error(e.to_string()));
                    break (ABNORMAL_CLOSURE, e.to_string());
                }
                None => break (ABNORMAL_CLOSURE, "stream ended".to_string()),
            },
        }
    };
    open.store(false, Ordering::SeqCst);
    log::info!("transport: {} closed ({} {})", id, code, reason);
    sink.emit(TransportEvent::Close { code, reason });
}
