//! Streaming session: transport, reconnection, dispatch, and the lifecycle controller.
//!
//! The controller is the only entry point for the UI. It owns the conversation and one
//! supervised connection, and it recreates the connection whenever the session config changes.

mod controller;
mod dispatch;
mod supervisor;
mod transport;

use std::time::Duration;

pub use controller::{ControllerHandle, ControllerState, Notice, SessionController};
pub use dispatch::{plan, Dispatch, ImageAttachment, Submission};
pub use supervisor::{CloseAction, LinkState, ReconnectPolicy, Supervisor};
pub use transport::{
    is_normal_closure, Connection, ConnectionId, Inbound, InboundSink, Transport, TransportError,
    TransportEvent, WsTransport, ABNORMAL_CLOSURE, NORMAL_CLOSURE, NO_STATUS_CLOSURE,
};

/// Everything that decides which backend a session talks to. Compared by value: a session
/// is torn down and recreated only when this changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub model: String,
    /// WebSocket URL of the streaming endpoint.
    pub endpoint: String,
}

impl SessionConfig {
    pub fn new(model: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            endpoint: endpoint.into(),
        }
    }
}

/// Timing policy for one controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    pub reconnect: ReconnectPolicy,
    /// Deadline for a streamed turn to reach `Done` or `Error`.
    pub watchdog: Duration,
    /// How long a text submission waits for the connection to open.
    pub open_wait: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            watchdog: Duration::from_millis(30_000),
            open_wait: Duration::from_millis(1000),
        }
    }
}
