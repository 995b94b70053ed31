//! User-facing error taxonomy for one submission.
//!
//! Every variant is terminal for the current turn only; the conversation history is kept and
//! the user may retry.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    /// Reconnection attempts exhausted; requires manual action (`/reconnect` or restart).
    #[error("connection lost after {attempts} reconnection attempts; reconnect manually to continue")]
    Transport { attempts: u32 },
    /// Malformed frame from the backend. The connection stays open.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Explicit error frame from the generation engine, surfaced verbatim.
    #[error("{0}")]
    Backend(String),
    #[error("no response within {}s; try again", .0.as_secs())]
    Timeout(Duration),
    #[error("connection unavailable; try again once the connection is back")]
    ConnectionUnavailable,
    #[error("a response is still in progress")]
    Busy,
    #[error("no model selected")]
    NoModel,
    /// The turn was cut off by a model switch or a conversation reset.
    #[error("response interrupted")]
    Interrupted,
    /// The one-shot request could not be completed.
    #[error("request failed: {0}")]
    Request(String),
}

impl ChatError {
    /// True when the same submission can simply be sent again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ChatError::NoModel | ChatError::Transport { .. })
    }
}
