//! Chat server HTTP API: one-shot chat, conversation persistence, and model listing.

mod http;

pub use http::{ApiClient, ApiError, ConversationSummary, ModelInfo, OneShotBackend};
