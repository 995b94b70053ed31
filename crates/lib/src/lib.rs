//! streamchat core library: conversation model, stream protocol, the supervised streaming
//! session and the chat server's HTTP API. Used by the CLI.

pub mod api;
pub mod config;
pub mod conversation;
pub mod error;
pub mod protocol;
pub mod session;
