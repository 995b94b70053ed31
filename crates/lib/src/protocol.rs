//! Wire types for the streaming and one-shot chat endpoints, and the inbound frame decoder.

use crate::conversation::{Message, Role};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Phase reported for payloads that carry nothing the decoder understands.
pub const UNRECOGNIZED_PHASE: &str = "unrecognized";

/// Message of the error frame produced for payloads that are not valid JSON.
pub const PARSE_FAILURE: &str = "parse failure";

/// Role + plain text content, as sent on the streaming endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: String,
}

impl From<&Message> for WireMessage {
    fn from(m: &Message) -> Self {
        Self {
            role: m.role,
            content: m.content.clone(),
        }
    }
}

/// Request sent over the WebSocket for text-only turns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    pub conversation_id: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub web_search: bool,
}

/// One part of a multi-part message: `{type: text, text}` or `{type: image_url, image_url: {url}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MultipartMessage {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

/// Request for image-bearing turns (POST /api/chat).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OneShotRequest {
    pub model: String,
    pub messages: Vec<MultipartMessage>,
    pub conversation_id: String,
    /// The endpoint streams unless told otherwise.
    pub stream: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub web_search: bool,
}

/// Single reply of the one-shot endpoint: `{ message: {role, content}, done }`.
#[derive(Debug, Clone, Deserialize)]
pub struct OneShotReply {
    #[serde(default)]
    pub message: Option<ReplyMessage>,
    #[serde(default)]
    pub done: Value,
    #[serde(default)]
    pub error: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplyMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
}

impl OneShotReply {
    pub fn content(&self) -> &str {
        self.message
            .as_ref()
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }

    pub fn is_done(&self) -> bool {
        is_done_marker(&self.done)
    }

    /// Why the reply cannot be used as an answer: an `error` field, or no message at all.
    pub fn failure(&self) -> Option<String> {
        if !self.error.is_null() {
            return Some(error_message(&self.error));
        }
        if self.message.is_none() {
            return Some("reply carried no message".to_string());
        }
        None
    }
}

/// Where an error frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOrigin {
    /// Explicit `error` field sent by the generation engine.
    Backend,
    /// The payload could not be decoded at all.
    Decode,
}

/// Decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    Delta { text: String },
    Status { phase: String, detail: String },
    Error { message: String, origin: ErrorOrigin },
    Done,
}

/// `done` may arrive as `true`, `"true"` or `1` depending on the backend revision.
pub fn is_done_marker(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.trim().eq_ignore_ascii_case("true"),
        Value::Number(n) => n.as_u64() == Some(1) || n.as_f64() == Some(1.0),
        _ => false,
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn error_message(value: &Value) -> String {
    value
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| text_of(value))
}

/// Decode one payload. A `Done` is appended after any delta or status carried by the same
/// payload, so the result holds at most two frames.
pub fn decode(raw: &str) -> Vec<StreamFrame> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            log::debug!("decode: malformed frame ({}): {:.120}", e, raw);
            return vec![StreamFrame::Error {
                message: PARSE_FAILURE.to_string(),
                origin: ErrorOrigin::Decode,
            }];
        }
    };
    let Some(obj) = value.as_object() else {
        return vec![StreamFrame::Status {
            phase: UNRECOGNIZED_PHASE.to_string(),
            detail: text_of(&value),
        }];
    };

    if let Some(err) = obj.get("error").filter(|v| !v.is_null()) {
        return vec![StreamFrame::Error {
            message: error_message(err),
            origin: ErrorOrigin::Backend,
        }];
    }

    let done = obj.get("done").is_some_and(is_done_marker);
    let mut frames = Vec::with_capacity(2);
    if let Some(status) = obj.get("status").filter(|v| !v.is_null()) {
        frames.push(StreamFrame::Status {
            phase: text_of(status),
            detail: obj
                .get("detail")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        });
    } else if let Some(content) = obj
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
    {
        if !content.is_empty() {
            frames.push(StreamFrame::Delta {
                text: content.to_string(),
            });
        }
    } else if !done {
        let keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        frames.push(StreamFrame::Status {
            phase: UNRECOGNIZED_PHASE.to_string(),
            detail: keys.join(","),
        });
    }
    if done {
        frames.push(StreamFrame::Done);
    }
    frames
}

/// Decode a WebSocket frame that may carry several newline-delimited payloads.
pub fn decode_lines(raw: &str) -> Vec<StreamFrame> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .flat_map(decode)
        .collect()
}
