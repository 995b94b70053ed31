//! Conversation log and the streaming accumulator.
//!
//! The log is append-only. While a response streams, the trailing assistant message is the
//! only mutable entry and it only ever grows: deltas are appended to its content, never
//! swapped in wholesale.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// One entry of a conversation (user, assistant or system).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Image URL (usually a data URL) attached to a user turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            id: Some(uuid::Uuid::new_v4().to_string()),
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
            image: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Opaque conversation identifier, stable for one chat session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh client-side id (new chat / clear chat).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new(id: ConversationId) -> Self {
        Self {
            id,
            messages: Vec::new(),
        }
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// Owns the conversation and mutates it only through turn operations.
#[derive(Debug)]
pub struct Accumulator {
    conversation: Conversation,
    /// True while the trailing assistant message is still receiving deltas.
    streaming: bool,
}

impl Accumulator {
    pub fn new(id: ConversationId) -> Self {
        Self {
            conversation: Conversation::new(id),
            streaming: false,
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Replace the whole log (new chat, cleared chat, or history loaded from the store).
    pub fn reset(&mut self, id: ConversationId, messages: Vec<Message>) {
        self.conversation = Conversation { id, messages };
        self.streaming = false;
    }

    /// Append the user's message and return a copy of it.
    pub fn begin_user_turn(&mut self, text: &str, image: Option<&str>) -> Message {
        // A user turn closes whatever was streaming before it.
        self.streaming = false;
        let mut message = Message::user(text);
        message.image = image.map(str::to_string);
        self.conversation.messages.push(message.clone());
        message
    }

    /// Grow the pending assistant message, or start one if there is none.
    pub fn apply_delta(&mut self, text: &str) {
        if self.streaming {
            if let Some(last) = self.conversation.messages.last_mut() {
                if last.role == Role::Assistant {
                    last.content.push_str(text);
                    return;
                }
            }
        }
        self.conversation.messages.push(Message::assistant(text));
        self.streaming = true;
    }

    /// Mark the trailing assistant message final. Returns it when one was streaming.
    pub fn finalize(&mut self) -> Option<&Message> {
        if !std::mem::take(&mut self.streaming) {
            return None;
        }
        self.conversation
            .messages
            .last()
            .filter(|m| m.role == Role::Assistant)
    }

    /// Drop the trailing user message of a turn that was never delivered.
    pub fn retract_user_turn(&mut self) -> Option<Message> {
        if self.streaming || self.conversation.last().map(|m| m.role) != Some(Role::User) {
            return None;
        }
        self.conversation.messages.pop()
    }

    /// Append a complete assistant message (one-shot replies have no partial frames).
    pub fn push_assistant(&mut self, content: impl Into<String>) -> Message {
        self.streaming = false;
        let message = Message::assistant(content);
        self.conversation.messages.push(message.clone());
        message
    }
}
