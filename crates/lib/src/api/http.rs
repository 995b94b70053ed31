//! HTTP client for the chat server (http://127.0.0.1:8000 by default).
//! One-shot chat, conversation persistence and model listing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::conversation::{ConversationId, Message, Role};
use crate::protocol::{OneShotReply, OneShotRequest};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("chat server request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("chat server api error: {0}")]
    Api(String),
}

impl From<ApiError> for crate::error::ChatError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Request(e) => crate::error::ChatError::Request(e.to_string()),
            ApiError::Api(msg) => crate::error::ChatError::Backend(msg),
        }
    }
}

/// Request/response call used for image-bearing turns.
#[async_trait]
pub trait OneShotBackend: Send + Sync + 'static {
    async fn chat(&self, request: OneShotRequest) -> Result<OneShotReply, ApiError>;
}

/// Client for the chat server's HTTP API.
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    models: Option<Vec<ModelInfo>>,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    messages: Vec<HistoryEntry>,
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    role: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct CreatedConversation {
    conversation_id: String,
}

#[derive(Debug, Deserialize)]
struct ConversationsResponse {
    #[serde(default)]
    conversations: Vec<ConversationSummary>,
}

fn role_from_wire(role: &str) -> Option<Role> {
    match role {
        "user" => Some(Role::User),
        "assistant" => Some(Role::Assistant),
        "system" => Some(Role::System),
        _ => None,
    }
}

impl ApiClient {
    pub fn new(base_url: Option<String>, timeout: Duration) -> Result<Self, ApiError> {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn check(res: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ApiError::Api(format!("{} {}", status, body)));
        }
        Ok(res)
    }

    /// GET /api/models: models the server can route to.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, ApiError> {
        let url = format!("{}/api/models", self.base_url);
        let res = Self::check(self.client.get(&url).send().await?).await?;
        let data: ModelsResponse = res.json().await?;
        Ok(data.models.unwrap_or_default())
    }

    /// GET /api/history/{id}: stored transcript. Entries with roles the client does not
    /// model (e.g. tool output) are skipped.
    pub async fn history(&self, id: &ConversationId) -> Result<Vec<Message>, ApiError> {
        let url = format!("{}/api/history/{}", self.base_url, id);
        let res = Self::check(self.client.get(&url).send().await?).await?;
        let data: HistoryResponse = res.json().await?;
        Ok(data
            .messages
            .into_iter()
            .filter_map(|entry| {
                let role = role_from_wire(&entry.role)?;
                Some(Message {
                    role,
                    content: entry.content,
                    id: None,
                    timestamp: None,
                    image: None,
                })
            })
            .collect())
    }

    /// POST /api/conversations: server-issued conversation id.
    pub async fn create_conversation(&self) -> Result<ConversationId, ApiError> {
        let url = format!("{}/api/conversations", self.base_url);
        let res = Self::check(self.client.post(&url).send().await?).await?;
        let data: CreatedConversation = res.json().await?;
        Ok(ConversationId::new(data.conversation_id))
    }

    /// DELETE /api/history/{id}
    pub async fn delete_conversation(&self, id: &ConversationId) -> Result<(), ApiError> {
        let url = format!("{}/api/history/{}", self.base_url, id);
        Self::check(self.client.delete(&url).send().await?).await?;
        Ok(())
    }

    /// GET /api/conversations: newest first, as returned by the server.
    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ApiError> {
        let url = format!("{}/api/conversations", self.base_url);
        let res = Self::check(self.client.get(&url).send().await?).await?;
        let data: ConversationsResponse = res.json().await?;
        Ok(data.conversations)
    }
}

#[async_trait]
impl OneShotBackend for ApiClient {
    /// POST /api/chat with `stream: false`.
    async fn chat(&self, request: OneShotRequest) -> Result<OneShotReply, ApiError> {
        let url = format!("{}/api/chat", self.base_url);
        let res = Self::check(self.client.post(&url).json(&request).send().await?).await?;
        let reply: OneShotReply = res.json().await?;
        Ok(reply)
    }
}
