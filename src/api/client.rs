use log::{debug, error, warn};
use reqwest::Client as HttpClient;
use serde::de::DeserializeOwned;

use crate::api::models::{
    Conversation, ConversationId, ConversationListResponse, Message, MessageListResponse, UserId,
};
use crate::config::ClientConfig;
use crate::error::{ChatError, Result};
use crate::utils::normalize_url;

/// Stateless HTTP client for conversation and message history lookups.
pub struct ChatService {
    http: HttpClient,
    base_uri: String,
}

impl ChatService {
    pub fn new(base_uri: &str) -> Self {
        Self {
            http: HttpClient::new(),
            base_uri: normalize_url(base_uri),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            http,
            base_uri: config.api_base_url(),
        })
    }

    pub fn base_uri(&self) -> &str {
        &self.base_uri
    }

    /// Conversations `user_id` belongs to, in backend order.
    pub async fn fetch_all_conversations(&self, user_id: &UserId) -> Result<Vec<Conversation>> {
        let endpoint = format!("{}/conversations/{}", self.base_uri, user_id);
        let body: ConversationListResponse = self.get_json(&endpoint).await?;
        for conversation in &body.conversations {
            if !conversation.has_participant(user_id) {
                warn!(
                    "Conversation {} returned for {} does not list them as a participant",
                    conversation.id, user_id
                );
            }
        }
        debug!("Fetched {} conversations for {}", body.conversations.len(), user_id);
        Ok(body.conversations)
    }

    pub async fn fetch_all_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        let endpoint = format!("{}/messages/{}", self.base_uri, conversation_id);
        let body: MessageListResponse = self.get_json(&endpoint).await?;
        debug!("Fetched {} messages for {}", body.messages.len(), conversation_id);
        Ok(body.messages)
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let resp = self.http.get(endpoint).send().await.map_err(|e| {
            error!("GET {} failed: {}", endpoint, e);
            ChatError::from(e)
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = match resp.text().await {
                Ok(body) => body,
                Err(e) => {
                    warn!("GET {} error body unreadable: {}", endpoint, e);
                    String::new()
                }
            };
            error!("GET {} returned HTTP {}", endpoint, status);
            return Err(ChatError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = resp.bytes().await.map_err(|e| {
            error!("GET {} body read failed: {}", endpoint, e);
            ChatError::from(e)
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            error!("GET {} returned an unexpected body: {}", endpoint, e);
            ChatError::MalformedResponse(e.to_string())
        })
    }
}
