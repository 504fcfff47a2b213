//! Frames exchanged over the session socket.
//!
//! Every text frame is a JSON envelope `{"event": <name>, "data": <payload>}`.

use serde::{Deserialize, Serialize};

use crate::api::models::{
    ConversationId, CreateConversation, CreateConversationResponse, MessageRequest,
    MessageResponse, UserId,
};

/// Frames the client emits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    CreateConversation(CreateConversation),
    JoinConversation { conversation_id: ConversationId },
    SendMessage(MessageRequest),
}

/// Frames the backend emits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Readiness ack sent once the backend has registered the socket.
    Connected { user_id: UserId },
    CreateConversationResponse(CreateConversationResponse),
    Message(MessageResponse),
    Error { message: String },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::CreateConversation(_) => "create_conversation",
            ClientEvent::JoinConversation { .. } => "join_conversation",
            ClientEvent::SendMessage(_) => "send_message",
        }
    }
}
