use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ChatError, Result};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

id_type!(
    /// Backend identifier of a user.
    UserId
);
id_type!(
    /// Backend identifier of a conversation.
    ConversationId
);
id_type!(MessageId);

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: UserId,
    #[serde(default)]
    pub name: String,
}

impl Member {
    pub fn new(id: impl Into<UserId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Conversation {
    #[serde(alias = "_id")]
    pub id: ConversationId,
    pub name: String,
    pub owner_id: UserId,
    #[serde(default)]
    pub members: Vec<Member>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// True when `user` owns the conversation or is one of its members.
    pub fn has_participant(&self, user: &UserId) -> bool {
        self.owner_id == *user || self.members.iter().any(|m| m.id == *user)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    #[serde(default, alias = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub sender_id: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ConversationRequest {
    pub name: String,
    pub owner_id: UserId,
    pub owner_name: String,
    pub members: Vec<Member>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct InitMessageRequest {
    pub sender_id: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// A conversation draft paired with its opening message.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CreateConversation {
    pub conversation_request: ConversationRequest,
    pub init_message_request: InitMessageRequest,
}

impl CreateConversation {
    /// One-to-one conversation from `owner` to `peer`, named after the peer.
    pub fn direct(owner: Member, peer: Member, text: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            init_message_request: InitMessageRequest {
                sender_id: owner.id.clone(),
                text: text.into(),
                created_at: now,
            },
            conversation_request: ConversationRequest {
                name: peer.name.clone(),
                owner_id: owner.id,
                owner_name: owner.name,
                members: vec![peer],
                created_at: now,
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        let conversation = &self.conversation_request;
        if self.init_message_request.sender_id != conversation.owner_id {
            return Err(ChatError::InvalidRequest(format!(
                "initial message sender {} is not the conversation owner {}",
                self.init_message_request.sender_id, conversation.owner_id
            )));
        }
        let mut seen = HashSet::new();
        for member in &conversation.members {
            if !seen.insert(&member.id) {
                return Err(ChatError::InvalidRequest(format!(
                    "member {} listed more than once",
                    member.id
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MessageText {
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CreateConversationResponse {
    pub conversation_response: Conversation,
    pub message_response: MessageText,
}

impl CreateConversationResponse {
    pub fn involves(&self, user: &UserId) -> bool {
        self.conversation_response.has_participant(user)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MessageRequest {
    pub sender_id: UserId,
    pub conversation_id: ConversationId,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl MessageRequest {
    pub fn new(
        sender_id: UserId,
        conversation_id: ConversationId,
        text: impl Into<String>,
    ) -> Self {
        Self {
            sender_id,
            conversation_id,
            text: text.into(),
            created_at: Utc::now(),
        }
    }
}

/// A message event broadcast to clients joined to its conversation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MessageResponse {
    #[serde(default, alias = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub sender_id: UserId,
    pub conversation_id: ConversationId,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConversationListResponse {
    pub conversations: Vec<Conversation>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MessageListResponse {
    pub messages: Vec<Message>,
}
