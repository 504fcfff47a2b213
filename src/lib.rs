//! Client library for a real-time chat backend.
//!
//! [`SessionChannel`] holds one user's socket session: conversation creation,
//! joins, and message delivery. [`ChatService`] is the HTTP side for
//! conversation and message history lookups.

pub mod api;
pub mod config;
pub mod error;
pub mod utils;

pub use api::client::ChatService;
pub use api::models::{
    Conversation, ConversationId, CreateConversation, CreateConversationResponse, Member,
    Message, MessageId, MessageRequest, MessageResponse, UserId,
};
pub use api::session::{ChannelState, SessionChannel};
pub use config::ClientConfig;
pub use error::{ChatError, ConfigError, Result};
