//! Conversation message types and the append-only message store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Role of a conversation message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System-level instructions.
    System,
    /// End-user input.
    User,
    /// Model output.
    Assistant,
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role of the message sender.
    pub role: MessageRole,
    /// The content of the message.
    pub content: String,
    /// When the message was produced.
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Creates a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: MessageRole::System, content: content.into(), created_at: Utc::now() }
    }

    /// Creates a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: MessageRole::User, content: content.into(), created_at: Utc::now() }
    }

    /// Creates an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: MessageRole::Assistant, content: content.into(), created_at: Utc::now() }
    }
}

/// Errors from the message store.
#[derive(Error, Debug)]
pub enum MessageStoreError {
    /// The underlying store rejected the append.
    #[error("Failed to append message: {0}")]
    AppendFailed(String),
}

/// Append-only message persistence, keyed by a per-run conversation id.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Appends a message to a conversation.
    ///
    /// # Arguments
    /// * `conversation_id` - The per-run conversation identifier
    /// * `message` - The message to append
    ///
    /// # Errors
    /// Returns `MessageStoreError` if the append fails.
    async fn add_message(
        &self,
        conversation_id: &str,
        message: ChatMessage,
    ) -> Result<(), MessageStoreError>;
}
