// Messaging service trait definition

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Refused locally, the upload would exceed the service limit
    #[error("file is {size} bytes, upload limit is {limit}")]
    TooLarge { size: u64, limit: u64 },

    #[error("message rejected: {0}")]
    Rejected(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a message goes: a chat and, in forum groups, a topic thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChatTarget {
    pub chat_id: i64,
    pub thread_id: Option<i64>,
}

impl ChatTarget {
    pub fn new(chat_id: i64, thread_id: Option<i64>) -> Self {
        Self { chat_id, thread_id }
    }

    pub fn chat(chat_id: i64) -> Self {
        Self::new(chat_id, None)
    }
}

/// Outbound side of the chat platform
#[async_trait]
pub trait MessagingService: Send + Sync {
    /// Upload a video with an HTML caption
    async fn send_media(
        &self,
        target: ChatTarget,
        path: &Path,
        caption: &str,
    ) -> Result<(), DeliveryError>;

    /// Silent text message without link preview
    async fn send_text(&self, target: ChatTarget, text: &str, html: bool)
        -> Result<(), DeliveryError>;

    /// Never fails; returns whether the message was deleted
    async fn delete_message(&self, target: ChatTarget, message_id: i64) -> bool;
}
