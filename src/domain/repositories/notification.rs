use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NotificationError {
    #[error("Notification transport failed: {0}")]
    Transport(String),

    #[error("Notification provider rejected the message: {0}")]
    Rejected(String),

    #[error("Malformed provider response: {0}")]
    Malformed(String),
}

/// Reply received on the notification channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub body: String,
    pub from: String,
    pub sent_at: DateTime<Utc>,
}

/// Out-of-band channel to the human approver
#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn send(&self, message: &str) -> Result<(), NotificationError>;

    /// Most recent inbound messages, newest first
    async fn list_recent_inbound(&self, limit: usize) -> Result<Vec<InboundMessage>, NotificationError>;
}
