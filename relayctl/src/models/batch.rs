//! Batch and message records.
//!
//! A batch groups `request_count` messages. Each message moves through
//! `queued → processing → completed | failed`; the batch moves from `pending` to `completed` once,
//! when the fan-in counter first reaches `request_count`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{BatchId, MessageId, ProviderId, QueueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    #[default]
    Pending,
    Completed,
}

/// Outcome of the single webhook call made for a completed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Success,
    Failed,
}

impl std::fmt::Display for WebhookStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: BatchId,
    /// Number of messages in the batch, fixed at creation
    pub request_count: u64,
    pub response_count: u64,
    pub status: BatchStatus,
    pub webhook_url: Option<String>,
    pub webhook_status: Option<WebhookStatus>,
    pub webhook_last_called_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn new(batch_id: BatchId, request_count: u64, webhook_url: Option<String>) -> Self {
        Self {
            batch_id,
            request_count,
            response_count: 0,
            status: BatchStatus::Pending,
            webhook_url,
            webhook_status: None,
            webhook_last_called_at: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == BatchStatus::Completed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Queued,
    Processing,
    Completed,
    Failed,
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub queue_id: QueueId,
    pub batch_id: Option<BatchId>,
    pub provider_id: Option<ProviderId>,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub status: MessageStatus,
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn new(queue_id: QueueId, batch_id: Option<BatchId>, prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            message_id: MessageId::new(),
            queue_id,
            batch_id,
            provider_id: None,
            prompt: prompt.into(),
            system_prompt: None,
            status: MessageStatus::Queued,
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn start_processing(&mut self) {
        self.status = MessageStatus::Processing;
        self.updated_at = Utc::now();
    }

    pub fn complete(&mut self, result: String) {
        self.status = MessageStatus::Completed;
        self.result = Some(result);
        self.error_message = None;
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self, error: String) {
        self.status = MessageStatus::Failed;
        self.error_message = Some(error);
        self.updated_at = Utc::now();
    }
}

/// One message's entry in a batch aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageResult {
    pub message_id: MessageId,
    pub status: MessageStatus,
    pub prompt: String,
    pub result: Option<String>,
    pub error_message: Option<String>,
}

impl From<&Message> for MessageResult {
    fn from(message: &Message) -> Self {
        Self {
            message_id: message.message_id,
            status: message.status,
            prompt: message.prompt.clone(),
            result: message.result.clone(),
            error_message: message.error_message.clone(),
        }
    }
}

/// The aggregate written to shared storage when a batch completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResults {
    pub batch_id: BatchId,
    pub request_count: u64,
    /// Messages that completed successfully
    pub response_count: u64,
    pub results: Vec<MessageResult>,
    pub completed_at: DateTime<Utc>,
}
