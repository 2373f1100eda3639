//! In-memory store. Suitable for tests and single-process deployments; contents are lost on restart.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::{Error, Result};
use crate::models::{Batch, BatchResults, BatchStatus, Message, Provider, WebhookStatus};
use crate::types::{BatchId, MessageId, QueueId};

use super::{BatchStore, ProviderDirectory};

#[derive(Clone, Default)]
pub struct InMemoryStore {
    batches: Arc<RwLock<HashMap<BatchId, Batch>>>,
    messages: Arc<RwLock<HashMap<MessageId, Message>>>,
    results: Arc<RwLock<HashMap<BatchId, BatchResults>>>,
    providers: Arc<RwLock<HashMap<QueueId, Vec<Provider>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_batch(&self, batch: Batch) {
        self.batches.write().insert(batch.batch_id, batch);
    }

    /// Attach a provider to its queue, after any existing ones.
    pub fn add_provider(&self, provider: Provider) {
        self.providers.write().entry(provider.queue_id).or_default().push(provider);
    }
}

impl BatchStore for InMemoryStore {
    async fn get_batch(&self, batch_id: BatchId) -> Result<Batch> {
        self.batches
            .read()
            .get(&batch_id)
            .cloned()
            .ok_or_else(|| Error::not_found("Batch", batch_id))
    }

    async fn list_batch_messages(&self, batch_id: BatchId) -> Result<Vec<Message>> {
        let mut messages: Vec<Message> = self
            .messages
            .read()
            .values()
            .filter(|m| m.batch_id == Some(batch_id))
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.message_id.cmp(&b.message_id)));
        Ok(messages)
    }

    async fn get_message(&self, message_id: MessageId) -> Result<Message> {
        self.messages
            .read()
            .get(&message_id)
            .cloned()
            .ok_or_else(|| Error::not_found("Message", message_id))
    }

    async fn save_message(&self, message: &Message) -> Result<()> {
        self.messages.write().insert(message.message_id, message.clone());
        Ok(())
    }

    async fn store_batch_results(&self, results: &BatchResults) -> Result<()> {
        self.results.write().insert(results.batch_id, results.clone());
        Ok(())
    }

    async fn get_batch_results(&self, batch_id: BatchId) -> Result<Option<BatchResults>> {
        Ok(self.results.read().get(&batch_id).cloned())
    }

    async fn mark_batch_completed(&self, batch_id: BatchId, response_count: u64, completed_at: DateTime<Utc>) -> Result<bool> {
        let mut batches = self.batches.write();
        let batch = batches
            .get_mut(&batch_id)
            .ok_or_else(|| Error::not_found("Batch", batch_id))?;

        if batch.status == BatchStatus::Completed {
            return Ok(false);
        }
        batch.status = BatchStatus::Completed;
        batch.response_count = response_count;
        batch.completed_at = Some(completed_at);
        Ok(true)
    }

    async fn record_webhook_delivery(&self, batch_id: BatchId, status: WebhookStatus, called_at: DateTime<Utc>) -> Result<()> {
        let mut batches = self.batches.write();
        let batch = batches
            .get_mut(&batch_id)
            .ok_or_else(|| Error::not_found("Batch", batch_id))?;
        batch.webhook_status = Some(status);
        batch.webhook_last_called_at = Some(called_at);
        Ok(())
    }
}

impl ProviderDirectory for InMemoryStore {
    async fn providers_for_queue(&self, queue_id: QueueId) -> Result<Vec<Provider>> {
        Ok(self.providers.read().get(&queue_id).cloned().unwrap_or_default())
    }
}
