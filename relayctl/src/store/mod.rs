//! Storage seams for the records this crate reads and writes.
//!
//! Persistence proper belongs to the host application. These traits name the operations the fan-in
//! path and the message processor need; [`in_memory::InMemoryStore`] implements them for tests and
//! single-process use.

use chrono::{DateTime, Utc};
use std::future::Future;

use crate::errors::Result;
use crate::models::{Batch, BatchResults, Message, Provider, WebhookStatus};
use crate::types::{BatchId, MessageId, QueueId};

pub mod in_memory;

pub use in_memory::InMemoryStore;

/// Batch, message and aggregate persistence.
pub trait BatchStore: Send + Sync {
    /// # Errors
    /// - `NotFound` if the batch doesn't exist
    fn get_batch(&self, batch_id: BatchId) -> impl Future<Output = Result<Batch>> + Send;

    /// All messages belonging to a batch, in creation order.
    fn list_batch_messages(&self, batch_id: BatchId) -> impl Future<Output = Result<Vec<Message>>> + Send;

    /// # Errors
    /// - `NotFound` if the message doesn't exist
    fn get_message(&self, message_id: MessageId) -> impl Future<Output = Result<Message>> + Send;

    /// Insert or replace a message.
    fn save_message(&self, message: &Message) -> impl Future<Output = Result<()>> + Send;

    /// Write the aggregate for a batch, replacing any previous one.
    fn store_batch_results(&self, results: &BatchResults) -> impl Future<Output = Result<()>> + Send;

    fn get_batch_results(&self, batch_id: BatchId) -> impl Future<Output = Result<Option<BatchResults>>> + Send;

    /// Atomically move a pending batch to completed.
    ///
    /// Returns `false` without changing anything if the batch was already completed, so exactly
    /// one caller wins.
    fn mark_batch_completed(
        &self,
        batch_id: BatchId,
        response_count: u64,
        completed_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn record_webhook_delivery(
        &self,
        batch_id: BatchId,
        status: WebhookStatus,
        called_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Lookup of the providers attached to a queue.
pub trait ProviderDirectory: Send + Sync {
    /// Providers in the order the route should list them. Empty if the queue has none.
    fn providers_for_queue(&self, queue_id: QueueId) -> impl Future<Output = Result<Vec<Provider>>> + Send;
}
