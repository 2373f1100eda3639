//! Builds and publishes the aggregate for a finished batch.

use chrono::Utc;
use metrics::counter;
use std::sync::Arc;

use crate::batch::webhook::{WebhookDelivery, WebhookNotifier, WebhookPayload};
use crate::errors::Result;
use crate::models::{BatchResults, MessageResult, MessageStatus};
use crate::store::BatchStore;
use crate::types::BatchId;

#[derive(Debug, Clone, PartialEq)]
pub enum AggregationOutcome {
    /// This call completed the batch
    Completed {
        results: BatchResults,
        webhook: Option<WebhookDelivery>,
    },
    /// The batch was already completed; nothing was changed
    AlreadyCompleted,
}

pub struct BatchAggregator<S> {
    store: Arc<S>,
    notifier: WebhookNotifier,
}

impl<S: BatchStore> BatchAggregator<S> {
    pub fn new(store: Arc<S>, notifier: WebhookNotifier) -> Self {
        Self { store, notifier }
    }

    /// Complete a batch: collect its messages, persist the aggregate, mark it completed and notify
    /// the webhook.
    ///
    /// Safe to call more than once. The aggregate is written before the batch is marked, so a call
    /// that fails part-way leaves the batch pending and can simply be repeated. Completion is a
    /// compare-and-set on the batch status and only the call that wins it sends the webhook; every
    /// other call returns [`AggregationOutcome::AlreadyCompleted`].
    #[tracing::instrument(skip_all, fields(batch_id = %batch_id))]
    pub async fn aggregate(&self, batch_id: BatchId) -> Result<AggregationOutcome> {
        let batch = self.store.get_batch(batch_id).await?;
        if batch.is_completed() {
            tracing::debug!("Batch already completed, skipping aggregation");
            return Ok(AggregationOutcome::AlreadyCompleted);
        }

        let messages = self.store.list_batch_messages(batch_id).await?;
        let response_count = messages
            .iter()
            .filter(|m| m.status == MessageStatus::Completed)
            .count() as u64;
        let aggregate = BatchResults {
            batch_id,
            request_count: batch.request_count,
            response_count,
            results: messages.iter().map(MessageResult::from).collect(),
            completed_at: Utc::now(),
        };

        // Racing calls may both write the aggregate; its contents are the same
        self.store.store_batch_results(&aggregate).await?;

        if !self
            .store
            .mark_batch_completed(batch_id, response_count, aggregate.completed_at)
            .await?
        {
            tracing::debug!("Lost completion race, another aggregation finished this batch");
            return Ok(AggregationOutcome::AlreadyCompleted);
        }

        counter!("relayctl_batches_aggregated_total").increment(1);
        tracing::info!(
            request_count = batch.request_count,
            response_count,
            messages = aggregate.results.len(),
            "Batch completed"
        );

        let webhook = match batch.webhook_url.as_deref() {
            Some(url) => {
                let delivery = self.notifier.notify(url, &WebhookPayload::from(&aggregate)).await;
                // Delivery status is bookkeeping; the batch stays completed either way
                if let Err(e) = self
                    .store
                    .record_webhook_delivery(batch_id, delivery.status, delivery.called_at)
                    .await
                {
                    tracing::warn!(error = %e, "Failed to record webhook delivery");
                }
                Some(delivery)
            }
            None => None,
        };

        Ok(AggregationOutcome::Completed {
            results: aggregate,
            webhook,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use crate::models::{Batch, Message, WebhookStatus};
    use crate::store::InMemoryStore;
    use crate::types::{MessageId, QueueId};
    use chrono::DateTime;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn seed(store: &InMemoryStore, webhook_url: Option<String>) -> BatchId {
        let batch = Batch::new(BatchId::new(), 3, webhook_url);
        let batch_id = batch.batch_id;
        store.insert_batch(batch);

        let queue_id = QueueId::new();
        let mut ok = Message::new(queue_id, Some(batch_id), "one");
        ok.complete("uno".to_string());
        let mut ok2 = Message::new(queue_id, Some(batch_id), "two");
        ok2.complete("dos".to_string());
        let mut failed = Message::new(queue_id, Some(batch_id), "three");
        failed.fail("HTTP 502".to_string());
        for message in [&ok, &ok2, &failed] {
            store.save_message(message).await.unwrap();
        }
        batch_id
    }

    fn aggregator(store: &InMemoryStore) -> BatchAggregator<InMemoryStore> {
        BatchAggregator::new(Arc::new(store.clone()), WebhookNotifier::new(Duration::from_secs(5)))
    }

    #[test_log::test(tokio::test)]
    async fn test_aggregate_persists_results_and_notifies() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/done"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = InMemoryStore::new();
        let batch_id = seed(&store, Some(format!("{}/done", server.uri()))).await;

        let outcome = aggregator(&store).aggregate(batch_id).await.unwrap();
        let AggregationOutcome::Completed { results, webhook } = outcome else {
            panic!("expected the batch to complete");
        };

        assert_eq!(results.request_count, 3);
        assert_eq!(results.response_count, 2);
        assert_eq!(results.results.len(), 3);
        assert_eq!(webhook.unwrap().status, WebhookStatus::Success);

        let batch = store.get_batch(batch_id).await.unwrap();
        assert!(batch.is_completed());
        assert_eq!(batch.response_count, 2);
        assert_eq!(batch.webhook_status, Some(WebhookStatus::Success));
        assert!(batch.webhook_last_called_at.is_some());
        assert_eq!(store.get_batch_results(batch_id).await.unwrap(), Some(results));
    }

    #[test_log::test(tokio::test)]
    async fn test_second_aggregation_is_a_noop() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = InMemoryStore::new();
        let batch_id = seed(&store, Some(server.uri())).await;
        let aggregator = aggregator(&store);

        aggregator.aggregate(batch_id).await.unwrap();
        let persisted = store.get_batch_results(batch_id).await.unwrap();
        let batch = store.get_batch(batch_id).await.unwrap();

        assert_eq!(aggregator.aggregate(batch_id).await.unwrap(), AggregationOutcome::AlreadyCompleted);
        assert_eq!(store.get_batch_results(batch_id).await.unwrap(), persisted);
        assert_eq!(store.get_batch(batch_id).await.unwrap(), batch);
    }

    #[test_log::test(tokio::test)]
    async fn test_concurrent_aggregations_complete_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = InMemoryStore::new();
        let batch_id = seed(&store, Some(server.uri())).await;
        let aggregator = aggregator(&store);

        let (a, b, c) = tokio::join!(
            aggregator.aggregate(batch_id),
            aggregator.aggregate(batch_id),
            aggregator.aggregate(batch_id)
        );
        let completed = [a.unwrap(), b.unwrap(), c.unwrap()]
            .iter()
            .filter(|o| matches!(o, AggregationOutcome::Completed { .. }))
            .count();
        assert_eq!(completed, 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_webhook_failure_keeps_batch_completed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let store = InMemoryStore::new();
        let batch_id = seed(&store, Some(server.uri())).await;

        let outcome = aggregator(&store).aggregate(batch_id).await.unwrap();
        assert!(matches!(outcome, AggregationOutcome::Completed { .. }));

        let batch = store.get_batch(batch_id).await.unwrap();
        assert!(batch.is_completed());
        assert_eq!(batch.webhook_status, Some(WebhookStatus::Failed));
    }

    #[test_log::test(tokio::test)]
    async fn test_no_webhook_configured() {
        let store = InMemoryStore::new();
        let batch_id = seed(&store, None).await;

        let outcome = aggregator(&store).aggregate(batch_id).await.unwrap();
        assert!(matches!(outcome, AggregationOutcome::Completed { webhook: None, .. }));
        assert!(store.get_batch(batch_id).await.unwrap().webhook_status.is_none());
    }

    #[test_log::test(tokio::test)]
    async fn test_unknown_batch_is_an_error() {
        let store = InMemoryStore::new();
        assert!(aggregator(&store).aggregate(BatchId::new()).await.is_err());
    }

    /// Delegates to an [`InMemoryStore`] but fails the first results write.
    struct FailFirstResultsWrite {
        inner: InMemoryStore,
        failed: AtomicBool,
    }

    impl BatchStore for FailFirstResultsWrite {
        async fn get_batch(&self, batch_id: BatchId) -> Result<Batch> {
            self.inner.get_batch(batch_id).await
        }

        async fn list_batch_messages(&self, batch_id: BatchId) -> Result<Vec<Message>> {
            self.inner.list_batch_messages(batch_id).await
        }

        async fn get_message(&self, message_id: MessageId) -> Result<Message> {
            self.inner.get_message(message_id).await
        }

        async fn save_message(&self, message: &Message) -> Result<()> {
            self.inner.save_message(message).await
        }

        async fn store_batch_results(&self, results: &BatchResults) -> Result<()> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(Error::Other(anyhow::anyhow!("shared storage unavailable")));
            }
            self.inner.store_batch_results(results).await
        }

        async fn get_batch_results(&self, batch_id: BatchId) -> Result<Option<BatchResults>> {
            self.inner.get_batch_results(batch_id).await
        }

        async fn mark_batch_completed(
            &self,
            batch_id: BatchId,
            response_count: u64,
            completed_at: DateTime<Utc>,
        ) -> Result<bool> {
            self.inner.mark_batch_completed(batch_id, response_count, completed_at).await
        }

        async fn record_webhook_delivery(
            &self,
            batch_id: BatchId,
            status: WebhookStatus,
            called_at: DateTime<Utc>,
        ) -> Result<()> {
            self.inner.record_webhook_delivery(batch_id, status, called_at).await
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_results_write_leaves_batch_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let inner = InMemoryStore::new();
        let batch_id = seed(&inner, Some(server.uri())).await;
        let store = Arc::new(FailFirstResultsWrite {
            inner: inner.clone(),
            failed: AtomicBool::new(false),
        });
        let aggregator = BatchAggregator::new(store, WebhookNotifier::new(Duration::from_secs(5)));

        assert!(aggregator.aggregate(batch_id).await.is_err());
        assert!(!inner.get_batch(batch_id).await.unwrap().is_completed());
        assert!(inner.get_batch_results(batch_id).await.unwrap().is_none());

        let outcome = aggregator.aggregate(batch_id).await.unwrap();
        assert!(matches!(outcome, AggregationOutcome::Completed { .. }));

        let batch = inner.get_batch(batch_id).await.unwrap();
        assert!(batch.is_completed());
        assert_eq!(batch.webhook_status, Some(WebhookStatus::Success));
        let results = inner.get_batch_results(batch_id).await.unwrap().unwrap();
        assert_eq!(results.response_count, 2);
        assert_eq!(results.results.len(), 3);
    }
}
