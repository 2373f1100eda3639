//! Fan-in of message completions onto batch aggregation.
//!
//! Each finished message bumps its batch counter exactly once. The caller whose increment first
//! reaches the batch size runs the aggregation; everyone else just records progress. Because the
//! counter hands every caller a distinct value, exactly one of them sees the crossing.
//!
//! A batch's counter is released once its aggregation completes. Signals that arrive after that
//! are ignored without touching the counter.

use std::sync::Arc;

use crate::batch::aggregator::{AggregationOutcome, BatchAggregator};
use crate::batch::counter::AtomicCounter;
use crate::errors::Result;
use crate::store::BatchStore;
use crate::types::BatchId;

#[derive(Debug, Clone, PartialEq)]
pub enum FanInOutcome {
    /// Batch not finished yet
    Pending { observed: u64, expected: u64 },
    /// This completion finished the batch and ran aggregation
    Triggered(AggregationOutcome),
    /// Counter already past the batch size of a batch that is still pending
    Overflow { observed: u64, expected: u64 },
    /// The batch was completed before this signal arrived
    BatchCompleted,
}

/// `observed` is the first value to reach `expected`. An empty batch completes on its first
/// signal.
fn crosses_threshold(observed: u64, expected: u64) -> bool {
    observed == expected.max(1)
}

pub struct CompletionTracker<C, S> {
    counter: C,
    store: Arc<S>,
    aggregator: Arc<BatchAggregator<S>>,
}

impl<C: AtomicCounter, S: BatchStore> CompletionTracker<C, S> {
    pub fn new(counter: C, store: Arc<S>, aggregator: Arc<BatchAggregator<S>>) -> Self {
        Self {
            counter,
            store,
            aggregator,
        }
    }

    /// Report that one message of `batch_id` reached a terminal status.
    ///
    /// Call once per message, after the message record itself is saved.
    #[tracing::instrument(skip_all, fields(batch_id = %batch_id))]
    pub async fn on_message_finished(&self, batch_id: BatchId) -> Result<FanInOutcome> {
        let batch = self.store.get_batch(batch_id).await?;
        if batch.is_completed() {
            tracing::debug!("Batch already completed, ignoring completion signal");
            return Ok(FanInOutcome::BatchCompleted);
        }

        let observed = self.counter.increment_and_get(batch_id).await?;
        let expected = batch.request_count;

        if crosses_threshold(observed, expected) {
            tracing::info!(observed, expected, "All batch messages finished, aggregating");
            let outcome = self.aggregator.aggregate(batch_id).await?;
            if let AggregationOutcome::Completed { .. } = outcome {
                self.counter.remove(batch_id).await?;
            }
            return Ok(FanInOutcome::Triggered(outcome));
        }

        if observed > expected {
            tracing::warn!(observed, expected, "Completion counted past batch size");
            return Ok(FanInOutcome::Overflow { observed, expected });
        }

        tracing::debug!(observed, expected, "Batch progress");
        Ok(FanInOutcome::Pending { observed, expected })
    }
}
