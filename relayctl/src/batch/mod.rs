//! Batch completion tracking.
//!
//! ```text
//! worker finishes message
//!   └─ CompletionTracker::on_message_finished()
//!        ├─ AtomicCounter::increment_and_get()
//!        └─ first value to reach request_count?
//!             ├─ BatchAggregator::aggregate()
//!             │    ├─ BatchStore: store results
//!             │    ├─ BatchStore: mark completed (compare-and-set)
//!             │    └─ WebhookNotifier::notify()   // single attempt
//!             └─ AtomicCounter::remove()
//! ```

pub mod aggregator;
pub mod counter;
pub mod fanin;
pub mod webhook;

pub use aggregator::{AggregationOutcome, BatchAggregator};
pub use counter::{AtomicCounter, InMemoryCounter};
pub use fanin::{CompletionTracker, FanInOutcome};
pub use webhook::{WebhookDelivery, WebhookNotifier, WebhookPayload};

#[cfg(feature = "postgres")]
pub use counter::PostgresCounter;
