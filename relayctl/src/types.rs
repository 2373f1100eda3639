//! Identifier types shared across the crate.
//!
//! All entity IDs are UUIDs wrapped in newtypes so a batch id can never be handed to an API that
//! expects a queue id:
//!
//! - [`QueueId`]: a provider queue, and the key of its gateway route
//! - [`ProviderId`]: an AI provider attached to a queue
//! - [`BatchId`]: a batch of messages tracked by the fan-in counter
//! - [`MessageId`]: a single dispatched work item
//!
//! [`DispatchQueue`] names the queue a worker pulls from. It is either a provider queue or the
//! internal queue used to schedule batch aggregation, which never gets a gateway route.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl std::ops::Deref for $name {
            type Target = Uuid;
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a provider queue.
    QueueId
);
uuid_id!(
    /// Unique identifier for a provider.
    ProviderId
);
uuid_id!(
    /// Unique identifier for a batch.
    BatchId
);
uuid_id!(
    /// Unique identifier for a message.
    MessageId
);

/// Name of the internal queue that carries batch aggregation jobs.
pub const BATCH_AGGREGATOR_QUEUE: &str = "batch_aggregator";

/// A queue a worker dispatches from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchQueue {
    /// A provider queue, routed through the gateway.
    Provider(QueueId),
    /// The internal batch aggregation queue. Exempt from route provisioning.
    BatchAggregator,
}

impl From<QueueId> for DispatchQueue {
    fn from(id: QueueId) -> Self {
        DispatchQueue::Provider(id)
    }
}

impl FromStr for DispatchQueue {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == BATCH_AGGREGATOR_QUEUE {
            return Ok(DispatchQueue::BatchAggregator);
        }
        s.parse().map(DispatchQueue::Provider)
    }
}

impl fmt::Display for DispatchQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchQueue::Provider(id) => write!(f, "{id}"),
            DispatchQueue::BatchAggregator => f.write_str(BATCH_AGGREGATOR_QUEUE),
        }
    }
}
