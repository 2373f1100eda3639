//! Records the control plane reads and writes.
//!
//! Persistence of these records belongs to the host application; this crate only defines their
//! shape and the transitions it performs on them.

pub mod batch;
pub mod provider;

pub use batch::{Batch, BatchResults, BatchStatus, Message, MessageResult, MessageStatus, WebhookStatus};
pub use provider::{Provider, ProviderType};
