//! # relayctl: gateway routes and batch fan-in for AI provider queues
//!
//! `relayctl` keeps an APISIX-style API gateway in step with the providers attached to each
//! dispatch queue, and tracks batches of queued messages through to a single aggregated result.
//!
//! ## Overview
//!
//! A queue fronts one or more upstream AI providers. Clients never talk to a provider directly:
//! each queue gets one gateway route whose path names the queue and its models, and the gateway
//! rewrites, rate-limits and authenticates requests on their way upstream. The [`gateway`] module
//! owns that route. It compiles the provider set into a route definition, waits for the control
//! API to come up, pushes the route with retries, and falls back to simpler definitions when the
//! gateway rejects the full one.
//!
//! Messages can be grouped into batches. Workers process messages independently, so the
//! [`batch`] module counts completions per batch with an atomic counter. The worker whose
//! completion finishes the batch aggregates every result and sends one webhook; the batch status
//! is flipped with a compare-and-set so repeated signals can't complete it twice.
//!
//! ## Components
//!
//! - [`gateway`]: route compilation ([`gateway::compiler`]), the control API client
//!   ([`gateway::client`]), retry policy ([`gateway::backoff`]) and the reconciler
//!   ([`gateway::reconciler`]).
//! - [`batch`]: completion counters, fan-in, aggregation and webhook delivery.
//! - [`dispatch`]: processes one queued message through its queue's route.
//! - [`store`]: storage traits plus an in-memory implementation.
//! - [`config`]: YAML + environment configuration and the CLI.
//! - [`telemetry`]: tracing setup with optional OTLP export.
//!
//! ## Metrics
//!
//! Counters are recorded through the [`metrics`] facade and go wherever the host installs a
//! recorder:
//!
//! - `relayctl_route_pushes_total{operation, outcome}`
//! - `relayctl_route_degradations_total{tier}`
//! - `relayctl_batches_aggregated_total`
//! - `relayctl_webhook_deliveries_total{outcome}`

pub mod batch;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod gateway;
pub mod models;
pub mod store;
pub mod telemetry;
pub mod types;

pub use config::Config;
pub use errors::{Error, Result};
