//! Gateway route provisioning.
//!
//! - [`compiler`] turns a queue's providers into a [`route::RouteDefinition`]
//! - [`client`] talks to the gateway control API
//! - [`reconciler`] drives create/update/delete with retries and fallbacks
//! - [`backoff`] holds the retry policies and the sleep abstraction

pub mod backoff;
pub mod client;
pub mod compiler;
pub mod reconciler;
pub mod route;

pub use client::{GatewayClient, HttpGatewayClient, MockGatewayClient};
pub use compiler::{compile_route, CompileError};
pub use reconciler::{ProvisioningReport, ReconcileError, RouteOutcome, RouteReconciler};
pub use route::{route_id, DegradationTier, RouteDefinition};
