//! Keeps the gateway's route for a queue in line with the queue's provider set.
//!
//! Every queue maps to exactly one route id, `route-{queue_id}`, so create, update and delete are
//! all keyed by something both sides can compute. Concurrent or repeated calls for the same queue
//! converge instead of duplicating: PUT upserts, a conflicting create turns into an update, and an
//! update of a missing route turns into a create. Each fallback runs at most once per call.
//!
//! # Failure policy
//!
//! - Configuration errors (missing model, bad endpoint) fail before any request is sent.
//! - A schema rejection of the full payload is retried with smaller payloads, see
//!   [`DegradationTier`].
//! - If the gateway cannot be reached at all, **create reports success** with a
//!   [`RouteWarning::Deferred`] warning: the route is re-provisioned by [`RouteReconciler::ensure_route`]
//!   before the queue's first dispatch. Update and delete have no such safety net and fail instead.
//! - Failures are returned as values and never roll back the caller's own writes.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::config::ReconcileSettings;
use crate::gateway::backoff::{BackoffPolicy, ReadinessPolicy, Sleeper, TokioSleeper};
use crate::gateway::client::{GatewayClient, GatewayResponse, PushOutcome, TransportError};
use crate::gateway::compiler::{compile_route, CompileError};
use crate::gateway::route::{route_id, DegradationTier, RouteDefinition};
use crate::models::Provider;
use crate::types::{DispatchQueue, QueueId};


/// What a successful reconciliation did to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteAction {
    Created,
    Updated,
    Deleted,
    /// Delete of a route that was not there
    AlreadyAbsent,
    /// Gateway unreachable; provisioning happens before first dispatch
    Deferred,
}

/// Something the caller should surface even though reconciliation succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteWarning {
    /// Readiness probe never succeeded; pushed anyway
    GatewayNotReady { attempts: u32 },
    /// The full payload was rejected; the route was stored at a reduced tier
    Degraded { tier: DegradationTier },
    /// The gateway could not be reached; nothing was stored
    Deferred { reason: String },
}

impl fmt::Display for RouteWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GatewayNotReady { attempts } => {
                write!(f, "Gateway not ready after {attempts} probes, pushed route anyway")
            }
            Self::Degraded { tier } => {
                write!(f, "Gateway rejected full route configuration, applied {tier} configuration")
            }
            Self::Deferred { reason } => {
                write!(f, "Gateway unreachable ({reason}), route will be created before first request")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteOutcome {
    pub route_id: String,
    /// Compiled path; absent for deletes
    pub route_path: Option<String>,
    pub action: RouteAction,
    pub warnings: Vec<RouteWarning>,
}

/// Error taxonomy surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connectivity,
    Validation,
    NotFound,
    Conflict,
    Configuration,
    Gateway,
}

#[derive(Debug, Clone, Error)]
pub enum ReconcileError {
    #[error("Invalid provider configuration: {0}")]
    Configuration(#[from] CompileError),

    #[error("Gateway unreachable while reconciling {route_id}: {source}")]
    Unreachable {
        route_id: String,
        #[source]
        source: TransportError,
    },

    #[error("Request for {route_id} failed after {attempts} attempts: {source}")]
    Transport {
        route_id: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("Gateway rejected every configuration tier for {route_path}: {response}")]
    Rejected {
        route_id: String,
        route_path: String,
        response: GatewayResponse,
    },

    #[error("Gateway refused {route_id}: {response}")]
    Refused {
        route_id: String,
        route_path: Option<String>,
        response: GatewayResponse,
    },
}

impl ReconcileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Unreachable { .. } => ErrorKind::Connectivity,
            Self::Transport { source, .. } if source.is_connectivity() => ErrorKind::Connectivity,
            Self::Transport { .. } => ErrorKind::Gateway,
            Self::Rejected { .. } => ErrorKind::Validation,
            Self::Refused { response, .. } => match response.outcome() {
                PushOutcome::NotFound => ErrorKind::NotFound,
                PushOutcome::Conflict => ErrorKind::Conflict,
                PushOutcome::Rejected => ErrorKind::Validation,
                PushOutcome::Applied | PushOutcome::Failed => ErrorKind::Gateway,
            },
        }
    }

    pub fn route_path(&self) -> Option<&str> {
        match self {
            Self::Rejected { route_path, .. } => Some(route_path),
            Self::Refused { route_path, .. } => route_path.as_deref(),
            _ => None,
        }
    }
}

/// Result shape returned to the provider/queue CRUD layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisioningReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<RouteAction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProvisioningReport {
    pub fn from_result(queue_id: &QueueId, result: &Result<RouteOutcome, ReconcileError>) -> Self {
        match result {
            Ok(outcome) => Self {
                success: true,
                route_id: Some(outcome.route_id.clone()),
                route_path: outcome.route_path.clone(),
                action: Some(outcome.action),
                warnings: outcome.warnings.iter().map(ToString::to_string).collect(),
                error_kind: None,
                error: None,
            },
            Err(e) => Self {
                success: false,
                route_id: Some(route_id(queue_id)),
                route_path: e.route_path().map(str::to_string),
                action: None,
                warnings: Vec::new(),
                error_kind: Some(e.kind()),
                error: Some(e.to_string()),
            },
        }
    }
}

/// Result of a create push, before any fallback is taken.
enum CreateStep {
    Applied(DegradationTier),
    Conflict,
    Deferred(TransportError),
}

/// Result of an update push, before any fallback is taken.
enum UpdateStep {
    Applied,
    NotFound,
}

/// A PUT that never got an HTTP answer within the retry budget.
struct RetriesExhausted {
    attempts: u32,
    last: TransportError,
    /// Every attempt failed to reach the gateway
    unreachable: bool,
}

pub struct RouteReconciler {
    client: Arc<dyn GatewayClient>,
    sleeper: Arc<dyn Sleeper>,
    readiness: ReadinessPolicy,
    push: BackoffPolicy,
}

impl RouteReconciler {
    pub fn new(client: Arc<dyn GatewayClient>, settings: &ReconcileSettings) -> Self {
        Self {
            client,
            sleeper: Arc::new(TokioSleeper),
            readiness: settings.readiness,
            push: settings.push,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Provision the route for a queue. Falls back to an update if the route already exists.
    #[tracing::instrument(skip_all, fields(queue_id = %queue_id, providers = providers.len()))]
    pub async fn create(&self, queue_id: &QueueId, providers: &[Provider]) -> Result<RouteOutcome, ReconcileError> {
        let route = compile_route(queue_id, providers)?;
        let id = route_id(queue_id);

        let mut warnings = Vec::new();
        if !self.wait_until_ready().await {
            warnings.push(RouteWarning::GatewayNotReady {
                attempts: self.readiness.attempts,
            });
        }

        match self.push_create(&id, &route).await? {
            CreateStep::Applied(tier) => {
                if tier != DegradationTier::Full {
                    warnings.push(RouteWarning::Degraded { tier });
                }
                tracing::info!(route_id = %id, uri = %route.uri, %tier, "Created gateway route");
                Ok(outcome(id, &route, RouteAction::Created, warnings))
            }
            CreateStep::Deferred(e) => {
                tracing::warn!(route_id = %id, error = %e, "Gateway unreachable, deferring route creation to first dispatch");
                warnings.push(RouteWarning::Deferred { reason: e.to_string() });
                Ok(outcome(id, &route, RouteAction::Deferred, warnings))
            }
            CreateStep::Conflict => {
                tracing::info!(route_id = %id, "Route already exists, updating instead");
                match self.push_update(&id, &route).await? {
                    UpdateStep::Applied => Ok(outcome(id, &route, RouteAction::Updated, warnings)),
                    UpdateStep::NotFound => Err(ReconcileError::Refused {
                        route_id: id,
                        route_path: Some(route.uri),
                        response: GatewayResponse::new(404, "route vanished between create and update"),
                    }),
                }
            }
        }
    }

    /// Replace the route for a queue with the current provider set. Falls back to a create if the
    /// gateway has no such route.
    #[tracing::instrument(skip_all, fields(queue_id = %queue_id, providers = providers.len()))]
    pub async fn update(&self, queue_id: &QueueId, providers: &[Provider]) -> Result<RouteOutcome, ReconcileError> {
        let route = compile_route(queue_id, providers)?;
        let id = route_id(queue_id);

        match self.push_update(&id, &route).await? {
            UpdateStep::Applied => {
                tracing::info!(route_id = %id, uri = %route.uri, "Updated gateway route");
                Ok(outcome(id, &route, RouteAction::Updated, Vec::new()))
            }
            UpdateStep::NotFound => {
                tracing::info!(route_id = %id, "Route missing on update, creating it");
                let mut warnings = Vec::new();
                match self.push_create(&id, &route).await? {
                    CreateStep::Applied(tier) => {
                        if tier != DegradationTier::Full {
                            warnings.push(RouteWarning::Degraded { tier });
                        }
                        Ok(outcome(id, &route, RouteAction::Created, warnings))
                    }
                    CreateStep::Deferred(e) => Err(ReconcileError::Unreachable { route_id: id, source: e }),
                    CreateStep::Conflict => Err(ReconcileError::Refused {
                        route_id: id,
                        route_path: Some(route.uri),
                        response: GatewayResponse::new(409, "route appeared between update and create"),
                    }),
                }
            }
        }
    }

    /// Remove the route for a queue. A route that is already gone counts as deleted.
    #[tracing::instrument(skip_all, fields(queue_id = %queue_id))]
    pub async fn delete(&self, queue_id: &QueueId) -> Result<RouteOutcome, ReconcileError> {
        let id = route_id(queue_id);
        let response = self.client.delete(&id).await.map_err(|e| {
            record_push("delete", "transport_error");
            if e.is_connectivity() {
                ReconcileError::Unreachable {
                    route_id: id.clone(),
                    source: e,
                }
            } else {
                ReconcileError::Transport {
                    route_id: id.clone(),
                    attempts: 1,
                    source: e,
                }
            }
        })?;

        let action = match response.outcome() {
            PushOutcome::Applied => RouteAction::Deleted,
            PushOutcome::NotFound => RouteAction::AlreadyAbsent,
            _ => {
                record_push("delete", "refused");
                tracing::error!(route_id = %id, status = response.status, "Gateway refused route deletion");
                return Err(ReconcileError::Refused {
                    route_id: id,
                    route_path: None,
                    response,
                });
            }
        };

        record_push("delete", "applied");
        tracing::info!(route_id = %id, ?action, "Deleted gateway route");
        Ok(RouteOutcome {
            route_id: id,
            route_path: None,
            action,
            warnings: Vec::new(),
        })
    }

    /// Make sure a route exists before dispatching to a queue.
    ///
    /// Idempotent, so safe to call before every dispatch. Returns `None` for the internal batch
    /// aggregation queue, which is never routed through the gateway.
    #[tracing::instrument(skip_all, fields(queue = %queue))]
    pub async fn ensure_route(
        &self,
        queue: &DispatchQueue,
        providers: &[Provider],
    ) -> Result<Option<RouteOutcome>, ReconcileError> {
        match queue {
            DispatchQueue::BatchAggregator => {
                tracing::debug!("Internal queue, skipping route provisioning");
                Ok(None)
            }
            DispatchQueue::Provider(queue_id) => self.create(queue_id, providers).await.map(Some),
        }
    }

    /// Poll the control API until it answers. Returns `false` if it never did.
    async fn wait_until_ready(&self) -> bool {
        for attempt in 1..=self.readiness.attempts {
            if self.client.probe().await {
                tracing::debug!(attempt, "Gateway ready");
                return true;
            }
            tracing::debug!(attempt, max_attempts = self.readiness.attempts, "Gateway not ready");
            if attempt < self.readiness.attempts {
                self.sleeper.sleep(self.readiness.delay).await;
            }
        }
        tracing::warn!(attempts = self.readiness.attempts, "Gateway never became ready, continuing anyway");
        false
    }

    /// PUT the route, degrading the payload tier by tier while the gateway rejects its schema.
    async fn push_create(&self, id: &str, route: &RouteDefinition) -> Result<CreateStep, ReconcileError> {
        let mut last_rejection = None;

        for tier in DegradationTier::ORDER {
            let payload = route.degrade(tier);
            let response = match self.put_with_retry(id, &payload).await {
                Ok(response) => response,
                Err(exhausted) if exhausted.unreachable => {
                    record_push("create", "deferred");
                    return Ok(CreateStep::Deferred(exhausted.last));
                }
                Err(exhausted) => {
                    record_push("create", "transport_error");
                    return Err(ReconcileError::Transport {
                        route_id: id.to_string(),
                        attempts: exhausted.attempts,
                        source: exhausted.last,
                    });
                }
            };

            match response.outcome() {
                PushOutcome::Applied => {
                    record_push("create", "applied");
                    if tier != DegradationTier::Full {
                        metrics::counter!("relayctl_route_degradations_total", "tier" => tier.as_str()).increment(1);
                    }
                    return Ok(CreateStep::Applied(tier));
                }
                PushOutcome::Conflict => {
                    record_push("create", "conflict");
                    return Ok(CreateStep::Conflict);
                }
                PushOutcome::Rejected => {
                    tracing::warn!(route_id = %id, %tier, status = response.status, body = %response.body, "Gateway rejected route schema");
                    last_rejection = Some(response);
                }
                PushOutcome::NotFound | PushOutcome::Failed => {
                    record_push("create", "refused");
                    tracing::error!(route_id = %id, %tier, status = response.status, body = %response.body, "Gateway refused route");
                    return Err(ReconcileError::Refused {
                        route_id: id.to_string(),
                        route_path: Some(route.uri.clone()),
                        response,
                    });
                }
            }
        }

        record_push("create", "rejected");
        Err(ReconcileError::Rejected {
            route_id: id.to_string(),
            route_path: route.uri.clone(),
            response: last_rejection.unwrap_or_else(|| GatewayResponse::new(400, "")),
        })
    }

    async fn put_with_retry(&self, id: &str, payload: &RouteDefinition) -> Result<GatewayResponse, RetriesExhausted> {
        let mut unreachable = true;
        let mut attempt = 1;
        loop {
            match self.client.put(id, payload).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    unreachable &= e.is_connectivity();
                    tracing::warn!(route_id = %id, attempt, max_attempts = self.push.max_attempts, error = %e, "Route push failed");
                    match self.push.delay_after(attempt) {
                        Some(delay) => {
                            self.sleeper.sleep(delay).await;
                            attempt += 1;
                        }
                        None => {
                            return Err(RetriesExhausted {
                                attempts: attempt,
                                last: e,
                                unreachable,
                            })
                        }
                    }
                }
            }
        }
    }

    async fn push_update(&self, id: &str, route: &RouteDefinition) -> Result<UpdateStep, ReconcileError> {
        let response = self.client.patch(id, route).await.map_err(|e| {
            record_push("update", "transport_error");
            if e.is_connectivity() {
                ReconcileError::Unreachable {
                    route_id: id.to_string(),
                    source: e,
                }
            } else {
                ReconcileError::Transport {
                    route_id: id.to_string(),
                    attempts: 1,
                    source: e,
                }
            }
        })?;

        match response.outcome() {
            PushOutcome::Applied => {
                record_push("update", "applied");
                Ok(UpdateStep::Applied)
            }
            PushOutcome::NotFound => {
                record_push("update", "not_found");
                Ok(UpdateStep::NotFound)
            }
            _ => {
                record_push("update", "refused");
                tracing::error!(route_id = %id, status = response.status, body = %response.body, "Gateway refused route update");
                Err(ReconcileError::Refused {
                    route_id: id.to_string(),
                    route_path: Some(route.uri.clone()),
                    response,
                })
            }
        }
    }
}

fn outcome(route_id: String, route: &RouteDefinition, action: RouteAction, warnings: Vec<RouteWarning>) -> RouteOutcome {
    RouteOutcome {
        route_id,
        route_path: Some(route.uri.clone()),
        action,
        warnings,
    }
}

fn record_push(operation: &'static str, outcome: &'static str) {
    metrics::counter!("relayctl_route_pushes_total", "operation" => operation, "outcome" => outcome).increment(1);
}
