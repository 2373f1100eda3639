//! Transport to the gateway control API.
//!
//! [`GatewayClient`] is a thin, stateless wrapper over the admin endpoints: one request per call,
//! an explicit timeout on each, no retries. Retry and fallback policy lives in the reconciler so it
//! can be exercised against [`MockGatewayClient`] without a network.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::config::GatewaySettings;
use crate::gateway::route::RouteDefinition;

const ADMIN_ROUTES_PATH: &str = "apisix/admin/routes";
const ADMIN_PROBE_PATH: &str = "apisix/admin/plugins";
const ADMIN_KEY_HEADER: &str = "X-API-KEY";

/// Raw response from the control API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResponse {
    pub status: u16,
    pub body: String,
}

impl GatewayResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Classify a PUT/PATCH/DELETE response for the reconciler.
    pub fn outcome(&self) -> PushOutcome {
        match self.status {
            s if (200..300).contains(&s) => PushOutcome::Applied,
            409 => PushOutcome::Conflict,
            404 => PushOutcome::NotFound,
            _ if is_schema_rejection(&self.body) => PushOutcome::Rejected,
            _ => PushOutcome::Failed,
        }
    }
}

impl std::fmt::Display for GatewayResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HTTP {}: {}", self.status, self.body)
    }
}

fn is_schema_rejection(body: &str) -> bool {
    let body = body.to_lowercase();
    body.contains("schema") || body.contains("validation")
}

/// How the control API answered a push. Fallbacks are driven off these, not off errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// 2xx
    Applied,
    /// Route id already exists
    Conflict,
    /// Route id does not exist
    NotFound,
    /// Payload failed the gateway's schema validation
    Rejected,
    /// Any other non-2xx answer
    Failed,
}

/// The request never produced an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Could not reach the gateway at all
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("request failed: {0}")]
    Other(String),
}

impl TransportError {
    /// Gateway unreachable, as opposed to a request that reached it and went wrong.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connect(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            Self::Connect(e.to_string())
        } else if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else {
            Self::Other(e.to_string())
        }
    }
}

/// Operations on the gateway control API, keyed by route id.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// `true` when the control API answers its health endpoint with 200.
    async fn probe(&self) -> bool;

    async fn put(&self, route_id: &str, route: &RouteDefinition) -> Result<GatewayResponse, TransportError>;

    async fn patch(&self, route_id: &str, route: &RouteDefinition) -> Result<GatewayResponse, TransportError>;

    async fn delete(&self, route_id: &str) -> Result<GatewayResponse, TransportError>;
}

// ============================================================================
// Production implementation using reqwest
// ============================================================================

/// Control API client bound to one admin URL and credential.
#[derive(Clone)]
pub struct HttpGatewayClient {
    client: reqwest::Client,
    admin_url: Url,
    admin_key: String,
    put_timeout: Duration,
    request_timeout: Duration,
    probe_timeout: Duration,
}

impl HttpGatewayClient {
    pub fn new(settings: &GatewaySettings) -> Self {
        Self::with_client(reqwest::Client::new(), settings)
    }

    pub fn with_client(client: reqwest::Client, settings: &GatewaySettings) -> Self {
        Self {
            client,
            admin_url: settings.admin_url.clone(),
            admin_key: settings.admin_key.clone(),
            put_timeout: settings.put_timeout,
            request_timeout: settings.request_timeout,
            probe_timeout: settings.probe_timeout,
        }
    }

    fn admin_endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.admin_url.as_str().trim_end_matches('/'), path)
    }

    fn route_endpoint(&self, route_id: &str) -> String {
        self.admin_endpoint(&format!("{ADMIN_ROUTES_PATH}/{route_id}"))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<GatewayResponse, TransportError> {
        let response = request.header(ADMIN_KEY_HEADER, &self.admin_key).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(GatewayResponse { status, body })
    }
}

#[async_trait]
impl GatewayClient for HttpGatewayClient {
    #[tracing::instrument(skip(self), fields(admin_url = %self.admin_url))]
    async fn probe(&self) -> bool {
        let request = self
            .client
            .get(self.admin_endpoint(ADMIN_PROBE_PATH))
            .timeout(self.probe_timeout);

        match self.send(request).await {
            Ok(response) => {
                tracing::debug!(status = response.status, "Gateway probe answered");
                response.status == 200
            }
            Err(e) => {
                tracing::debug!(error = %e, "Gateway probe failed");
                false
            }
        }
    }

    #[tracing::instrument(skip(self, route), fields(uri = %route.uri))]
    async fn put(&self, route_id: &str, route: &RouteDefinition) -> Result<GatewayResponse, TransportError> {
        let request = self
            .client
            .put(self.route_endpoint(route_id))
            .json(route)
            .timeout(self.put_timeout);
        let response = self.send(request).await?;
        tracing::debug!(status = response.status, "PUT route");
        Ok(response)
    }

    #[tracing::instrument(skip(self, route), fields(uri = %route.uri))]
    async fn patch(&self, route_id: &str, route: &RouteDefinition) -> Result<GatewayResponse, TransportError> {
        let request = self
            .client
            .patch(self.route_endpoint(route_id))
            .json(route)
            .timeout(self.request_timeout);
        let response = self.send(request).await?;
        tracing::debug!(status = response.status, "PATCH route");
        Ok(response)
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, route_id: &str) -> Result<GatewayResponse, TransportError> {
        let request = self
            .client
            .delete(self.route_endpoint(route_id))
            .timeout(self.request_timeout);
        let response = self.send(request).await?;
        tracing::debug!(status = response.status, "DELETE route");
        Ok(response)
    }
}

// ============================================================================
// Test/Mock implementation
// ============================================================================

/// Record of a call made to [`MockGatewayClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    /// `PUT`, `PATCH` or `DELETE`
    pub method: &'static str,
    pub route_id: String,
    pub body: Option<RouteDefinition>,
}

/// In-memory gateway for tests.
///
/// Scripted responses are consumed first, FIFO per `"{METHOD} {route_id}"` key. When no script is
/// left for a key the mock behaves like a real control API backed by an in-memory route table:
/// PUT upserts, PATCH and DELETE answer 404 for unknown ids.
#[derive(Clone, Default)]
pub struct MockGatewayClient {
    ready: Arc<Mutex<VecDeque<bool>>>,
    scripted: Arc<Mutex<HashMap<String, VecDeque<Result<GatewayResponse, TransportError>>>>>,
    routes: Arc<Mutex<HashMap<String, RouteDefinition>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    probes: Arc<Mutex<usize>>,
}

impl MockGatewayClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue probe answers; once exhausted, probes report ready.
    pub fn script_probes(&self, answers: impl IntoIterator<Item = bool>) {
        self.ready.lock().extend(answers);
    }

    /// Queue a response for `key`, formatted as `"{METHOD} {route_id}"`.
    pub fn add_response(&self, key: &str, response: Result<GatewayResponse, TransportError>) {
        self.scripted
            .lock()
            .entry(key.to_string())
            .or_default()
            .push_back(response);
    }

    /// Seed the route table.
    pub fn insert_route(&self, route_id: &str, route: RouteDefinition) {
        self.routes.lock().insert(route_id.to_string(), route);
    }

    pub fn route(&self, route_id: &str) -> Option<RouteDefinition> {
        self.routes.lock().get(route_id).cloned()
    }

    pub fn route_count(&self) -> usize {
        self.routes.lock().len()
    }

    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn probe_count(&self) -> usize {
        *self.probes.lock()
    }

    fn record(&self, method: &'static str, route_id: &str, body: Option<&RouteDefinition>) {
        self.calls.lock().push(MockCall {
            method,
            route_id: route_id.to_string(),
            body: body.cloned(),
        });
    }

    fn next_scripted(&self, method: &str, route_id: &str) -> Option<Result<GatewayResponse, TransportError>> {
        self.scripted
            .lock()
            .get_mut(&format!("{method} {route_id}"))
            .and_then(VecDeque::pop_front)
    }

    fn not_found(route_id: &str) -> GatewayResponse {
        GatewayResponse::new(404, format!(r#"{{"message":"Key not found: /routes/{route_id}"}}"#))
    }
}

#[async_trait]
impl GatewayClient for MockGatewayClient {
    async fn probe(&self) -> bool {
        *self.probes.lock() += 1;
        self.ready.lock().pop_front().unwrap_or(true)
    }

    async fn put(&self, route_id: &str, route: &RouteDefinition) -> Result<GatewayResponse, TransportError> {
        self.record("PUT", route_id, Some(route));
        if let Some(scripted) = self.next_scripted("PUT", route_id) {
            return scripted;
        }
        let previous = self.routes.lock().insert(route_id.to_string(), route.clone());
        Ok(match previous {
            Some(_) => GatewayResponse::new(200, "{}"),
            None => GatewayResponse::new(201, "{}"),
        })
    }

    async fn patch(&self, route_id: &str, route: &RouteDefinition) -> Result<GatewayResponse, TransportError> {
        self.record("PATCH", route_id, Some(route));
        if let Some(scripted) = self.next_scripted("PATCH", route_id) {
            return scripted;
        }
        let mut routes = self.routes.lock();
        match routes.get_mut(route_id) {
            Some(existing) => {
                *existing = route.clone();
                Ok(GatewayResponse::new(200, "{}"))
            }
            None => Ok(Self::not_found(route_id)),
        }
    }

    async fn delete(&self, route_id: &str) -> Result<GatewayResponse, TransportError> {
        self.record("DELETE", route_id, None);
        if let Some(scripted) = self.next_scripted("DELETE", route_id) {
            return scripted;
        }
        match self.routes.lock().remove(route_id) {
            Some(_) => Ok(GatewayResponse::new(200, r#"{"deleted":"1"}"#)),
            None => Ok(Self::not_found(route_id)),
        }
    }
}
