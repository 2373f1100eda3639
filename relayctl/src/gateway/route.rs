//! The route object accepted by the gateway control API.
//!
//! Field names follow the gateway's admin schema verbatim (`limit-req`, `keepalive_pool`, ...), so
//! these types serialize straight into PUT/PATCH bodies.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::QueueId;

/// Deterministic gateway route id for a queue.
pub fn route_id(queue_id: &QueueId) -> String {
    format!("route-{queue_id}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDefinition {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,
    pub upstream: Upstream,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugins: Option<RoutePlugins>,
}

impl RouteDefinition {
    /// Reduce the payload to what the given tier keeps.
    pub fn degrade(&self, tier: DegradationTier) -> RouteDefinition {
        let mut route = self.clone();
        match tier {
            DegradationTier::Full => {}
            DegradationTier::Minimal => {
                route.plugins = None;
            }
            DegradationTier::Basic => {
                route.plugins = None;
                route.methods = None;
            }
        }
        route
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upstream {
    #[serde(rename = "type")]
    pub balancer: String,
    /// `host:port` → weight
    pub nodes: BTreeMap<String, u32>,
    pub scheme: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<UpstreamTimeout>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive_pool: Option<KeepalivePool>,
}

/// Upstream timeouts in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamTimeout {
    pub connect: u32,
    pub send: u32,
    pub read: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepalivePool {
    pub size: u32,
    pub idle_timeout: u32,
    pub requests: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutePlugins {
    #[serde(rename = "limit-req")]
    pub limit_req: LimitReq,
    #[serde(rename = "proxy-rewrite")]
    pub proxy_rewrite: ProxyRewrite,
    pub cors: Cors,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitReq {
    /// Requests per second
    pub rate: f64,
    pub burst: u32,
    pub key: String,
    pub rejected_code: u16,
    pub rejected_msg: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRewrite {
    pub uri: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cors {
    pub allow_origins: String,
    pub allow_methods: String,
    pub allow_headers: String,
    pub expose_headers: String,
    pub max_age: u32,
    pub allow_credential: bool,
}

/// Progressively smaller payloads tried after the gateway rejects a richer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DegradationTier {
    /// Everything: methods, upstream and all plugins
    Full,
    /// Path, methods and upstream
    Minimal,
    /// Path and upstream
    Basic,
}

impl DegradationTier {
    /// Tiers in the order they are attempted.
    pub const ORDER: [DegradationTier; 3] = [DegradationTier::Full, DegradationTier::Minimal, DegradationTier::Basic];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Minimal => "minimal",
            Self::Basic => "basic",
        }
    }
}

impl fmt::Display for DegradationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
