//! Configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The file path
//! defaults to `relayctl.yaml` and can be set with `-f` or the `RELAYCTL_CONFIG` environment
//! variable.
//!
//! ## Loading Priority
//!
//! Later sources override earlier ones:
//!
//! 1. **YAML config file**
//! 2. **`RELAYCTL_`-prefixed environment variables**, with `__` for nesting
//!    (`RELAYCTL_RECONCILE__PUSH__MAX_ATTEMPTS=3`)
//! 3. **`GATEWAY_ADMIN_URL`, `GATEWAY_ADMIN_KEY`, `GATEWAY_URL`**, which set the gateway admin
//!    URL, admin key and data-plane URL
//!
//! ## Example
//!
//! ```yaml
//! gateway:
//!   admin_url: http://apisix:9180
//!   admin_key: edd1c9f034335f136f87ad84b625c8f1
//!   data_plane_url: http://apisix:9080
//! reconcile:
//!   readiness:
//!     attempts: 10
//!     delay: 5s
//!   push:
//!     max_attempts: 5
//!     initial_delay: 5s
//! webhook:
//!   timeout: 30s
//! ```

use clap::{Parser, Subcommand};
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, time::Duration};
use url::Url;

use crate::errors::Error;
use crate::gateway::backoff::{BackoffPolicy, ReadinessPolicy};
use crate::types::QueueId;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "RELAYCTL_CONFIG", default_value = "relayctl.yaml")]
    pub config: String,

    /// Validate configuration and exit.
    #[arg(long)]
    pub validate: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Check whether the gateway control API is reachable
    Health,
    /// Manage the gateway route of a queue
    Route {
        #[command(subcommand)]
        action: RouteCommand,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum RouteCommand {
    /// Print the route that would be pushed, without contacting the gateway
    Compile {
        queue_id: QueueId,
        /// YAML file listing the queue's providers
        #[arg(short, long)]
        providers: PathBuf,
    },
    /// Create the route, updating it if it already exists
    Create {
        queue_id: QueueId,
        #[arg(short, long)]
        providers: PathBuf,
    },
    /// Update the route, creating it if it is missing
    Update {
        queue_id: QueueId,
        #[arg(short, long)]
        providers: PathBuf,
    },
    /// Delete the route
    Delete { queue_id: QueueId },
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub gateway: GatewaySettings,
    pub reconcile: ReconcileSettings,
    pub webhook: WebhookSettings,
    pub dispatch: DispatchSettings,
    /// Export traces over OTLP, configured through the standard `OTEL_*` variables
    pub enable_otel_export: bool,
}

/// Where the gateway lives and how long to wait on it.
#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct GatewaySettings {
    /// Control API base URL
    pub admin_url: Url,
    /// Sent as `X-API-KEY` on every control API request
    pub admin_key: String,
    /// Data-plane base URL that routed requests are sent to
    pub data_plane_url: Url,
    /// Timeout for route PUTs
    #[serde(with = "humantime_serde")]
    pub put_timeout: Duration,
    /// Timeout for route PATCHes and DELETEs
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Timeout for each readiness probe
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            admin_url: Url::parse("http://127.0.0.1:9180").expect("valid default admin URL"),
            admin_key: String::new(),
            data_plane_url: Url::parse("http://127.0.0.1:9080").expect("valid default data plane URL"),
            put_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

impl fmt::Debug for GatewaySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewaySettings")
            .field("admin_url", &self.admin_url.as_str())
            .field("admin_key", &"<redacted>")
            .field("data_plane_url", &self.data_plane_url.as_str())
            .field("put_timeout", &self.put_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("probe_timeout", &self.probe_timeout)
            .finish()
    }
}

/// Per-call replacements for the configured gateway, for tenants with their own gateway or
/// credential.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct GatewayOverrides {
    pub admin_url: Option<Url>,
    pub admin_key: Option<String>,
    pub data_plane_url: Option<Url>,
}

impl GatewaySettings {
    pub fn with_overrides(&self, overrides: &GatewayOverrides) -> GatewaySettings {
        let mut settings = self.clone();
        if let Some(url) = &overrides.admin_url {
            settings.admin_url = url.clone();
        }
        if let Some(key) = &overrides.admin_key {
            settings.admin_key = key.clone();
        }
        if let Some(url) = &overrides.data_plane_url {
            settings.data_plane_url = url.clone();
        }
        settings
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcileSettings {
    /// Probing the control API before a create
    pub readiness: ReadinessPolicy,
    /// Retrying a route PUT that got no HTTP response
    pub push: BackoffPolicy,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct WebhookSettings {
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchSettings {
    /// Timeout for a chat request on the data plane
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            // RELAYCTL_CONFIG names the file itself
            .merge(Env::prefixed("RELAYCTL_").ignore(&["CONFIG"]).split("__"))
            .merge(
                Env::raw()
                    .only(&["GATEWAY_ADMIN_URL"])
                    .map(|_| "gateway.admin_url".into()),
            )
            .merge(
                Env::raw()
                    .only(&["GATEWAY_ADMIN_KEY"])
                    .map(|_| "gateway.admin_key".into()),
            )
            .merge(
                Env::raw()
                    .only(&["GATEWAY_URL"])
                    .map(|_| "gateway.data_plane_url".into()),
            )
    }

    pub fn validate(&self) -> Result<(), Error> {
        for (name, url) in [
            ("gateway.admin_url", &self.gateway.admin_url),
            ("gateway.data_plane_url", &self.gateway.data_plane_url),
        ] {
            if !matches!(url.scheme(), "http" | "https") {
                return Err(Error::InvalidInput {
                    message: format!("Config validation: {name} must be an http(s) URL, got '{url}'"),
                });
            }
        }

        if self.reconcile.readiness.attempts == 0 {
            return Err(Error::InvalidInput {
                message: "Config validation: reconcile.readiness.attempts must be at least 1".to_string(),
            });
        }
        if self.reconcile.push.max_attempts == 0 {
            return Err(Error::InvalidInput {
                message: "Config validation: reconcile.push.max_attempts must be at least 1".to_string(),
            });
        }
        if self.reconcile.push.initial_delay > self.reconcile.push.max_delay {
            return Err(Error::InvalidInput {
                message: format!(
                    "Config validation: reconcile.push.initial_delay ({:?}) cannot be greater than max_delay ({:?})",
                    self.reconcile.push.initial_delay, self.reconcile.push.max_delay
                ),
            });
        }

        let timeouts = [
            ("gateway.put_timeout", self.gateway.put_timeout),
            ("gateway.request_timeout", self.gateway.request_timeout),
            ("gateway.probe_timeout", self.gateway.probe_timeout),
            ("webhook.timeout", self.webhook.timeout),
            ("dispatch.timeout", self.dispatch.timeout),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, t)| t.is_zero()) {
            return Err(Error::InvalidInput {
                message: format!("Config validation: {name} must be greater than zero"),
            });
        }

        Ok(())
    }
}
