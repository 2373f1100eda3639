//! Compiles a queue's provider set into a gateway route.
//!
//! Compilation is pure: the same providers in the same order always produce the same
//! [`RouteDefinition`], and nothing here touches the network.
//!
//! Only the first provider contributes the upstream and the injected credential. Load balancing
//! across several providers of one queue is not implemented; the remaining providers still shape
//! the path and the rate limit.

use std::collections::BTreeMap;
use thiserror::Error;
use url::Url;

use crate::gateway::route::{
    Cors, KeepalivePool, LimitReq, ProxyRewrite, RouteDefinition, RoutePlugins, Upstream, UpstreamTimeout,
};
use crate::models::{Provider, ProviderType};
use crate::types::{ProviderId, QueueId};

const ROUTE_METHODS: [&str; 1] = ["POST"];
const UPSTREAM_REWRITE_URI: &str = "/v1/chat/completions";
const BALANCER: &str = "roundrobin";

const MIN_RATE: f64 = 0.1;
const RATE_LIMIT_KEY: &str = "remote_addr";
const RATE_LIMIT_REJECTED_CODE: u16 = 429;
const RATE_LIMIT_REJECTED_MSG: &str = "Rate limit exceeded";

const UPSTREAM_TIMEOUT: UpstreamTimeout = UpstreamTimeout {
    connect: 60,
    send: 60,
    read: 60,
};
const KEEPALIVE_POOL: KeepalivePool = KeepalivePool {
    size: 320,
    idle_timeout: 60,
    requests: 1000,
};

// Placeholder route for queues without providers
const PLACEHOLDER_NODE: &str = "httpbin.org:80";
const PLACEHOLDER_RATE: f64 = 10.0;
const PLACEHOLDER_BURST: u32 = 20;

const OPENAI_ENDPOINT: &str = "https://api.openai.com";

/// Reasons a provider set cannot be compiled. These are configuration errors: retrying or
/// degrading the payload cannot fix them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("No model configured for provider {provider_id}")]
    MissingModel { provider_id: ProviderId },

    #[error("Provider {provider_id} has an invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint {
        provider_id: ProviderId,
        endpoint: String,
        reason: String,
    },

    #[error("Provider {provider_id} has a zero-length rate limit window")]
    InvalidRateWindow { provider_id: ProviderId },
}

/// Compile the full route for a queue.
///
/// An empty provider list yields the placeholder route (see [`placeholder_route`]).
pub fn compile_route(queue_id: &QueueId, providers: &[Provider]) -> Result<RouteDefinition, CompileError> {
    let Some(primary) = providers.first() else {
        return Ok(placeholder_route(queue_id));
    };

    let uri = route_path(queue_id, providers)?;
    let limit_req = rate_limit(providers)?;
    let upstream = upstream_for(primary)?;

    Ok(RouteDefinition {
        uri,
        methods: Some(ROUTE_METHODS.iter().map(|m| m.to_string()).collect()),
        upstream,
        plugins: Some(RoutePlugins {
            limit_req,
            proxy_rewrite: ProxyRewrite {
                uri: UPSTREAM_REWRITE_URI.to_string(),
                headers: auth_headers(primary),
            },
            cors: cors_policy(),
        }),
    })
}

/// Route path for a queue: `/{queue_id}-{model_1}-...-{model_n}`.
///
/// Every provider must carry a model; one missing model fails the whole path.
pub fn route_path(queue_id: &QueueId, providers: &[Provider]) -> Result<String, CompileError> {
    if providers.is_empty() {
        return Ok(format!("/{queue_id}"));
    }

    let models = providers
        .iter()
        .map(|provider| {
            provider
                .model()
                .map(sanitize_model)
                .ok_or(CompileError::MissingModel {
                    provider_id: provider.provider_id,
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(format!("/{}-{}", queue_id, models.join("-")))
}

/// Make a model name safe for a URL path segment.
pub fn sanitize_model(model: &str) -> String {
    model.replace(['.', ' '], "-")
}

/// Route for a queue with no providers: harmless upstream, default limits, no credentials.
pub fn placeholder_route(queue_id: &QueueId) -> RouteDefinition {
    RouteDefinition {
        uri: format!("/{queue_id}"),
        methods: Some(ROUTE_METHODS.iter().map(|m| m.to_string()).collect()),
        upstream: Upstream {
            balancer: BALANCER.to_string(),
            nodes: BTreeMap::from([(PLACEHOLDER_NODE.to_string(), 1)]),
            scheme: "http".to_string(),
            timeout: None,
            keepalive_pool: None,
        },
        plugins: Some(RoutePlugins {
            limit_req: LimitReq {
                rate: PLACEHOLDER_RATE,
                burst: PLACEHOLDER_BURST,
                key: RATE_LIMIT_KEY.to_string(),
                rejected_code: RATE_LIMIT_REJECTED_CODE,
                rejected_msg: RATE_LIMIT_REJECTED_MSG.to_string(),
            },
            proxy_rewrite: ProxyRewrite {
                uri: UPSTREAM_REWRITE_URI.to_string(),
                headers: BTreeMap::new(),
            },
            cors: cors_policy(),
        }),
    }
}

/// The most restrictive limit and window across all providers govern the route.
fn rate_limit(providers: &[Provider]) -> Result<LimitReq, CompileError> {
    if let Some(provider) = providers.iter().find(|p| p.time_window == 0) {
        return Err(CompileError::InvalidRateWindow {
            provider_id: provider.provider_id,
        });
    }

    let min_limit = providers.iter().map(|p| p.limit).min().unwrap_or_default();
    let min_window = providers.iter().map(|p| p.time_window).min().unwrap_or(1);
    let rate = (f64::from(min_limit) / f64::from(min_window)).max(MIN_RATE);

    Ok(LimitReq {
        rate,
        burst: min_limit,
        key: RATE_LIMIT_KEY.to_string(),
        rejected_code: RATE_LIMIT_REJECTED_CODE,
        rejected_msg: RATE_LIMIT_REJECTED_MSG.to_string(),
    })
}

/// Built-in endpoint for a provider type.
pub fn default_endpoint(provider_type: ProviderType) -> &'static str {
    match provider_type {
        ProviderType::OpenAi => OPENAI_ENDPOINT,
        ProviderType::Anthropic | ProviderType::Claude => "https://api.anthropic.com",
        ProviderType::Azure => "https://your-resource.openai.azure.com",
        ProviderType::DeepSeek => "https://api.deepseek.com",
        ProviderType::Other => OPENAI_ENDPOINT,
    }
}

fn upstream_for(provider: &Provider) -> Result<Upstream, CompileError> {
    let endpoint = provider
        .endpoint()
        .unwrap_or_else(|| default_endpoint(provider.provider_type));

    let invalid = |reason: String| CompileError::InvalidEndpoint {
        provider_id: provider.provider_id,
        endpoint: endpoint.to_string(),
        reason,
    };

    let url = Url::parse(endpoint).map_err(|e| invalid(e.to_string()))?;
    let host = url.host_str().ok_or_else(|| invalid("missing host".to_string()))?;
    let scheme = url.scheme();
    let port = url.port().unwrap_or(if scheme == "https" { 443 } else { 80 });

    Ok(Upstream {
        balancer: BALANCER.to_string(),
        nodes: BTreeMap::from([(format!("{host}:{port}"), 1)]),
        scheme: scheme.to_string(),
        timeout: Some(UPSTREAM_TIMEOUT),
        keepalive_pool: Some(KEEPALIVE_POOL),
    })
}

/// Credential header injected by the gateway for a provider.
pub fn auth_headers(provider: &Provider) -> BTreeMap<String, String> {
    let key = &provider.api_key;
    let (name, value) = match provider.provider_type {
        ProviderType::Anthropic | ProviderType::Claude => ("x-api-key", key.clone()),
        ProviderType::Azure => ("api-key", key.clone()),
        ProviderType::OpenAi | ProviderType::DeepSeek | ProviderType::Other => ("Authorization", format!("Bearer {key}")),
    };
    BTreeMap::from([(name.to_string(), value)])
}

fn cors_policy() -> Cors {
    Cors {
        allow_origins: "*".to_string(),
        allow_methods: "GET,POST,PUT,DELETE,OPTIONS".to_string(),
        allow_headers: "*".to_string(),
        expose_headers: "*".to_string(),
        max_age: 3600,
        allow_credential: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProviderId;
    use serde_json::{json, Map, Value};

    fn provider(provider_type: ProviderType, model: Option<&str>, limit: u32, time_window: u32) -> Provider {
        let mut config = Map::new();
        if let Some(model) = model {
            config.insert("model".to_string(), Value::String(model.to_string()));
        }
        Provider {
            provider_id: ProviderId::new(),
            queue_id: QueueId::new(),
            provider_name: format!("{provider_type}-provider"),
            provider_type,
            api_key: "sk-test".to_string(),
            limit,
            time_window,
            config,
        }
    }

    #[test]
    fn test_two_provider_route_end_to_end() {
        let queue_id = QueueId::new();
        let providers = vec![
            provider(ProviderType::OpenAi, Some("gpt-4"), 100, 60),
            provider(ProviderType::Anthropic, Some("claude-3"), 100, 60),
        ];

        let route = compile_route(&queue_id, &providers).unwrap();

        assert_eq!(route.uri, format!("/{}-gpt-4-claude-3", queue_id));
        assert_eq!(route.methods, Some(vec!["POST".to_string()]));
        assert_eq!(route.upstream.scheme, "https");
        assert_eq!(route.upstream.nodes, BTreeMap::from([("api.openai.com:443".to_string(), 1)]));
        assert_eq!(route.upstream.timeout, Some(UPSTREAM_TIMEOUT));
        assert_eq!(route.upstream.keepalive_pool, Some(KEEPALIVE_POOL));

        // Only the first provider's credential is injected
        let plugins = route.plugins.unwrap();
        assert_eq!(
            plugins.proxy_rewrite.headers,
            BTreeMap::from([("Authorization".to_string(), "Bearer sk-test".to_string())])
        );
        assert_eq!(plugins.proxy_rewrite.uri, "/v1/chat/completions");
    }

    #[test]
    fn test_path_keeps_input_order_and_sanitizes() {
        let queue_id = QueueId::new();
        let providers = vec![
            provider(ProviderType::DeepSeek, Some("deepseek chat v2.5"), 10, 60),
            provider(ProviderType::OpenAi, Some("gpt-3.5-turbo"), 10, 60),
            provider(ProviderType::Claude, Some("claude-3.5 sonnet"), 10, 60),
        ];

        let path = route_path(&queue_id, &providers).unwrap();
        assert_eq!(path, format!("/{}-deepseek-chat-v2-5-gpt-3-5-turbo-claude-3-5-sonnet", queue_id));
    }

    #[test]
    fn test_missing_model_fails_whole_route() {
        let queue_id = QueueId::new();
        let missing = provider(ProviderType::OpenAi, None, 10, 60);
        let missing_id = missing.provider_id;
        let providers = vec![provider(ProviderType::OpenAi, Some("gpt-4"), 10, 60), missing];

        let err = compile_route(&queue_id, &providers).unwrap_err();
        assert_eq!(err, CompileError::MissingModel { provider_id: missing_id });
        assert!(route_path(&queue_id, &providers).is_err());
    }

    #[test]
    fn test_rate_uses_min_limit_over_min_window() {
        let providers = vec![
            provider(ProviderType::OpenAi, Some("a"), 100, 3600),
            provider(ProviderType::OpenAi, Some("b"), 50, 60),
        ];

        let limit = rate_limit(&providers).unwrap();
        assert!((limit.rate - 50.0 / 60.0).abs() < 1e-9);
        assert_eq!(limit.burst, 50);
        assert_eq!(limit.rejected_code, 429);
        assert_eq!(limit.key, "remote_addr");
    }

    #[test]
    fn test_rate_is_floored() {
        let providers = vec![provider(ProviderType::OpenAi, Some("a"), 100, 3600)];

        let limit = rate_limit(&providers).unwrap();
        assert_eq!(limit.rate, 0.1);
        assert_eq!(limit.burst, 100);
    }

    #[test]
    fn test_zero_window_is_a_configuration_error() {
        let bad = provider(ProviderType::OpenAi, Some("a"), 100, 0);
        let bad_id = bad.provider_id;

        let err = compile_route(&QueueId::new(), &[bad]).unwrap_err();
        assert_eq!(err, CompileError::InvalidRateWindow { provider_id: bad_id });
    }

    #[test]
    fn test_auth_header_per_provider_type() {
        let cases = [
            (ProviderType::OpenAi, "Authorization", "Bearer sk-test"),
            (ProviderType::DeepSeek, "Authorization", "Bearer sk-test"),
            (ProviderType::Anthropic, "x-api-key", "sk-test"),
            (ProviderType::Claude, "x-api-key", "sk-test"),
            (ProviderType::Azure, "api-key", "sk-test"),
            (ProviderType::Other, "Authorization", "Bearer sk-test"),
        ];

        for (provider_type, name, value) in cases {
            let headers = auth_headers(&provider(provider_type, Some("m"), 1, 1));
            assert_eq!(headers.len(), 1, "{provider_type}");
            assert_eq!(headers.get(name).map(String::as_str), Some(value), "{provider_type}");
        }
    }

    #[test]
    fn test_default_endpoint_per_provider_type() {
        let anthropic = compile_route(&QueueId::new(), &[provider(ProviderType::Anthropic, Some("claude-3"), 1, 1)]).unwrap();
        assert!(anthropic.upstream.nodes.contains_key("api.anthropic.com:443"));

        let unknown = compile_route(&QueueId::new(), &[provider(ProviderType::Other, Some("x"), 1, 1)]).unwrap();
        assert!(unknown.upstream.nodes.contains_key("api.openai.com:443"));
    }

    #[test]
    fn test_custom_endpoint_overrides_default() {
        let mut custom = provider(ProviderType::OpenAi, Some("llama"), 10, 60);
        custom
            .config
            .insert("endpoint".to_string(), json!("http://inference.internal:8000/v1"));

        let route = compile_route(&QueueId::new(), &[custom]).unwrap();
        assert_eq!(route.upstream.scheme, "http");
        assert!(route.upstream.nodes.contains_key("inference.internal:8000"));

        let mut plain_http = provider(ProviderType::OpenAi, Some("llama"), 10, 60);
        plain_http.config.insert("endpoint".to_string(), json!("http://inference.internal"));
        let route = compile_route(&QueueId::new(), &[plain_http]).unwrap();
        assert!(route.upstream.nodes.contains_key("inference.internal:80"));
    }

    #[test]
    fn test_unparsable_endpoint_is_rejected() {
        let mut bad = provider(ProviderType::OpenAi, Some("gpt-4"), 10, 60);
        bad.config.insert("endpoint".to_string(), json!("not a url"));

        let err = compile_route(&QueueId::new(), &[bad]).unwrap_err();
        assert!(matches!(err, CompileError::InvalidEndpoint { .. }));
    }

    #[test]
    fn test_empty_provider_set_yields_placeholder() {
        let queue_id = QueueId::new();
        let route = compile_route(&queue_id, &[]).unwrap();

        assert_eq!(route, placeholder_route(&queue_id));
        assert_eq!(route.uri, format!("/{}", queue_id));
        assert_eq!(route.upstream.scheme, "http");
        assert!(route.upstream.nodes.contains_key("httpbin.org:80"));
        let plugins = route.plugins.unwrap();
        assert!(plugins.proxy_rewrite.headers.is_empty());
        assert_eq!(plugins.limit_req.burst, 20);
    }

    #[test]
    fn test_cors_is_fixed_and_permissive() {
        let route = compile_route(&QueueId::new(), &[provider(ProviderType::Azure, Some("gpt-4o"), 5, 1)]).unwrap();
        let cors = route.plugins.unwrap().cors;
        assert_eq!(cors.allow_origins, "*");
        assert_eq!(cors.allow_headers, "*");
        assert_eq!(cors.max_age, 3600);
        assert!(!cors.allow_credential);
    }

    #[test]
    fn test_compilation_is_deterministic() {
        let queue_id = QueueId::new();
        let providers = vec![
            provider(ProviderType::OpenAi, Some("gpt-4"), 100, 60),
            provider(ProviderType::Azure, Some("gpt-4o"), 20, 10),
        ];
        assert_eq!(
            compile_route(&queue_id, &providers).unwrap(),
            compile_route(&queue_id, &providers).unwrap()
        );
    }
}
