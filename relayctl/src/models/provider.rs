//! Provider records as seen by the route compiler.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::errors::Error;
use crate::types::{ProviderId, QueueId};

/// The upstream API family a provider speaks.
///
/// Determines the default endpoint and which header carries the credential. Unknown names
/// deserialize to [`ProviderType::Other`] and are treated like OpenAI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    #[default]
    OpenAi,
    Anthropic,
    Claude,
    Azure,
    DeepSeek,
    #[serde(other)]
    Other,
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Claude => "claude",
            Self::Azure => "azure",
            Self::DeepSeek => "deepseek",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// A snapshot of one provider attached to a queue.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub provider_id: ProviderId,
    pub queue_id: QueueId,
    #[serde(default)]
    pub provider_name: String,
    #[serde(default)]
    pub provider_type: ProviderType,
    pub api_key: String,
    /// Maximum requests per `time_window` seconds
    pub limit: u32,
    pub time_window: u32,
    /// Free-form settings. `model` is required to route, `endpoint` overrides the default upstream.
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl Provider {
    /// Model name from `config.model`, if present and non-empty.
    pub fn model(&self) -> Option<&str> {
        self.config_str("model")
    }

    /// Custom upstream endpoint from `config.endpoint`.
    pub fn endpoint(&self) -> Option<&str> {
        self.config_str("endpoint")
    }

    fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    /// Check the fields the CRUD layer must enforce before a provider is stored.
    pub fn validate(&self) -> Result<(), Error> {
        if self.api_key.is_empty() {
            return Err(Error::InvalidInput {
                message: format!("Provider {} is missing required field: api_key", self.provider_id),
            });
        }
        if self.limit == 0 {
            return Err(Error::InvalidInput {
                message: format!("Provider {} must have a positive limit", self.provider_id),
            });
        }
        if self.time_window == 0 {
            return Err(Error::InvalidInput {
                message: format!("Provider {} must have a positive time_window", self.provider_id),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("provider_id", &self.provider_id)
            .field("queue_id", &self.queue_id)
            .field("provider_name", &self.provider_name)
            .field("provider_type", &self.provider_type)
            .field("api_key", &"<redacted>")
            .field("limit", &self.limit)
            .field("time_window", &self.time_window)
            .field("config", &self.config)
            .finish()
    }
}
