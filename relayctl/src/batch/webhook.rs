//! Completion callback for finished batches.
//!
//! One POST per completed batch, never retried. The outcome is recorded on the batch but does not
//! affect its completed state.

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use std::time::Duration;

use crate::config::WebhookSettings;
use crate::models::{BatchResults, MessageResult, WebhookStatus};
use crate::types::BatchId;

/// Body POSTed to the caller's callback URL.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookPayload {
    pub batch_id: BatchId,
    pub status: &'static str,
    pub request_count: u64,
    pub response_count: u64,
    pub results: Vec<MessageResult>,
}

impl From<&BatchResults> for WebhookPayload {
    fn from(aggregate: &BatchResults) -> Self {
        Self {
            batch_id: aggregate.batch_id,
            status: "completed",
            request_count: aggregate.request_count,
            response_count: aggregate.response_count,
            results: aggregate.results.clone(),
        }
    }
}

/// What happened to a delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookDelivery {
    pub status: WebhookStatus,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub called_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    pub fn from_settings(settings: &WebhookSettings) -> Self {
        Self::new(settings.timeout)
    }

    /// POST the payload once. Never fails: transport errors are reported as a failed delivery.
    #[tracing::instrument(skip(self, payload), fields(batch_id = %payload.batch_id))]
    pub async fn notify(&self, url: &str, payload: &WebhookPayload) -> WebhookDelivery {
        let called_at = Utc::now();
        let result = self.client.post(url).json(payload).timeout(self.timeout).send().await;

        let delivery = match result {
            Ok(response) if response.status().is_success() => WebhookDelivery {
                status: WebhookStatus::Success,
                status_code: Some(response.status().as_u16()),
                error: None,
                called_at,
            },
            Ok(response) => {
                let status_code = response.status().as_u16();
                WebhookDelivery {
                    status: WebhookStatus::Failed,
                    status_code: Some(status_code),
                    error: Some(format!("HTTP {status_code}")),
                    called_at,
                }
            }
            Err(e) => WebhookDelivery {
                status: WebhookStatus::Failed,
                status_code: None,
                error: Some(e.to_string()),
                called_at,
            },
        };

        match delivery.status {
            WebhookStatus::Success => {
                counter!("relayctl_webhook_deliveries_total", "outcome" => "success").increment(1);
                tracing::info!(status = ?delivery.status_code, "Batch webhook delivered");
            }
            WebhookStatus::Failed => {
                counter!("relayctl_webhook_deliveries_total", "outcome" => "failure").increment(1);
                tracing::warn!(status = ?delivery.status_code, error = ?delivery.error, "Batch webhook failed");
            }
        }
        delivery
    }
}
