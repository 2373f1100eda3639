//! Sending messages through the gateway data plane.
//!
//! [`MessageProcessor`] is the worker side of the pipeline: it takes one queued message, makes sure
//! the queue's route exists, posts the chat request to the gateway, records the outcome and reports
//! the completion to the batch fan-in.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::batch::{AtomicCounter, CompletionTracker, FanInOutcome};
use crate::config::{DispatchSettings, GatewaySettings};
use crate::errors::Result;
use crate::gateway::compiler::route_path;
use crate::gateway::RouteReconciler;
use crate::models::Message;
use crate::store::{BatchStore, ProviderDirectory};
use crate::types::{DispatchQueue, MessageId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Body sent to a queue's route on the data plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

impl ChatRequest {
    /// The message's prompt as a user turn, preceded by its system prompt if it has one.
    pub fn for_message(model: impl Into<String>, message: &Message) -> Self {
        let mut messages = Vec::with_capacity(2);
        if let Some(system_prompt) = &message.system_prompt {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system_prompt.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: message.prompt.clone(),
        });
        Self {
            model: model.into(),
            messages,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No provider configured for queue")]
    NoProvider,

    #[error("Route provisioning failed: {0}")]
    Route(String),

    #[error("Gateway request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Gateway returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Gateway response had no message content")]
    MissingContent,
}

/// Client for the gateway's data plane.
#[derive(Clone)]
pub struct DataPlaneClient {
    client: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

impl DataPlaneClient {
    pub fn new(base_url: Url, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            timeout,
        }
    }

    /// Client for the configured data plane, with the dispatch timeout.
    pub fn from_settings(gateway: &GatewaySettings, dispatch: &DispatchSettings) -> Self {
        Self::new(gateway.data_plane_url.clone(), dispatch.timeout)
    }

    /// POST a chat request to `route_path` and return the first choice's content.
    #[tracing::instrument(skip(self, request), fields(model = %request.model))]
    pub async fn chat(&self, route_path: &str, request: &ChatRequest) -> std::result::Result<String, DispatchError> {
        let url = format!("{}{}", self.base_url.as_str().trim_end_matches('/'), route_path);
        let response = self
            .client
            .post(&url)
            .json(request)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Status { status, body });
        }

        let body: Value = response.json().await?;
        body.pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(DispatchError::MissingContent)
    }
}

/// Outcome of processing one message.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedMessage {
    pub message: Message,
    /// Present when the message belongs to a batch
    pub fan_in: Option<FanInOutcome>,
}

pub struct MessageProcessor<S, C> {
    store: Arc<S>,
    reconciler: Arc<RouteReconciler>,
    data_plane: DataPlaneClient,
    tracker: Arc<CompletionTracker<C, S>>,
}

impl<S, C> MessageProcessor<S, C>
where
    S: BatchStore + ProviderDirectory,
    C: AtomicCounter,
{
    pub fn new(
        store: Arc<S>,
        reconciler: Arc<RouteReconciler>,
        data_plane: DataPlaneClient,
        tracker: Arc<CompletionTracker<C, S>>,
    ) -> Self {
        Self {
            store,
            reconciler,
            data_plane,
            tracker,
        }
    }

    /// Process one message to a terminal status.
    ///
    /// Dispatch failures are recorded on the message and do not fail this call; a failed message
    /// still counts toward its batch. Only storage errors are returned.
    #[tracing::instrument(skip_all, fields(message_id = %message_id))]
    pub async fn process(&self, message_id: MessageId) -> Result<ProcessedMessage> {
        let mut message = self.store.get_message(message_id).await?;
        if message.status.is_terminal() {
            tracing::debug!(status = ?message.status, "Message already processed");
            return Ok(ProcessedMessage { message, fan_in: None });
        }

        message.start_processing();
        self.store.save_message(&message).await?;

        match self.dispatch(&mut message).await {
            Ok(content) => {
                tracing::info!(queue_id = %message.queue_id, "Message completed");
                message.complete(content);
            }
            Err(e) => {
                tracing::warn!(queue_id = %message.queue_id, error = %e, "Message failed");
                message.fail(e.to_string());
            }
        }
        self.store.save_message(&message).await?;

        let fan_in = match message.batch_id {
            Some(batch_id) => Some(self.tracker.on_message_finished(batch_id).await?),
            None => None,
        };

        Ok(ProcessedMessage { message, fan_in })
    }

    async fn dispatch(&self, message: &mut Message) -> std::result::Result<String, DispatchError> {
        let providers = self
            .store
            .providers_for_queue(message.queue_id)
            .await
            .map_err(|e| DispatchError::Route(e.to_string()))?;
        let primary = providers.first().ok_or(DispatchError::NoProvider)?;
        message.provider_id = Some(primary.provider_id);

        self.reconciler
            .ensure_route(&DispatchQueue::Provider(message.queue_id), &providers)
            .await
            .map_err(|e| DispatchError::Route(e.to_string()))?;

        // Compilation succeeded in ensure_route, so the path and model are both present
        let path = route_path(&message.queue_id, &providers).map_err(|e| DispatchError::Route(e.to_string()))?;
        let model = primary.model().unwrap_or_default();

        let request = ChatRequest::for_message(model, message);
        self.data_plane.chat(&path, &request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{AggregationOutcome, BatchAggregator, InMemoryCounter, WebhookNotifier};
    use crate::config::{Config, ReconcileSettings};
    use crate::gateway::backoff::NoopSleeper;
    use crate::gateway::{route_id, MockGatewayClient};
    use crate::models::{Batch, MessageStatus, Provider, ProviderType};
    use crate::store::InMemoryStore;
    use crate::types::{BatchId, ProviderId, QueueId};
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        store: InMemoryStore,
        gateway: MockGatewayClient,
        processor: MessageProcessor<InMemoryStore, InMemoryCounter>,
    }

    fn harness(data_plane_url: &str) -> Harness {
        let mut config = Config::default();
        config.gateway.data_plane_url = data_plane_url.parse().unwrap();
        config.webhook.timeout = Duration::from_secs(5);
        config.dispatch.timeout = Duration::from_secs(5);

        let store = InMemoryStore::new();
        let gateway = MockGatewayClient::new();
        let reconciler = RouteReconciler::new(Arc::new(gateway.clone()), &ReconcileSettings::default())
            .with_sleeper(Arc::new(NoopSleeper::new()));
        let shared = Arc::new(store.clone());
        let aggregator = Arc::new(BatchAggregator::new(shared.clone(), WebhookNotifier::from_settings(&config.webhook)));
        let tracker = Arc::new(CompletionTracker::new(InMemoryCounter::new(), shared.clone(), aggregator));
        let processor = MessageProcessor::new(
            shared,
            Arc::new(reconciler),
            DataPlaneClient::from_settings(&config.gateway, &config.dispatch),
            tracker,
        );
        Harness {
            store,
            gateway,
            processor,
        }
    }

    fn add_provider(store: &InMemoryStore, queue_id: QueueId, model: &str) {
        let mut config = serde_json::Map::new();
        config.insert("model".to_string(), json!(model));
        store.add_provider(Provider {
            provider_id: ProviderId::new(),
            queue_id,
            provider_name: model.to_string(),
            provider_type: ProviderType::OpenAi,
            api_key: "sk-test".to_string(),
            limit: 60,
            time_window: 60,
            config,
        });
    }

    fn completion(content: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "role": "assistant", "content": content } }]
        }))
    }

    #[test]
    fn test_system_prompt_is_prepended() {
        let message = Message::new(QueueId::new(), None, "What is 2+2?").with_system_prompt("Be terse.");
        let request = ChatRequest::for_message("gpt-4", &message);

        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "model": "gpt-4",
                "messages": [
                    { "role": "system", "content": "Be terse." },
                    { "role": "user", "content": "What is 2+2?" }
                ]
            })
        );

        let plain = ChatRequest::for_message("gpt-4", &Message::new(QueueId::new(), None, "hi"));
        assert_eq!(plain.messages.len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_data_plane_client_uses_configured_url_and_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/q-gpt-4"))
            .respond_with(completion("fast"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/q-gpt-4"))
            .respond_with(completion("slow").set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let mut config = Config::default();
        config.gateway.data_plane_url = server.uri().parse().unwrap();
        config.dispatch.timeout = Duration::from_millis(50);
        let client = DataPlaneClient::from_settings(&config.gateway, &config.dispatch);
        let request = ChatRequest::for_message("gpt-4", &Message::new(QueueId::new(), None, "hi"));

        assert_eq!(client.chat("/q-gpt-4", &request).await.unwrap(), "fast");
        match client.chat("/q-gpt-4", &request).await {
            Err(DispatchError::Http(e)) => assert!(e.is_timeout()),
            other => panic!("expected a timeout, got {other:?}"),
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_process_dispatches_through_route() {
        let server = MockServer::start().await;
        let h = harness(&server.uri());
        let queue_id = QueueId::new();
        add_provider(&h.store, queue_id, "gpt-4");
        add_provider(&h.store, queue_id, "gpt-3.5-turbo");

        Mock::given(method("POST"))
            .and(path(format!("/{queue_id}-gpt-4-gpt-3-5-turbo")))
            .and(body_json(json!({
                "model": "gpt-4",
                "messages": [{ "role": "user", "content": "hello" }]
            })))
            .respond_with(completion("hi there"))
            .expect(1)
            .mount(&server)
            .await;

        let message = Message::new(queue_id, None, "hello");
        h.store.save_message(&message).await.unwrap();

        let processed = h.processor.process(message.message_id).await.unwrap();

        assert_eq!(processed.message.status, MessageStatus::Completed);
        assert_eq!(processed.message.result.as_deref(), Some("hi there"));
        assert!(processed.message.provider_id.is_some());
        assert!(processed.fan_in.is_none());
        // Route provisioned before dispatch
        assert!(h.gateway.route(&route_id(&queue_id)).is_some());
        assert_eq!(h.store.get_message(message.message_id).await.unwrap(), processed.message);
    }

    #[test_log::test(tokio::test)]
    async fn test_upstream_error_fails_message() {
        let server = MockServer::start().await;
        let h = harness(&server.uri());
        let queue_id = QueueId::new();
        add_provider(&h.store, queue_id, "gpt-4");

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("Rate limit exceeded"))
            .mount(&server)
            .await;

        let message = Message::new(queue_id, None, "hello");
        h.store.save_message(&message).await.unwrap();

        let processed = h.processor.process(message.message_id).await.unwrap();
        assert_eq!(processed.message.status, MessageStatus::Failed);
        assert!(processed.message.error_message.unwrap().contains("429"));
    }

    #[test_log::test(tokio::test)]
    async fn test_queue_without_provider_fails_message() {
        let server = MockServer::start().await;
        let h = harness(&server.uri());
        let message = Message::new(QueueId::new(), None, "hello");
        h.store.save_message(&message).await.unwrap();

        let processed = h.processor.process(message.message_id).await.unwrap();
        assert_eq!(processed.message.status, MessageStatus::Failed);
        assert_eq!(h.gateway.call_count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_terminal_message_is_not_reprocessed() {
        let server = MockServer::start().await;
        let h = harness(&server.uri());
        let mut message = Message::new(QueueId::new(), None, "hello");
        message.complete("done".to_string());
        h.store.save_message(&message).await.unwrap();

        let processed = h.processor.process(message.message_id).await.unwrap();
        assert_eq!(processed.message, message);
        assert_eq!(h.gateway.call_count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_batch_completes_after_last_message() {
        let server = MockServer::start().await;
        let h = harness(&server.uri());
        let queue_id = QueueId::new();
        add_provider(&h.store, queue_id, "gpt-4");

        Mock::given(method("POST"))
            .and(path(format!("/{queue_id}-gpt-4")))
            .respond_with(completion("ok"))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/{queue_id}-gpt-4")))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let batch = Batch::new(BatchId::new(), 3, Some(format!("{}/hook", server.uri())));
        let batch_id = batch.batch_id;
        h.store.insert_batch(batch);
        let messages: Vec<_> = (0..3)
            .map(|i| Message::new(queue_id, Some(batch_id), format!("prompt {i}")))
            .collect();
        for message in &messages {
            h.store.save_message(message).await.unwrap();
        }

        let mut outcomes = Vec::new();
        for message in &messages {
            outcomes.push(h.processor.process(message.message_id).await.unwrap().fan_in.unwrap());
        }

        assert!(matches!(outcomes[0], FanInOutcome::Pending { observed: 1, expected: 3 }));
        assert!(matches!(outcomes[1], FanInOutcome::Pending { observed: 2, expected: 3 }));
        assert!(matches!(
            outcomes[2],
            FanInOutcome::Triggered(AggregationOutcome::Completed { .. })
        ));

        let batch = h.store.get_batch(batch_id).await.unwrap();
        assert!(batch.is_completed());
        // The failed third message counts toward completion but not toward responses
        assert_eq!(batch.response_count, 2);
    }
}
