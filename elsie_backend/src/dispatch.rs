//! Hand-off of positive decisions to response generation.
//!
//! The engine only decides; whoever turns a decision into spoken text sits
//! behind a [`ResponseSink`]. Delivery happens after the channel lock is
//! released and is never retried.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::EngineConfig;
use crate::roleplay::{ChannelRef, ContextualCues, IncomingMessage, MessageOutcome, ResponseDecision};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// What a response generator needs to act on one decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRequest {
    pub id: String,
    pub session_key: Option<String>,
    pub channel: ChannelRef,
    pub author_id: String,
    pub message_text: String,
    pub decision: ResponseDecision,
    pub cues: ContextualCues,
    pub roster: Vec<String>,
    pub requested_at: DateTime<Utc>,
}

impl ResponseRequest {
    /// `None` unless the decision says to respond.
    pub fn from_outcome(message: &IncomingMessage, outcome: &MessageOutcome) -> Option<Self> {
        if !outcome.decision.should_respond {
            return None;
        }
        Some(Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_key: outcome.session_key.clone(),
            channel: message.channel(),
            author_id: message.author_id.clone(),
            message_text: message.raw_text.clone(),
            decision: outcome.decision.clone(),
            cues: outcome.cues.clone(),
            roster: outcome.session.roster_names(),
            requested_at: Utc::now(),
        })
    }
}

#[async_trait]
pub trait ResponseSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, request: &ResponseRequest) -> Result<()>;
}

/// In-process fan-out; the HTTP server forwards these to WebSocket clients.
pub struct BroadcastSink {
    tx: broadcast::Sender<ResponseRequest>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResponseRequest> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl ResponseSink for BroadcastSink {
    fn name(&self) -> &str {
        "broadcast"
    }

    async fn deliver(&self, request: &ResponseRequest) -> Result<()> {
        // No subscribers is not a failure.
        let _ = self.tx.send(request.clone());
        Ok(())
    }
}

/// POSTs each request as JSON to the response-generation service.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: &str) -> Result<Self> {
        let allow_system_proxy = std::env::var("ELSIE_ENABLE_SYSTEM_PROXY")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let mut builder = reqwest::Client::builder().timeout(WEBHOOK_TIMEOUT);
        if !allow_system_proxy {
            builder = builder.no_proxy();
        }
        let client = builder
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self {
            client,
            url: url.trim().to_string(),
        })
    }
}

#[async_trait]
impl ResponseSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, request: &ResponseRequest) -> Result<()> {
        self.client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .with_context(|| format!("Failed to reach response webhook {}", self.url))?
            .error_for_status()
            .context("Response webhook rejected request")?;
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct Dispatcher {
    sinks: Vec<Arc<dyn ResponseSink>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResponseSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Broadcast sink plus the configured webhook, if any.
    pub fn from_config(config: &EngineConfig, broadcast: Arc<BroadcastSink>) -> Result<Self> {
        let mut dispatcher = Self::new().with_sink(broadcast);
        if let Some(url) = config
            .response_webhook_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
        {
            dispatcher = dispatcher.with_sink(Arc::new(WebhookSink::new(url)?));
            tracing::info!("Forwarding response requests to {}", url);
        }
        Ok(dispatcher)
    }

    pub fn sink_names(&self) -> Vec<String> {
        self.sinks.iter().map(|sink| sink.name().to_string()).collect()
    }

    /// Deliver to every sink. Returns how many accepted it.
    pub async fn dispatch(&self, request: &ResponseRequest) -> usize {
        let mut delivered = 0;
        for sink in &self.sinks {
            match sink.deliver(request).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(
                    "Sink '{}' failed to deliver request {}: {:#}",
                    sink.name(),
                    request.id,
                    e
                ),
            }
        }
        delivered
    }

    /// Fire-and-forget variant for callers that must not wait on delivery.
    pub fn spawn_dispatch(&self, request: ResponseRequest) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.dispatch(&request).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roleplay::RoleplayEngine;
    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};
    use tokio::sync::Mutex;

    struct FailingSink;

    #[async_trait]
    impl ResponseSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn deliver(&self, _request: &ResponseRequest) -> Result<()> {
            anyhow::bail!("downstream unavailable")
        }
    }

    async fn request_for(text: &str) -> Option<ResponseRequest> {
        let engine = RoleplayEngine::new(&EngineConfig::default(), None);
        let message = IncomingMessage::new("c1", "u1", text);
        let outcome = engine.process(&message).await;
        ResponseRequest::from_outcome(&message, &outcome)
    }

    #[tokio::test]
    async fn only_positive_decisions_become_requests() {
        assert!(request_for("just chatting").await.is_none());
        let request = request_for("Elsie, what do you recommend tonight?")
            .await
            .expect("request");
        assert_eq!(request.session_key.as_deref(), Some("c1"));
        assert!(request.decision.should_respond);
    }

    #[tokio::test]
    async fn failures_are_counted_not_retried() {
        let broadcast = Arc::new(BroadcastSink::new(8));
        let mut rx = broadcast.subscribe();
        let dispatcher = Dispatcher::new()
            .with_sink(Arc::new(FailingSink))
            .with_sink(broadcast.clone());
        let request = request_for("Hi Elsie!").await.expect("request");

        assert_eq!(dispatcher.dispatch(&request).await, 1);
        assert_eq!(rx.recv().await.expect("broadcast").id, request.id);
        assert!(rx.try_recv().is_err());
        assert_eq!(dispatcher.sink_names(), vec!["failing", "broadcast"]);
    }

    #[tokio::test]
    async fn webhook_posts_json() {
        let received: Arc<Mutex<Vec<ResponseRequest>>> = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route(
                "/respond",
                post(
                    |State(store): State<Arc<Mutex<Vec<ResponseRequest>>>>,
                     Json(body): Json<ResponseRequest>| async move {
                        store.lock().await.push(body);
                        "ok"
                    },
                ),
            )
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let sink = WebhookSink::new(&format!("http://{}/respond", addr)).expect("sink");
        let request = request_for("Hi Elsie!").await.expect("request");
        sink.deliver(&request).await.expect("deliver");

        let stored = received.lock().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, request.id);

        let missing = WebhookSink::new(&format!("http://{}/nope", addr)).expect("sink");
        assert!(missing.deliver(&request).await.is_err());
    }

    #[test]
    fn config_without_webhook_uses_broadcast_only() {
        let dispatcher =
            Dispatcher::from_config(&EngineConfig::default(), Arc::new(BroadcastSink::new(4)))
                .expect("dispatcher");
        assert_eq!(dispatcher.sink_names(), vec!["broadcast"]);
    }
}
