use anyhow::{Context, Result};
use elsie_backend::config::EngineConfig;
use elsie_backend::journal::DecisionRecord;
use elsie_backend::roleplay::{IncomingMessage, MessageOutcome, Session};
use elsie_backend::server::{ApiEventEnvelope, SessionsResponse, SweepResponse};
use flume::Sender;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header as ws_header;
use tokio_tungstenite::tungstenite::http::HeaderValue as WsHeaderValue;
use tokio_tungstenite::tungstenite::Message;

const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8790";

/// Live backend events, flattened for terminal display.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Decision {
        session_key: String,
        response_type: String,
        should_respond: bool,
        reasoning: String,
    },
    SessionChanged {
        session_key: String,
        from: String,
        to: String,
        reason: String,
        participants: Vec<String>,
    },
    ResponseRequested {
        session_key: String,
        response_type: String,
        approach: String,
    },
    Other(String),
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    ws_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn from_env() -> Self {
        let base = std::env::var("ELSIE_BACKEND_URL")
            .unwrap_or_else(|_| DEFAULT_BACKEND_URL.to_string());
        let token = std::env::var("ELSIE_BACKEND_TOKEN")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        Self::new(base, token)
    }

    pub fn new(base_url: String, token: Option<String>) -> Self {
        let normalized_base = normalize_base_url(&base_url);
        let ws_url = normalize_ws_url(&normalized_base);

        Self {
            http: reqwest::Client::new(),
            base_url: normalized_base,
            ws_url,
            token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get_config(&self) -> Result<EngineConfig> {
        self.request(reqwest::Method::GET, "/v1/config")
            .send()
            .await?
            .error_for_status()
            .context("GET /v1/config failed")?
            .json::<EngineConfig>()
            .await
            .context("Failed to decode config response")
    }

    pub async fn send_message(&self, message: &IncomingMessage) -> Result<MessageOutcome> {
        let response = self
            .request(reqwest::Method::POST, "/v1/messages")
            .json(message)
            .send()
            .await?
            .error_for_status()
            .context("POST /v1/messages failed")?;

        let body = response
            .text()
            .await
            .context("Failed to read message outcome payload")?;
        serde_json::from_str::<MessageOutcome>(&body).context(format!(
            "Failed to decode message outcome. Payload preview: {}",
            body.chars().take(500).collect::<String>()
        ))
    }

    pub async fn list_sessions(&self) -> Result<SessionsResponse> {
        self.request(reqwest::Method::GET, "/v1/sessions")
            .send()
            .await?
            .error_for_status()
            .context("GET /v1/sessions failed")?
            .json::<SessionsResponse>()
            .await
            .context("Failed to decode session list")
    }

    pub async fn get_session(&self, key: &str) -> Result<Session> {
        self.request(reqwest::Method::GET, &format!("/v1/sessions/{}", key))
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("GET /v1/sessions/{} failed", key))?
            .json::<Session>()
            .await
            .context("Failed to decode session")
    }

    pub async fn sweep(&self) -> Result<usize> {
        let response = self
            .request(reqwest::Method::POST, "/v1/sessions/sweep")
            .send()
            .await?
            .error_for_status()
            .context("POST /v1/sessions/sweep failed")?
            .json::<SweepResponse>()
            .await
            .context("Failed to decode sweep response")?;
        Ok(response.closed)
    }

    pub async fn list_decisions(
        &self,
        channel: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DecisionRecord>> {
        let mut builder = self
            .request(reqwest::Method::GET, "/v1/decisions")
            .query(&[("limit", limit.to_string())]);
        if let Some(channel) = channel {
            builder = builder.query(&[("channel", channel)]);
        }
        builder
            .send()
            .await?
            .error_for_status()
            .context("GET /v1/decisions failed")?
            .json::<Vec<DecisionRecord>>()
            .await
            .context("Failed to decode decision list")
    }

    pub async fn stream_events_forever(self, tx: Sender<WatchEvent>) {
        loop {
            match self.stream_events_once(&tx).await {
                Ok(()) => {
                    tracing::info!("Event stream disconnected; reconnecting in 2s");
                }
                Err(error) => {
                    tracing::warn!("Event stream failed: {}; reconnecting in 2s", error);
                }
            }
            if tx.is_disconnected() {
                return;
            }
            sleep(Duration::from_secs(2)).await;
        }
    }

    async fn stream_events_once(&self, tx: &Sender<WatchEvent>) -> Result<()> {
        let ws_endpoint = format!("{}/v1/ws/events", self.ws_url);
        let mut request = ws_endpoint
            .into_client_request()
            .context("Invalid websocket endpoint URL")?;

        if let Some(token) = self.token.as_deref() {
            let value = WsHeaderValue::from_str(&format!("Bearer {}", token))
                .context("Invalid bearer token for websocket auth")?;
            request
                .headers_mut()
                .insert(ws_header::AUTHORIZATION, value);
        }

        let (stream, _) = connect_async(request)
            .await
            .context("Failed to connect websocket event stream")?;
        let (_write, mut read) = stream.split();

        while let Some(message) = read.next().await {
            let text = match message.context("Websocket read error")? {
                Message::Text(text) => text.to_string(),
                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(_) => continue,
                },
                Message::Close(_) => return Ok(()),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };
            let event = parse_event_envelope(&text)?;
            if tx.send(event).is_err() {
                return Ok(());
            }
        }

        Ok(())
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.http.request(method, url);
        if let Some(token) = self.token.as_deref() {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

fn parse_event_envelope(text: &str) -> Result<WatchEvent> {
    let envelope: ApiEventEnvelope =
        serde_json::from_str(text).context("Failed to decode API event envelope")?;
    Ok(map_event(envelope))
}

fn str_field(payload: &Value, pointer: &str) -> String {
    payload
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn map_event(envelope: ApiEventEnvelope) -> WatchEvent {
    let payload = &envelope.payload;
    match envelope.event_type.as_str() {
        "decision_made" => WatchEvent::Decision {
            session_key: str_field(payload, "/session_key"),
            response_type: str_field(payload, "/decision/response_type"),
            should_respond: payload
                .pointer("/decision/should_respond")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            reasoning: str_field(payload, "/decision/reasoning"),
        },
        "session_changed" => WatchEvent::SessionChanged {
            session_key: str_field(payload, "/session_key"),
            from: str_field(payload, "/from"),
            to: str_field(payload, "/to"),
            reason: str_field(payload, "/reason"),
            participants: payload
                .get("participants")
                .and_then(Value::as_array)
                .map(|names| {
                    names
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        },
        "response_requested" => WatchEvent::ResponseRequested {
            session_key: str_field(payload, "/session_key"),
            response_type: str_field(payload, "/decision/response_type"),
            approach: str_field(payload, "/decision/approach"),
        },
        other => WatchEvent::Other(other.to_string()),
    }
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        DEFAULT_BACKEND_URL.to_string()
    } else {
        trimmed.to_string()
    }
}

fn normalize_ws_url(base_http_url: &str) -> String {
    if let Some(rest) = base_http_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_http_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", base_http_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn normalizes_base_url() {
        assert_eq!(normalize_base_url("http://x:1/"), "http://x:1");
        assert_eq!(normalize_base_url(""), DEFAULT_BACKEND_URL);
    }

    #[test]
    fn maps_http_to_ws_url() {
        assert_eq!(
            normalize_ws_url("http://127.0.0.1:8790"),
            "ws://127.0.0.1:8790"
        );
        assert_eq!(normalize_ws_url("https://example.com"), "wss://example.com");
    }

    #[test]
    fn parses_decision_event() {
        let text = serde_json::json!({
            "event_type": "decision_made",
            "emitted_at": Utc::now(),
            "payload": {
                "session_key": "c1",
                "channel": {"id": "c1", "name": null},
                "decision": {
                    "should_respond": true,
                    "response_type": "active_dialogue",
                    "reasoning": "[direct_address] addressed by name"
                }
            }
        })
        .to_string();

        match parse_event_envelope(&text).expect("parsed") {
            WatchEvent::Decision {
                session_key,
                response_type,
                should_respond,
                ..
            } => {
                assert_eq!(session_key, "c1");
                assert_eq!(response_type, "active_dialogue");
                assert!(should_respond);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn parses_session_change_participants() {
        let envelope = ApiEventEnvelope {
            event_type: "session_changed".to_string(),
            emitted_at: Utc::now(),
            payload: serde_json::json!({
                "session_key": "c1",
                "from": "inactive",
                "to": "monitoring",
                "reason": "director_start",
                "participants": ["John"]
            }),
        };
        assert_eq!(
            map_event(envelope),
            WatchEvent::SessionChanged {
                session_key: "c1".to_string(),
                from: "inactive".to_string(),
                to: "monitoring".to_string(),
                reason: "director_start".to_string(),
                participants: vec!["John".to_string()],
            }
        );
    }

    #[test]
    fn unknown_events_are_passed_through_by_name() {
        let envelope = ApiEventEnvelope {
            event_type: "something_new".to_string(),
            emitted_at: Utc::now(),
            payload: Value::Null,
        };
        assert_eq!(map_event(envelope), WatchEvent::Other("something_new".to_string()));
    }

    #[test]
    fn api_client_trims_trailing_slash() {
        let client = ApiClient::new("http://127.0.0.1:8790/".to_string(), None);
        assert_eq!(client.base_url(), "http://127.0.0.1:8790");
    }
}
