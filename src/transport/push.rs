//! ntfy-style push relay transport
//!
//! Publishing is a `POST {host}/{topic}` carrying the clip as the body and
//! the client id in the `Title` header. Subscribing is a long-lived
//! server-sent events stream at `{host}/{topic}/sse`, reopened after the
//! server's retry delay whenever it drops.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::PushRelayConfig;
use crate::transport::sse::{SseEvent, SseParser, DEFAULT_RETRY};
use crate::transport::{ClipSink, ConnectionError, ConnectionState, Delivery, SendError, Transport};

/// JSON body of an ntfy stream event
#[derive(Debug, Clone, Deserialize)]
struct PushMessage {
    /// `open`, `keepalive` or `message`; absent on older relays
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    message: String,
    /// Unix seconds
    #[serde(default)]
    time: Option<i64>,
}

/// Push relay publish/subscribe endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRelayEndpoints {
    pub publish: Url,
    pub subscribe: Url,
}

impl PushRelayEndpoints {
    pub fn from_config(config: &PushRelayConfig) -> Result<Self, ConnectionError> {
        let base = format!("{}/{}", config.host.trim_end_matches('/'), config.topic.trim());
        let token = auth_token(config.user.as_deref(), config.pass.as_deref());

        let build = |raw: String| -> Result<Url, ConnectionError> {
            let mut url = Url::parse(&raw).map_err(|e| ConnectionError::InvalidUrl {
                url: raw.clone(),
                message: e.to_string(),
            })?;
            if let Some(token) = &token {
                url.set_query(Some(&format!("auth={}", token)));
            }
            Ok(url)
        };

        Ok(Self {
            publish: build(base.clone())?,
            subscribe: build(format!("{}/sse", base))?,
        })
    }
}

/// `base64("Basic " + base64("user:pass"))` without trailing padding
///
/// The outer encoding is what deployed peers put in the `auth` query
/// parameter; keep it byte-for-byte.
pub fn auth_token(user: Option<&str>, pass: Option<&str>) -> Option<String> {
    match (user, pass) {
        (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => {
            let header = format!("Basic {}", BASE64.encode(format!("{}:{}", user, pass)));
            Some(BASE64.encode(header).trim_end_matches('=').to_string())
        }
        _ => None,
    }
}

/// Transport over an ntfy-compatible relay
pub struct PushRelayTransport {
    client: Client,
    client_id: String,
    endpoints: PushRelayEndpoints,
    state: Arc<watch::Sender<ConnectionState>>,
    subscription: Option<JoinHandle<()>>,
}

impl PushRelayTransport {
    /// Start the subscription and return immediately
    #[instrument(skip(config, sink), fields(topic = %config.topic))]
    pub fn connect(config: &PushRelayConfig, sink: ClipSink) -> Result<Self, ConnectionError> {
        let endpoints = PushRelayEndpoints::from_config(config)?;
        let client = Client::builder().build()?;
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let state = Arc::new(state);

        info!("Subscribing to push relay {}", config.host);

        let subscription = tokio::spawn(run_subscription(
            client.clone(),
            endpoints.subscribe.clone(),
            sink,
            Arc::clone(&state),
        ));

        Ok(Self {
            client,
            client_id: config.client_id.clone(),
            endpoints,
            state,
            subscription: Some(subscription),
        })
    }

    pub fn endpoints(&self) -> &PushRelayEndpoints {
        &self.endpoints
    }
}

#[async_trait]
impl Transport for PushRelayTransport {
    fn kind(&self) -> &'static str {
        "push-relay"
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn send_clip(&self, payload: &str) -> Result<(), SendError> {
        if self.subscription.is_none() {
            return Err(SendError::Closed);
        }

        let response = self
            .client
            .post(self.endpoints.publish.clone())
            .header("Title", &self.client_id)
            .header("Priority", "min")
            .body(payload.to_owned())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!("Push relay rejected clip with status {}", status);
            return Err(SendError::Rejected {
                status: status.as_u16(),
            });
        }

        debug!("Published {} byte clip", payload.len());
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.abort();
            info!("Push relay subscription closed");
        }
        self.state.send_replace(ConnectionState::Closed);
    }
}

impl Drop for PushRelayTransport {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.abort();
        }
    }
}

/// Keep the event stream open until the task is aborted
async fn run_subscription(
    client: Client,
    url: Url,
    sink: ClipSink,
    state: Arc<watch::Sender<ConnectionState>>,
) {
    let mut retry = DEFAULT_RETRY;

    loop {
        state.send_replace(ConnectionState::Connecting);

        let response = client
            .get(url.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await;

        match response {
            Ok(response) if !response.status().is_success() => {
                warn!("{}", describe_rejection(response.status()));
            }
            Ok(response) => {
                state.send_replace(ConnectionState::Open);
                debug!("Event stream open");

                let mut parser = SseParser::new();
                let mut body = response.bytes_stream();
                while let Some(chunk) = body.next().await {
                    match chunk {
                        Ok(bytes) => {
                            for event in parser.feed(&bytes) {
                                if handle_event(&sink, &event) == Some(Delivery::Disconnected) {
                                    debug!("Clip receiver dropped, ending subscription");
                                    state.send_replace(ConnectionState::Closed);
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            warn!("Event stream error: {}", e);
                            break;
                        }
                    }
                }

                if let Some(server_retry) = parser.retry() {
                    retry = server_retry;
                }
                info!("Event stream ended, reopening in {:?}", retry);
            }
            Err(e) => {
                warn!("Failed to open event stream: {}", e);
            }
        }

        state.send_replace(ConnectionState::Error);
        tokio::time::sleep(retry).await;
    }
}

/// Log line for a subscribe request the relay refused
fn describe_rejection(status: StatusCode) -> String {
    let hint = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => " (check user and pass)",
        StatusCode::NOT_FOUND => " (check host and topic)",
        _ => "",
    };
    format!("Event stream rejected with HTTP status {}{}", status, hint)
}

/// Parse one stream event and hand it to the sink
fn handle_event(sink: &ClipSink, event: &SseEvent) -> Option<Delivery> {
    if !event.is_message() {
        debug!("Ignoring '{}' stream event", event.event);
        return None;
    }

    let message: PushMessage = match serde_json::from_str(&event.data) {
        Ok(message) => message,
        Err(e) => {
            warn!("Dropping unparseable push event: {}", e);
            return None;
        }
    };

    if let Some(kind) = message.event.as_deref() {
        if kind != "message" {
            debug!("Ignoring '{}' push event", kind);
            return None;
        }
    }

    // Out of range server times fall back to receipt time
    let timestamp = message.time.and_then(|secs| secs.checked_mul(1000));
    Some(sink.deliver(&message.title, message.message, timestamp))
}
