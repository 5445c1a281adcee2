//! WebSocket social relay transport
//!
//! One session task owns the socket, the subscription and the reconnect
//! timer. The transport handle talks to it over channels: outbound frames on
//! an mpsc queue, shutdown on a watch flag.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, instrument, warn};

use crate::config::SocialRelayConfig;
use crate::transport::protocol::{
    new_subscription_id, open_envelope, seal_envelope, ClientMessage, Event, Filter, Keys,
    RelayMessage,
};
use crate::transport::reconnect::{
    ConnectionEvent, ReconnectAction, ReconnectionConfig, ReconnectionManager,
};
use crate::transport::{ClipSink, ConnectionError, ConnectionState, SendError, Transport};

type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `close()` waits for the session to say goodbye
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Transport over a nostr-style relay
pub struct SocialRelayTransport {
    client_id: String,
    keys: Arc<Keys>,
    outbound_tx: mpsc::UnboundedSender<String>,
    state: Arc<watch::Sender<ConnectionState>>,
    shutdown_tx: watch::Sender<bool>,
    session: Option<JoinHandle<()>>,
}

impl SocialRelayTransport {
    /// Spawn the session task and return immediately
    #[instrument(skip(config, sink, reconnection), fields(relay = %config.host))]
    pub fn connect(
        config: &SocialRelayConfig,
        sink: ClipSink,
        reconnection: ReconnectionConfig,
    ) -> Result<Self, ConnectionError> {
        let keys = Arc::new(Keys::parse(&config.private_key)?);
        let url = config.host.trim().to_string();
        reqwest::Url::parse(&url).map_err(|e| ConnectionError::InvalidUrl {
            url: url.clone(),
            message: e.to_string(),
        })?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let state = Arc::new(state);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!("Connecting to social relay as {}", keys.public_key_hex());

        let session = RelaySession {
            url,
            keys: Arc::clone(&keys),
            sink,
            manager: ReconnectionManager::new(reconnection),
            outbound_rx,
            state_tx: Arc::clone(&state),
            shutdown_rx,
        };

        Ok(Self {
            client_id: config.client_id.clone(),
            keys,
            outbound_tx,
            state,
            shutdown_tx,
            session: Some(tokio::spawn(session.run())),
        })
    }

    pub fn public_key(&self) -> String {
        self.keys.public_key_hex()
    }
}

#[async_trait]
impl Transport for SocialRelayTransport {
    fn kind(&self) -> &'static str {
        "social-relay"
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn send_clip(&self, payload: &str) -> Result<(), SendError> {
        if self.session.is_none() {
            return Err(SendError::Closed);
        }
        if self.state() != ConnectionState::Open {
            return Err(SendError::NotConnected);
        }

        let content = self.keys.nip04_encrypt(&seal_envelope(&self.client_id, payload));
        let event = Event::direct_message(&self.keys, content, chrono::Utc::now().timestamp());
        debug!("Publishing event {}", event.id);

        self.outbound_tx
            .send(ClientMessage::Event(event).to_json())
            .map_err(|_| SendError::Closed)
    }

    async fn close(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        self.shutdown_tx.send_replace(true);
        match tokio::time::timeout(CLOSE_GRACE, &mut session).await {
            Ok(_) => info!("Social relay session closed"),
            Err(_) => {
                warn!("Social relay session did not stop in time, aborting");
                session.abort();
            }
        }
        self.state.send_replace(ConnectionState::Closed);
    }
}

impl Drop for SocialRelayTransport {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// Why a live session ended
enum SessionEnd {
    Event(ConnectionEvent),
    Shutdown,
}

/// State owned by the session task
struct RelaySession {
    url: String,
    keys: Arc<Keys>,
    sink: ClipSink,
    manager: ReconnectionManager,
    outbound_rx: mpsc::UnboundedReceiver<String>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RelaySession {
    async fn run(mut self) {
        while !*self.shutdown_rx.borrow() && self.manager.begin_attempt() {
            self.publish_state();

            let connected = tokio::select! {
                result = connect_async(self.url.as_str()) => result,
                _ = self.shutdown_rx.changed() => break,
            };

            let event = match connected {
                Ok((stream, _response)) => {
                    info!("Connected to relay {}", self.url);
                    let action = self.manager.on_event(ConnectionEvent::Opened);
                    if action != ReconnectAction::Subscribe {
                        break;
                    }
                    self.publish_state();

                    let end = self.run_session(stream).await;
                    self.discard_unsent();
                    match end {
                        SessionEnd::Event(event) => event,
                        SessionEnd::Shutdown => break,
                    }
                }
                Err(e) => {
                    warn!("Failed to connect to relay {}: {}", self.url, e);
                    ConnectionEvent::Error
                }
            };

            let action = self.manager.on_event(event);
            self.publish_state();
            match action {
                ReconnectAction::Reconnect { after } => {
                    tokio::select! {
                        _ = tokio::time::sleep(after) => {}
                        _ = self.shutdown_rx.changed() => break,
                    }
                }
                ReconnectAction::Stop => break,
                ReconnectAction::Subscribe | ReconnectAction::Ignore => {}
            }
        }

        self.manager.on_event(ConnectionEvent::CloseRequested);
        self.publish_state();
        debug!("Relay session task ended after {} attempts", self.manager.attempt_count());
    }

    /// Drive one open socket until it ends
    async fn run_session(&mut self, stream: RelayStream) -> SessionEnd {
        let (mut ws_sink, mut ws_stream) = stream.split();

        let subscription_id = new_subscription_id();
        let request = ClientMessage::Req {
            subscription_id: subscription_id.clone(),
            filter: Filter::direct_messages_from(self.keys.public_key_hex()),
        };
        if let Err(e) = ws_sink.send(WsMessage::Text(request.to_json().into())).await {
            error!("Failed to send subscription request: {}", e);
            return SessionEnd::Event(ConnectionEvent::Error);
        }
        debug!("Subscribed as {}", subscription_id);

        loop {
            tokio::select! {
                // Flush queued publishes before honouring a shutdown
                biased;

                outbound = self.outbound_rx.recv() => match outbound {
                    Some(frame) => {
                        if let Err(e) = ws_sink.send(WsMessage::Text(frame.into())).await {
                            error!("Failed to publish event: {}", e);
                            return SessionEnd::Event(ConnectionEvent::Error);
                        }
                    }
                    None => return SessionEnd::Shutdown,
                },

                frame = ws_stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        self.handle_frame(text.as_str(), &subscription_id);
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!("Relay closed the connection");
                        return SessionEnd::Event(ConnectionEvent::RemoteClosed);
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        warn!("Ignoring unexpected binary frame of {} bytes", data.len());
                    }
                    Some(Ok(_)) => {
                        // Ping/pong are answered by tungstenite
                    }
                    Some(Err(e)) => {
                        warn!("Relay socket error: {}", e);
                        return SessionEnd::Event(ConnectionEvent::Error);
                    }
                },

                _ = self.shutdown_rx.changed() => {
                    let _ = ws_sink.send(WsMessage::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
            }
        }
    }

    fn handle_frame(&self, text: &str, subscription_id: &str) {
        let Some((origin, contents, timestamp)) = decode_clip(&self.keys, text, subscription_id)
        else {
            return;
        };
        self.sink.deliver(&origin, contents, timestamp);
    }

    /// Publishes are never replayed across sessions
    fn discard_unsent(&mut self) {
        let mut dropped = 0;
        while self.outbound_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!("Dropped {} unsent clips after the session ended", dropped);
        }
    }

    fn publish_state(&self) {
        self.state_tx.send_replace(self.manager.state());
    }
}

/// Turn a relay frame into `(origin, contents, timestamp_ms)`
///
/// Returns `None` for control frames, other subscriptions, events that fail
/// verification, undecryptable content and envelopes without a delimiter or
/// body. The timestamp is `None` when `created_at` does not fit in
/// milliseconds.
pub(crate) fn decode_clip(
    keys: &Keys,
    text: &str,
    subscription_id: &str,
) -> Option<(String, String, Option<i64>)> {
    let message = match RelayMessage::from_json(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Dropping malformed relay frame: {}", e);
            return None;
        }
    };

    let event = match message {
        RelayMessage::Event {
            subscription_id: sub,
            event,
        } if sub == subscription_id => event,
        RelayMessage::Event { subscription_id: sub, .. } => {
            debug!("Ignoring event for foreign subscription {}", sub);
            return None;
        }
        RelayMessage::Notice(notice) => {
            info!("Relay notice: {}", notice);
            return None;
        }
        RelayMessage::Ok { accepted: false, message, .. } => {
            warn!("Relay rejected event: {}", message);
            return None;
        }
        other => {
            debug!("Ignoring relay frame {:?}", other);
            return None;
        }
    };

    if let Err(e) = event.verify() {
        warn!("Dropping event {}: {}", event.id, e);
        return None;
    }

    let decrypted = match keys.nip04_decrypt(&event.content) {
        Ok(decrypted) => decrypted,
        Err(e) => {
            debug!("Dropping event {}: {}", event.id, e);
            return None;
        }
    };

    let Some((origin, contents)) = open_envelope(&decrypted) else {
        debug!("Dropping event {} without clip envelope", event.id);
        return None;
    };

    let timestamp = event.created_at.checked_mul(1000);
    if timestamp.is_none() {
        debug!("Event {} has out of range created_at {}", event.id, event.created_at);
    }
    Some((origin.to_string(), contents.to_string(), timestamp))
}
