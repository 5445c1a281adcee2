//! Clip bus: ties the active transport, content encryption and history
//! together.
//!
//! Transports forward inbound clips over one unbounded channel; the bus
//! applies them one at a time in [`ClipBus::process_next`], so history has a
//! single writer and subscribers see clips in arrival order.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, instrument, warn};

use crate::config::BackendConfig;
use crate::encryption::ContentCipher;
use crate::history::{Clip, ClipHistory};
use crate::transport::{
    BackendConnector, ClipSink, ConnectionState, Connector, InboundClip, SendError, Transport,
};

/// Buffered clips per subscriber before lagging ones start missing clips
const SUBSCRIBER_CAPACITY: usize = 100;

pub struct ClipBus {
    connector: Box<dyn Connector>,
    transport: Option<Box<dyn Transport>>,
    cipher: Option<ContentCipher>,
    backend: BackendConfig,
    history: ClipHistory,
    generation: u64,
    inbound_tx: mpsc::UnboundedSender<InboundClip>,
    inbound_rx: mpsc::UnboundedReceiver<InboundClip>,
    clip_tx: broadcast::Sender<Clip>,
}

impl ClipBus {
    /// Bus using the built-in relay transports
    pub fn new() -> Self {
        Self::with_connector(BackendConnector::default())
    }

    pub fn with_connector(connector: impl Connector + 'static) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (clip_tx, _) = broadcast::channel(SUBSCRIBER_CAPACITY);

        Self {
            connector: Box::new(connector),
            transport: None,
            cipher: None,
            backend: BackendConfig::None,
            history: ClipHistory::new(),
            generation: 0,
            inbound_tx,
            inbound_rx,
            clip_tx,
        }
    }

    /// Replace the active backend.
    ///
    /// The previous transport is closed first. The content key, if any, is
    /// derived before the new transport exists, so no clip is ever sent or
    /// accepted without it. On failure the bus is left with no backend.
    #[instrument(skip(self, config), fields(backend = %config.describe()))]
    pub async fn set_config(&mut self, config: BackendConfig) -> crate::Result<()> {
        config.validate()?;

        if let Some(mut previous) = self.transport.take() {
            debug!("Closing {} transport", previous.kind());
            previous.close().await;
        }
        self.generation += 1;
        self.backend = BackendConfig::None;
        self.cipher = None;

        let Some(client_id) = config.client_id() else {
            info!("No backend configured");
            return Ok(());
        };

        let cipher = match config.encryption().and_then(|e| e.passphrase().map(|p| (p, e.mode))) {
            Some((passphrase, mode)) => Some(ContentCipher::derive(passphrase, mode).await?),
            None => None,
        };

        let sink = ClipSink::new(client_id, self.generation, self.inbound_tx.clone());
        let transport = self.connector.connect(&config, sink).await?;
        info!(
            "Using {} backend as '{}'{}",
            transport.kind(),
            client_id,
            if cipher.is_some() { " with content encryption" } else { "" }
        );

        self.transport = Some(transport);
        self.cipher = cipher;
        self.backend = config;
        Ok(())
    }

    /// Publish one clip. Without a backend this does nothing.
    pub async fn send(&self, plaintext: &str) -> Result<(), SendError> {
        let Some(transport) = &self.transport else {
            debug!("No backend configured, dropping outbound clip");
            return Ok(());
        };

        let payload = match &self.cipher {
            Some(cipher) => {
                let ciphertext = cipher.encrypt(plaintext);
                if ciphertext.is_empty() {
                    return Err(SendError::Encryption);
                }
                ciphertext
            }
            None => plaintext.to_owned(),
        };

        transport.send_clip(&payload).await
    }

    /// Wait for the next inbound clip and apply it
    pub async fn process_next(&mut self) -> Option<Clip> {
        let inbound = self.inbound_rx.recv().await?;
        self.accept(inbound)
    }

    /// Apply every inbound clip that is already queued
    pub fn drain(&mut self) -> Vec<Clip> {
        let mut accepted = Vec::new();
        while let Ok(inbound) = self.inbound_rx.try_recv() {
            accepted.extend(self.accept(inbound));
        }
        accepted
    }

    /// Decrypt, record and announce one inbound clip
    pub fn accept(&mut self, inbound: InboundClip) -> Option<Clip> {
        if inbound.generation != self.generation {
            debug!(
                "Dropping clip from retired transport generation {}",
                inbound.generation
            );
            return None;
        }

        let contents = match &self.cipher {
            Some(cipher) => cipher.decrypt(&inbound.contents),
            None => inbound.contents,
        };
        if contents.is_empty() {
            warn!("Clip from '{}' has no usable content", inbound.client);
            return None;
        }

        let clip = Clip::new(inbound.client, contents, inbound.timestamp);
        info!("Received clip from '{}'", clip.client);
        self.history.insert(clip.clone());
        // No subscribers is fine
        let _ = self.clip_tx.send(clip.clone());
        Some(clip)
    }

    /// Receive every clip accepted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Clip> {
        self.clip_tx.subscribe()
    }

    /// Newest-first snapshot of received clips
    pub fn history(&self) -> Vec<Clip> {
        self.history.to_vec()
    }

    pub fn latest(&self) -> Option<&Clip> {
        self.history.latest()
    }

    pub fn backend(&self) -> &BackendConfig {
        &self.backend
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// `None` when no backend is configured
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.transport.as_ref().map(|transport| transport.state())
    }

    /// Wait until the transport reports `Open`; false on timeout or no backend
    pub async fn wait_until_open(&self, timeout: Duration) -> bool {
        let Some(transport) = &self.transport else {
            return false;
        };

        let mut state = transport.watch_state();
        // Bound first so the watch guard is released before `state`
        let opened = matches!(
            tokio::time::timeout(timeout, state.wait_for(|s| *s == ConnectionState::Open)).await,
            Ok(Ok(_))
        );
        opened
    }

    /// Close the active transport; the bus keeps its history
    pub async fn shutdown(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
            info!("{} transport closed", transport.kind());
        }
        self.generation += 1;
    }
}

impl Default for ClipBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EncryptionConfig, PushRelayConfig};
    use crate::encryption::CipherMode;
    use crate::history::HISTORY_CAPACITY;
    use crate::transport::ConnectionError;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};
    use tokio::sync::watch;

    #[derive(Default)]
    struct Recorded {
        sinks: Vec<ClipSink>,
        published: Vec<String>,
        closed: usize,
        refuse: bool,
    }

    #[derive(Clone, Default)]
    struct FakeConnector {
        recorded: Arc<Mutex<Recorded>>,
    }

    impl FakeConnector {
        fn sink(&self, index: usize) -> ClipSink {
            self.recorded.lock().unwrap().sinks[index].clone()
        }

        fn published(&self) -> Vec<String> {
            self.recorded.lock().unwrap().published.clone()
        }

        fn closed(&self) -> usize {
            self.recorded.lock().unwrap().closed
        }
    }

    struct FakeTransport {
        recorded: Arc<Mutex<Recorded>>,
        state: watch::Sender<ConnectionState>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn kind(&self) -> &'static str {
            "fake"
        }

        fn state(&self) -> ConnectionState {
            *self.state.borrow()
        }

        fn watch_state(&self) -> watch::Receiver<ConnectionState> {
            self.state.subscribe()
        }

        async fn send_clip(&self, payload: &str) -> Result<(), SendError> {
            self.recorded.lock().unwrap().published.push(payload.to_string());
            Ok(())
        }

        async fn close(&mut self) {
            self.recorded.lock().unwrap().closed += 1;
            self.state.send_replace(ConnectionState::Closed);
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(
            &self,
            _config: &BackendConfig,
            sink: ClipSink,
        ) -> Result<Box<dyn Transport>, ConnectionError> {
            let mut recorded = self.recorded.lock().unwrap();
            if recorded.refuse {
                return Err(ConnectionError::InvalidUrl {
                    url: "https://ntfy.example.com".to_string(),
                    message: "refused".to_string(),
                });
            }
            recorded.sinks.push(sink);
            drop(recorded);
            let (state, _) = watch::channel(ConnectionState::Open);
            Ok(Box::new(FakeTransport {
                recorded: Arc::clone(&self.recorded),
                state,
            }))
        }
    }

    fn push_config(key: Option<&str>) -> BackendConfig {
        BackendConfig::PushRelay(PushRelayConfig {
            client_id: "dev1".to_string(),
            host: "https://ntfy.example.com".to_string(),
            topic: "t1".to_string(),
            user: None,
            pass: None,
            encryption: EncryptionConfig {
                key: key.map(str::to_string),
                mode: CipherMode::FixedIv,
            },
        })
    }

    async fn bus_with(config: BackendConfig) -> (ClipBus, FakeConnector) {
        let connector = FakeConnector::default();
        let mut bus = ClipBus::with_connector(connector.clone());
        bus.set_config(config).await.unwrap();
        (bus, connector)
    }

    #[tokio::test]
    async fn test_send_without_backend_is_noop() {
        let connector = FakeConnector::default();
        let bus = ClipBus::with_connector(connector.clone());

        bus.send("ping").await.unwrap();
        assert!(connector.published().is_empty());
        assert_eq!(bus.connection_state(), None);
        assert!(!bus.wait_until_open(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_send_plaintext() {
        let (bus, connector) = bus_with(push_config(None)).await;

        bus.send("ping").await.unwrap();
        assert_eq!(connector.published(), vec!["ping"]);
        assert!(!bus.is_encrypted());
        assert!(bus.wait_until_open(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_send_encrypts_with_configured_key() {
        let (bus, connector) = bus_with(push_config(Some("secret"))).await;

        bus.send("hello").await.unwrap();
        assert_eq!(connector.published(), vec!["OyecWm0cLtnxitZ70wi9bw=="]);
    }

    #[tokio::test]
    async fn test_empty_key_means_no_encryption() {
        let (bus, connector) = bus_with(push_config(Some(""))).await;

        bus.send("hello").await.unwrap();
        assert_eq!(connector.published(), vec!["hello"]);
    }

    #[tokio::test]
    async fn test_inbound_clip_is_decrypted_and_recorded() {
        let (mut bus, connector) = bus_with(push_config(Some("secret"))).await;
        let mut clips = bus.subscribe();

        connector
            .sink(0)
            .deliver("dev2", "D0zfha3sshUSKYq/AHtUEQ==".to_string(), Some(5));

        let clip = bus.process_next().await.unwrap();
        assert_eq!(clip, Clip::new("dev2", "ping", 5));
        assert_eq!(bus.history(), vec![clip.clone()]);
        assert_eq!(clips.recv().await.unwrap(), clip);
    }

    #[tokio::test]
    async fn test_undecryptable_clip_is_not_recorded() {
        let (mut bus, connector) = bus_with(push_config(Some("secret"))).await;

        connector.sink(0).deliver("dev2", "plain text".to_string(), None);
        assert_eq!(bus.process_next().await, None);
        assert!(bus.history().is_empty());
    }

    #[tokio::test]
    async fn test_self_echo_never_reaches_history() {
        let (mut bus, connector) = bus_with(push_config(None)).await;

        connector.sink(0).deliver("dev1", "echo".to_string(), None);
        connector.sink(0).deliver("dev2", "pong".to_string(), None);

        let accepted = bus.drain();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].client, "dev2");
    }

    #[tokio::test]
    async fn test_set_config_closes_previous_and_drops_stale_clips() {
        let (mut bus, connector) = bus_with(push_config(None)).await;
        let stale = connector.sink(0);

        bus.set_config(push_config(None)).await.unwrap();
        assert_eq!(connector.closed(), 1);

        stale.deliver("dev2", "old".to_string(), None);
        connector.sink(1).deliver("dev2", "new".to_string(), None);

        let accepted = bus.drain();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].contents, "new");
    }

    #[tokio::test]
    async fn test_set_config_none_clears_transport() {
        let (mut bus, connector) = bus_with(push_config(Some("secret"))).await;

        bus.set_config(BackendConfig::None).await.unwrap();
        assert_eq!(connector.closed(), 1);
        assert_eq!(bus.connection_state(), None);
        assert!(!bus.is_encrypted());
        assert!(bus.backend().is_none());

        bus.send("ping").await.unwrap();
        assert!(connector.published().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_connecting() {
        let connector = FakeConnector::default();
        let mut bus = ClipBus::with_connector(connector.clone());

        let mut config = push_config(None);
        if let BackendConfig::PushRelay(cfg) = &mut config {
            cfg.topic = String::new();
        }

        assert!(matches!(
            bus.set_config(config).await,
            Err(crate::Error::Config(_))
        ));
        assert!(connector.recorded.lock().unwrap().sinks.is_empty());
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_no_backend() {
        let (mut bus, connector) = bus_with(push_config(Some("secret"))).await;
        connector.recorded.lock().unwrap().refuse = true;

        assert!(matches!(
            bus.set_config(push_config(Some("secret"))).await,
            Err(crate::Error::Connection(_))
        ));
        assert_eq!(connector.closed(), 1);
        assert!(bus.backend().is_none());
        assert!(!bus.is_encrypted());
        assert_eq!(bus.connection_state(), None);

        bus.send("ping").await.unwrap();
        assert!(connector.published().is_empty());
    }

    #[tokio::test]
    async fn test_history_keeps_newest_ten() {
        let (mut bus, connector) = bus_with(push_config(None)).await;
        let sink = connector.sink(0);

        for i in 0..12 {
            sink.deliver("dev2", format!("clip {}", i), Some(i));
        }
        bus.drain();

        let history = bus.history();
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(history[0].contents, "clip 11");
        assert_eq!(history[9].contents, "clip 2");
        assert_eq!(bus.latest().map(|clip| clip.contents.as_str()), Some("clip 11"));
    }

    #[tokio::test]
    async fn test_shutdown_closes_transport_and_keeps_history() {
        let (mut bus, connector) = bus_with(push_config(None)).await;
        connector.sink(0).deliver("dev2", "kept".to_string(), None);
        bus.drain();

        bus.shutdown().await;
        bus.shutdown().await;
        assert_eq!(connector.closed(), 1);
        assert_eq!(bus.history().len(), 1);

        // Clips still in flight from the closed transport are ignored
        connector.sink(0).deliver("dev2", "late".to_string(), None);
        assert!(bus.drain().is_empty());
    }
}
