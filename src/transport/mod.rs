//! Transport connection management.
//!
//! One persistent connection per logical channel (call signaling, presence),
//! created lazily and owned by the [`TransportManager`] for its lifetime.
//! Connections are created disconnected and must be explicitly
//! [`ChannelConnection::connect`]ed; from then on they reconnect on their own
//! with capped backoff, indefinitely. The concrete socket sits behind the
//! [`Transport`]/[`TransportFactory`] traits so tests can substitute a
//! channel-backed fake.

pub mod ws;

use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};

use crate::config::CallConfig;
use crate::error::TransportError;

/// An event produced by the transport layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The connection is established and ready for intents.
    Connected,
    /// A text frame arrived from the server.
    MessageReceived(String),
    /// The connection was lost. The owning channel will retry on its own.
    Disconnected,
}

/// An active network connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one text frame to the server.
    async fn send_text(&self, text: &str) -> Result<(), TransportError>;

    /// Closes the connection.
    async fn disconnect(&self);
}

/// Creates transport instances for a channel URL.
///
/// `dial` resolves once the connection is established; implementations must
/// push a [`TransportEvent::Connected`] as the first event on the returned
/// receiver, and a final [`TransportEvent::Disconnected`] when the
/// connection dies.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn dial(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), TransportError>;
}

/// The logical channels the client keeps open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalChannel {
    CallSignaling,
    Presence,
}

impl SignalChannel {
    fn url<'a>(&self, config: &'a CallConfig) -> &'a str {
        match self {
            Self::CallSignaling => &config.signaling_url,
            Self::Presence => &config.presence_url,
        }
    }
}

/// One auto-reconnecting connection bound to a channel.
///
/// Constructed disconnected; no network activity happens until `connect`.
pub struct ChannelConnection {
    channel: SignalChannel,
    url: String,
    factory: Arc<dyn TransportFactory>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    connected_tx: watch::Sender<bool>,
    running: AtomicBool,
    events_tx: mpsc::Sender<(SignalChannel, TransportEvent)>,
    max_backoff: Duration,
}

impl ChannelConnection {
    fn new(
        channel: SignalChannel,
        url: String,
        factory: Arc<dyn TransportFactory>,
        events_tx: mpsc::Sender<(SignalChannel, TransportEvent)>,
        max_backoff: Duration,
    ) -> Self {
        let (connected_tx, _) = watch::channel(false);
        Self {
            channel,
            url,
            factory,
            transport: Mutex::new(None),
            connected_tx,
            running: AtomicBool::new(false),
            events_tx,
            max_backoff,
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.connected_tx.borrow()
    }

    /// Starts the connection loop. Calling this twice is an error; the loop
    /// keeps the channel alive with unbounded retries until `close`.
    pub fn connect(self: &Arc<Self>) -> Result<(), TransportError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyOpen);
        }
        let conn = self.clone();
        tokio::spawn(conn.run_loop());
        Ok(())
    }

    /// Stops the connection loop and closes the socket.
    pub async fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(transport) = self.transport.lock().await.take() {
            transport.disconnect().await;
        }
        self.connected_tx.send_replace(false);
    }

    /// Emits one intent, waiting up to `send_timeout` for a live
    /// connection. Never queues: an unconfirmed send surfaces as an error
    /// so the caller can avoid speculative state changes.
    pub async fn send(&self, text: &str, send_timeout: Duration) -> Result<(), TransportError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }

        let mut connected_rx = self.connected_tx.subscribe();
        let wait = connected_rx.wait_for(|connected| *connected);
        if tokio::time::timeout(send_timeout, wait).await.is_err() {
            return Err(TransportError::SendTimeout(send_timeout));
        }

        let transport = self
            .transport
            .lock()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)?;
        transport.send_text(text).await
    }

    async fn run_loop(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        while self.running.load(Ordering::SeqCst) {
            match self.factory.dial(&self.url).await {
                Ok((transport, mut events)) => {
                    attempt = 0;
                    *self.transport.lock().await = Some(transport);

                    let mut saw_disconnect = false;
                    while let Some(event) = events.recv().await {
                        match &event {
                            TransportEvent::Connected => {
                                self.connected_tx.send_replace(true);
                                info!(
                                    target: "Calls/Transport",
                                    "{:?} channel connected", self.channel
                                );
                            }
                            TransportEvent::Disconnected => saw_disconnect = true,
                            TransportEvent::MessageReceived(_) => {}
                        }
                        if self.events_tx.send((self.channel, event)).await.is_err() {
                            debug!(
                                target: "Calls/Transport",
                                "event consumer dropped, stopping {:?} channel", self.channel
                            );
                            self.running.store(false, Ordering::SeqCst);
                            break;
                        }
                        if saw_disconnect {
                            break;
                        }
                    }

                    self.connected_tx.send_replace(false);
                    *self.transport.lock().await = None;

                    // If the socket task vanished without an explicit
                    // disconnect, the dispatcher still needs to hear it.
                    if !saw_disconnect && self.running.load(Ordering::SeqCst) {
                        let _ = self
                            .events_tx
                            .send((self.channel, TransportEvent::Disconnected))
                            .await;
                    }
                }
                Err(e) => {
                    warn!(
                        target: "Calls/Transport",
                        "failed to dial {:?} channel: {e}", self.channel
                    );
                }
            }

            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            attempt = attempt.saturating_add(1);
            let delay = Duration::from_secs(u64::from(attempt) * 2).min(self.max_backoff);
            info!(
                target: "Calls/Transport",
                "will retry {:?} channel in {:?} (attempt {})", self.channel, delay, attempt
            );
            tokio::time::sleep(delay).await;
        }
        debug!(target: "Calls/Transport", "{:?} channel loop stopped", self.channel);
    }
}

/// Owns the per-channel connections. `connection` is idempotent: repeated
/// calls for the same channel return the same instance, created lazily and
/// kept for the manager's lifetime.
pub struct TransportManager {
    config: CallConfig,
    factory: Arc<dyn TransportFactory>,
    channels: Mutex<HashMap<SignalChannel, Arc<ChannelConnection>>>,
    events_tx: mpsc::Sender<(SignalChannel, TransportEvent)>,
}

impl TransportManager {
    pub fn new(
        config: CallConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> (Self, mpsc::Receiver<(SignalChannel, TransportEvent)>) {
        let (events_tx, events_rx) = mpsc::channel(100);
        (
            Self {
                config,
                factory,
                channels: Mutex::new(HashMap::new()),
                events_tx,
            },
            events_rx,
        )
    }

    pub async fn connection(&self, channel: SignalChannel) -> Arc<ChannelConnection> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(channel)
            .or_insert_with(|| {
                Arc::new(ChannelConnection::new(
                    channel,
                    channel.url(&self.config).to_string(),
                    self.factory.clone(),
                    self.events_tx.clone(),
                    self.config.reconnect_max_backoff,
                ))
            })
            .clone()
    }

    pub async fn close(&self) {
        for (_, conn) in self.channels.lock().await.drain() {
            conn.close().await;
        }
    }
}
