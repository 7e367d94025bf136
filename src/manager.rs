//! Call manager: orchestrates the call lifecycle.
//!
//! Local intents are validated against the current snapshot *before*
//! anything is emitted, so an invalid UI action never reaches the wire and
//! fails fast locally. State only advances on authoritative server events
//! (ack-gated transitions); the sole exceptions are the locally owned
//! `OutgoingStarted` window, the ring timeout and the disconnect grace,
//! each of which yields to a later authoritative event.

use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, Notify, mpsc, watch};

use crate::config::CallConfig;
use crate::error::{CallError, TransportError};
use crate::media::MediaHooks;
use crate::proto::{self, ClientIntent};
use crate::session::{CallSession, CallStatus, CallTransition};
use crate::store::CallStore;
use crate::transport::{SignalChannel, TransportEvent, TransportFactory, TransportManager};
use crate::types::{DeviceStatus, UserId};

pub struct CallManager {
    config: CallConfig,
    pub(crate) store: Arc<CallStore>,
    transports: TransportManager,
    transport_events: Mutex<Option<mpsc::Receiver<(SignalChannel, TransportEvent)>>>,
    pub(crate) media: Arc<dyn MediaHooks>,
    /// Our identity, seeded by the session layer and confirmed by the
    /// server's `identityConfirmed`.
    pub(crate) identity: Mutex<UserId>,
    /// Bumped on arm and on every authoritative state change; a ring timer
    /// only fires if its generation is still current, so at most one timer
    /// is ever live.
    ring_generation: AtomicU64,
    grace_generation: AtomicU64,
    is_running: AtomicBool,
    shutdown: Notify,
}

impl CallManager {
    pub fn new(
        config: CallConfig,
        factory: Arc<dyn TransportFactory>,
        media: Arc<dyn MediaHooks>,
        our_user_id: UserId,
    ) -> Arc<Self> {
        let (transports, events_rx) = TransportManager::new(config.clone(), factory);
        Arc::new(Self {
            config,
            store: Arc::new(CallStore::new()),
            transports,
            transport_events: Mutex::new(Some(events_rx)),
            media,
            identity: Mutex::new(our_user_id),
            ring_generation: AtomicU64::new(0),
            grace_generation: AtomicU64::new(0),
            is_running: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    pub fn store(&self) -> &Arc<CallStore> {
        &self.store
    }

    pub fn current_session(&self) -> CallSession {
        self.store.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSession> {
        self.store.subscribe()
    }

    /// Opens both channels and starts the event dispatch loop. Events from
    /// each channel are processed strictly in arrival order.
    pub async fn connect(self: &Arc<Self>) -> Result<(), CallError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!(target: "Calls/Manager", "connect called while already running");
            return Err(TransportError::AlreadyOpen.into());
        }

        self.transports
            .connection(SignalChannel::CallSignaling)
            .await
            .connect()?;
        self.transports
            .connection(SignalChannel::Presence)
            .await
            .connect()?;

        let events_rx = self
            .transport_events
            .lock()
            .await
            .take()
            .ok_or(TransportError::AlreadyOpen)?;
        let manager = self.clone();
        tokio::spawn(async move { manager.dispatch_loop(events_rx).await });
        Ok(())
    }

    /// Stops dispatching and closes both channels.
    pub async fn shutdown(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        self.cancel_ring_timer();
        self.grace_generation.fetch_add(1, Ordering::SeqCst);
        self.transports.close().await;
    }

    async fn dispatch_loop(
        self: Arc<Self>,
        mut events_rx: mpsc::Receiver<(SignalChannel, TransportEvent)>,
    ) {
        loop {
            let (channel, event) = tokio::select! {
                _ = self.shutdown.notified() => break,
                received = events_rx.recv() => match received {
                    Some(pair) => pair,
                    None => break,
                },
            };

            match event {
                TransportEvent::Connected => {
                    // A live connection cancels any pending grace timer.
                    if channel == SignalChannel::CallSignaling {
                        self.grace_generation.fetch_add(1, Ordering::SeqCst);
                    }
                }
                TransportEvent::Disconnected => {
                    if channel == SignalChannel::CallSignaling {
                        self.arm_grace_timer();
                    }
                }
                TransportEvent::MessageReceived(text) => match proto::decode_event(&text) {
                    Ok(event) => self.handle_server_event(channel, event).await,
                    Err(e) => {
                        // A bad frame must never take the dispatcher down.
                        warn!(
                            target: "Calls/Manager",
                            "dropping malformed event from {channel:?}: {e}"
                        );
                    }
                },
            }
        }
        debug!(target: "Calls/Manager", "dispatch loop stopped");
    }

    /// Starts an outgoing call. No-op with a logged warning while another
    /// call is in progress; a leftover terminal snapshot is cleared first,
    /// this being the user's next explicit action.
    pub async fn start_call(self: &Arc<Self>, target: UserId) -> Result<(), CallError> {
        let session = self.store.current();
        if session.status.is_active() {
            warn!(
                target: "Calls/Manager",
                "start_call ignored: call already in progress ({:?})", session.status
            );
            return Ok(());
        }
        if session.status.is_terminal() {
            self.store.apply(CallTransition::Reset)?;
        }

        self.send_intent(
            SignalChannel::CallSignaling,
            &ClientIntent::StartCall {
                target_user_id: target.clone(),
            },
        )
        .await?;

        // The send was confirmed; open the pre-confirmation window. The
        // server assigns the call id with its first authoritative event.
        let caller = self.identity.lock().await.clone();
        self.store.apply(CallTransition::OutgoingStarted {
            callee: target.clone(),
            caller: Some(caller),
        })?;
        if let Some(record) = self.store.presence_of(&target) {
            self.store.annotate_peer_online(record.online);
        }
        self.arm_ring_timer();
        info!(target: "Calls/Manager", "calling {target}");
        Ok(())
    }

    /// Accepts the ringing incoming call. The session stays `Ringing` until
    /// the server confirms with `callAccepted`.
    pub async fn accept_call(&self) -> Result<(), CallError> {
        let session = self.store.current();
        let accepting = session.status == CallStatus::Ringing && session.is_incoming();
        let Some(call_id) = session.call_id.filter(|_| accepting) else {
            warn!(target: "Calls/Manager", "accept_call ignored: no ringing incoming call");
            return Ok(());
        };
        self.send_intent(
            SignalChannel::CallSignaling,
            &ClientIntent::AcceptCall { call_id },
        )
        .await
    }

    /// Declines the ringing incoming call; ack-gated like `accept_call`.
    pub async fn decline_call(&self) -> Result<(), CallError> {
        let session = self.store.current();
        let declining = session.status == CallStatus::Ringing && session.is_incoming();
        let Some(call_id) = session.call_id.filter(|_| declining) else {
            warn!(target: "Calls/Manager", "decline_call ignored: no ringing incoming call");
            return Ok(());
        };
        self.send_intent(
            SignalChannel::CallSignaling,
            &ClientIntent::DeclineCall { call_id },
        )
        .await
    }

    /// Hangs up the call in progress. Requires a server-assigned call id;
    /// an outgoing call still inside the pre-confirmation window has
    /// nothing to end remotely and is covered by the ring timeout.
    pub async fn end_call(&self) -> Result<(), CallError> {
        let session = self.store.current();
        if !session.status.is_active() {
            warn!(target: "Calls/Manager", "end_call ignored: no call in progress");
            return Ok(());
        }
        let Some(call_id) = session.call_id else {
            warn!(
                target: "Calls/Manager",
                "end_call ignored: call not yet confirmed by the server"
            );
            return Ok(());
        };
        self.send_intent(
            SignalChannel::CallSignaling,
            &ClientIntent::EndCall { call_id },
        )
        .await
    }

    /// Reports local device state (camera/mic/headphone/live).
    pub async fn update_user_status(&self, status: DeviceStatus) -> Result<(), CallError> {
        self.send_intent(
            SignalChannel::CallSignaling,
            &ClientIntent::UpdateUserStatus(status),
        )
        .await
    }

    /// Clears a finished call back to idle. No-op while a call is active;
    /// termination goes through `end_call`.
    pub fn reset(&self) {
        let session = self.store.current();
        if session.status.is_active() {
            warn!(target: "Calls/Manager", "reset ignored: call in progress");
            return;
        }
        self.cancel_ring_timer();
        if let Err(e) = self.store.apply(CallTransition::Reset) {
            debug!(target: "Calls/Manager", "reset skipped: {e}");
        }
    }

    /// Clears the recorded failure from the snapshot.
    pub fn clear_error(&self) {
        self.store.clear_error();
    }

    pub(crate) async fn send_intent(
        &self,
        channel: SignalChannel,
        intent: &ClientIntent,
    ) -> Result<(), CallError> {
        let text = proto::encode_intent(intent)?;
        let connection = self.transports.connection(channel).await;
        connection
            .send(&text, self.config.send_timeout)
            .await
            .map_err(CallError::from)
    }

    pub(crate) fn arm_ring_timer(self: &Arc<Self>) {
        // Arming supersedes any previous timer via the generation bump.
        let generation = self.ring_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let manager = self.clone();
        let timeout = self.config.ring_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if manager.ring_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            manager.on_ring_timeout().await;
        });
    }

    pub(crate) fn cancel_ring_timer(&self) {
        self.ring_generation.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_ring_timeout(self: Arc<Self>) {
        let session = self.store.current();
        if session.status != CallStatus::Ringing {
            return;
        }

        // Cancel the remote ring, best effort. The server's own terminal
        // event, should one still arrive, wins over this local timeout.
        if let Some(call_id) = session.call_id {
            if let Err(e) = self
                .send_intent(
                    SignalChannel::CallSignaling,
                    &ClientIntent::EndCall { call_id },
                )
                .await
            {
                warn!(target: "Calls/Manager", "failed to cancel remote ring: {e}");
            }
        }

        match self.store.apply(CallTransition::RingTimeout) {
            Ok(_) => {
                info!(target: "Calls/Manager", "call timed out without an answer");
                self.media.release().await;
            }
            Err(e) => debug!(target: "Calls/Manager", "ring timeout skipped: {e}"),
        }
    }

    fn arm_grace_timer(self: &Arc<Self>) {
        if !self.store.current().status.is_active() {
            return;
        }
        let generation = self.grace_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let manager = self.clone();
        let grace = self.config.disconnect_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if manager.grace_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            manager.on_disconnect_grace_elapsed().await;
        });
    }

    async fn on_disconnect_grace_elapsed(self: Arc<Self>) {
        let connection = self
            .transports
            .connection(SignalChannel::CallSignaling)
            .await;
        if connection.is_connected() {
            return;
        }
        match self.store.apply(CallTransition::ConnectionLost) {
            Ok(_) => {
                warn!(
                    target: "Calls/Manager",
                    "signaling connection lost beyond grace period, ending call"
                );
                self.cancel_ring_timer();
                self.media.release().await;
            }
            Err(e) => debug!(target: "Calls/Manager", "grace elapsed, nothing to end: {e}"),
        }
    }
}
