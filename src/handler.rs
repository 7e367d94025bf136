//! Server event handling for the call manager.
//!
//! Events are applied in arrival order by the dispatch loop; stale or
//! mismatched events are logged and dropped, never fatal. Terminal events
//! release media resources through the media seam.

use log::{debug, info, warn};
use std::sync::Arc;

use crate::error::CallFailure;
use crate::manager::CallManager;
use crate::proto::{ErrorEvent, ServerEvent};
use crate::session::{CallStatus, CallTransition};
use crate::transport::SignalChannel;
use crate::types::{CallEndReason, CallId, CallerInfo, PresenceStatus, UserId};

impl CallManager {
    pub(crate) async fn handle_server_event(self: &Arc<Self>, channel: SignalChannel, event: ServerEvent) {
        match event {
            ServerEvent::IdentityConfirmed {
                user_dehive_id,
                status,
            } => {
                self.handle_identity_confirmed(user_dehive_id, status).await;
            }
            ServerEvent::IncomingCall {
                call_id,
                caller_id,
                caller_info,
            } => {
                self.handle_incoming_call(call_id, caller_id, caller_info)
                    .await;
            }
            ServerEvent::CallAccepted { call_id } => {
                self.handle_call_accepted(call_id).await;
            }
            ServerEvent::CallDeclined { call_id } => {
                self.handle_call_declined(call_id).await;
            }
            ServerEvent::CallEnded { call_id, reason } => {
                self.handle_call_ended(call_id, reason).await;
            }
            ServerEvent::UserStatusChanged { user_id, status } => {
                self.handle_presence_update(user_id, status);
            }
            ServerEvent::Error(err) => {
                self.handle_error_event(channel, err);
            }
        }
    }

    async fn handle_identity_confirmed(&self, user_id: UserId, status: PresenceStatus) {
        info!(target: "Calls/Manager", "identity confirmed: {user_id}");
        self.store
            .record_presence(user_id.clone(), status.is_online());
        *self.identity.lock().await = user_id;
    }

    async fn handle_incoming_call(
        self: &Arc<Self>,
        call_id: CallId,
        caller_id: UserId,
        caller_info: CallerInfo,
    ) {
        let session = self.store.current();
        if session.status.is_active() {
            // At most one call per client; the server resolves the glare.
            warn!(
                target: "Calls/Manager",
                "incoming call {call_id} ignored: session busy ({:?})", session.status
            );
            return;
        }
        if session.status.is_terminal() {
            // A new authoritative offer clears a finished call.
            let _ = self.store.apply(CallTransition::Reset);
        }

        let callee = self.identity.lock().await.clone();
        let offer = CallTransition::IncomingOffer {
            call_id: call_id.clone(),
            caller: caller_id.clone(),
            caller_info: Some(caller_info),
            callee: Some(callee),
        };
        match self.store.apply(offer) {
            Ok(_) => {
                info!(target: "Calls/Manager", "incoming call {call_id} from {caller_id}");
                if let Some(record) = self.store.presence_of(&caller_id) {
                    self.store.annotate_peer_online(record.online);
                }
                self.arm_ring_timer();
            }
            Err(e) => warn!(target: "Calls/Manager", "incoming call {call_id} dropped: {e}"),
        }
    }

    async fn handle_call_accepted(self: &Arc<Self>, call_id: CallId) {
        let session = self.store.current();
        if !session.matches(&call_id) {
            debug!(target: "Calls/Manager", "stale callAccepted for {call_id} ignored");
            return;
        }
        self.cancel_ring_timer();

        let connecting = match self.store.apply(CallTransition::Accepted {
            call_id: call_id.clone(),
        }) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!(target: "Calls/Manager", "callAccepted for {call_id} ignored: {e}");
                return;
            }
        };

        if let Err(e) = self.bind_media(&connecting).await {
            warn!(target: "Calls/Manager", "media setup failed for {call_id}: {e}");
            self.store
                .record_failure(CallFailure::MediaSetup(e.to_string()));
            self.media.release().await;
            // Hang up; the terminal state arrives with the callEnded ack.
            if let Err(e) = self.end_call().await {
                warn!(target: "Calls/Manager", "failed to hang up after media failure: {e}");
            }
            return;
        }

        match self.store.apply(CallTransition::MediaBound) {
            Ok(_) => info!(target: "Calls/Manager", "call {call_id} connected"),
            Err(e) => debug!(target: "Calls/Manager", "connect for {call_id} skipped: {e}"),
        }
    }

    async fn bind_media(
        &self,
        session: &crate::session::CallSession,
    ) -> Result<(), anyhow::Error> {
        self.media.acquire_local_stream().await?;
        self.media.bind_remote_stream(session).await
    }

    async fn handle_call_declined(&self, call_id: CallId) {
        let session = self.store.current();
        if !session.matches(&call_id) {
            debug!(target: "Calls/Manager", "stale callDeclined for {call_id} ignored");
            return;
        }
        self.cancel_ring_timer();
        match self.store.apply(CallTransition::Declined { call_id }) {
            Ok(_) => {
                info!(target: "Calls/Manager", "call declined");
                self.media.release().await;
            }
            Err(e) => debug!(target: "Calls/Manager", "callDeclined ignored: {e}"),
        }
    }

    async fn handle_call_ended(&self, call_id: CallId, reason: CallEndReason) {
        let session = self.store.current();
        if !session.matches(&call_id) {
            debug!(target: "Calls/Manager", "stale callEnded for {call_id} ignored");
            return;
        }
        self.cancel_ring_timer();
        match self.store.apply(CallTransition::Ended { call_id, reason }) {
            Ok(_) => {
                info!(target: "Calls/Manager", "call ended ({reason:?})");
                self.media.release().await;
            }
            Err(e) => debug!(target: "Calls/Manager", "callEnded ignored: {e}"),
        }
    }

    fn handle_error_event(&self, channel: SignalChannel, err: ErrorEvent) {
        warn!(
            target: "Calls/Manager",
            "server error on {channel:?}: {} (code: {:?})", err.message, err.code
        );
        // Surfaced on the snapshot only; a server error on its own never
        // terminates the session.
        if self.store.current().status != CallStatus::Idle {
            self.store.record_failure(CallFailure::RemoteRejected {
                message: err.message,
                code: err.code,
            });
        }
    }
}
