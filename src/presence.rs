//! Presence binding.
//!
//! Consumes `userStatusChanged` events (from either channel; the shapes are
//! identical) and reconciles them against the active session. Presence is
//! advisory only: a peer going offline annotates the snapshot but never
//! terminates a call. Termination authority stays with the signaling
//! events alone.

use log::{debug, info};

use crate::manager::CallManager;
use crate::types::{PresenceRecord, PresenceStatus, UserId};

impl CallManager {
    pub(crate) fn handle_presence_update(&self, user_id: UserId, status: PresenceStatus) {
        let record = self.store.record_presence(user_id.clone(), status.is_online());
        debug!(
            target: "Calls/Presence",
            "{user_id} is now {}", if record.online { "online" } else { "offline" }
        );

        let session = self.store.current();
        if session.status.is_active() && session.peer_id() == Some(&user_id) {
            self.store.annotate_peer_online(record.online);
            if !record.online {
                info!(
                    target: "Calls/Presence",
                    "peer {user_id} went offline during the call (advisory only)"
                );
            }
        }
    }

    /// Last observed presence for a user, if any was ever reported.
    pub fn presence_of(&self, user_id: &UserId) -> Option<PresenceRecord> {
        self.store.presence_of(user_id)
    }
}
