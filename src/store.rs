//! Call context store.
//!
//! Holds the current [`CallSession`] snapshot and the presence record set.
//! [`CallStore::apply`] is the single mutation funnel: it builds the next
//! snapshot off to the side and swaps it in atomically, so readers only ever
//! observe complete states. Consumers read via [`CallStore::current`] or
//! subscribe to a watch channel for change notifications.

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::watch;

use crate::error::CallFailure;
use crate::session::{CallSession, CallTransition, InvalidTransition};
use crate::types::{PresenceRecord, UserId};

pub struct CallStore {
    session_tx: watch::Sender<CallSession>,
    presence: DashMap<UserId, PresenceRecord>,
}

impl CallStore {
    pub fn new() -> Self {
        let (session_tx, _) = watch::channel(CallSession::default());
        Self {
            session_tx,
            presence: DashMap::new(),
        }
    }

    /// Latest session snapshot. Immutable per read.
    pub fn current(&self) -> CallSession {
        self.session_tx.borrow().clone()
    }

    /// Watch receiver notified on every applied change.
    pub fn subscribe(&self) -> watch::Receiver<CallSession> {
        self.session_tx.subscribe()
    }

    /// Applies a transition and returns the resulting snapshot. On an
    /// invalid transition the stored session is left untouched and no
    /// notification is sent.
    pub(crate) fn apply(
        &self,
        transition: CallTransition,
    ) -> Result<CallSession, InvalidTransition> {
        let mut outcome = Ok(());
        self.session_tx.send_if_modified(|session| {
            let mut next = session.clone();
            match next.apply_transition(transition) {
                Ok(()) => {
                    *session = next;
                    true
                }
                Err(e) => {
                    outcome = Err(e);
                    false
                }
            }
        });
        outcome.map(|()| self.current())
    }

    pub(crate) fn record_failure(&self, failure: CallFailure) {
        // RecordError is accepted in every state.
        let _ = self.apply(CallTransition::RecordError(failure));
    }

    /// Clears the recorded failure. The only way `error` ever empties.
    pub fn clear_error(&self) {
        self.session_tx.send_modify(|session| session.error = None);
    }

    /// Upserts the presence record for a user. Records are never removed;
    /// a stale entry keeps its last-known status.
    pub(crate) fn record_presence(&self, user_id: UserId, online: bool) -> PresenceRecord {
        let record = PresenceRecord {
            user_id: user_id.clone(),
            online,
            updated_at: Utc::now(),
        };
        self.presence.insert(user_id, record.clone());
        record
    }

    pub fn presence_of(&self, user_id: &UserId) -> Option<PresenceRecord> {
        self.presence.get(user_id).map(|r| r.clone())
    }

    /// Annotates the active session with the peer's advisory online state.
    pub(crate) fn annotate_peer_online(&self, online: bool) {
        self.session_tx
            .send_modify(|session| session.peer_online = Some(online));
    }
}

impl Default for CallStore {
    fn default() -> Self {
        Self::new()
    }
}
