//! Call session state machine.
//!
//! A [`CallSession`] is a pure snapshot; every change goes through
//! [`CallSession::apply_transition`], which validates the move against the
//! current status and either produces the next snapshot or reports an
//! [`InvalidTransition`]. Callers decide what an invalid move means: local
//! UI actions are rejected silently with a logged warning, while stale or
//! duplicate server events are logged and dropped.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::CallFailure;
use crate::types::{CallDirection, CallEndReason, CallId, CallerInfo, UserId};

/// Current status of the call session. These seven values are the only ones
/// ever observable from a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// No call. Initial state, and the only state reachable after a
    /// terminal one (via reset).
    #[default]
    Idle,
    /// Ringing on one end: outgoing "calling" or incoming ring, told apart
    /// by the session direction.
    Ringing,
    /// Accepted, media being established.
    Connecting,
    /// Media flowing.
    Connected,
    /// Peer (or we) declined. Terminal.
    Declined,
    /// Call finished or was torn down. Terminal.
    Ended,
    /// Ring window elapsed without an answer. Terminal, distinct from
    /// `Declined`.
    Timeout,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Declined | Self::Ended | Self::Timeout)
    }

    /// A call is in progress: not idle and not yet in a terminal state.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Idle) && !self.is_terminal()
    }
}

/// Snapshot of the single active call session.
///
/// Immutable per read: consumers receive clones and never mutate shared
/// state. While an outgoing call waits for its first authoritative event the
/// session is `Ringing` with `call_id` still unset (the pre-confirmation
/// window); in every other non-idle state a `call_id` is present.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CallSession {
    pub call_id: Option<CallId>,
    pub status: CallStatus,
    pub direction: Option<CallDirection>,
    pub caller_id: Option<UserId>,
    pub callee_id: Option<UserId>,
    pub caller_info: Option<CallerInfo>,
    /// Last recorded failure. Cleared explicitly, never by a transition.
    pub error: Option<CallFailure>,
    /// Reason from the terminal `callEnded` event, if any.
    pub end_reason: Option<CallEndReason>,
    /// Advisory presence annotation for the peer of this session.
    pub peer_online: Option<bool>,
    pub started_at: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
}

impl CallSession {
    pub fn is_incoming(&self) -> bool {
        self.direction == Some(CallDirection::Incoming)
    }

    pub fn is_outgoing(&self) -> bool {
        self.direction == Some(CallDirection::Outgoing)
    }

    /// The other party of this session, if a call exists.
    pub fn peer_id(&self) -> Option<&UserId> {
        match self.direction? {
            CallDirection::Incoming => self.caller_id.as_ref(),
            CallDirection::Outgoing => self.callee_id.as_ref(),
        }
    }

    /// True when `event_call_id` addresses this session. An outgoing call
    /// that has not yet learned its server-assigned id matches any id and
    /// adopts it from the first authoritative event.
    pub(crate) fn matches(&self, event_call_id: &CallId) -> bool {
        match &self.call_id {
            Some(id) => id == event_call_id,
            None => self.is_outgoing(),
        }
    }

    /// Apply a state transition, replacing the snapshot wholesale on
    /// success. Party identities are set by the creation transitions and
    /// never rewritten afterwards.
    pub fn apply_transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        use CallStatus::*;

        match (self.status, &transition) {
            (Idle, CallTransition::OutgoingStarted { callee, caller }) => {
                *self = CallSession {
                    status: Ringing,
                    direction: Some(CallDirection::Outgoing),
                    caller_id: caller.clone(),
                    callee_id: Some(callee.clone()),
                    started_at: Some(Utc::now()),
                    ..CallSession::default()
                };
            }
            (
                Idle,
                CallTransition::IncomingOffer {
                    call_id,
                    caller,
                    caller_info,
                    callee,
                },
            ) => {
                *self = CallSession {
                    call_id: Some(call_id.clone()),
                    status: Ringing,
                    direction: Some(CallDirection::Incoming),
                    caller_id: Some(caller.clone()),
                    callee_id: callee.clone(),
                    caller_info: caller_info.clone(),
                    started_at: Some(Utc::now()),
                    ..CallSession::default()
                };
            }
            (Ringing, CallTransition::Accepted { call_id }) => {
                self.adopt_call_id(call_id);
                self.status = Connecting;
            }
            (Connecting, CallTransition::MediaBound) => {
                self.status = Connected;
                self.connected_at = Some(Utc::now());
            }
            // Terminal events are authoritative and win over everything,
            // including an already terminal local state (last event wins).
            (s, CallTransition::Declined { call_id }) if s != Idle => {
                self.adopt_call_id(call_id);
                self.status = Declined;
            }
            (s, CallTransition::Ended { call_id, reason }) if s != Idle => {
                self.adopt_call_id(call_id);
                self.status = Ended;
                self.end_reason = Some(*reason);
            }
            (Ringing, CallTransition::RingTimeout) => {
                self.status = Timeout;
                self.error = Some(CallFailure::Timeout);
            }
            (s, CallTransition::ConnectionLost) if s.is_active() => {
                self.status = Ended;
                self.end_reason = Some(CallEndReason::ConnectionLost);
                self.error = Some(CallFailure::ConnectionLost);
            }
            (s, CallTransition::Reset) if s == Idle || s.is_terminal() => {
                *self = CallSession::default();
            }
            (_, CallTransition::RecordError(failure)) => {
                self.error = Some(failure.clone());
            }
            (_, _) => {
                return Err(InvalidTransition {
                    current_status: self.status,
                    attempted: transition.name(),
                });
            }
        }

        Ok(())
    }

    fn adopt_call_id(&mut self, call_id: &CallId) {
        if self.call_id.is_none() {
            self.call_id = Some(call_id.clone());
        }
    }
}

/// State transitions for the call session.
///
/// `OutgoingStarted`, `RingTimeout`, `ConnectionLost` and `Reset` originate
/// locally; the rest carry authoritative server events.
#[derive(Debug, Clone)]
pub enum CallTransition {
    /// A `startCall` intent was handed to a live transport. Opens the
    /// pre-confirmation window: ringing, no call id yet.
    OutgoingStarted {
        callee: UserId,
        caller: Option<UserId>,
    },
    /// `incomingCall` arrived while idle.
    IncomingOffer {
        call_id: CallId,
        caller: UserId,
        caller_info: Option<CallerInfo>,
        callee: Option<UserId>,
    },
    /// `callAccepted`: either our accept was confirmed or the callee
    /// answered our outgoing call.
    Accepted { call_id: CallId },
    /// Media streams are bound; the call is live.
    MediaBound,
    /// `callDeclined`.
    Declined { call_id: CallId },
    /// `callEnded`.
    Ended {
        call_id: CallId,
        reason: CallEndReason,
    },
    /// Local ring timer elapsed with the session still unanswered.
    RingTimeout,
    /// Transport stayed down beyond the grace period.
    ConnectionLost,
    /// Explicit local reset from a terminal state back to idle.
    Reset,
    /// Record a failure on the snapshot without moving state.
    RecordError(CallFailure),
}

impl CallTransition {
    fn name(&self) -> &'static str {
        match self {
            Self::OutgoingStarted { .. } => "OutgoingStarted",
            Self::IncomingOffer { .. } => "IncomingOffer",
            Self::Accepted { .. } => "Accepted",
            Self::MediaBound => "MediaBound",
            Self::Declined { .. } => "Declined",
            Self::Ended { .. } => "Ended",
            Self::RingTimeout => "RingTimeout",
            Self::ConnectionLost => "ConnectionLost",
            Self::Reset => "Reset",
            Self::RecordError(_) => "RecordError",
        }
    }
}

/// An attempted transition that the current status does not permit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current_status: CallStatus,
    pub attempted: &'static str,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in status {:?}",
            self.attempted, self.current_status
        )
    }
}

impl std::error::Error for InvalidTransition {}
