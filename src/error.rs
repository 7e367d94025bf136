//! Error taxonomy for the signaling core.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

pub use crate::session::InvalidTransition;

/// Errors returned from the public [`CallManager`](crate::manager::CallManager) API.
///
/// Illegal local actions (double-accept, accept while idle, ...) are *not*
/// errors at this level: they are rejected silently with a logged warning and
/// never reach the wire.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("no active call")]
    NoActiveCall,

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failure recorded on the [`CallSession`](crate::session::CallSession)
/// snapshot. Cleared explicitly, never by a transition.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum CallFailure {
    /// The server answered an intent with an `error` event.
    #[error("rejected by server: {message}")]
    RemoteRejected {
        message: String,
        code: Option<String>,
    },

    /// No answer arrived within the configured ring timeout.
    #[error("no answer within the ring timeout")]
    Timeout,

    /// The signaling connection stayed down beyond the grace period.
    #[error("connection lost")]
    ConnectionLost,

    /// The media collaborator failed to set up streams for the call.
    #[error("media setup failed: {0}")]
    MediaSetup(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("send not confirmed within {0:?}")]
    SendTimeout(Duration),

    #[error("connection already open")]
    AlreadyOpen,

    #[error("connection closed")]
    Closed,

    #[error("websocket error: {0}")]
    WebSocket(String),
}
