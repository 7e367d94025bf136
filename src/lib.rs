//! Client-side direct call signaling for the Dehive messenger.
//!
//! This crate implements the call control plane: establishing, ringing,
//! accepting/declining and tearing down a peer call session over a
//! persistent signaling connection, coordinated with a separate presence
//! channel. Rendering, HTTP routes and the media transport itself are
//! external collaborators reached through trait seams.
//!
//! # Architecture
//!
//! - [`CallSession`] & [`CallStatus`]: call state machine snapshot and its
//!   transition rules
//! - [`CallStore`]: single-writer context holding the current snapshot
//! - [`CallManager`]: validates local intents, emits them over the wire and
//!   applies authoritative server events
//! - [`ClientIntent`] & [`ServerEvent`]: the JSON wire contract
//! - [`Transport`]/[`TransportFactory`]: the pluggable connection seam, with
//!   a tokio-tungstenite implementation in [`transport::ws`]
//! - [`MediaHooks`]: seam to the external media collaborator
//!
//! State only advances on authoritative server events; local actions are
//! validated before anything reaches the wire, and local timers (ring
//! timeout, disconnect grace) always yield to a later authoritative event.

pub mod config;
pub mod error;
mod handler;
pub mod manager;
pub mod media;
mod presence;
pub mod proto;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;

pub use config::CallConfig;
pub use error::{CallError, CallFailure, TransportError};
pub use manager::CallManager;
pub use media::{MediaHooks, NoopMedia};
pub use proto::{ClientIntent, ErrorEvent, ServerEvent};
pub use session::{CallSession, CallStatus, CallTransition, InvalidTransition};
pub use store::CallStore;
pub use transport::{
    SignalChannel, Transport, TransportEvent, TransportFactory, TransportManager,
};
pub use types::{
    CallDirection, CallEndReason, CallId, CallerInfo, DeviceStatus, PresenceRecord,
    PresenceStatus, UserId,
};
