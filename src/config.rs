//! Configuration for the call signaling client.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CallConfig {
    /// WebSocket endpoint of the call signaling channel.
    pub signaling_url: String,
    /// WebSocket endpoint of the presence channel.
    pub presence_url: String,
    /// How long an unanswered ring may last before the session moves to
    /// `Timeout`. Advisory UX only; the server's terminal events remain
    /// authoritative and are honored even after this fires.
    pub ring_timeout: Duration,
    /// Bounded wait for a live connection when emitting an intent.
    pub send_timeout: Duration,
    /// How long the signaling connection may stay down before an active
    /// call is ended with a connection-lost failure.
    pub disconnect_grace: Duration,
    /// Cap on the reconnect backoff delay.
    pub reconnect_max_backoff: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: "wss://api.dehive.app/ws/call".to_string(),
            presence_url: "wss://api.dehive.app/ws/presence".to_string(),
            ring_timeout: Duration::from_secs(45),
            send_timeout: Duration::from_secs(5),
            disconnect_grace: Duration::from_secs(10),
            reconnect_max_backoff: Duration::from_secs(30),
        }
    }
}
