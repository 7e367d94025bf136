//! Seam to the external media-transport collaborator.
//!
//! The state machine does not own the media lifecycle. It calls
//! [`MediaHooks::acquire_local_stream`] and [`MediaHooks::bind_remote_stream`]
//! while moving a call from `Connecting` to `Connected`, and guarantees
//! [`MediaHooks::release`] on every transition into a terminal state.

use async_trait::async_trait;

use crate::session::CallSession;

#[async_trait]
pub trait MediaHooks: Send + Sync {
    /// Open local capture (mic/camera) for the call.
    async fn acquire_local_stream(&self) -> Result<(), anyhow::Error>;

    /// Attach the peer's media to the given session.
    async fn bind_remote_stream(&self, session: &CallSession) -> Result<(), anyhow::Error>;

    /// Tear down any held media resources. Must be safe to call repeatedly.
    async fn release(&self);
}

/// Media implementation that does nothing. Useful for signaling-only
/// clients and tests.
#[derive(Debug, Default)]
pub struct NoopMedia;

#[async_trait]
impl MediaHooks for NoopMedia {
    async fn acquire_local_stream(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn bind_remote_stream(&self, _session: &CallSession) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn release(&self) {}
}
