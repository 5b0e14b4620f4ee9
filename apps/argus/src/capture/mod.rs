//! Capabilities borrowed from the host: the capture device, the surface that
//! renders remote media, and an optional stay-awake lock.

use async_trait::async_trait;
use thiserror::Error;

pub mod synthetic;

pub use synthetic::{MAX_FPS, SyntheticCapture};

use crate::model::PeerId;
use crate::transport::MediaStream;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
}

#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Opens the device. Stopping the returned stream releases it.
    async fn acquire(&self) -> Result<MediaStream, CaptureError>;
}

/// Where remote media ends up.
pub trait RenderSink: Send + Sync {
    fn attach(&self, peer_id: &PeerId, name: &str, stream: MediaStream);
    fn detach(&self, peer_id: &PeerId);
}

/// Best-effort device stay-awake lock.
pub trait WakeLock: Send + Sync {
    fn acquire(&self) -> Result<(), String>;
    fn release(&self);
}

/// Render sink that only logs what it is handed.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingSink;

impl RenderSink for LoggingSink {
    fn attach(&self, peer_id: &PeerId, name: &str, stream: MediaStream) {
        tracing::info!(
            target: "argus::render",
            peer_id = %peer_id,
            name,
            stream_id = stream.id(),
            tracks = stream.tracks().len(),
            "attached remote stream"
        );
    }

    fn detach(&self, peer_id: &PeerId) {
        tracing::info!(target: "argus::render", peer_id = %peer_id, "detached remote stream");
    }
}
