//! Peer-to-peer connection layer.
//!
//! A [`TransportProvider`] registers the local peer with whatever broker hands
//! out peer ids and yields an [`OpenedTransport`]: the transport handle plus the
//! streams of inbound data and media connections. Outbound connections are
//! fire-and-forget: handles come back immediately and negotiation progress is
//! observed through each connection's own events.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod connection;
pub mod local;
pub mod media;
#[cfg(feature = "webrtc-provider")]
pub mod webrtc;

pub use connection::{DataConnection, MediaConnection};
pub use media::{MediaStream, MediaTrack, TrackKind};

use crate::model::PeerId;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("transport closed")]
    Closed,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("signaling error: {0}")]
    Signaling(String),
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn local_peer_id(&self) -> &PeerId;

    fn open_data_connection(&self, remote: &PeerId) -> Result<DataConnection, TransportError>;

    fn open_media_connection(
        &self,
        remote: &PeerId,
        stream: &MediaStream,
    ) -> Result<MediaConnection, TransportError>;

    /// Connections opened or accepted by this transport that have not terminated.
    fn open_connection_count(&self) -> usize;

    /// Closes every child connection and unregisters from the broker.
    async fn close(&self);
}

#[async_trait]
pub trait TransportProvider: Send + Sync {
    async fn open(&self) -> Result<OpenedTransport, TransportError>;
}

pub struct InboundConnections {
    pub data: mpsc::UnboundedReceiver<DataConnection>,
    pub media: mpsc::UnboundedReceiver<MediaConnection>,
}

pub struct OpenedTransport {
    pub transport: Arc<dyn PeerTransport>,
    pub inbound: InboundConnections,
}

impl OpenedTransport {
    pub fn local_peer_id(&self) -> &PeerId {
        self.transport.local_peer_id()
    }
}
