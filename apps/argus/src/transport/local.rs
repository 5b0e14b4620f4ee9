//! In-process provider: every peer lives in the same [`LocalPeerNetwork`].
//!
//! Used by the loopback command and the test suites. Connections to unknown
//! peers come back already terminated, matching how a broker reports an
//! unavailable peer.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::connection::ConnectionRegistry;
use super::{
    DataConnection, InboundConnections, MediaConnection, MediaStream, OpenedTransport,
    PeerTransport, TransportError, TransportProvider,
};
use crate::model::PeerId;

#[derive(Clone, Default)]
pub struct LocalPeerNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    peers: RwLock<HashMap<PeerId, Endpoint>>,
    offline: AtomicBool,
}

#[derive(Clone)]
struct Endpoint {
    data: mpsc::UnboundedSender<DataConnection>,
    media: mpsc::UnboundedSender<MediaConnection>,
    connections: Arc<ConnectionRegistry>,
}

impl LocalPeerNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline, `open` fails the way an unreachable broker would.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.read().len()
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.inner.peers.read().contains_key(peer_id)
    }

    /// Registers a peer under a caller-chosen id.
    pub fn open_as(&self, peer_id: PeerId) -> Result<OpenedTransport, TransportError> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("local network offline".into()));
        }
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let connections = Arc::new(ConnectionRegistry::default());
        {
            let mut peers = self.inner.peers.write();
            if peers.contains_key(&peer_id) {
                return Err(TransportError::Unavailable(format!(
                    "peer id {peer_id} already taken"
                )));
            }
            peers.insert(
                peer_id.clone(),
                Endpoint {
                    data: data_tx,
                    media: media_tx,
                    connections: connections.clone(),
                },
            );
        }
        debug!(target: "argus::transport", peer_id = %peer_id, "local peer registered");
        let transport = LocalTransport {
            peer_id,
            network: self.clone(),
            connections,
            closed: CancellationToken::new(),
        };
        Ok(OpenedTransport {
            transport: Arc::new(transport),
            inbound: InboundConnections {
                data: data_rx,
                media: media_rx,
            },
        })
    }

    fn endpoint(&self, peer_id: &PeerId) -> Option<Endpoint> {
        self.inner.peers.read().get(peer_id).cloned()
    }

    fn remove(&self, peer_id: &PeerId) {
        self.inner.peers.write().remove(peer_id);
    }
}

#[async_trait]
impl TransportProvider for LocalPeerNetwork {
    async fn open(&self) -> Result<OpenedTransport, TransportError> {
        self.open_as(PeerId::generate())
    }
}

struct LocalTransport {
    peer_id: PeerId,
    network: LocalPeerNetwork,
    connections: Arc<ConnectionRegistry>,
    closed: CancellationToken,
}

impl LocalTransport {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerTransport for LocalTransport {
    fn local_peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    fn open_data_connection(&self, remote: &PeerId) -> Result<DataConnection, TransportError> {
        self.ensure_open()?;
        let id = format!("dc_{}", uuid::Uuid::new_v4().simple());
        let token = CancellationToken::new();
        let (to_remote, from_local) = mpsc::unbounded_channel();
        let (to_local, from_remote) = mpsc::unbounded_channel();
        let local = DataConnection::new(remote.clone(), id.clone(), to_remote, from_remote, token.clone());
        self.connections.track(&id, token.clone());

        let delivered = self.network.endpoint(remote).is_some_and(|endpoint| {
            let accepted = DataConnection::new(self.peer_id.clone(), id.clone(), to_local, from_local, token.clone());
            endpoint.connections.track(&id, token.clone());
            endpoint.data.send(accepted).is_ok()
        });
        if !delivered {
            debug!(target: "argus::transport", remote = %remote, "data connection to unavailable peer");
            token.cancel();
        }
        Ok(local)
    }

    fn open_media_connection(
        &self,
        remote: &PeerId,
        stream: &MediaStream,
    ) -> Result<MediaConnection, TransportError> {
        self.ensure_open()?;
        let id = format!("mc_{}", uuid::Uuid::new_v4().simple());
        let token = CancellationToken::new();
        let local = MediaConnection::new(remote.clone(), id.clone(), token.clone());
        self.connections.track(&id, token.clone());

        let delivered = self.network.endpoint(remote).is_some_and(|endpoint| {
            let accepted = MediaConnection::new(self.peer_id.clone(), id.clone(), token.clone());
            accepted.publish_remote_stream(stream.remote_view());
            endpoint.connections.track(&id, token.clone());
            endpoint.media.send(accepted).is_ok()
        });
        if !delivered {
            debug!(target: "argus::transport", remote = %remote, "media connection to unavailable peer");
            token.cancel();
        }
        Ok(local)
    }

    fn open_connection_count(&self) -> usize {
        self.connections.open_count()
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.network.remove(&self.peer_id);
        let closed = self.connections.close_all();
        debug!(
            target: "argus::transport",
            peer_id = %self.peer_id,
            closed_connections = closed,
            "local transport closed"
        );
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            self.network.remove(&self.peer_id);
            self.connections.close_all();
        }
    }
}
