use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::TransportError;
use super::media::MediaStream;
use crate::model::PeerId;

/// Application side of a message channel to one remote peer.
///
/// Messages arrive in send order. Termination is a one-shot signal shared with
/// the provider: `close()` from either side fires it exactly once, and the
/// provider releases its resources when it observes it.
#[derive(Clone)]
pub struct DataConnection {
    inner: Arc<DataInner>,
}

struct DataInner {
    peer_id: PeerId,
    id: String,
    outbound: mpsc::UnboundedSender<Bytes>,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<Bytes>>,
    terminated: CancellationToken,
}

impl DataConnection {
    pub fn new(
        peer_id: PeerId,
        id: impl Into<String>,
        outbound: mpsc::UnboundedSender<Bytes>,
        inbound: mpsc::UnboundedReceiver<Bytes>,
        terminated: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(DataInner {
                peer_id,
                id: id.into(),
                outbound,
                inbound: AsyncMutex::new(inbound),
                terminated,
            }),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.inner.peer_id
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Queues a message for the remote peer. Providers buffer until the
    /// underlying channel opens.
    pub fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        self.inner
            .outbound
            .send(payload)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    pub fn send_json<T: Serialize>(&self, message: &T) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(message)?;
        self.send(Bytes::from(payload))
    }

    /// Next inbound message. Messages queued before termination are still
    /// delivered; afterwards this returns `None`.
    pub async fn recv(&self) -> Option<Bytes> {
        let mut inbound = self.inner.inbound.lock().await;
        tokio::select! {
            biased;
            message = inbound.recv() => message,
            _ = self.inner.terminated.cancelled() => inbound.try_recv().ok(),
        }
    }

    pub fn close(&self) {
        self.inner.terminated.cancel();
    }

    pub async fn closed(&self) {
        self.inner.terminated.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.terminated.is_cancelled()
    }

    pub(crate) fn termination(&self) -> CancellationToken {
        self.inner.terminated.clone()
    }
}

impl fmt::Debug for DataConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataConnection")
            .field("peer_id", &self.inner.peer_id)
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Application side of a media session with one remote peer.
#[derive(Clone)]
pub struct MediaConnection {
    inner: Arc<MediaInner>,
}

struct MediaInner {
    peer_id: PeerId,
    id: String,
    remote_stream: watch::Sender<Option<MediaStream>>,
    terminated: CancellationToken,
}

impl MediaConnection {
    pub fn new(peer_id: PeerId, id: impl Into<String>, terminated: CancellationToken) -> Self {
        let (remote_stream, _) = watch::channel(None);
        Self {
            inner: Arc::new(MediaInner {
                peer_id,
                id: id.into(),
                remote_stream,
                terminated,
            }),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.inner.peer_id
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Resolves once the remote media is ready, or `None` if the connection
    /// terminates first.
    pub async fn remote_stream(&self) -> Option<MediaStream> {
        let receiver = self.inner.remote_stream.subscribe();
        tokio::select! {
            biased;
            stream = wait_for_stream(receiver) => stream,
            _ = self.inner.terminated.cancelled() => None,
        }
    }

    pub fn current_stream(&self) -> Option<MediaStream> {
        self.inner.remote_stream.borrow().clone()
    }

    /// Fires the stream-available event. Only the first stream is kept.
    pub fn publish_remote_stream(&self, stream: MediaStream) {
        self.inner.remote_stream.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(stream);
            true
        });
    }

    pub fn close(&self) {
        self.inner.terminated.cancel();
    }

    pub async fn closed(&self) {
        self.inner.terminated.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.terminated.is_cancelled()
    }

    pub(crate) fn termination(&self) -> CancellationToken {
        self.inner.terminated.clone()
    }
}

impl fmt::Debug for MediaConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaConnection")
            .field("peer_id", &self.inner.peer_id)
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn wait_for_stream(mut receiver: watch::Receiver<Option<MediaStream>>) -> Option<MediaStream> {
    match receiver.wait_for(Option::is_some).await {
        Ok(stream) => stream.clone(),
        Err(_) => None,
    }
}

/// Termination handles of every connection a transport has opened or accepted,
/// so closing the transport closes its children.
#[derive(Default)]
pub(crate) struct ConnectionRegistry {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl ConnectionRegistry {
    pub(crate) fn track(&self, id: &str, token: CancellationToken) {
        let mut tokens = self.tokens.lock();
        tokens.retain(|_, token| !token.is_cancelled());
        tokens.insert(id.to_owned(), token);
    }

    pub(crate) fn open_count(&self) -> usize {
        let mut tokens = self.tokens.lock();
        tokens.retain(|_, token| !token.is_cancelled());
        tokens.len()
    }

    pub(crate) fn close_all(&self) -> usize {
        let drained: Vec<_> = self.tokens.lock().drain().collect();
        let mut closed = 0;
        for (_, token) in drained {
            if !token.is_cancelled() {
                token.cancel();
                closed += 1;
            }
        }
        closed
    }
}
