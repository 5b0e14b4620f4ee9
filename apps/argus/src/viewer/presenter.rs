use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{SensorSession, ViewerEvent, ViewerHandle};
use crate::capture::RenderSink;
use crate::model::PeerId;
use crate::transport::MediaStream;

enum Attachment {
    /// Waiting for the remote stream of media connection `media_id`.
    Waiting {
        media_id: String,
        cancel: CancellationToken,
    },
    Attached {
        media_id: String,
    },
}

impl Attachment {
    fn media_id(&self) -> &str {
        match self {
            Attachment::Waiting { media_id, .. } | Attachment::Attached { media_id } => media_id,
        }
    }
}

/// Forwards each connected sensor's remote stream to `sink` and detaches it
/// when the sensor goes away. Sessions already connected when this is called
/// are attached too. Everything still attached is detached when the viewer is
/// disposed.
///
/// Each stream is awaited in its own task, so a sensor whose stream never
/// shows up does not hold back the others.
pub fn attach_renderer(handle: &ViewerHandle, sink: Arc<dyn RenderSink>) -> JoinHandle<()> {
    let mut events = handle.subscribe();
    let snapshot = handle.session_snapshot();
    let shutdown = handle.shutdown_token();
    tokio::spawn(async move {
        let mut renderer = Renderer {
            sink,
            attachments: HashMap::new(),
            waiters: JoinSet::new(),
            shutdown: shutdown.clone(),
        };
        let existing = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Vec::new(),
            sessions = snapshot => sessions,
        };
        for session in existing {
            renderer.on_connected(session);
        }

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(joined) = renderer.waiters.join_next(), if !renderer.waiters.is_empty() => {
                    if let Ok(Some((session, stream))) = joined {
                        renderer.on_stream(session, stream);
                    }
                }
                event = events.recv() => match event {
                    Ok(ViewerEvent::SensorConnected(session)) => renderer.on_connected(session),
                    Ok(ViewerEvent::SensorDisconnected { peer_id, .. }) => {
                        renderer.on_disconnected(&peer_id);
                    }
                    Ok(ViewerEvent::AttemptFailed { .. }) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(target: "argus::render", skipped, "renderer fell behind viewer events");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        renderer.finish().await;
    })
}

struct Renderer {
    sink: Arc<dyn RenderSink>,
    attachments: HashMap<PeerId, Attachment>,
    waiters: JoinSet<Option<(SensorSession, MediaStream)>>,
    shutdown: CancellationToken,
}

impl Renderer {
    fn on_connected(&mut self, session: SensorSession) {
        let media_id = session.media().id().to_owned();
        if let Some(existing) = self.attachments.get(session.peer_id()) {
            if existing.media_id() == media_id {
                return;
            }
            self.on_disconnected(session.peer_id());
        }

        let cancel = self.shutdown.child_token();
        self.attachments.insert(
            session.peer_id().clone(),
            Attachment::Waiting {
                media_id,
                cancel: cancel.clone(),
            },
        );
        self.waiters.spawn(async move {
            let stream = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                stream = session.media().remote_stream() => stream,
            };
            stream.map(|stream| (session, stream))
        });
    }

    fn on_stream(&mut self, session: SensorSession, stream: MediaStream) {
        let Some(attachment) = self.attachments.get_mut(session.peer_id()) else {
            return;
        };
        let current = matches!(
            attachment,
            Attachment::Waiting { media_id, .. } if media_id.as_str() == session.media().id()
        );
        if !current {
            return;
        }
        *attachment = Attachment::Attached {
            media_id: session.media().id().to_owned(),
        };
        debug!(target: "argus::render", peer_id = %session.peer_id(), "stream attached");
        self.sink.attach(session.peer_id(), session.name(), stream);
    }

    fn on_disconnected(&mut self, peer_id: &PeerId) {
        match self.attachments.remove(peer_id) {
            Some(Attachment::Waiting { cancel, .. }) => cancel.cancel(),
            Some(Attachment::Attached { .. }) => self.sink.detach(peer_id),
            None => {}
        }
    }

    async fn finish(mut self) {
        let peers: Vec<PeerId> = self.attachments.keys().cloned().collect();
        for peer_id in peers {
            self.on_disconnected(&peer_id);
        }
        self.waiters.shutdown().await;
    }
}
