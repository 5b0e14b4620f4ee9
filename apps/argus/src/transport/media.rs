use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const SAMPLE_BUFFER: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
}

/// A single media track carrying opaque encoded samples.
///
/// Clones share the same underlying track. A [`MediaTrack::remote_view`] shares
/// the sample feed but owns its own stop signal, so the receiving side of a
/// connection can stop its copy without releasing the capture device.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    samples: broadcast::Sender<Bytes>,
    stopped: CancellationToken,
}

impl MediaTrack {
    pub fn new(kind: TrackKind) -> Self {
        let (samples, _) = broadcast::channel(SAMPLE_BUFFER);
        Self {
            inner: Arc::new(TrackInner {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                samples,
                stopped: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    /// Publishes one sample to every subscriber. Returns `false` once the track
    /// has been stopped.
    pub fn push_sample(&self, sample: Bytes) -> bool {
        if self.is_stopped() {
            return false;
        }
        // No subscribers is fine: samples are dropped like a live feed would.
        let _ = self.inner.samples.send(sample);
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.inner.samples.subscribe()
    }

    pub fn stop(&self) {
        self.inner.stopped.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.is_cancelled()
    }

    pub async fn stopped(&self) {
        self.inner.stopped.cancelled().await;
    }

    pub fn remote_view(&self) -> MediaTrack {
        Self {
            inner: Arc::new(TrackInner {
                id: self.inner.id.clone(),
                kind: self.inner.kind,
                samples: self.inner.samples.clone(),
                stopped: self.inner.stopped.child_token(),
            }),
        }
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), tracks)
    }

    pub fn with_id(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|track| track.kind() == TrackKind::Video)
    }

    /// Stops every track, releasing whatever device feeds them.
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn is_active(&self) -> bool {
        self.tracks.iter().any(|track| !track.is_stopped())
    }

    pub fn remote_view(&self) -> MediaStream {
        Self {
            id: self.id.clone(),
            tracks: self.tracks.iter().map(MediaTrack::remote_view).collect(),
        }
    }
}
