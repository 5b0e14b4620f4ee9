use argus_core::auth::{Argon2Scheme, CredentialScheme, KdfParams, SecretBinding};
use argus_core::capture::{RenderSink, SyntheticCapture};
use argus_core::handshake::{HandshakeOutcome, RejectReason};
use argus_core::model::{PeerId, Site};
use argus_core::protocol::{self, CredentialMessage, NameMessage};
use argus_core::registry::{MemoryRegistry, Registry};
use argus_core::sensor::{Sensor, SensorConfig, SensorDeps};
use argus_core::transport::local::LocalPeerNetwork;
use argus_core::transport::{
    InboundConnections, MediaConnection, MediaStream, MediaTrack, OpenedTransport, TrackKind,
    TransportError, TransportProvider,
};
use argus_core::viewer::{
    ManagerStats, ViewerConfig, ViewerDeps, ViewerEvent, ViewerHandle, ViewerSessionManager,
    attach_renderer,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

const EVENT_WAIT: Duration = Duration::from_secs(5);

fn site() -> Site {
    Site::from("lab")
}

fn cheap_scheme() -> Arc<dyn CredentialScheme> {
    Arc::new(
        Argon2Scheme::new(KdfParams {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        })
        .expect("kdf params"),
    )
}

struct Harness {
    network: LocalPeerNetwork,
    registry: Arc<MemoryRegistry>,
    scheme: Arc<dyn CredentialScheme>,
}

impl Harness {
    fn new() -> Self {
        Self {
            network: LocalPeerNetwork::new(),
            registry: Arc::new(MemoryRegistry::new()),
            scheme: cheap_scheme(),
        }
    }

    async fn sensor(&self, name: &str, password: &str) -> Sensor {
        self.sensor_with(SensorConfig::new(site(), name, password)).await
    }

    async fn sensor_with(&self, mut config: SensorConfig) -> Sensor {
        config.announce_interval = Duration::from_millis(50);
        let sensor = Sensor::start(
            config,
            SensorDeps {
                provider: Arc::new(self.network.clone()),
                registry: self.registry.clone(),
                capture: Arc::new(SyntheticCapture::new(30)),
                scheme: self.scheme.clone(),
                wake_lock: None,
            },
        )
        .await
        .expect("sensor start");
        self.wait_announced(sensor.local_peer_id()).await;
        sensor
    }

    /// A peer that registers like a sensor but whose behavior the test drives.
    async fn scripted_sensor(&self, id: &str) -> OpenedTransport {
        let opened = self.network.open_as(PeerId::from(id)).expect("open scripted peer");
        self.registry
            .announce(&site(), &PeerId::from(id))
            .await
            .expect("announce scripted peer");
        opened
    }

    async fn viewer(&self, password: &str, handshake_timeout: Duration) -> ViewerHandle {
        let mut config = ViewerConfig::new(site(), password);
        config.handshake_timeout = handshake_timeout;
        config.discover_interval = handshake_timeout.max(Duration::from_millis(200));
        self.viewer_with(config).await
    }

    async fn viewer_with(&self, config: ViewerConfig) -> ViewerHandle {
        self.viewer_over(Arc::new(self.network.clone()), config).await
    }

    async fn viewer_over(
        &self,
        provider: Arc<dyn TransportProvider>,
        config: ViewerConfig,
    ) -> ViewerHandle {
        ViewerSessionManager::start(
            config,
            ViewerDeps {
                provider,
                registry: self.registry.clone(),
                scheme: self.scheme.clone(),
            },
        )
        .await
        .expect("viewer start")
    }

    async fn wait_announced(&self, peer_id: &PeerId) {
        tokio::time::timeout(EVENT_WAIT, async {
            loop {
                let peers = self.registry.discover(&site()).await.unwrap_or_default();
                if peers.contains(peer_id) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("sensor announced");
    }
}

async fn next_event(events: &mut broadcast::Receiver<ViewerEvent>) -> ViewerEvent {
    tokio::time::timeout(EVENT_WAIT, events.recv())
        .await
        .expect("viewer event before timeout")
        .expect("viewer event channel open")
}

async fn eventually<F: Fn() -> bool>(check: F) {
    tokio::time::timeout(EVENT_WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached");
}

fn test_stream() -> MediaStream {
    MediaStream::new(vec![MediaTrack::new(TrackKind::Video)])
}

#[tokio::test]
async fn viewer_connects_to_cam1() {
    let harness = Harness::new();
    let sensor = harness.sensor("Cam1", "hunter2").await;
    let viewer = harness.viewer("hunter2", Duration::from_secs(2)).await;
    let mut events = viewer.subscribe();

    match next_event(&mut events).await {
        ViewerEvent::SensorConnected(session) => {
            assert_eq!(session.name(), "Cam1");
            assert_eq!(session.peer_id(), sensor.local_peer_id());
            let stream = session.media().remote_stream().await.expect("remote stream");
            assert_eq!(stream.id(), sensor.stream().id());
        }
        other => panic!("unexpected event {other:?}"),
    }

    let sessions = viewer.sessions().await;
    assert_eq!(sessions.len(), 1);
    assert!(viewer.pending().await.is_empty());

    viewer.dispose().await;
    sensor.dispose().await;
}

#[tokio::test]
async fn wrong_credential_is_rejected_without_a_session() {
    let harness = Harness::new();
    let sensor = harness.sensor("Cam1", "hunter2").await;
    let viewer = harness.viewer("letmein", Duration::from_secs(2)).await;
    let mut events = viewer.subscribe();

    match next_event(&mut events).await {
        ViewerEvent::AttemptFailed { peer_id, outcome } => {
            assert_eq!(&peer_id, sensor.local_peer_id());
            assert_eq!(
                outcome,
                HandshakeOutcome::Rejected(RejectReason::ClosedWithoutReply)
            );
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(viewer.sessions().await.is_empty());

    viewer.dispose().await;
    sensor.dispose().await;
}

#[tokio::test]
async fn tracked_sensor_is_not_contacted_again() {
    let harness = Harness::new();
    let sensor = harness.sensor("Cam1", "hunter2").await;
    let viewer = harness.viewer("hunter2", Duration::from_millis(200)).await;
    let mut events = viewer.subscribe();

    assert!(matches!(
        next_event(&mut events).await,
        ViewerEvent::SensorConnected(_)
    ));

    let polls = harness.registry.discover_count();
    viewer.refresh();
    eventually(|| harness.registry.discover_count() >= polls + 3).await;

    assert!(events.try_recv().is_err());
    assert_eq!(viewer.sessions().await.len(), 1);
    assert!(viewer.pending().await.is_empty());
    assert_eq!(viewer.stats().pending, 0);

    viewer.dispose().await;
    sensor.dispose().await;
}

#[tokio::test]
async fn media_before_reply_waits_for_the_name() {
    let harness = Harness::new();
    let mut scripted = harness.scripted_sensor("S1").await;
    let viewer = harness.viewer("hunter2", Duration::from_secs(3)).await;
    let mut events = viewer.subscribe();

    let data = tokio::time::timeout(EVENT_WAIT, scripted.inbound.data.recv())
        .await
        .expect("viewer dials")
        .expect("data connection");
    let first = data.recv().await.expect("credential");
    protocol::decode::<CredentialMessage>(&first).expect("credential message");

    let stream = test_stream();
    let _media = scripted
        .transport
        .open_media_connection(viewer.local_peer_id(), &stream)
        .expect("open media");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(viewer.sessions().await.is_empty());
    assert_eq!(viewer.pending().await, vec![PeerId::from("S1")]);
    assert!(events.try_recv().is_err());

    data.send(protocol::encode(&NameMessage { name: "Porch".into() }).unwrap())
        .unwrap();
    match next_event(&mut events).await {
        ViewerEvent::SensorConnected(session) => {
            assert_eq!(session.name(), "Porch");
            assert_eq!(session.peer_id(), &PeerId::from("S1"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    eventually(|| data.is_closed()).await;

    viewer.dispose().await;
}

#[tokio::test]
async fn name_without_media_times_out() {
    let harness = Harness::new();
    let mut scripted = harness.scripted_sensor("S1").await;
    let viewer = harness.viewer("hunter2", Duration::from_millis(200)).await;
    let mut events = viewer.subscribe();

    let data = tokio::time::timeout(EVENT_WAIT, scripted.inbound.data.recv())
        .await
        .expect("viewer dials")
        .expect("data connection");
    data.recv().await.expect("credential");
    data.send(protocol::encode(&NameMessage { name: "Cam1".into() }).unwrap())
        .unwrap();

    match next_event(&mut events).await {
        ViewerEvent::AttemptFailed { peer_id, outcome } => {
            assert_eq!(peer_id, PeerId::from("S1"));
            assert_eq!(outcome, HandshakeOutcome::TimedOut);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(data.is_closed());
    assert!(viewer.sessions().await.is_empty());
    assert_eq!(viewer.stats().timers, 0);

    viewer.dispose().await;
}

#[tokio::test]
async fn malformed_reply_is_rejected() {
    let harness = Harness::new();
    let mut scripted = harness.scripted_sensor("S1").await;
    let viewer = harness.viewer("hunter2", Duration::from_secs(2)).await;
    let mut events = viewer.subscribe();

    let data = tokio::time::timeout(EVENT_WAIT, scripted.inbound.data.recv())
        .await
        .expect("viewer dials")
        .expect("data connection");
    data.recv().await.expect("credential");
    data.send(Bytes::from_static(br#"{"hello":"there"}"#)).unwrap();

    match next_event(&mut events).await {
        ViewerEvent::AttemptFailed { outcome, .. } => {
            assert_eq!(
                outcome,
                HandshakeOutcome::Rejected(RejectReason::MalformedReply)
            );
        }
        other => panic!("unexpected event {other:?}"),
    }
    eventually(|| data.is_closed()).await;

    viewer.dispose().await;
}

#[tokio::test]
async fn sensor_hangup_disconnects_the_session() {
    let harness = Harness::new();
    let sensor = harness.sensor("Cam1", "hunter2").await;
    let viewer = harness.viewer("hunter2", Duration::from_secs(2)).await;
    let mut events = viewer.subscribe();

    assert!(matches!(
        next_event(&mut events).await,
        ViewerEvent::SensorConnected(_)
    ));
    let sensor_id = sensor.local_peer_id().clone();
    sensor.dispose().await;

    match next_event(&mut events).await {
        ViewerEvent::SensorDisconnected { peer_id, name } => {
            assert_eq!(peer_id, sensor_id);
            assert_eq!(name, "Cam1");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(viewer.sessions().await.is_empty());

    viewer.dispose().await;
}

#[tokio::test]
async fn reconnecting_sensor_gets_a_fresh_session() {
    let harness = Harness::new();
    let first = harness.sensor("Cam1", "hunter2").await;
    let viewer = harness.viewer("hunter2", Duration::from_millis(200)).await;
    let mut events = viewer.subscribe();

    assert!(matches!(
        next_event(&mut events).await,
        ViewerEvent::SensorConnected(_)
    ));
    let first_id = first.local_peer_id().clone();
    first.dispose().await;
    harness.registry.remove(&site(), &first_id);

    let second = harness.sensor("Cam1", "hunter2").await;
    viewer.refresh();
    loop {
        match next_event(&mut events).await {
            ViewerEvent::SensorConnected(session) => {
                assert_eq!(session.peer_id(), second.local_peer_id());
                assert_eq!(session.name(), "Cam1");
                break;
            }
            ViewerEvent::SensorDisconnected { peer_id, .. } => assert_eq!(peer_id, first_id),
            ViewerEvent::AttemptFailed { .. } => {}
        }
    }

    viewer.dispose().await;
    second.dispose().await;
}

#[tokio::test]
async fn dispose_releases_sessions_attempts_and_timers() {
    let harness = Harness::new();
    let sensor = harness.sensor("Cam1", "hunter2").await;
    let mut silent = harness.scripted_sensor("S2").await;
    let viewer = harness.viewer("hunter2", Duration::from_secs(30)).await;
    let mut events = viewer.subscribe();

    assert!(matches!(
        next_event(&mut events).await,
        ViewerEvent::SensorConnected(_)
    ));
    let silent_data = tokio::time::timeout(EVENT_WAIT, silent.inbound.data.recv())
        .await
        .expect("viewer dials the silent peer")
        .expect("data connection");
    eventually(|| viewer.stats().pending == 1 && viewer.stats().tracked == 1).await;
    assert_eq!(viewer.stats().timers, 1);

    viewer.dispose().await;

    assert_eq!(viewer.stats(), ManagerStats::default());
    assert!(silent_data.is_closed());
    assert_eq!(silent.transport.open_connection_count(), 0);
    eventually(|| sensor.open_connection_count() == 0).await;
    assert!(!harness.network.contains(viewer.local_peer_id()));

    sensor.dispose().await;
}

#[tokio::test]
async fn site_bound_secret_connects_when_both_sides_agree() {
    let harness = Harness::new();
    let mut sensor_config = SensorConfig::new(site(), "Cam1", "hunter2");
    sensor_config.binding = SecretBinding::SiteAndPassword;
    let sensor = harness.sensor_with(sensor_config).await;

    let mut viewer_config = ViewerConfig::new(site(), "hunter2");
    viewer_config.binding = SecretBinding::SiteAndPassword;
    viewer_config.handshake_timeout = Duration::from_secs(2);
    viewer_config.discover_interval = Duration::from_secs(2);
    let viewer = harness.viewer_with(viewer_config).await;
    let mut events = viewer.subscribe();

    assert!(matches!(
        next_event(&mut events).await,
        ViewerEvent::SensorConnected(_)
    ));

    viewer.dispose().await;
    sensor.dispose().await;
}

/// Local network whose media from one peer never carries a stream, as when a
/// remote track stalls before it is negotiated.
struct WithheldStream {
    network: LocalPeerNetwork,
    peer_id: PeerId,
}

#[async_trait]
impl TransportProvider for WithheldStream {
    async fn open(&self) -> Result<OpenedTransport, TransportError> {
        let OpenedTransport { transport, inbound } = self.network.open().await?;
        let InboundConnections {
            data,
            media: mut upstream,
        } = inbound;
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let withheld = self.peer_id.clone();
        tokio::spawn(async move {
            while let Some(media) = upstream.recv().await {
                let forwarded = if media.peer_id() == &withheld {
                    let terminated = CancellationToken::new();
                    let stalled =
                        MediaConnection::new(media.peer_id().clone(), media.id(), terminated.clone());
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = media.closed() => terminated.cancel(),
                            _ = terminated.cancelled() => media.close(),
                        }
                    });
                    stalled
                } else {
                    media
                };
                if media_tx.send(forwarded).is_err() {
                    break;
                }
            }
        });
        Ok(OpenedTransport {
            transport,
            inbound: InboundConnections {
                data,
                media: media_rx,
            },
        })
    }
}

#[derive(Default)]
struct RecordingSink {
    log: Mutex<Vec<String>>,
}

impl RenderSink for RecordingSink {
    fn attach(&self, peer_id: &PeerId, name: &str, _stream: MediaStream) {
        self.log.lock().push(format!("attach {peer_id} {name}"));
    }

    fn detach(&self, peer_id: &PeerId) {
        self.log.lock().push(format!("detach {peer_id}"));
    }
}

#[tokio::test]
async fn renderer_follows_session_lifecycle() {
    let harness = Harness::new();
    let sensor = harness.sensor("Cam1", "hunter2").await;
    let viewer = harness.viewer("hunter2", Duration::from_secs(2)).await;
    let sink = Arc::new(RecordingSink::default());
    let renderer = attach_renderer(&viewer, sink.clone());

    let expected_attach = format!("attach {} Cam1", sensor.local_peer_id());
    eventually(|| sink.log.lock().contains(&expected_attach)).await;

    viewer.dispose().await;
    tokio::time::timeout(EVENT_WAIT, renderer)
        .await
        .expect("renderer stops")
        .expect("renderer task");
    let log = sink.log.lock().clone();
    assert_eq!(
        log,
        vec![
            expected_attach,
            format!("detach {}", sensor.local_peer_id())
        ]
    );

    sensor.dispose().await;
}

#[tokio::test]
async fn stalled_stream_does_not_hold_back_other_sensors() {
    let harness = Harness::new();
    let mut scripted = harness.scripted_sensor("S1").await;
    let provider = Arc::new(WithheldStream {
        network: harness.network.clone(),
        peer_id: PeerId::from("S1"),
    });
    let mut config = ViewerConfig::new(site(), "hunter2");
    config.handshake_timeout = Duration::from_secs(2);
    config.discover_interval = Duration::from_secs(2);
    let viewer = harness.viewer_over(provider, config).await;
    let mut events = viewer.subscribe();
    let sink = Arc::new(RecordingSink::default());
    let renderer = attach_renderer(&viewer, sink.clone());

    let data = tokio::time::timeout(EVENT_WAIT, scripted.inbound.data.recv())
        .await
        .expect("viewer dials")
        .expect("data connection");
    data.recv().await.expect("credential");
    data.send(protocol::encode(&NameMessage { name: "Porch".into() }).unwrap())
        .unwrap();
    let stream = test_stream();
    let stalled_media = scripted
        .transport
        .open_media_connection(viewer.local_peer_id(), &stream)
        .expect("open media");
    match next_event(&mut events).await {
        ViewerEvent::SensorConnected(session) => assert_eq!(session.name(), "Porch"),
        other => panic!("unexpected event {other:?}"),
    }

    let cam2 = harness.sensor("Cam2", "hunter2").await;
    viewer.refresh();
    let expected_attach = format!("attach {} Cam2", cam2.local_peer_id());
    eventually(|| sink.log.lock().contains(&expected_attach)).await;

    stalled_media.close();
    loop {
        match next_event(&mut events).await {
            ViewerEvent::SensorDisconnected { peer_id, .. } => {
                assert_eq!(peer_id, PeerId::from("S1"));
                break;
            }
            ViewerEvent::SensorConnected(_) => {}
            other => panic!("unexpected event {other:?}"),
        }
    }

    viewer.dispose().await;
    tokio::time::timeout(EVENT_WAIT, renderer)
        .await
        .expect("renderer stops")
        .expect("renderer task");
    assert_eq!(
        sink.log.lock().clone(),
        vec![expected_attach, format!("detach {}", cam2.local_peer_id())]
    );

    cam2.dispose().await;
}

#[tokio::test]
async fn renderer_picks_up_sessions_connected_before_it() {
    let harness = Harness::new();
    let sensor = harness.sensor("Cam1", "hunter2").await;
    let viewer = harness.viewer("hunter2", Duration::from_secs(2)).await;
    let mut events = viewer.subscribe();
    assert!(matches!(
        next_event(&mut events).await,
        ViewerEvent::SensorConnected(_)
    ));

    let sink = Arc::new(RecordingSink::default());
    let renderer = attach_renderer(&viewer, sink.clone());
    let expected_attach = format!("attach {} Cam1", sensor.local_peer_id());
    eventually(|| sink.log.lock().contains(&expected_attach)).await;

    sensor.dispose().await;
    let expected_detach = format!("detach {}", sensor.local_peer_id());
    eventually(|| sink.log.lock().contains(&expected_detach)).await;

    viewer.dispose().await;
    tokio::time::timeout(EVENT_WAIT, renderer)
        .await
        .expect("renderer stops")
        .expect("renderer task");
    assert_eq!(sink.log.lock().clone(), vec![expected_attach, expected_detach]);
}
