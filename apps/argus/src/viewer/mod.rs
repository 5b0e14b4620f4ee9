//! Viewer role: discovers sensors for a site, authenticates to each one and
//! keeps a session per sensor whose media is flowing.
//!
//! All session state lives in a single actor task. Handshake readers, media
//! watchers and the registry poller only report into it over channels; the
//! pending and tracked maps are never touched from anywhere else.

use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{DelayQueue, delay_queue};
use tracing::{debug, info, warn};

pub mod presenter;

pub use presenter::attach_renderer;

use crate::auth::{AuthError, Credential, CredentialScheme, Secret, SecretBinding};
use crate::handshake::{
    AckEvent, HandshakeEvent, HandshakeOutcome, HandshakeState, read_ack, send_credential,
};
use crate::model::{PeerId, Site};
use crate::registry::{Discovery, Registry, RegistryClient};
use crate::transport::{
    DataConnection, InboundConnections, MediaConnection, PeerTransport, TransportError,
    TransportProvider,
};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum ViewerError {
    #[error("invalid viewer configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Clone, Debug)]
pub struct ViewerConfig {
    pub site: Site,
    pub password: String,
    pub binding: SecretBinding,
    pub discover_interval: Duration,
    pub handshake_timeout: Duration,
}

impl ViewerConfig {
    pub fn new(site: Site, password: impl Into<String>) -> Self {
        Self {
            site,
            password: password.into(),
            binding: SecretBinding::default(),
            discover_interval: Duration::from_secs(20),
            handshake_timeout: Duration::from_secs(10),
        }
    }

    /// The poll interval may not undercut the handshake timeout, otherwise a
    /// slow attempt would still be pending when the same peer is rediscovered.
    pub fn validate(&self) -> Result<(), ViewerError> {
        if self.site.as_str().trim().is_empty() {
            return Err(ViewerError::InvalidConfig("site cannot be empty".into()));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ViewerError::InvalidConfig(
                "handshake timeout must be non-zero".into(),
            ));
        }
        if self.discover_interval < self.handshake_timeout {
            return Err(ViewerError::InvalidConfig(format!(
                "discover interval {:?} is shorter than the handshake timeout {:?}",
                self.discover_interval, self.handshake_timeout
            )));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct ViewerDeps {
    pub provider: Arc<dyn TransportProvider>,
    pub registry: Arc<dyn Registry>,
    pub scheme: Arc<dyn CredentialScheme>,
}

/// A sensor whose credential check passed and whose media arrived.
#[derive(Clone, Debug)]
pub struct SensorSession {
    peer_id: PeerId,
    name: String,
    media: MediaConnection,
}

impl SensorSession {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn media(&self) -> &MediaConnection {
        &self.media
    }
}

#[derive(Clone, Debug)]
pub enum ViewerEvent {
    SensorConnected(SensorSession),
    SensorDisconnected { peer_id: PeerId, name: String },
    AttemptFailed {
        peer_id: PeerId,
        outcome: HandshakeOutcome,
    },
}

/// Snapshot of the manager's bookkeeping, refreshed after every step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub pending: usize,
    pub tracked: usize,
    pub timers: usize,
    pub open_connections: usize,
}

enum Command {
    Sessions(oneshot::Sender<Vec<SensorSession>>),
    Pending(oneshot::Sender<Vec<PeerId>>),
}

struct AckReport {
    peer_id: PeerId,
    attempt: u64,
    event: AckEvent,
}

struct SessionEnded {
    peer_id: PeerId,
    connection_id: String,
}

type DiscoveryReport = (Discovery, oneshot::Sender<()>);

struct PendingHandshake {
    attempt: u64,
    state: HandshakeState,
    data: DataConnection,
    name: Option<String>,
    media: Option<MediaConnection>,
    /// `None` once the timer has fired.
    timer: Option<delay_queue::Key>,
    reader: CancellationToken,
}

struct TrackedSession {
    session: SensorSession,
    watcher: CancellationToken,
}

struct Channels {
    commands: mpsc::UnboundedReceiver<Command>,
    discoveries: mpsc::UnboundedReceiver<DiscoveryReport>,
    acks: mpsc::UnboundedReceiver<AckReport>,
    ended: mpsc::UnboundedReceiver<SessionEnded>,
    inbound: InboundConnections,
}

pub struct ViewerSessionManager {
    local_peer_id: PeerId,
    credential: Credential,
    handshake_timeout: Duration,
    transport: Arc<dyn PeerTransport>,
    pending: HashMap<PeerId, PendingHandshake>,
    tracked: HashMap<PeerId, TrackedSession>,
    timers: DelayQueue<(PeerId, u64)>,
    next_attempt: u64,
    events: broadcast::Sender<ViewerEvent>,
    stats: watch::Sender<ManagerStats>,
    acks: mpsc::UnboundedSender<AckReport>,
    ended: mpsc::UnboundedSender<SessionEnded>,
    shutdown: CancellationToken,
}

impl ViewerSessionManager {
    /// Derives the credential, opens the transport and starts polling.
    pub async fn start(config: ViewerConfig, deps: ViewerDeps) -> Result<ViewerHandle, ViewerError> {
        config.validate()?;
        let secret = Secret::new(config.site.clone(), config.password.clone(), config.binding)?;
        let scheme = deps.scheme.clone();
        let credential = tokio::task::spawn_blocking(move || scheme.derive(&secret))
            .await
            .map_err(|err| AuthError::Derive(err.to_string()))??;

        let opened = deps.provider.open().await?;
        let local_peer_id = opened.local_peer_id().clone();

        let shutdown = CancellationToken::new();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (stats_tx, stats_rx) = watch::channel(ManagerStats::default());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (discovery_tx, discovery_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let refresh = Arc::new(Notify::new());

        let manager = ViewerSessionManager {
            local_peer_id: local_peer_id.clone(),
            credential,
            handshake_timeout: config.handshake_timeout,
            transport: opened.transport,
            pending: HashMap::new(),
            tracked: HashMap::new(),
            timers: DelayQueue::new(),
            next_attempt: 0,
            events: events.clone(),
            stats: stats_tx,
            acks: ack_tx,
            ended: ended_tx,
            shutdown: shutdown.clone(),
        };
        let channels = Channels {
            commands: command_rx,
            discoveries: discovery_rx,
            acks: ack_rx,
            ended: ended_rx,
            inbound: opened.inbound,
        };
        let actor = tokio::spawn(manager.run(channels));
        let poller = tokio::spawn(poll_loop(
            RegistryClient::new(deps.registry.clone()),
            config.site.clone(),
            config.discover_interval,
            refresh.clone(),
            discovery_tx,
            shutdown.clone(),
        ));

        info!(
            target: "argus::viewer",
            site = %config.site,
            peer_id = %local_peer_id,
            "viewer started"
        );
        Ok(ViewerHandle {
            inner: Arc::new(HandleInner {
                local_peer_id,
                site: config.site,
                commands: command_tx,
                events,
                stats: stats_rx,
                refresh,
                shutdown,
                tasks: Mutex::new(vec![actor, poller]),
            }),
        })
    }

    async fn run(mut self, mut channels: Channels) {
        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(command) = channels.commands.recv() => self.on_command(command),
                Some((discovery, done)) = channels.discoveries.recv() => {
                    self.on_discovery(discovery);
                    let _ = done.send(());
                }
                Some(report) = channels.acks.recv() => self.on_ack(report),
                Some(media) = channels.inbound.media.recv() => self.on_inbound_media(media),
                Some(ended) = channels.ended.recv() => self.on_session_ended(ended),
                Some(expired) = self.timers.next() => {
                    let (peer_id, attempt) = expired.into_inner();
                    self.on_timeout(peer_id, attempt);
                }
                Some(data) = channels.inbound.data.recv() => {
                    debug!(
                        target: "argus::viewer",
                        peer_id = %data.peer_id(),
                        "closing inbound data connection"
                    );
                    data.close();
                }
            }
            self.publish_stats();
        }
        self.teardown().await;
    }

    fn on_command(&self, command: Command) {
        match command {
            Command::Sessions(reply) => {
                let sessions = self
                    .tracked
                    .values()
                    .map(|tracked| tracked.session.clone())
                    .collect();
                let _ = reply.send(sessions);
            }
            Command::Pending(reply) => {
                let _ = reply.send(self.pending.keys().cloned().collect());
            }
        }
    }

    fn on_discovery(&mut self, discovery: Discovery) {
        if discovery.stale {
            debug!(
                target: "argus::viewer",
                peers = discovery.peer_ids.len(),
                "using last known peers"
            );
        }
        for peer_id in discovery.peer_ids {
            if peer_id == self.local_peer_id
                || self.pending.contains_key(&peer_id)
                || self.tracked.contains_key(&peer_id)
            {
                continue;
            }
            self.start_attempt(peer_id);
        }
    }

    fn start_attempt(&mut self, peer_id: PeerId) {
        let data = match self.transport.open_data_connection(&peer_id) {
            Ok(data) => data,
            Err(err) => {
                warn!(target: "argus::viewer", peer_id = %peer_id, error = %err, "cannot open data connection");
                return;
            }
        };
        self.next_attempt += 1;
        let attempt = self.next_attempt;

        let state = match send_credential(&data, &self.credential) {
            Ok(()) => HandshakeState::Connecting.step(HandshakeEvent::CredentialSent),
            Err(err) => {
                debug!(target: "argus::viewer", peer_id = %peer_id, error = %err, "credential not sent");
                HandshakeState::Connecting.step(HandshakeEvent::DataClosed)
            }
        };
        if let Some(outcome) = state.outcome() {
            data.close();
            self.report_failure(peer_id, outcome);
            return;
        }

        let timer = self
            .timers
            .insert((peer_id.clone(), attempt), self.handshake_timeout);
        let reader = self.shutdown.child_token();
        {
            let reader = reader.clone();
            let data = data.clone();
            let acks = self.acks.clone();
            let peer_id = peer_id.clone();
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = reader.cancelled() => {}
                    event = read_ack(&data) => {
                        let _ = acks.send(AckReport { peer_id, attempt, event });
                    }
                }
            });
        }

        debug!(target: "argus::viewer", peer_id = %peer_id, attempt, "handshake started");
        self.pending.insert(
            peer_id,
            PendingHandshake {
                attempt,
                state,
                data,
                name: None,
                media: None,
                timer: Some(timer),
                reader,
            },
        );
    }

    fn on_ack(&mut self, report: AckReport) {
        let Some(pending) = self.pending.get_mut(&report.peer_id) else {
            return;
        };
        if pending.attempt != report.attempt {
            return;
        }
        let event = match report.event {
            AckEvent::Reply(name) => {
                if pending.media.as_ref().is_some_and(MediaConnection::is_closed) {
                    pending.media = None;
                    pending.state = pending.state.step(HandshakeEvent::MediaClosed);
                }
                pending.name = Some(name);
                HandshakeEvent::Reply
            }
            AckEvent::Malformed => HandshakeEvent::Malformed,
            AckEvent::Closed => HandshakeEvent::DataClosed,
        };
        pending.state = pending.state.step(event);
        if pending.state.is_terminal() {
            self.resolve(&report.peer_id);
        }
    }

    fn on_inbound_media(&mut self, media: MediaConnection) {
        let peer_id = media.peer_id().clone();
        let Some(pending) = self.pending.get_mut(&peer_id) else {
            debug!(
                target: "argus::viewer",
                peer_id = %peer_id,
                connection_id = media.id(),
                "closing unsolicited media connection"
            );
            media.close();
            return;
        };
        if let Some(existing) = &pending.media {
            if !existing.is_closed() {
                debug!(target: "argus::viewer", peer_id = %peer_id, "dropping duplicate media connection");
                media.close();
                return;
            }
        }
        pending.media = Some(media);
        pending.state = pending.state.step(HandshakeEvent::MediaArrived);
        if pending.state.is_terminal() {
            self.resolve(&peer_id);
        }
    }

    fn on_timeout(&mut self, peer_id: PeerId, attempt: u64) {
        match self.pending.get_mut(&peer_id) {
            Some(pending) if pending.attempt == attempt => {
                pending.timer = None;
                pending.state = pending.state.step(HandshakeEvent::Timeout);
            }
            _ => return,
        }
        self.resolve(&peer_id);
    }

    /// Retires a pending attempt that reached a terminal state. Every exit
    /// path goes through here so the timer, reader and data connection are
    /// always released.
    fn resolve(&mut self, peer_id: &PeerId) {
        let Some(mut pending) = self.pending.remove(peer_id) else {
            return;
        };
        if let Some(key) = pending.timer.take() {
            self.timers.remove(&key);
        }
        pending.reader.cancel();
        pending.data.close();

        match (pending.state.outcome(), pending.name, pending.media) {
            (Some(HandshakeOutcome::Established), Some(name), Some(media)) => {
                self.track(peer_id.clone(), name, media);
            }
            (outcome, _, media) => {
                if let Some(media) = media {
                    media.close();
                }
                let outcome = match outcome {
                    Some(HandshakeOutcome::Established) | None => HandshakeOutcome::Terminated,
                    Some(outcome) => outcome,
                };
                self.report_failure(peer_id.clone(), outcome);
            }
        }
    }

    fn track(&mut self, peer_id: PeerId, name: String, media: MediaConnection) {
        let watcher = self.shutdown.child_token();
        {
            let watcher = watcher.clone();
            let media = media.clone();
            let ended = self.ended.clone();
            let peer_id = peer_id.clone();
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = watcher.cancelled() => {}
                    _ = media.closed() => {
                        let _ = ended.send(SessionEnded {
                            peer_id,
                            connection_id: media.id().to_owned(),
                        });
                    }
                }
            });
        }
        let session = SensorSession {
            peer_id: peer_id.clone(),
            name,
            media,
        };
        info!(
            target: "argus::viewer",
            peer_id = %peer_id,
            name = %session.name,
            "sensor connected"
        );
        self.tracked.insert(
            peer_id,
            TrackedSession {
                session: session.clone(),
                watcher,
            },
        );
        self.emit(ViewerEvent::SensorConnected(session));
    }

    fn on_session_ended(&mut self, ended: SessionEnded) {
        let current = self
            .tracked
            .get(&ended.peer_id)
            .is_some_and(|tracked| tracked.session.media.id() == ended.connection_id);
        if !current {
            return;
        }
        if let Some(tracked) = self.tracked.remove(&ended.peer_id) {
            tracked.watcher.cancel();
            info!(target: "argus::viewer", peer_id = %ended.peer_id, "sensor disconnected");
            self.emit(ViewerEvent::SensorDisconnected {
                peer_id: ended.peer_id,
                name: tracked.session.name,
            });
        }
    }

    fn report_failure(&self, peer_id: PeerId, outcome: HandshakeOutcome) {
        info!(target: "argus::viewer", peer_id = %peer_id, outcome = %outcome, "handshake failed");
        self.emit(ViewerEvent::AttemptFailed { peer_id, outcome });
    }

    fn emit(&self, event: ViewerEvent) {
        let _ = self.events.send(event);
    }

    fn publish_stats(&self) {
        debug_assert!(
            self.pending.keys().all(|id| !self.tracked.contains_key(id)),
            "peer id both pending and tracked"
        );
        self.stats.send_replace(ManagerStats {
            pending: self.pending.len(),
            tracked: self.tracked.len(),
            timers: self.timers.len(),
            open_connections: self.transport.open_connection_count(),
        });
    }

    async fn teardown(&mut self) {
        let pending: Vec<_> = self.pending.drain().collect();
        for (peer_id, mut pending) in pending {
            pending.state = pending.state.step(HandshakeEvent::Cancelled);
            pending.reader.cancel();
            pending.data.close();
            if let Some(media) = pending.media {
                media.close();
            }
            let outcome = pending
                .state
                .outcome()
                .unwrap_or(HandshakeOutcome::Terminated);
            self.emit(ViewerEvent::AttemptFailed { peer_id, outcome });
        }
        self.timers.clear();

        let tracked: Vec<_> = self.tracked.drain().collect();
        for (peer_id, tracked) in tracked {
            tracked.watcher.cancel();
            tracked.session.media.close();
            self.emit(ViewerEvent::SensorDisconnected {
                peer_id,
                name: tracked.session.name,
            });
        }

        self.transport.close().await;
        self.publish_stats();
        info!(target: "argus::viewer", peer_id = %self.local_peer_id, "viewer disposed");
    }
}

async fn poll_loop(
    registry: RegistryClient,
    site: Site,
    interval: Duration,
    refresh: Arc<Notify>,
    discoveries: mpsc::UnboundedSender<DiscoveryReport>,
    shutdown: CancellationToken,
) {
    loop {
        let discovery = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            discovery = registry.discover(&site) => discovery,
        };
        let (done_tx, done_rx) = oneshot::channel();
        if discoveries.send((discovery, done_tx)).is_err() {
            break;
        }
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = done_rx => {}
        }
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = refresh.notified() => {}
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!(target: "argus::viewer", site = %site, "discovery stopped");
}

/// Cheap, cloneable front end to a running manager.
#[derive(Clone)]
pub struct ViewerHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    local_peer_id: PeerId,
    site: Site,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ViewerEvent>,
    stats: watch::Receiver<ManagerStats>,
    refresh: Arc<Notify>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ViewerHandle {
    pub fn local_peer_id(&self) -> &PeerId {
        &self.inner.local_peer_id
    }

    pub fn site(&self) -> &Site {
        &self.inner.site
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ViewerEvent> {
        self.inner.events.subscribe()
    }

    /// Connected sensors. Empty once disposed.
    pub async fn sessions(&self) -> Vec<SensorSession> {
        self.session_snapshot().await
    }

    /// Same as [`ViewerHandle::sessions`] but holds only the command sender,
    /// so a background task awaiting it does not keep the handle alive.
    pub(crate) fn session_snapshot(
        &self,
    ) -> impl std::future::Future<Output = Vec<SensorSession>> + Send + 'static {
        let (reply, response) = oneshot::channel();
        let sent = self.inner.commands.send(Command::Sessions(reply)).is_ok();
        async move {
            if !sent {
                return Vec::new();
            }
            response.await.unwrap_or_default()
        }
    }

    /// Peer ids with a handshake in flight.
    pub async fn pending(&self) -> Vec<PeerId> {
        let (reply, response) = oneshot::channel();
        if self.inner.commands.send(Command::Pending(reply)).is_err() {
            return Vec::new();
        }
        response.await.unwrap_or_default()
    }

    pub fn stats(&self) -> ManagerStats {
        *self.inner.stats.borrow()
    }

    /// Cuts the current poll delay short.
    pub fn refresh(&self) {
        self.inner.refresh.notify_one();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub async fn disposed(&self) {
        self.inner.shutdown.cancelled().await;
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Stops polling, abandons pending handshakes, closes every session and
    /// the transport. Safe to call more than once.
    pub async fn dispose(&self) {
        self.inner.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                if err.is_panic() {
                    warn!(target: "argus::viewer", error = %err, "viewer task panicked");
                }
            }
        }
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Argon2Scheme, KdfParams};
    use crate::registry::MemoryRegistry;
    use crate::transport::local::LocalPeerNetwork;
    use crate::transport::{MediaStream, MediaTrack, TrackKind};

    fn deps(network: &LocalPeerNetwork, registry: Arc<MemoryRegistry>) -> ViewerDeps {
        ViewerDeps {
            provider: Arc::new(network.clone()),
            registry,
            scheme: Arc::new(
                Argon2Scheme::new(KdfParams {
                    memory_kib: 64,
                    iterations: 1,
                    parallelism: 1,
                })
                .unwrap(),
            ),
        }
    }

    #[test]
    fn discover_interval_may_not_undercut_the_timeout() {
        let mut config = ViewerConfig::new(Site::from("lab"), "hunter2");
        assert!(config.validate().is_ok());

        config.discover_interval = Duration::from_secs(5);
        assert!(matches!(config.validate(), Err(ViewerError::InvalidConfig(_))));

        config.discover_interval = Duration::from_secs(10);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn offline_transport_fails_start() {
        let network = LocalPeerNetwork::new();
        network.set_offline(true);
        let result = ViewerSessionManager::start(
            ViewerConfig::new(Site::from("lab"), "hunter2"),
            deps(&network, Arc::new(MemoryRegistry::new())),
        )
        .await;
        assert!(matches!(
            result,
            Err(ViewerError::Transport(TransportError::Unavailable(_)))
        ));
    }

    #[tokio::test]
    async fn unsolicited_media_is_closed() {
        let network = LocalPeerNetwork::new();
        let viewer = ViewerSessionManager::start(
            ViewerConfig::new(Site::from("lab"), "hunter2"),
            deps(&network, Arc::new(MemoryRegistry::new())),
        )
        .await
        .unwrap();

        let stranger = network.open_as(PeerId::from("X1")).unwrap();
        let stream = MediaStream::new(vec![MediaTrack::new(TrackKind::Video)]);
        let media = stranger
            .transport
            .open_media_connection(viewer.local_peer_id(), &stream)
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), media.closed())
            .await
            .unwrap();
        assert!(viewer.sessions().await.is_empty());
        viewer.dispose().await;
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_empties_the_handle() {
        let network = LocalPeerNetwork::new();
        let viewer = ViewerSessionManager::start(
            ViewerConfig::new(Site::from("lab"), "hunter2"),
            deps(&network, Arc::new(MemoryRegistry::new())),
        )
        .await
        .unwrap();

        viewer.dispose().await;
        viewer.dispose().await;
        assert!(viewer.is_disposed());
        assert!(viewer.sessions().await.is_empty());
        assert!(viewer.pending().await.is_empty());
        assert_eq!(viewer.stats(), ManagerStats::default());
        assert!(!network.contains(viewer.local_peer_id()));
    }

    #[tokio::test]
    async fn dispose_cancels_pending_attempts() {
        let network = LocalPeerNetwork::new();
        let registry = Arc::new(MemoryRegistry::new());
        let mut silent = network.open_as(PeerId::from("S1")).unwrap();
        registry
            .announce(&Site::from("lab"), &PeerId::from("S1"))
            .await
            .unwrap();

        let viewer = ViewerSessionManager::start(
            ViewerConfig::new(Site::from("lab"), "hunter2"),
            deps(&network, registry),
        )
        .await
        .unwrap();
        let mut events = viewer.subscribe();
        let data = tokio::time::timeout(Duration::from_secs(2), silent.inbound.data.recv())
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while viewer.stats().pending != 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        viewer.dispose().await;
        match events.try_recv().unwrap() {
            ViewerEvent::AttemptFailed { peer_id, outcome } => {
                assert_eq!(peer_id, PeerId::from("S1"));
                assert_eq!(outcome, HandshakeOutcome::Terminated);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(data.is_closed());
        assert_eq!(viewer.stats(), ManagerStats::default());
    }
}
