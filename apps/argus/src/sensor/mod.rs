//! Sensor role: owns the capture stream and the transport, announces itself to
//! the registry, and answers every inbound handshake.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{AuthError, CredentialScheme, Secret, SecretBinding};
use crate::capture::{CaptureError, CaptureSource, WakeLock};
use crate::handshake::{Responder, ResponderOutcome};
use crate::model::{PeerId, Site};
use crate::registry::{Registry, RegistryClient};
use crate::transport::{
    DataConnection, MediaConnection, MediaStream, PeerTransport, TransportError,
    TransportProvider,
};

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("invalid sensor configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SensorState {
    Idle,
    Registering,
    Serving,
    Disposed,
}

#[derive(Clone, Debug)]
pub struct SensorConfig {
    pub site: Site,
    pub name: String,
    pub password: String,
    pub binding: SecretBinding,
    pub announce_interval: Duration,
    pub handshake_timeout: Duration,
}

impl SensorConfig {
    pub fn new(site: Site, name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            site,
            name: name.into(),
            password: password.into(),
            binding: SecretBinding::default(),
            announce_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
        }
    }

    pub fn validate(&self) -> Result<(), SensorError> {
        if self.site.as_str().trim().is_empty() {
            return Err(SensorError::InvalidConfig("site cannot be empty".into()));
        }
        if self.name.trim().is_empty() {
            return Err(SensorError::InvalidConfig("name cannot be empty".into()));
        }
        if self.announce_interval.is_zero() {
            return Err(SensorError::InvalidConfig(
                "announce interval must be non-zero".into(),
            ));
        }
        if self.handshake_timeout.is_zero() {
            return Err(SensorError::InvalidConfig(
                "handshake timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Collaborators the sensor borrows from its host.
#[derive(Clone)]
pub struct SensorDeps {
    pub provider: Arc<dyn TransportProvider>,
    pub registry: Arc<dyn Registry>,
    pub capture: Arc<dyn CaptureSource>,
    pub scheme: Arc<dyn CredentialScheme>,
    pub wake_lock: Option<Arc<dyn WakeLock>>,
}

pub struct Sensor {
    site: Site,
    local_peer_id: PeerId,
    stream: MediaStream,
    transport: Arc<dyn PeerTransport>,
    state: watch::Sender<SensorState>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    wake_lock: Option<Arc<dyn WakeLock>>,
    disposed: AtomicBool,
}

impl Sensor {
    /// Acquires the capture device and registers with the transport. Either
    /// failing aborts construction with nothing left running.
    pub async fn start(config: SensorConfig, deps: SensorDeps) -> Result<Sensor, SensorError> {
        config.validate()?;
        let secret = Secret::new(config.site.clone(), config.password.clone(), config.binding)?;
        let (state, _) = watch::channel(SensorState::Idle);

        let stream = deps.capture.acquire().await?;
        state.send_replace(SensorState::Registering);
        let opened = match deps.provider.open().await {
            Ok(opened) => opened,
            Err(err) => {
                stream.stop();
                return Err(err.into());
            }
        };
        let local_peer_id = opened.local_peer_id().clone();
        let transport = opened.transport;
        let inbound = opened.inbound;

        // Only a lock that was actually taken is released later.
        let wake_lock = deps.wake_lock.filter(|lock| match lock.acquire() {
            Ok(()) => true,
            Err(err) => {
                warn!(target: "argus::sensor", error = %err, "wake lock unavailable");
                false
            }
        });

        let shutdown = CancellationToken::new();
        let registry = RegistryClient::new(deps.registry.clone());
        let heartbeat = tokio::spawn(heartbeat_loop(
            registry,
            config.site.clone(),
            local_peer_id.clone(),
            config.announce_interval,
            shutdown.clone(),
        ));
        let responder = Responder::new(
            secret,
            deps.scheme.clone(),
            config.name.clone(),
            config.handshake_timeout,
        );
        let accept = tokio::spawn(accept_loop(
            responder,
            transport.clone(),
            stream.clone(),
            inbound.data,
            inbound.media,
            shutdown.clone(),
        ));

        state.send_replace(SensorState::Serving);
        info!(
            target: "argus::sensor",
            site = %config.site,
            peer_id = %local_peer_id,
            name = %config.name,
            "sensor serving"
        );

        Ok(Sensor {
            site: config.site,
            local_peer_id,
            stream,
            transport,
            state,
            shutdown,
            tasks: Mutex::new(vec![heartbeat, accept]),
            wake_lock,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> SensorState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SensorState> {
        self.state.subscribe()
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    pub fn site(&self) -> &Site {
        &self.site
    }

    pub fn stream(&self) -> &MediaStream {
        &self.stream
    }

    pub fn open_connection_count(&self) -> usize {
        self.transport.open_connection_count()
    }

    /// Stops announcing, closes every connection and releases the device.
    /// Later calls are no-ops.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                if err.is_panic() {
                    warn!(target: "argus::sensor", error = %err, "sensor task panicked");
                }
            }
        }
        self.transport.close().await;
        self.stream.stop();
        if let Some(lock) = &self.wake_lock {
            lock.release();
        }
        self.state.send_replace(SensorState::Disposed);
        info!(target: "argus::sensor", peer_id = %self.local_peer_id, "sensor disposed");
    }
}

impl Drop for Sensor {
    fn drop(&mut self) {
        if !self.disposed.load(Ordering::SeqCst) {
            self.shutdown.cancel();
            self.stream.stop();
            if let Some(lock) = &self.wake_lock {
                lock.release();
            }
        }
    }
}

async fn heartbeat_loop(
    registry: RegistryClient,
    site: Site,
    peer_id: PeerId,
    interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            result = registry.announce(&site, &peer_id) => {
                if let Err(err) = result {
                    warn!(target: "argus::sensor", site = %site, error = %err, "announce failed");
                }
            }
        }
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!(target: "argus::sensor", "heartbeat stopped");
}

async fn accept_loop(
    responder: Responder,
    transport: Arc<dyn PeerTransport>,
    stream: MediaStream,
    mut data: mpsc::UnboundedReceiver<DataConnection>,
    mut media: mpsc::UnboundedReceiver<MediaConnection>,
    shutdown: CancellationToken,
) {
    let mut handshakes = tokio::task::JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            connection = data.recv() => {
                let Some(connection) = connection else { break };
                debug!(
                    target: "argus::sensor",
                    peer_id = %connection.peer_id(),
                    connection_id = connection.id(),
                    "inbound data connection"
                );
                let responder = responder.clone();
                let transport = transport.clone();
                let stream = stream.clone();
                let cancel = shutdown.child_token();
                handshakes.spawn(async move {
                    let peer_id = connection.peer_id().clone();
                    let outcome = responder
                        .respond(connection, transport.as_ref(), &stream, &cancel)
                        .await;
                    if outcome != ResponderOutcome::Accepted {
                        debug!(target: "argus::sensor", peer_id = %peer_id, outcome = ?outcome, "handshake ended");
                    }
                });
            }
            Some(unexpected) = media.recv() => {
                debug!(
                    target: "argus::sensor",
                    peer_id = %unexpected.peer_id(),
                    "refusing inbound media connection"
                );
                unexpected.close();
            }
            Some(_) = handshakes.join_next(), if !handshakes.is_empty() => {}
        }
    }
    handshakes.shutdown().await;
}
