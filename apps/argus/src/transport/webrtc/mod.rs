//! WebRTC provider negotiated through a PeerJS-style broker.
//!
//! Each data or media connection gets its own `RTCPeerConnection`, identified
//! on the wire by a connection id (`dc_*` / `mc_*`). Inbound media is answered
//! receive-only. A connection's termination token is the single release path:
//! whoever cancels it, the watcher spawned at creation closes the peer
//! connection exactly once.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

pub mod config;
pub mod signaling;

pub use config::WebRtcConfig;
use signaling::{ConnectionKind, SignalMessage, SignalPayload, SignalingClient};

use super::connection::ConnectionRegistry;
use super::{
    DataConnection, InboundConnections, MediaConnection, MediaStream, MediaTrack, OpenedTransport,
    PeerTransport, TrackKind, TransportError, TransportProvider,
};
use crate::model::PeerId;

const VIDEO_SAMPLE_DURATION: Duration = Duration::from_millis(33);
const AUDIO_SAMPLE_DURATION: Duration = Duration::from_millis(20);

pub struct WebRtcProvider {
    config: WebRtcConfig,
}

impl WebRtcProvider {
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportProvider for WebRtcProvider {
    async fn open(&self) -> Result<OpenedTransport, TransportError> {
        let peer_id = PeerId::generate();
        let api = build_api()?;
        let (signaling, signals) = SignalingClient::connect(&self.config, &peer_id).await?;
        info!(target: "argus::webrtc", peer_id = %peer_id, "registered with signaling broker");

        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            peer_id,
            api,
            rtc_config: RTCConfiguration {
                ice_servers: self.config.rtc_ice_servers(),
                ..Default::default()
            },
            signaling,
            links: Mutex::new(HashMap::new()),
            connections: ConnectionRegistry::default(),
            inbound_data: data_tx,
            inbound_media: media_tx,
            closed: CancellationToken::new(),
        });

        let dispatcher = tokio::spawn(dispatch_signals(shared.clone(), signals));
        Ok(OpenedTransport {
            transport: Arc::new(WebRtcTransport {
                shared,
                dispatcher: Mutex::new(Some(dispatcher)),
            }),
            inbound: InboundConnections {
                data: data_rx,
                media: media_rx,
            },
        })
    }
}

fn build_api() -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|err| TransportError::Setup(err.to_string()))?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(|err| TransportError::Setup(err.to_string()))?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

struct Shared {
    peer_id: PeerId,
    api: API,
    rtc_config: RTCConfiguration,
    signaling: SignalingClient,
    links: Mutex<HashMap<String, Arc<PeerLink>>>,
    connections: ConnectionRegistry,
    inbound_data: mpsc::UnboundedSender<DataConnection>,
    inbound_media: mpsc::UnboundedSender<MediaConnection>,
    closed: CancellationToken,
}

/// One negotiated peer connection backing a data or media connection.
struct PeerLink {
    remote: PeerId,
    kind: ConnectionKind,
    pc: Arc<RTCPeerConnection>,
    terminated: CancellationToken,
    pending_candidates: Mutex<Option<Vec<RTCIceCandidateInit>>>,
}

impl PeerLink {
    /// Buffers the candidate until a remote description is set.
    fn defer_candidate(&self, candidate: RTCIceCandidateInit) -> Option<RTCIceCandidateInit> {
        let mut pending = self.pending_candidates.lock();
        match pending.as_mut() {
            Some(buffer) => {
                buffer.push(candidate);
                None
            }
            None => Some(candidate),
        }
    }

    async fn apply_remote_description(&self, description: RTCSessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|err| TransportError::Setup(err.to_string()))?;
        let buffered = self.pending_candidates.lock().take().unwrap_or_default();
        for candidate in buffered {
            if let Err(err) = self.pc.add_ice_candidate(candidate).await {
                debug!(target: "argus::webrtc", error = %err, "dropping buffered ice candidate");
            }
        }
        Ok(())
    }
}

pub struct WebRtcTransport {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    fn local_peer_id(&self) -> &PeerId {
        &self.shared.peer_id
    }

    fn open_data_connection(&self, remote: &PeerId) -> Result<DataConnection, TransportError> {
        if self.shared.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let connection_id = format!("dc_{}", uuid::Uuid::new_v4().simple());
        let token = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let connection = DataConnection::new(
            remote.clone(),
            connection_id.clone(),
            outbound_tx,
            inbound_rx,
            token.clone(),
        );
        self.shared.connections.track(&connection_id, token.clone());

        let shared = self.shared.clone();
        let remote = remote.clone();
        tokio::spawn(async move {
            if let Err(err) =
                offer_data(&shared, &remote, &connection_id, token.clone(), inbound_tx, outbound_rx).await
            {
                warn!(
                    target: "argus::webrtc",
                    remote = %remote,
                    connection_id = %connection_id,
                    error = %err,
                    "data connection negotiation failed"
                );
                token.cancel();
            }
        });
        Ok(connection)
    }

    fn open_media_connection(
        &self,
        remote: &PeerId,
        stream: &MediaStream,
    ) -> Result<MediaConnection, TransportError> {
        if self.shared.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let connection_id = format!("mc_{}", uuid::Uuid::new_v4().simple());
        let token = CancellationToken::new();
        let connection = MediaConnection::new(remote.clone(), connection_id.clone(), token.clone());
        self.shared.connections.track(&connection_id, token.clone());

        let shared = self.shared.clone();
        let remote = remote.clone();
        let stream = stream.clone();
        tokio::spawn(async move {
            if let Err(err) = offer_media(&shared, &remote, &connection_id, token.clone(), &stream).await {
                warn!(
                    target: "argus::webrtc",
                    remote = %remote,
                    connection_id = %connection_id,
                    error = %err,
                    "media connection negotiation failed"
                );
                token.cancel();
            }
        });
        Ok(connection)
    }

    fn open_connection_count(&self) -> usize {
        self.shared.connections.open_count()
    }

    async fn close(&self) {
        if self.shared.closed.is_cancelled() {
            return;
        }
        self.shared.closed.cancel();
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            dispatcher.abort();
        }
        let closed = self.shared.connections.close_all();
        let links: Vec<_> = self.shared.links.lock().drain().map(|(_, link)| link).collect();
        for link in links {
            if let Err(err) = link.pc.close().await {
                debug!(target: "argus::webrtc", error = %err, "peer connection close failed");
            }
        }
        self.shared.signaling.close();
        info!(
            target: "argus::webrtc",
            peer_id = %self.shared.peer_id,
            closed_connections = closed,
            "webrtc transport closed"
        );
    }
}

impl Drop for WebRtcTransport {
    fn drop(&mut self) {
        self.shared.closed.cancel();
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            dispatcher.abort();
        }
        self.shared.connections.close_all();
    }
}

async fn new_link(
    shared: &Arc<Shared>,
    remote: &PeerId,
    kind: ConnectionKind,
    connection_id: &str,
    token: CancellationToken,
) -> Result<Arc<PeerLink>, TransportError> {
    let pc = Arc::new(
        shared
            .api
            .new_peer_connection(shared.rtc_config.clone())
            .await
            .map_err(|err| TransportError::Setup(err.to_string()))?,
    );

    let signals = shared.signaling.sender();
    let dst = remote.clone();
    let candidate_connection = connection_id.to_string();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let signals = signals.clone();
        let dst = dst.clone();
        let connection_id = candidate_connection.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = signals.send(SignalMessage::Candidate {
                        src: None,
                        dst: Some(dst),
                        payload: SignalPayload {
                            kind,
                            connection_id,
                            sdp: None,
                            candidate: Some(init),
                            label: None,
                            serialization: None,
                            reliable: None,
                        },
                    });
                }
                Err(err) => debug!(target: "argus::webrtc", error = %err, "unserializable ice candidate"),
            }
        })
    }));

    let state_token = token.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let token = state_token.clone();
        Box::pin(async move {
            debug!(target: "argus::webrtc", state = %state, "peer connection state changed");
            if matches!(
                state,
                RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Closed
            ) {
                token.cancel();
            }
        })
    }));

    let link = Arc::new(PeerLink {
        remote: remote.clone(),
        kind,
        pc: pc.clone(),
        terminated: token.clone(),
        pending_candidates: Mutex::new(Some(Vec::new())),
    });
    shared.links.lock().insert(connection_id.to_string(), link.clone());

    let watcher_shared = shared.clone();
    let watcher_id = connection_id.to_string();
    tokio::spawn(async move {
        token.cancelled().await;
        let link = watcher_shared.links.lock().remove(&watcher_id);
        if let Some(link) = link {
            if let Err(err) = link.pc.close().await {
                debug!(target: "argus::webrtc", error = %err, "peer connection close failed");
            }
            debug!(
                target: "argus::webrtc",
                connection_id = %watcher_id,
                remote = %link.remote,
                "connection released"
            );
        }
    });

    Ok(link)
}

fn description_payload(kind: ConnectionKind, connection_id: &str, sdp: RTCSessionDescription) -> SignalPayload {
    SignalPayload {
        kind,
        connection_id: connection_id.to_string(),
        sdp: Some(sdp),
        candidate: None,
        label: None,
        serialization: None,
        reliable: None,
    }
}

async fn local_description(link: &PeerLink, offer: bool) -> Result<RTCSessionDescription, TransportError> {
    let description = if offer {
        link.pc.create_offer(None).await
    } else {
        link.pc.create_answer(None).await
    }
    .map_err(|err| TransportError::Setup(err.to_string()))?;
    link.pc
        .set_local_description(description.clone())
        .await
        .map_err(|err| TransportError::Setup(err.to_string()))?;
    Ok(description)
}

async fn offer_data(
    shared: &Arc<Shared>,
    remote: &PeerId,
    connection_id: &str,
    token: CancellationToken,
    inbound: mpsc::UnboundedSender<Bytes>,
    outbound: mpsc::UnboundedReceiver<Bytes>,
) -> Result<(), TransportError> {
    let link = new_link(shared, remote, ConnectionKind::Data, connection_id, token.clone()).await?;
    let channel = link
        .pc
        .create_data_channel(
            connection_id,
            Some(RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            }),
        )
        .await
        .map_err(|err| TransportError::Setup(err.to_string()))?;
    wire_data_channel(channel, inbound, outbound, token);

    let offer = local_description(&link, true).await?;
    let mut payload = description_payload(ConnectionKind::Data, connection_id, offer);
    payload.label = Some(connection_id.to_string());
    payload.serialization = Some("raw".into());
    payload.reliable = Some(true);
    shared.signaling.send(SignalMessage::Offer {
        src: None,
        dst: Some(remote.clone()),
        payload,
    })
}

async fn offer_media(
    shared: &Arc<Shared>,
    remote: &PeerId,
    connection_id: &str,
    token: CancellationToken,
    stream: &MediaStream,
) -> Result<(), TransportError> {
    let link = new_link(shared, remote, ConnectionKind::Media, connection_id, token.clone()).await?;
    for track in stream.tracks() {
        let (mime_type, duration) = match track.kind() {
            TrackKind::Video => (MIME_TYPE_VP8, VIDEO_SAMPLE_DURATION),
            TrackKind::Audio => (MIME_TYPE_OPUS, AUDIO_SAMPLE_DURATION),
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id().to_owned(),
            stream.id().to_owned(),
        ));
        let sender = link
            .pc
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|err| TransportError::Setup(err.to_string()))?;

        let rtcp_token = token.clone();
        tokio::spawn(async move {
            let mut buffer = vec![0u8; 1500];
            loop {
                tokio::select! {
                    _ = rtcp_token.cancelled() => break,
                    read = sender.read(&mut buffer) => {
                        if read.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        tokio::spawn(pump_samples(track.clone(), local, duration, token.clone()));
    }

    let offer = local_description(&link, true).await?;
    shared.signaling.send(SignalMessage::Offer {
        src: None,
        dst: Some(remote.clone()),
        payload: description_payload(ConnectionKind::Media, connection_id, offer),
    })
}

async fn pump_samples(
    track: MediaTrack,
    local: Arc<TrackLocalStaticSample>,
    duration: Duration,
    token: CancellationToken,
) {
    let mut samples = track.subscribe();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = track.stopped() => break,
            sample = samples.recv() => match sample {
                Ok(data) => {
                    let sample = Sample {
                        data,
                        duration,
                        ..Default::default()
                    };
                    if let Err(err) = local.write_sample(&sample).await {
                        debug!(target: "argus::webrtc", error = %err, "sample write failed");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(target: "argus::webrtc", skipped, "sample pump lagging");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

fn wire_data_channel(
    channel: Arc<RTCDataChannel>,
    inbound: mpsc::UnboundedSender<Bytes>,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    token: CancellationToken,
) {
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let inbound = inbound.clone();
        Box::pin(async move {
            let _ = inbound.send(message.data);
        })
    }));

    let close_token = token.clone();
    channel.on_close(Box::new(move || {
        let token = close_token.clone();
        Box::pin(async move {
            token.cancel();
        })
    }));

    let opened = Arc::new(Notify::new());
    let open_signal = opened.clone();
    channel.on_open(Box::new(move || {
        let open_signal = open_signal.clone();
        Box::pin(async move {
            open_signal.notify_one();
        })
    }));

    tokio::spawn(async move {
        if channel.ready_state() != RTCDataChannelState::Open {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = opened.notified() => {}
            }
        }
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                message = outbound.recv() => {
                    let Some(message) = message else { break };
                    if let Err(err) = channel.send(&message).await {
                        warn!(target: "argus::webrtc", error = %err, "data channel send failed");
                        token.cancel();
                        break;
                    }
                }
            }
        }
        let _ = channel.close().await;
    });
}

async fn dispatch_signals(shared: Arc<Shared>, mut signals: mpsc::UnboundedReceiver<SignalMessage>) {
    while let Some(message) = signals.recv().await {
        match message {
            SignalMessage::Offer {
                src: Some(src),
                payload,
                ..
            } => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    let connection_id = payload.connection_id.clone();
                    if let Err(err) = accept_offer(&shared, src.clone(), payload).await {
                        warn!(
                            target: "argus::webrtc",
                            remote = %src,
                            connection_id = %connection_id,
                            error = %err,
                            "failed to accept offer"
                        );
                        if let Some(link) = shared.links.lock().get(&connection_id) {
                            link.terminated.cancel();
                        }
                    }
                });
            }
            SignalMessage::Answer { payload, .. } => {
                let link = shared.links.lock().get(&payload.connection_id).cloned();
                match (link, payload.sdp) {
                    (Some(link), Some(sdp)) => {
                        if let Err(err) = link.apply_remote_description(sdp).await {
                            warn!(target: "argus::webrtc", error = %err, "failed to apply answer");
                            link.terminated.cancel();
                        }
                    }
                    _ => debug!(
                        target: "argus::webrtc",
                        connection_id = %payload.connection_id,
                        "answer for unknown connection"
                    ),
                }
            }
            SignalMessage::Candidate { payload, .. } => {
                let link = shared.links.lock().get(&payload.connection_id).cloned();
                if let (Some(link), Some(candidate)) = (link, payload.candidate) {
                    if let Some(candidate) = link.defer_candidate(candidate) {
                        if let Err(err) = link.pc.add_ice_candidate(candidate).await {
                            debug!(target: "argus::webrtc", error = %err, "ice candidate rejected");
                        }
                    }
                }
            }
            SignalMessage::Leave { src: Some(src), .. } | SignalMessage::Expire { src: Some(src) } => {
                let departed: Vec<_> = shared
                    .links
                    .lock()
                    .values()
                    .filter(|link| link.remote == src)
                    .cloned()
                    .collect();
                debug!(
                    target: "argus::webrtc",
                    remote = %src,
                    connections = departed.len(),
                    "remote peer left"
                );
                for link in departed {
                    link.terminated.cancel();
                }
            }
            SignalMessage::Error { payload } => {
                warn!(target: "argus::webrtc", message = %payload.msg, "broker error");
            }
            other => debug!(target: "argus::webrtc", message = ?other, "ignoring signal"),
        }
    }
    debug!(target: "argus::webrtc", "signaling stream ended");
}

async fn accept_offer(shared: &Arc<Shared>, src: PeerId, payload: SignalPayload) -> Result<(), TransportError> {
    let Some(sdp) = payload.sdp else {
        return Err(TransportError::Signaling("offer without sdp".into()));
    };
    let connection_id = payload.connection_id;
    let token = CancellationToken::new();
    let link = new_link(shared, &src, payload.kind, &connection_id, token.clone()).await?;
    shared.connections.track(&connection_id, token.clone());

    match payload.kind {
        ConnectionKind::Data => {
            let shared_for_channel = shared.clone();
            let remote = src.clone();
            let channel_id = connection_id.clone();
            let channel_token = token.clone();
            link.pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                let shared = shared_for_channel.clone();
                let remote = remote.clone();
                let connection_id = channel_id.clone();
                let token = channel_token.clone();
                Box::pin(async move {
                    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
                    wire_data_channel(channel, inbound_tx, outbound_rx, token.clone());
                    let connection = DataConnection::new(remote, connection_id, outbound_tx, inbound_rx, token.clone());
                    if shared.inbound_data.send(connection).is_err() {
                        token.cancel();
                    }
                })
            }));
        }
        ConnectionKind::Media => {
            let connection = MediaConnection::new(src.clone(), connection_id.clone(), token.clone());
            let publisher = connection.clone();
            let track_token = token.clone();
            link.pc.on_track(Box::new(move |remote_track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let publisher = publisher.clone();
                let token = track_token.clone();
                Box::pin(async move {
                    let kind = match remote_track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        _ => TrackKind::Video,
                    };
                    let track = MediaTrack::new(kind);
                    publisher.publish_remote_stream(MediaStream::with_id(
                        remote_track.stream_id(),
                        vec![track.clone()],
                    ));
                    tokio::spawn(async move {
                        loop {
                            tokio::select! {
                                _ = token.cancelled() => break,
                                packet = remote_track.read_rtp() => match packet {
                                    Ok((packet, _)) => {
                                        if !track.push_sample(packet.payload) {
                                            break;
                                        }
                                    }
                                    Err(_) => break,
                                },
                            }
                        }
                        track.stop();
                    });
                })
            }));
            if shared.inbound_media.send(connection).is_err() {
                token.cancel();
                return Ok(());
            }
        }
    }

    link.apply_remote_description(sdp).await?;
    let answer = local_description(&link, false).await?;
    shared.signaling.send(SignalMessage::Answer {
        src: None,
        dst: Some(src),
        payload: description_payload(link.kind, &connection_id, answer),
    })
}
