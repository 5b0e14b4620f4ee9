use std::time::Duration;
use url::Url;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::transport::TransportError;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_BROKER_KEY: &str = "peerjs";

/// Configuration for the WebRTC provider.
#[derive(Clone, Debug)]
pub struct WebRtcConfig {
    /// Base URL of the signaling broker (`ws://` or `wss://`)
    pub signaling_url: Url,
    /// API key sent to the broker on connect
    pub key: String,
    /// ICE server URLs
    pub ice_servers: Vec<String>,
    /// Interval between keep-alive frames on the signaling socket
    pub heartbeat_interval: Duration,
    /// How long to wait for the broker to confirm our peer id
    pub open_timeout: Duration,
}

impl WebRtcConfig {
    pub fn new(signaling_url: &str) -> Result<Self, TransportError> {
        let signaling_url = Url::parse(signaling_url)
            .map_err(|err| TransportError::Setup(format!("invalid signaling url: {err}")))?;
        match signaling_url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(TransportError::Setup(format!(
                    "signaling url must use ws or wss, got {other}"
                )));
            }
        }
        Ok(Self {
            signaling_url,
            key: DEFAULT_BROKER_KEY.to_string(),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            heartbeat_interval: Duration::from_secs(5),
            open_timeout: Duration::from_secs(10),
        })
    }

    pub fn with_ice_servers(mut self, ice_servers: Vec<String>) -> Self {
        self.ice_servers = ice_servers;
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Localhost-only setup: no STUN/TURN.
    pub fn localhost(mut self) -> Self {
        self.ice_servers.clear();
        self
    }

    pub(crate) fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        if self.ice_servers.is_empty() {
            return Vec::new();
        }
        vec![RTCIceServer {
            urls: self.ice_servers.clone(),
            ..Default::default()
        }]
    }

    /// Broker endpoint for `peer_id`, in the PeerJS query layout.
    pub(crate) fn broker_url(&self, peer_id: &str, token: &str) -> Url {
        let mut url = self.signaling_url.clone();
        {
            let path = url.path().trim_end_matches('/').to_string();
            url.set_path(&format!("{path}/peerjs"));
        }
        url.query_pairs_mut()
            .clear()
            .append_pair("key", &self.key)
            .append_pair("id", peer_id)
            .append_pair("token", token);
        url
    }
}
