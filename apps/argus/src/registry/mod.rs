//! Discovery registry: sensors announce `(site, peerId)`, viewers list a site.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub mod memory;

pub use memory::MemoryRegistry;

use crate::model::{PeerId, Site};
use crate::protocol::{AnnounceRequest, DiscoverRequest, DiscoverResponse};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid registry configuration: {0}")]
    InvalidConfig(String),
    #[error("registry unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait Registry: Send + Sync {
    async fn announce(&self, site: &Site, peer_id: &PeerId) -> Result<(), RegistryError>;
    async fn discover(&self, site: &Site) -> Result<Vec<PeerId>, RegistryError>;
}

#[derive(Clone, Debug)]
pub struct RegistryConfig {
    base_url: Url,
}

impl RegistryConfig {
    pub fn new(base_url: impl AsRef<str>) -> Result<Self, RegistryError> {
        let mut base = base_url.as_ref().trim().to_string();
        if base.is_empty() {
            return Err(RegistryError::InvalidConfig(
                "registry base url cannot be empty".into(),
            ));
        }
        if !base.contains("://") {
            let inferred_scheme = infer_scheme(&base);
            base = format!("{inferred_scheme}{base}");
        }
        let mut parsed = Url::parse(&base)
            .map_err(|err| RegistryError::InvalidConfig(format!("invalid registry url: {err}")))?;
        if !parsed.path().ends_with('/') {
            let path = format!("{}/", parsed.path());
            parsed.set_path(&path);
        }
        Ok(Self { base_url: parsed })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, name: &str) -> Result<Url, RegistryError> {
        self.base_url
            .join(name)
            .map_err(|err| RegistryError::InvalidConfig(format!("invalid {name} endpoint: {err}")))
    }
}

fn infer_scheme(base: &str) -> &'static str {
    let host_part = base
        .split('/')
        .next()
        .unwrap_or(base)
        .trim_start_matches('[')
        .split(']')
        .next()
        .unwrap_or(base);
    let host_lower = host_part.to_ascii_lowercase();
    if host_lower.starts_with("localhost")
        || host_lower == "0.0.0.0"
        || host_lower.starts_with("127.")
        || host_lower == "::1"
        || host_lower.starts_with("10.")
        || host_lower.starts_with("192.168.")
        || host_lower
            .strip_prefix("172.")
            .and_then(|rest| rest.split('.').next())
            .and_then(|octet| octet.parse::<u8>().ok())
            .is_some_and(|octet| (16..32).contains(&octet))
    {
        "http://"
    } else {
        "https://"
    }
}

/// JSON-over-HTTP registry: `POST {base}/sensor` and `POST {base}/viewer`.
pub struct HttpRegistry {
    config: RegistryConfig,
    client: reqwest::Client,
}

impl HttpRegistry {
    pub fn new(config: RegistryConfig) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn announce(&self, site: &Site, peer_id: &PeerId) -> Result<(), RegistryError> {
        let endpoint = self.config.endpoint("sensor")?;
        let request = AnnounceRequest {
            site: site.clone(),
            peer_id: peer_id.clone(),
        };
        let response = self.client.post(endpoint).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::HttpStatus(response.status()));
        }
        Ok(())
    }

    async fn discover(&self, site: &Site) -> Result<Vec<PeerId>, RegistryError> {
        let endpoint = self.config.endpoint("viewer")?;
        let request = DiscoverRequest { site: site.clone() };
        let response = self.client.post(endpoint).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::HttpStatus(response.status()));
        }
        let body = response.bytes().await?;
        let payload: DiscoverResponse = serde_json::from_slice(&body)
            .map_err(|err| RegistryError::InvalidResponse(err.to_string()))?;
        Ok(payload.peer_ids)
    }
}

/// Result of one discovery poll.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Discovery {
    pub peer_ids: Vec<PeerId>,
    /// The registry could not be reached; `peer_ids` is the last known set.
    pub stale: bool,
}

/// Registry front end used by the sessions: best-effort announces and
/// discovery that falls back to the last known set.
#[derive(Clone)]
pub struct RegistryClient {
    registry: Arc<dyn Registry>,
    last_known: Arc<Mutex<Vec<PeerId>>>,
}

impl RegistryClient {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            last_known: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn announce(&self, site: &Site, peer_id: &PeerId) -> Result<(), RegistryError> {
        self.registry.announce(site, peer_id).await?;
        debug!(target: "argus::registry", site = %site, peer_id = %peer_id, "announced");
        Ok(())
    }

    pub async fn discover(&self, site: &Site) -> Discovery {
        match self.registry.discover(site).await {
            Ok(peer_ids) => {
                let mut seen = HashSet::new();
                let peer_ids: Vec<PeerId> = peer_ids
                    .into_iter()
                    .filter(|id| seen.insert(id.clone()))
                    .collect();
                *self.last_known.lock() = peer_ids.clone();
                debug!(target: "argus::registry", site = %site, peers = peer_ids.len(), "discovered");
                Discovery {
                    peer_ids,
                    stale: false,
                }
            }
            Err(err) => {
                warn!(target: "argus::registry", site = %site, error = %err, "discovery failed; keeping last known peers");
                Discovery {
                    peer_ids: self.last_known.lock().clone(),
                    stale: true,
                }
            }
        }
    }
}
