//! Wire messages shared by sensors, viewers and the discovery registry.
//!
//! Handshake exchange over a data connection:
//! - viewer opens a data connection to the sensor and sends `{credential}`
//! - sensor checks the credential against its local secret
//! - on a match the sensor replies `{name}` and opens a media connection back
//! - on a mismatch the sensor closes the data connection without replying
//!
//! Registry contract (JSON over HTTP):
//! - `POST {base}/sensor` with `{site, peerId}`; response body is ignored
//! - `POST {base}/viewer` with `{site}` answers `{peerIds: [..]}`

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::model::{PeerId, Site};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Viewer to sensor: the derived credential.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialMessage {
    #[serde(alias = "passwordHash")]
    pub credential: String,
}

/// Sensor to viewer: acceptance, carrying the sensor's display name.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NameMessage {
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AnnounceRequest {
    pub site: Site,
    pub peer_id: PeerId,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoverRequest {
    pub site: Site,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverResponse {
    #[serde(default)]
    pub peer_ids: Vec<PeerId>,
}

pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(payload)?)
}
