use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::config::WebRtcConfig;
use crate::model::PeerId;
use crate::transport::TransportError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Data,
    Media,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    #[serde(rename = "type")]
    pub kind: ConnectionKind,
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<RTCSessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<RTCIceCandidateInit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serialization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reliable: Option<bool>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BrokerNotice {
    #[serde(default)]
    pub msg: String,
}

/// Frames exchanged with the PeerJS-style broker. The broker stamps `src` on
/// relayed frames; clients address them with `dst`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING-KEBAB-CASE")]
pub enum SignalMessage {
    Open,
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<PeerId>,
        payload: SignalPayload,
    },
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<PeerId>,
        payload: SignalPayload,
    },
    Candidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<PeerId>,
        payload: SignalPayload,
    },
    Leave {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<PeerId>,
    },
    Expire {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<PeerId>,
    },
    IdTaken {
        #[serde(default)]
        payload: BrokerNotice,
    },
    Error {
        #[serde(default)]
        payload: BrokerNotice,
    },
    Heartbeat,
}

/// WebSocket link to the broker. Dropping it stops the socket tasks.
pub struct SignalingClient {
    outbound: mpsc::UnboundedSender<SignalMessage>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Connects as `peer_id` and waits for the broker to confirm the id.
    pub async fn connect(
        config: &WebRtcConfig,
        peer_id: &PeerId,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalMessage>), TransportError> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let url = config.broker_url(peer_id.as_str(), &token);
        let (socket, _) = tokio::time::timeout(config.open_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| TransportError::Unavailable("signaling connect timed out".into()))?
            .map_err(|err| TransportError::Unavailable(format!("signaling connect failed: {err}")))?;
        let (mut sink, mut stream) = socket.split();

        let opened = tokio::time::timeout(config.open_timeout, async {
            while let Some(frame) = stream.next().await {
                let frame = frame.map_err(|err| TransportError::Signaling(err.to_string()))?;
                let Message::Text(text) = frame else {
                    continue;
                };
                match serde_json::from_str::<SignalMessage>(&text) {
                    Ok(SignalMessage::Open) => return Ok(()),
                    Ok(SignalMessage::IdTaken { payload }) => {
                        return Err(TransportError::Unavailable(format!(
                            "peer id {peer_id} taken: {}",
                            payload.msg
                        )));
                    }
                    Ok(SignalMessage::Error { payload }) => {
                        return Err(TransportError::Unavailable(payload.msg));
                    }
                    Ok(other) => trace!(target: "argus::signaling", message = ?other, "frame before open"),
                    Err(err) => debug!(target: "argus::signaling", error = %err, "unparseable frame"),
                }
            }
            Err(TransportError::Unavailable("broker closed before open".into()))
        })
        .await
        .map_err(|_| TransportError::Unavailable("broker did not confirm peer id".into()))?;
        opened?;
        debug!(target: "argus::signaling", peer_id = %peer_id, "broker confirmed peer id");

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<SignalMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<SignalMessage>();

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(target: "argus::signaling", error = %err, "failed to encode frame");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<SignalMessage>(&text) {
                        Ok(message) => {
                            if inbound_tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            debug!(target: "argus::signaling", error = %err, "unparseable frame")
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(target: "argus::signaling", error = %err, "signaling socket failed");
                        break;
                    }
                }
            }
        });

        let heartbeat_tx = outbound_tx.clone();
        let interval = config.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(SignalMessage::Heartbeat).is_err() {
                    break;
                }
            }
        });

        Ok((
            Self {
                outbound: outbound_tx,
                tasks: Mutex::new(vec![writer, reader, heartbeat]),
            },
            inbound_rx,
        ))
    }

    pub fn send(&self, message: SignalMessage) -> Result<(), TransportError> {
        self.outbound
            .send(message)
            .map_err(|_| TransportError::Signaling("signaling socket closed".into()))
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<SignalMessage> {
        self.outbound.clone()
    }

    pub fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_broker_frames() {
        let open: SignalMessage = serde_json::from_value(json!({"type": "OPEN"})).unwrap();
        assert!(matches!(open, SignalMessage::Open));

        let taken: SignalMessage =
            serde_json::from_value(json!({"type": "ID-TAKEN", "payload": {"msg": "ID is taken"}})).unwrap();
        assert!(matches!(taken, SignalMessage::IdTaken { payload } if payload.msg == "ID is taken"));

        let offer: SignalMessage = serde_json::from_value(json!({
            "type": "OFFER",
            "src": "V1",
            "dst": "S1",
            "payload": {
                "type": "data",
                "connectionId": "dc_abc",
                "sdp": {"type": "offer", "sdp": "v=0\r\n"},
                "label": "dc_abc",
                "reliable": true
            }
        }))
        .unwrap();
        match offer {
            SignalMessage::Offer { src, payload, .. } => {
                assert_eq!(src, Some(PeerId::from("V1")));
                assert_eq!(payload.kind, ConnectionKind::Data);
                assert_eq!(payload.connection_id, "dc_abc");
                assert!(payload.sdp.is_some());
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn candidate_frames_round_trip_field_names() {
        let frame = SignalMessage::Candidate {
            src: None,
            dst: Some(PeerId::from("S1")),
            payload: SignalPayload {
                kind: ConnectionKind::Media,
                connection_id: "mc_1".into(),
                sdp: None,
                candidate: Some(RTCIceCandidateInit {
                    candidate: "candidate:1 1 udp 1 127.0.0.1 5000 typ host".into(),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                    username_fragment: None,
                }),
                label: None,
                serialization: None,
                reliable: None,
            },
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "CANDIDATE");
        assert_eq!(value["dst"], "S1");
        assert_eq!(value["payload"]["type"], "media");
        assert_eq!(value["payload"]["connectionId"], "mc_1");
        assert!(value.get("src").is_none());
    }

    #[test]
    fn heartbeat_is_a_bare_type_frame() {
        let value = serde_json::to_value(SignalMessage::Heartbeat).unwrap();
        assert_eq!(value, json!({"type": "HEARTBEAT"}));
    }
}
