use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{Credential, CredentialScheme, Secret};
use crate::protocol::{self, CredentialMessage, NameMessage};
use crate::transport::{DataConnection, MediaStream, PeerTransport};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponderOutcome {
    /// Name sent and media connection opened.
    Accepted,
    Rejected,
    Malformed,
    TimedOut,
    /// The viewer hung up before sending anything.
    Closed,
    Cancelled,
}

/// Sensor side of the handshake. One instance is shared by every inbound
/// connection; it holds no per-connection state.
#[derive(Clone)]
pub struct Responder {
    secret: Arc<Secret>,
    scheme: Arc<dyn CredentialScheme>,
    name: String,
    timeout: Duration,
}

impl Responder {
    pub fn new(
        secret: Secret,
        scheme: Arc<dyn CredentialScheme>,
        name: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            secret: Arc::new(secret),
            scheme,
            name: name.into(),
            timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn respond(
        &self,
        connection: DataConnection,
        transport: &dyn PeerTransport,
        stream: &MediaStream,
        cancel: &CancellationToken,
    ) -> ResponderOutcome {
        let peer_id = connection.peer_id().clone();
        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                connection.close();
                return ResponderOutcome::Cancelled;
            }
            first = tokio::time::timeout(self.timeout, connection.recv()) => first,
        };
        let payload = match first {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!(target: "argus::handshake", peer_id = %peer_id, "viewer left before sending a credential");
                return ResponderOutcome::Closed;
            }
            Err(_) => {
                debug!(target: "argus::handshake", peer_id = %peer_id, "no credential within timeout");
                connection.close();
                return ResponderOutcome::TimedOut;
            }
        };

        let message = match protocol::decode::<CredentialMessage>(&payload) {
            Ok(message) => message,
            Err(err) => {
                debug!(target: "argus::handshake", peer_id = %peer_id, error = %err, "malformed credential message");
                connection.close();
                return ResponderOutcome::Malformed;
            }
        };

        let matched = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                connection.close();
                return ResponderOutcome::Cancelled;
            }
            matched = self.verify(Credential::new(message.credential)) => matched,
        };
        if !matched {
            info!(target: "argus::handshake", peer_id = %peer_id, "credential rejected");
            connection.close();
            return ResponderOutcome::Rejected;
        }

        if let Err(err) = connection.send_json(&NameMessage {
            name: self.name.clone(),
        }) {
            debug!(target: "argus::handshake", peer_id = %peer_id, error = %err, "viewer gone before reply");
            return ResponderOutcome::Closed;
        }
        match transport.open_media_connection(&peer_id, stream) {
            Ok(media) => {
                info!(
                    target: "argus::handshake",
                    peer_id = %peer_id,
                    media_connection = media.id(),
                    "viewer accepted; streaming"
                );
                ResponderOutcome::Accepted
            }
            Err(err) => {
                warn!(target: "argus::handshake", peer_id = %peer_id, error = %err, "failed to open media connection");
                connection.close();
                ResponderOutcome::Closed
            }
        }
    }

    async fn verify(&self, credential: Credential) -> bool {
        let secret = self.secret.clone();
        let scheme = self.scheme.clone();
        match tokio::task::spawn_blocking(move || scheme.verify(&secret, &credential)).await {
            Ok(matched) => matched,
            Err(err) => {
                warn!(target: "argus::handshake", error = %err, "credential check panicked");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Argon2Scheme, KdfParams, SecretBinding};
    use crate::model::{PeerId, Site};
    use crate::transport::local::LocalPeerNetwork;
    use crate::handshake::send_credential;
    use crate::transport::{MediaTrack, TrackKind};
    use bytes::Bytes;

    fn scheme() -> Arc<dyn CredentialScheme> {
        Arc::new(
            Argon2Scheme::new(KdfParams {
                memory_kib: 64,
                iterations: 1,
                parallelism: 1,
            })
            .unwrap(),
        )
    }

    fn secret(password: &str) -> Secret {
        Secret::new(Site::from("lab"), password, SecretBinding::PasswordOnly).unwrap()
    }

    struct Fixture {
        responder: Responder,
        network: LocalPeerNetwork,
        sensor: crate::transport::OpenedTransport,
        stream: MediaStream,
    }

    fn fixture(timeout: Duration) -> Fixture {
        let network = LocalPeerNetwork::new();
        let sensor = network.open_as(PeerId::from("S1")).unwrap();
        Fixture {
            responder: Responder::new(secret("hunter2"), scheme(), "Cam1", timeout),
            network,
            sensor,
            stream: MediaStream::new(vec![MediaTrack::new(TrackKind::Video)]),
        }
    }

    #[tokio::test]
    async fn matching_credential_gets_name_and_media() {
        let mut fx = fixture(Duration::from_secs(5));
        let mut viewer = fx.network.open_as(PeerId::from("V1")).unwrap();
        let credential = scheme().derive(&secret("hunter2")).unwrap();

        let outbound = viewer.transport.open_data_connection(&PeerId::from("S1")).unwrap();
        send_credential(&outbound, &credential).unwrap();
        let inbound = fx.sensor.inbound.data.recv().await.unwrap();

        let outcome = fx
            .responder
            .respond(inbound, fx.sensor.transport.as_ref(), &fx.stream, &CancellationToken::new())
            .await;
        assert_eq!(outcome, ResponderOutcome::Accepted);

        let reply: NameMessage = protocol::decode(&outbound.recv().await.unwrap()).unwrap();
        assert_eq!(reply.name, "Cam1");
        let media = viewer.inbound.media.recv().await.unwrap();
        assert_eq!(media.peer_id(), &PeerId::from("S1"));
        assert!(!outbound.is_closed());
    }

    #[tokio::test]
    async fn wrong_credential_closes_without_reply() {
        let mut fx = fixture(Duration::from_secs(5));
        let mut viewer = fx.network.open_as(PeerId::from("V1")).unwrap();
        let credential = scheme().derive(&secret("wrong")).unwrap();

        let outbound = viewer.transport.open_data_connection(&PeerId::from("S1")).unwrap();
        send_credential(&outbound, &credential).unwrap();
        let inbound = fx.sensor.inbound.data.recv().await.unwrap();

        let outcome = fx
            .responder
            .respond(inbound, fx.sensor.transport.as_ref(), &fx.stream, &CancellationToken::new())
            .await;
        assert_eq!(outcome, ResponderOutcome::Rejected);
        assert!(outbound.recv().await.is_none());
        assert!(viewer.inbound.media.try_recv().is_err());
    }

    #[tokio::test]
    async fn garbage_is_malformed() {
        let mut fx = fixture(Duration::from_secs(5));
        let viewer = fx.network.open_as(PeerId::from("V1")).unwrap();
        let outbound = viewer.transport.open_data_connection(&PeerId::from("S1")).unwrap();
        outbound.send(Bytes::from_static(b"{\"hello\":1}")).unwrap();
        let inbound = fx.sensor.inbound.data.recv().await.unwrap();

        let outcome = fx
            .responder
            .respond(inbound, fx.sensor.transport.as_ref(), &fx.stream, &CancellationToken::new())
            .await;
        assert_eq!(outcome, ResponderOutcome::Malformed);
        assert!(outbound.is_closed());
    }

    #[tokio::test]
    async fn silent_viewer_times_out() {
        let mut fx = fixture(Duration::from_millis(50));
        let viewer = fx.network.open_as(PeerId::from("V1")).unwrap();
        let outbound = viewer.transport.open_data_connection(&PeerId::from("S1")).unwrap();
        let inbound = fx.sensor.inbound.data.recv().await.unwrap();

        let outcome = fx
            .responder
            .respond(inbound, fx.sensor.transport.as_ref(), &fx.stream, &CancellationToken::new())
            .await;
        assert_eq!(outcome, ResponderOutcome::TimedOut);
        assert!(outbound.is_closed());
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_wait() {
        let mut fx = fixture(Duration::from_secs(30));
        let viewer = fx.network.open_as(PeerId::from("V1")).unwrap();
        let outbound = viewer.transport.open_data_connection(&PeerId::from("S1")).unwrap();
        let inbound = fx.sensor.inbound.data.recv().await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = fx
            .responder
            .respond(inbound, fx.sensor.transport.as_ref(), &fx.stream, &cancel)
            .await;
        assert_eq!(outcome, ResponderOutcome::Cancelled);
        assert!(outbound.is_closed());
    }
}
