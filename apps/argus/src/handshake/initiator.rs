use crate::auth::Credential;
use crate::protocol::{self, CredentialMessage, NameMessage};
use crate::transport::{DataConnection, TransportError};

/// What the viewer learned from its data connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AckEvent {
    Reply(String),
    Malformed,
    Closed,
}

pub fn send_credential(
    connection: &DataConnection,
    credential: &Credential,
) -> Result<(), TransportError> {
    connection.send_json(&CredentialMessage {
        credential: credential.as_str().to_owned(),
    })
}

/// Waits for the first reply on `connection`. Only the first message counts;
/// anything after it is the sensor's business.
pub async fn read_ack(connection: &DataConnection) -> AckEvent {
    match connection.recv().await {
        None => AckEvent::Closed,
        Some(payload) => match protocol::decode::<NameMessage>(&payload) {
            Ok(reply) => AckEvent::Reply(reply.name),
            Err(err) => {
                tracing::debug!(
                    target: "argus::handshake",
                    peer_id = %connection.peer_id(),
                    error = %err,
                    "discarding malformed reply"
                );
                AckEvent::Malformed
            }
        },
    }
}
