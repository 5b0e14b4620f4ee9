//! Credential handshake between a viewer (initiator) and a sensor (responder).
//!
//! The viewer sends `{credential}` as soon as its data connection is open. A
//! sensor that accepts replies `{name}` and opens a media connection back; a
//! sensor that refuses closes the data connection without a word. The two
//! acceptance signals travel independently, so the viewer tracks each attempt
//! with [`HandshakeState`] and only promotes it once both have arrived.

use std::fmt;

pub mod initiator;
pub mod responder;

pub use initiator::{AckEvent, read_ack, send_credential};
pub use responder::{Responder, ResponderOutcome};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// The data connection terminated before any reply.
    ClosedWithoutReply,
    /// The first reply did not decode as `{name}`.
    MalformedReply,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Established,
    Rejected(RejectReason),
    TimedOut,
    /// The owning manager was disposed mid-attempt.
    Terminated,
}

impl fmt::Display for HandshakeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeOutcome::Established => f.write_str("established"),
            HandshakeOutcome::Rejected(RejectReason::ClosedWithoutReply) => {
                f.write_str("rejected (closed without reply)")
            }
            HandshakeOutcome::Rejected(RejectReason::MalformedReply) => {
                f.write_str("rejected (malformed reply)")
            }
            HandshakeOutcome::TimedOut => f.write_str("timed out"),
            HandshakeOutcome::Terminated => f.write_str("terminated"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeEvent {
    CredentialSent,
    /// `{name}` arrived on the data connection.
    Reply,
    Malformed,
    DataClosed,
    /// An inbound media connection from the target peer arrived.
    MediaArrived,
    /// A buffered media connection terminated before the reply.
    MediaClosed,
    Timeout,
    Cancelled,
}

/// Viewer-side progress of one attempt.
///
/// Acceptance (`{name}` received) is not a resting state: the reply moves the
/// attempt straight to `AwaitingMedia`, or to `Established` when media was
/// already buffered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Connecting,
    AwaitingAck { media_buffered: bool },
    AwaitingMedia,
    Established,
    Rejected(RejectReason),
    TimedOut,
    Terminated,
}

impl HandshakeState {
    pub fn step(self, event: HandshakeEvent) -> HandshakeState {
        use HandshakeEvent as E;
        use HandshakeState as S;

        if self.is_terminal() {
            return self;
        }
        match (self, event) {
            (_, E::Timeout) => S::TimedOut,
            (_, E::Cancelled) => S::Terminated,

            (S::Connecting, E::CredentialSent) => S::AwaitingAck {
                media_buffered: false,
            },
            (S::Connecting, E::DataClosed) => S::Rejected(RejectReason::ClosedWithoutReply),
            (S::Connecting, _) => self,

            (S::AwaitingAck { .. }, E::MediaArrived) => S::AwaitingAck {
                media_buffered: true,
            },
            (S::AwaitingAck { .. }, E::MediaClosed) => S::AwaitingAck {
                media_buffered: false,
            },
            (S::AwaitingAck { media_buffered }, E::Reply) => {
                if media_buffered {
                    S::Established
                } else {
                    S::AwaitingMedia
                }
            }
            (S::AwaitingAck { .. }, E::Malformed) => S::Rejected(RejectReason::MalformedReply),
            (S::AwaitingAck { .. }, E::DataClosed) => {
                S::Rejected(RejectReason::ClosedWithoutReply)
            }
            (S::AwaitingAck { .. }, E::CredentialSent) => self,

            // Once accepted, the data channel has served its purpose.
            (S::AwaitingMedia, E::MediaArrived) => S::Established,
            (S::AwaitingMedia, _) => self,

            (terminal, _) => terminal,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome().is_some()
    }

    pub fn outcome(&self) -> Option<HandshakeOutcome> {
        match self {
            HandshakeState::Established => Some(HandshakeOutcome::Established),
            HandshakeState::Rejected(reason) => Some(HandshakeOutcome::Rejected(*reason)),
            HandshakeState::TimedOut => Some(HandshakeOutcome::TimedOut),
            HandshakeState::Terminated => Some(HandshakeOutcome::Terminated),
            _ => None,
        }
    }
}
