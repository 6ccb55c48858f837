//! Transport collaborators.
//!
//! The engine never talks to a broker itself. It hands fully prepared
//! envelopes to a command sender or notification publisher supplied by the
//! embedding application. Failure classification is explicit: transports
//! report transient versus permanent failures as values, and the dispatcher
//! folds each attempt into a [`DeliveryOutcome`] instead of routing control
//! flow through caught exceptions.

use std::collections::HashMap;

use async_trait::async_trait;
use snafu::Snafu;
use uuid::Uuid;

use crate::codec::DecodedPayload;

/// Header key carrying the freshly generated wire message id.
pub const MESSAGE_ID_HEADER: &str = "message-id";

/// A message prepared for the wire.
///
/// Carries the decoded payload, the stored headers merged with a fresh wire
/// id and the restored trace context, and the optional explicit destination.
pub struct OutboundEnvelope {
    /// Wire-level message id, generated per delivery attempt
    pub message_id: Uuid,
    /// Payload reconstructed through the registry
    pub payload: DecodedPayload,
    /// Explicit destination endpoint; `None` means derived from the payload type
    pub destination: Option<String>,
    /// Stored headers merged with message id and trace context
    pub headers: HashMap<String, String>,
}

/// How a transport call failed.
#[derive(Debug, Snafu)]
pub enum TransportError {
    /// The transport was unreachable or timed out; worth retrying.
    #[snafu(display("transient transport failure: {reason}"))]
    Transient { reason: String },

    /// The transport rejected the message for good; retrying cannot help.
    #[snafu(display("permanent transport failure: {reason}"))]
    Permanent { reason: String },

    /// The transport observed local shutdown mid-call.
    #[snafu(display("delivery cancelled by shutdown"))]
    Cancelled,
}

/// Outcome of one delivery attempt, as seen by the dispatcher loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    TransientFailure(String),
    PermanentFailure(String),
    Cancelled,
}

impl From<TransportError> for DeliveryOutcome {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Transient { reason } => Self::TransientFailure(reason),
            TransportError::Permanent { reason } => Self::PermanentFailure(reason),
            TransportError::Cancelled => Self::Cancelled,
        }
    }
}

/// Sends commands to a single destination endpoint.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn send(&self, envelope: OutboundEnvelope) -> Result<(), TransportError>;
}

/// Publishes notifications to all interested subscribers.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn publish(&self, envelope: OutboundEnvelope) -> Result<(), TransportError>;
}
