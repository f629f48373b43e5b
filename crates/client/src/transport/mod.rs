//! Transport adapters.
//!
//! The client engine never touches the network itself. Everything it needs
//! from the underlying protocol engine goes through the [`Transport`] trait:
//! connect, disconnect, wire-level subscribe/unsubscribe, send one message,
//! poll for a received message, and query link status.
//!
//! Two implementations ship with the crate:
//! - [`MemoryTransport`]: an in-process loopback broker with fault injection,
//!   used by tests and for wiring components together without a service.
//! - [`MqttTransport`]: an MQTT 3.1.1 adapter on top of `rumqttc`.
//!
//! # Contract
//!
//! - A [`ConnectionHandle`] is owned by the connection manager; no other
//!   component calls `disconnect`.
//! - `send` returns a [`DeliveryToken`] once the message has been handed to
//!   the wire. For at-least-once messages the token resolves when the service
//!   acknowledges the message, or fails if the link is lost first.
//! - `poll_received` returns `None` once the link is closed. `status` then
//!   reports why.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::{
    config::{SecurityOptions, ServiceAddress},
    error::ClientError,
    message::{InboundMessage, Payload, Qos},
};

pub mod memory;
pub mod mqtt;

pub use memory::MemoryTransport;
pub use mqtt::{MqttSettings, MqttTransport};

/// Opaque identifier of one established connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(u64);

impl ConnectionHandle {
    pub fn new(id: u64) -> Self {
        ConnectionHandle(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Everything a transport needs to open a connection.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub client_id: String,
    pub service: ServiceAddress,
    pub security: SecurityOptions,
}

/// Wire-level subscription request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireSubscription {
    pub pattern: String,
    pub share: Option<String>,
    pub qos: Qos,
    pub credit: u32,

    /// Milliseconds the service keeps the subscription after disconnect.
    pub ttl: u32,
}

/// Wire-level outbound message.
#[derive(Debug, Clone)]
pub struct WireMessage {
    pub topic: String,
    pub payload: Payload,
    pub qos: Qos,

    /// Time-to-live in milliseconds.
    pub ttl: Option<u32>,
}

/// Status of a connection as seen by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Connected,
    Disconnected,
    Error(TransportError),
}

/// Errors reported by transports.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connect attempt failed in a way that may succeed later.
    #[error("Connect failed: {0}")]
    Connect(String),

    /// The service refused the client permanently (credentials,
    /// authorization, certificate trust, protocol version).
    #[error("Connection rejected: {0}")]
    Rejected(String),

    /// An established link went away.
    #[error("Link closed: {0}")]
    Closed(String),

    /// A single wire operation failed while the link stayed up.
    #[error("Operation failed: {0}")]
    Operation(String),

    /// The handle does not belong to a live connection.
    #[error("Unknown connection handle {0}")]
    UnknownHandle(ConnectionHandle),
}

/// Whether a transport failure is worth another connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    // Error is unrecoverable, reconnecting makes no sense
    Fatal,
    // Error is temporary, reconnect attempt is reasonable
    Reconnect,
}

impl TransportError {
    pub fn disposition(&self) -> Disposition {
        match self {
            TransportError::Rejected(_) => Disposition::Fatal,
            _ => Disposition::Reconnect,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.disposition(), Disposition::Fatal)
    }
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Rejected(reason) => ClientError::Security(reason),
            other => ClientError::Network(other.to_string()),
        }
    }
}

/// Resolves once the service has acknowledged a sent message.
#[derive(Debug)]
pub struct DeliveryToken {
    inner: TokenState,
}

#[derive(Debug)]
enum TokenState {
    Settled(Result<(), TransportError>),
    Pending(oneshot::Receiver<Result<(), TransportError>>),
}

impl DeliveryToken {
    /// A token that is already complete, for at-most-once sends.
    pub fn settled() -> Self {
        DeliveryToken {
            inner: TokenState::Settled(Ok(())),
        }
    }

    /// A token that has already failed.
    pub fn failed(err: TransportError) -> Self {
        DeliveryToken {
            inner: TokenState::Settled(Err(err)),
        }
    }

    /// A pending token and the acknowledgement that completes it.
    pub fn pending() -> (DeliveryAck, Self) {
        let (tx, rx) = oneshot::channel();
        (
            DeliveryAck(tx),
            DeliveryToken {
                inner: TokenState::Pending(rx),
            },
        )
    }

    /// Waits for the acknowledgement.
    ///
    /// A dropped [`DeliveryAck`] counts as a lost link.
    pub async fn confirmed(self) -> Result<(), TransportError> {
        match self.inner {
            TokenState::Settled(result) => result,
            TokenState::Pending(rx) => rx.await.unwrap_or_else(|_| {
                Err(TransportError::Closed(
                    "connection lost before delivery was confirmed".into(),
                ))
            }),
        }
    }
}

/// Completion side of a [`DeliveryToken`].
#[derive(Debug)]
pub struct DeliveryAck(oneshot::Sender<Result<(), TransportError>>);

impl DeliveryAck {
    pub fn confirm(self) {
        let _ = self.0.send(Ok(()));
    }

    pub fn fail(self, err: TransportError) {
        let _ = self.0.send(Err(err));
    }
}

/// The protocol engine consumed by the client.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens a connection to one service.
    async fn connect(&self, request: ConnectRequest) -> Result<ConnectionHandle, TransportError>;

    /// Closes a connection. Unknown handles are ignored.
    async fn disconnect(&self, handle: ConnectionHandle);

    /// Registers a subscription on the wire.
    async fn subscribe(
        &self,
        handle: ConnectionHandle,
        subscription: &WireSubscription,
    ) -> Result<(), TransportError>;

    /// Removes a subscription on the wire.
    async fn unsubscribe(
        &self,
        handle: ConnectionHandle,
        pattern: &str,
        share: Option<&str>,
    ) -> Result<(), TransportError>;

    /// Hands one message to the wire.
    async fn send(
        &self,
        handle: ConnectionHandle,
        message: &WireMessage,
    ) -> Result<DeliveryToken, TransportError>;

    /// Waits for the next received message. `None` once the link is closed.
    async fn poll_received(&self, handle: ConnectionHandle) -> Option<InboundMessage>;

    /// Current status of a connection.
    fn status(&self, handle: ConnectionHandle) -> LinkStatus;

    /// Acknowledges an inbound at-least-once delivery.
    async fn confirm(&self, _handle: ConnectionHandle, _tag: u64) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Matches a topic against a subscription pattern.
///
/// `+` matches exactly one segment and `#` matches zero or more trailing
/// segments, so `a/#` matches `a`, `a/b` and `a/b/c`.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_segments = pattern.split('/');
    let mut topic_segments = topic.split('/');

    loop {
        match (pattern_segments.next(), topic_segments.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
