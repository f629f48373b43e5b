//! Message, payload and per-operation option types.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    client::Client,
    error::Result,
    subscription::Confirmation,
};

/// Delivery guarantee of a message or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Qos {
    /// Fire-and-forget. Complete once handed to the transport.
    #[default]
    AtMostOnce,

    /// Tracked until the service acknowledges it.
    AtLeastOnce,
}

impl Qos {
    pub fn as_str(&self) -> &'static str {
        match self {
            Qos::AtMostOnce => "at-most-once",
            Qos::AtLeastOnce => "at-least-once",
        }
    }
}

impl fmt::Display for Qos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message body: text or opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl Payload {
    /// Raw bytes of the payload (UTF-8 for text).
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(text) => text.as_bytes(),
            Payload::Binary(bytes) => bytes,
        }
    }

    /// The text, if this is a text payload.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Binary(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Payload::Text(_))
    }

    /// Copies the payload into a `Bytes` buffer for the wire.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Payload::Text(text) => Bytes::copy_from_slice(text.as_bytes()),
            Payload::Binary(bytes) => bytes.clone(),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(Bytes::from(bytes))
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Binary(Bytes::copy_from_slice(bytes))
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Binary(bytes)
    }
}

/// Receive callback attached to a subscription or installed as the client
/// default.
pub type MessageHandler = Arc<dyn Fn(&Client, &InboundMessage) + Send + Sync>;

/// Options for `send`.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub qos: Qos,

    /// Time-to-live in milliseconds. `None` means the message never expires.
    pub ttl: Option<f64>,
}

impl SendOptions {
    pub fn at_least_once() -> Self {
        SendOptions {
            qos: Qos::AtLeastOnce,
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: f64) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Options for `subscribe`.
#[derive(Clone)]
pub struct SubscribeOptions {
    pub qos: Qos,

    /// Milliseconds the service keeps the subscription after the client
    /// disconnects. `0` discards it immediately.
    pub ttl: Option<f64>,

    /// Flow-control window: how many unconfirmed messages the service may
    /// have outstanding for this subscription.
    pub credit: u32,

    /// Confirm at-least-once deliveries automatically after the receive
    /// callback returns. When false, call [`InboundMessage::confirm`].
    pub auto_confirm: bool,

    /// Receive callback for this subscription. Falls back to the client's
    /// `on_message` hook when absent.
    pub handler: Option<MessageHandler>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        SubscribeOptions {
            qos: Qos::AtMostOnce,
            ttl: None,
            credit: 1024,
            auto_confirm: true,
            handler: None,
        }
    }
}

impl SubscribeOptions {
    pub fn at_least_once() -> Self {
        SubscribeOptions {
            qos: Qos::AtLeastOnce,
            ..Default::default()
        }
    }

    pub fn with_ttl(mut self, ttl: f64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_credit(mut self, credit: u32) -> Self {
        self.credit = credit;
        self
    }

    pub fn with_auto_confirm(mut self, auto_confirm: bool) -> Self {
        self.auto_confirm = auto_confirm;
        self
    }

    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Client, &InboundMessage) + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }
}

impl fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("qos", &self.qos)
            .field("ttl", &self.ttl)
            .field("credit", &self.credit)
            .field("auto_confirm", &self.auto_confirm)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// Options for `unsubscribe`.
#[derive(Debug, Clone, Default)]
pub struct UnsubscribeOptions {
    /// Only `0` is accepted: discard held messages immediately.
    pub ttl: Option<f64>,
}

/// A message delivered to a receive callback.
#[derive(Clone)]
pub struct InboundMessage {
    topic: String,
    payload: Payload,
    pattern: String,
    share: Option<String>,
    qos: Qos,
    tag: Option<u64>,
    confirmation: Option<Confirmation>,
}

impl InboundMessage {
    /// Builds a message as handed over by a transport.
    ///
    /// `pattern` and `share` identify the subscription the service matched.
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<Payload>,
        pattern: impl Into<String>,
        share: Option<String>,
        qos: Qos,
    ) -> Self {
        InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
            pattern: pattern.into(),
            share,
            qos,
            tag: None,
            confirmation: None,
        }
    }

    /// Delivery tag a transport uses to correlate `confirm` calls.
    pub fn with_tag(mut self, tag: u64) -> Self {
        self.tag = Some(tag);
        self
    }

    /// Topic the message was published to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Pattern of the subscription that matched.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Share name under which the message was delivered.
    pub fn share(&self) -> Option<&str> {
        self.share.as_deref()
    }

    pub fn qos(&self) -> Qos {
        self.qos
    }

    pub fn tag(&self) -> Option<u64> {
        self.tag
    }

    /// Whether the receiver must call [`confirm`](Self::confirm).
    pub fn needs_confirmation(&self) -> bool {
        self.confirmation.is_some()
    }

    /// Acknowledges an at-least-once delivery on a subscription created with
    /// `auto_confirm = false`.
    ///
    /// Confirming twice is a no-op. Fails with `Stopped` when the connection
    /// the message arrived on is gone; the service will redeliver it.
    pub fn confirm(&self) -> Result<()> {
        match &self.confirmation {
            Some(confirmation) => confirmation.confirm(),
            None => Ok(()),
        }
    }

    pub(crate) fn attach_confirmation(&mut self, confirmation: Confirmation) {
        self.confirmation = Some(confirmation);
    }

    pub(crate) fn key(&self) -> (String, Option<String>) {
        (self.pattern.clone(), self.share.clone())
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("topic", &self.topic)
            .field("pattern", &self.pattern)
            .field("share", &self.share)
            .field("qos", &self.qos)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Echo of a message handed to a send completion callback.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub topic: String,
    pub payload: Payload,
    pub qos: Qos,

    /// Validated time-to-live in milliseconds.
    pub ttl: Option<u32>,
}

/// Snapshot of one subscription, as returned by `Client::subscriptions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub pattern: String,
    pub share: Option<String>,
    pub qos: Qos,
    pub credit: u32,
    pub ttl: u32,
    pub auto_confirm: bool,
    pub delivered: u64,
    pub confirmed: u64,
}
