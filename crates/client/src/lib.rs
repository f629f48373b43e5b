//! Client engine for a publish/subscribe messaging service.
//!
//! The engine keeps one logical connection to a messaging service and
//! exposes a small surface on top of it:
//!
//! - a lifecycle (`start`, `stop`) with automatic reconnect and capped
//!   exponential backoff,
//! - subscriptions keyed by topic pattern and optional share group, replayed
//!   on every reconnect,
//! - sends with at-most-once or at-least-once delivery, bounded by an
//!   admission limit that signals backpressure,
//! - a single callback thread, so user callbacks never run concurrently and
//!   may call back into the client freely.
//!
//! The wire protocol sits behind the [`Transport`] trait. [`MqttTransport`]
//! talks to a broker over MQTT 3.1.1; [`MemoryTransport`] is an in-process
//! broker for tests and local development.

mod admission;
mod backoff;
mod client;
mod config;
mod connection;
mod dispatcher;
mod error;
mod message;
mod state;
mod subscription;
pub mod transport;
pub mod validate;

#[cfg(test)]
pub(crate) mod testing;

pub use backoff::Backoff;
pub use client::{Client, ClientBuilder};
pub use config::{generate_client_id, ClientConfig, RetryConfig, Scheme, SecurityOptions, ServiceAddress};
pub use dispatcher::{
    LifecycleHook, SendCallback, StartCallback, StateListener, StopCallback, SubscribeCallback,
};
pub use error::{ClientError, Result};
pub use message::{
    InboundMessage, MessageHandler, Payload, Qos, SendOptions, SentMessage, SubscribeOptions,
    SubscriptionInfo, UnsubscribeOptions,
};
pub use state::LifecycleState;
pub use transport::{MemoryTransport, MqttSettings, MqttTransport, Transport, TransportError};
