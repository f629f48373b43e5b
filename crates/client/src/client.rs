//! The public client handle.
//!
//! A [`Client`] is a cheap, cloneable handle. All clones share one engine:
//! one lifecycle state, one subscription table, one admission controller and
//! one callback thread. Dropping the last handle cancels any retry and
//! disconnects the transport.
//!
//! # Typical Usage
//!
//! ```ignore
//! let client = Client::builder(ClientConfig::new("amqp://localhost"))
//!     .on_message(|_, message| println!("{}: {:?}", message.topic(), message.payload()))
//!     .on_state_changed(|_, state, error| println!("{state} {error:?}"))
//!     .build()?;
//!
//! client.start_with(|client, result| {
//!     if result.is_ok() {
//!         let _ = client.subscribe("sensors/+/temperature", None, SubscribeOptions::default());
//!     }
//! });
//!
//! if !client.send("sensors/a/temperature", "23.5", SendOptions::at_least_once())? {
//!     client.drained().await;
//! }
//! ```

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::{runtime::Handle, sync::Notify};
use tracing::{debug, info};

use crate::{
    backoff::Backoff,
    config::{ClientConfig, SecurityOptions, ServiceAddress},
    connection::Core,
    dispatcher::{Dispatcher, LifecycleHook, StateListener},
    error::{ClientError, Result},
    message::{
        InboundMessage, MessageHandler, Payload, SendOptions, SentMessage, SubscribeOptions,
        SubscriptionInfo, UnsubscribeOptions,
    },
    state::LifecycleState,
    transport::{MqttSettings, MqttTransport, Transport},
};

/// Hooks installed through [`ClientBuilder`].
#[derive(Default, Clone)]
pub(crate) struct Hooks {
    pub(crate) on_started: Option<LifecycleHook>,
    pub(crate) on_restarted: Option<LifecycleHook>,
    pub(crate) on_stopped: Option<LifecycleHook>,
    pub(crate) on_state_changed: Option<StateListener>,
    pub(crate) on_drain: Option<LifecycleHook>,
    pub(crate) on_message: Option<MessageHandler>,
}

/// Engine state shared by every clone of a [`Client`].
pub(crate) struct Inner {
    pub(crate) id: String,
    pub(crate) services: Vec<ServiceAddress>,
    pub(crate) security: SecurityOptions,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) runtime: Handle,
    pub(crate) hooks: Hooks,
    pub(crate) dispatcher: Dispatcher<Client>,
    pub(crate) drain: Notify,
    core: Mutex<Core>,
}

impl Inner {
    /// Takes the client-wide lock.
    pub(crate) fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = core.shutdown() {
            debug!(client_id = %self.id, "Client dropped, closing {}", handle);
            let transport = self.transport.clone();
            self.runtime
                .spawn(async move { transport.disconnect(handle).await });
        }
    }
}

/// Handle to a publish/subscribe client.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Starts building a client for `config`.
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// Starts the client. Does nothing if it is already starting or started.
    pub fn start(&self) {
        self.inner.start(None);
    }

    /// Starts the client and calls `callback` once it is started.
    ///
    /// The callback gets `Err(Stopped)` if `stop` is called first, or the
    /// error of a fatal rejection.
    pub fn start_with<F>(&self, callback: F)
    where
        F: FnOnce(&Client, Result<()>) + Send + 'static,
    {
        self.inner.start(Some(Box::new(callback)));
    }

    /// Stops the client. Calling it on a stopped client has no effect.
    pub fn stop(&self) {
        self.inner.stop(None);
    }

    /// Stops the client and calls `callback` once it is stopped.
    pub fn stop_with<F>(&self, callback: F)
    where
        F: FnOnce(&Client) + Send + 'static,
    {
        self.inner.stop(Some(Box::new(callback)));
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.core().state
    }

    /// URL of the connected service without its password, while started.
    pub fn service(&self) -> Option<String> {
        let core = self.inner.core();
        match (&core.link, core.state) {
            (Some(link), LifecycleState::Started) => Some(link.service.to_string()),
            _ => None,
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Number of successful connects so far.
    pub fn generation(&self) -> u64 {
        self.inner.core().generation
    }

    /// Subscribes to `pattern`, optionally as a member of the share group
    /// `share`.
    ///
    /// Subscribing again with the same pattern and share updates the
    /// options of the existing subscription.
    pub fn subscribe(
        &self,
        pattern: &str,
        share: Option<&str>,
        options: SubscribeOptions,
    ) -> Result<()> {
        self.inner.subscribe(pattern, share, options, None)
    }

    /// Like [`subscribe`](Self::subscribe), calling `callback` with the
    /// outcome, the pattern and the share name.
    pub fn subscribe_with<F>(
        &self,
        pattern: &str,
        share: Option<&str>,
        options: SubscribeOptions,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(&Client, Result<()>, &str, Option<&str>) + Send + 'static,
    {
        self.inner
            .subscribe(pattern, share, options, Some(Box::new(callback)))
    }

    pub fn unsubscribe(
        &self,
        pattern: &str,
        share: Option<&str>,
        options: UnsubscribeOptions,
    ) -> Result<()> {
        self.inner.unsubscribe(pattern, share, options, None)
    }

    pub fn unsubscribe_with<F>(
        &self,
        pattern: &str,
        share: Option<&str>,
        options: UnsubscribeOptions,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(&Client, Result<()>, &str, Option<&str>) + Send + 'static,
    {
        self.inner
            .unsubscribe(pattern, share, options, Some(Box::new(callback)))
    }

    /// Sends a message.
    ///
    /// Returns `Ok(false)` when the admission limit is reached: the message
    /// is accepted, but the caller should wait for [`drained`](Self::drained)
    /// or the `on_drain` hook before sending more.
    pub fn send(
        &self,
        topic: &str,
        payload: impl Into<Payload>,
        options: SendOptions,
    ) -> Result<bool> {
        self.inner.send(topic, payload.into(), options, None)
    }

    /// Like [`send`](Self::send), calling `callback` once the message is
    /// complete: handed to the transport for at-most-once, acknowledged for
    /// at-least-once.
    pub fn send_with<F>(
        &self,
        topic: &str,
        payload: impl Into<Payload>,
        options: SendOptions,
        callback: F,
    ) -> Result<bool>
    where
        F: FnOnce(&Client, Result<()>, &SentMessage) + Send + 'static,
    {
        self.inner
            .send(topic, payload.into(), options, Some(Box::new(callback)))
    }

    /// Waits until sends are admitted without backpressure.
    pub async fn drained(&self) {
        self.inner.drained().await
    }

    /// Snapshot of the subscription table.
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.inner.subscriptions()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    runtime: Option<Handle>,
    hooks: Hooks,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        ClientBuilder {
            config,
            transport: None,
            runtime: None,
            hooks: Hooks::default(),
        }
    }

    /// Uses `transport` instead of the default MQTT transport.
    pub fn transport<T: Transport>(mut self, transport: Arc<T>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Runtime for background tasks. Defaults to the current runtime.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Called when a `start` completes.
    pub fn on_started<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Client) + Send + Sync + 'static,
    {
        self.hooks.on_started = Some(Arc::new(hook));
        self
    }

    /// Called when the client is started again after a lost connection.
    pub fn on_restarted<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Client) + Send + Sync + 'static,
    {
        self.hooks.on_restarted = Some(Arc::new(hook));
        self
    }

    pub fn on_stopped<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Client) + Send + Sync + 'static,
    {
        self.hooks.on_stopped = Some(Arc::new(hook));
        self
    }

    /// Called on every state change, and with `Error` for each failed
    /// connect attempt.
    pub fn on_state_changed<F>(mut self, listener: F) -> Self
    where
        F: Fn(&Client, LifecycleState, Option<&ClientError>) + Send + Sync + 'static,
    {
        self.hooks.on_state_changed = Some(Arc::new(listener));
        self
    }

    /// Called once each time backpressure is relieved.
    pub fn on_drain<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Client) + Send + Sync + 'static,
    {
        self.hooks.on_drain = Some(Arc::new(hook));
        self
    }

    /// Receive handler for subscriptions that have none of their own.
    pub fn on_message<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Client, &InboundMessage) + Send + Sync + 'static,
    {
        self.hooks.on_message = Some(Arc::new(handler));
        self
    }

    /// Validates the configuration and creates the client in the `Stopped`
    /// state.
    pub fn build(self) -> Result<Client> {
        let services = self.config.check()?;
        let id = self.config.resolve_client_id();

        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| {
                ClientError::Config(
                    "A tokio runtime is required: build inside one or set ClientBuilder::runtime"
                        .into(),
                )
            })?,
        };
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(MqttTransport::new(MqttSettings::from(&self.config))) as Arc<dyn Transport>,
        };

        let (dispatcher, queue) = Dispatcher::new();
        let core = Core::new(
            Backoff::from(&self.config.retry),
            self.config.max_inflight as usize,
        );
        let inner = Arc::new(Inner {
            id,
            services,
            security: self.config.security.clone(),
            transport,
            runtime,
            hooks: self.hooks,
            dispatcher,
            drain: Notify::new(),
            core: Mutex::new(core),
        });

        let weak = Arc::downgrade(&inner);
        queue
            .spawn("lumen-dispatch".into(), move || {
                weak.upgrade().map(|inner| Client { inner })
            })
            .map_err(|e| ClientError::Config(format!("Failed to start callback thread: {e}")))?;

        info!(
            client_id = %inner.id,
            "Client created for {}",
            inner
                .services
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(Client { inner })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{mpsc, Arc},
        time::Duration,
    };

    use super::*;
    use crate::{
        message::Qos,
        testing::{harness, recv, wait_until},
        transport::MemoryTransport,
    };

    #[test]
    fn test_build_requires_runtime() {
        let result = Client::builder(ClientConfig::default())
            .transport(Arc::new(MemoryTransport::new()))
            .build();
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    #[tokio::test]
    async fn test_build_validates_config() {
        let transport = Arc::new(MemoryTransport::new());
        let result = Client::builder(ClientConfig::new("http://localhost"))
            .transport(transport.clone())
            .build();
        assert!(matches!(result, Err(ClientError::InvalidArgument(_))));

        let result = Client::builder(ClientConfig::default().with_client_id("bad id!"))
            .transport(transport.clone())
            .build();
        assert!(matches!(result, Err(ClientError::Config(_))));

        let result = Client::builder(ClientConfig::default().with_max_inflight(0))
            .transport(transport)
            .build();
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    #[tokio::test]
    async fn test_new_client_is_stopped_with_generated_id() {
        let client = Client::builder(ClientConfig::default())
            .transport(Arc::new(MemoryTransport::new()))
            .build()
            .unwrap();
        assert_eq!(client.state(), LifecycleState::Stopped);
        assert!(client.id().starts_with("AUTO_"));
        assert_eq!(client.id().len(), 12);
        assert_eq!(client.service(), None);
        assert_eq!(client.generation(), 0);
    }

    #[tokio::test]
    async fn test_end_to_end_receive_before_sent() {
        let (client, _transport, events) = harness(|config| config);
        events.start(&client).await;

        let (tx, rx) = mpsc::channel();
        let received = tx.clone();
        let options = SubscribeOptions::at_least_once().with_handler(move |_, message| {
            let text = message.payload().as_text().unwrap_or_default().to_string();
            let _ = received.send(format!("received {text} on {}", message.topic()));
        });
        let subscribed = tx.clone();
        client
            .subscribe_with("/foo", None, options, move |_, result, pattern, _| {
                let _ = subscribed.send(format!("subscribed {pattern} {}", result.is_ok()));
            })
            .unwrap();
        assert_eq!(recv(&rx).await, "subscribed /foo true");

        let sent = tx.clone();
        let admitted = client
            .send_with("/foo", "hello", SendOptions::at_least_once(), move |_, result, message| {
                let _ = sent.send(format!("sent {} {}", message.topic, result.is_ok()));
            })
            .unwrap();
        assert!(admitted);
        assert_eq!(recv(&rx).await, "received hello on /foo");
        assert_eq!(recv(&rx).await, "sent /foo true");

        client.stop_with(move |client| {
            let _ = tx.send(format!("stopped {}", client.state()));
        });
        assert_eq!(recv(&rx).await, "stopped stopped");
        assert_eq!(client.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_break_client() {
        let (client, transport, events) = harness(|config| config);
        events.start(&client).await;

        let (tx, rx) = mpsc::channel();
        let options = SubscribeOptions::default().with_handler(move |_, message| {
            if message.payload().as_text() == Some("boom") {
                panic!("handler failure");
            }
            let _ = tx.send(message.payload().clone());
        });
        client.subscribe("/t", None, options).unwrap();
        events.wait_for_subscriptions(&transport, 1).await;

        transport.publish("/t", "boom", Qos::AtMostOnce);
        transport.publish("/t", "fine", Qos::AtMostOnce);
        assert_eq!(recv(&rx).await, Payload::from("fine"));
        assert_eq!(client.state(), LifecycleState::Started);
        assert!(client.send("/t", "x", SendOptions::default()).is_ok());
    }

    #[tokio::test]
    async fn test_callbacks_may_call_back_into_client() {
        let (client, _transport, events) = harness(|config| config);

        let (tx, rx) = mpsc::channel();
        client.start_with(move |client, _| {
            let result = client.subscribe("/nested", None, SubscribeOptions::default());
            let _ = tx.send(result);
        });
        assert!(recv(&rx).await.is_ok());
        assert_eq!(client.subscriptions().len(), 1);
        events.wait_for(LifecycleState::Started).await;
    }

    #[tokio::test]
    async fn test_hooks_fire() {
        let (tx, rx) = mpsc::channel();
        let started = tx.clone();
        let client = Client::builder(ClientConfig::default())
            .transport(Arc::new(MemoryTransport::new()))
            .on_started(move |_| {
                let _ = started.send("started");
            })
            .on_stopped(move |_| {
                let _ = tx.send("stopped");
            })
            .build()
            .unwrap();

        client.start();
        assert_eq!(recv(&rx).await, "started");
        client.stop();
        assert_eq!(recv(&rx).await, "stopped");
    }

    #[tokio::test]
    async fn test_dropping_client_disconnects() {
        let (client, transport, events) = harness(|config| config);
        events.start(&client).await;
        assert_eq!(transport.live_connections().len(), 1);

        drop(client);
        wait_until(|| transport.live_connections().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
