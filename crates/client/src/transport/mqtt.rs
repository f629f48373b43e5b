//! MQTT 3.1.1 transport on top of `rumqttc`.
//!
//! Each connection gets its own `AsyncClient`/`EventLoop` pair. After the
//! CONNACK handshake a driver task owns the event loop: it forwards inbound
//! publishes to the link's inbox and settles outstanding requests when the
//! matching acknowledgement arrives.
//!
//! # Request correlation
//!
//! `rumqttc` assigns packet ids inside the event loop, so a request cannot
//! know its id up front. Requests are recorded in a FIFO before they are
//! handed to the client; the event loop emits `Outgoing::{Publish,Subscribe,
//! Unsubscribe}(pkid)` in the same order, which binds each queued request to
//! its packet id. PUBACK/SUBACK/UNSUBACK then settle the request by id.
//!
//! # Shared subscriptions
//!
//! A share name maps to the `$share/<name>/<pattern>` filter understood by
//! most MQTT brokers.
//!
//! # Manual acknowledgement
//!
//! Acks are manual: an at-least-once publish is kept by the driver under a
//! delivery tag and acknowledged only when the client confirms the tag, so
//! `auto_confirm = false` subscriptions hold the PUBACK until the
//! application calls `confirm`. Publishes matching no known subscription are
//! acknowledged right away.
//!
//! The driver never reconnects on its own. When the event loop fails the
//! link is closed and the connection manager decides what to do next.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, Publish, QoS, SubscribeReasonCode, TlsConfiguration, Transport as NetTransport,
};
use tokio::{
    sync::{mpsc, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
    topic_matches, ConnectRequest, ConnectionHandle, DeliveryAck, DeliveryToken, LinkStatus,
    Transport, TransportError, WireMessage, WireSubscription,
};
use crate::{
    config::ClientConfig,
    message::{InboundMessage, Qos},
};

/// Tuning for MQTT connections.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    /// Keep-alive interval.
    pub keep_alive: Duration,

    /// Maximum time for the TCP/TLS connect and CONNACK handshake.
    pub connect_timeout: Duration,

    /// Outgoing QoS 1 window of the protocol engine.
    pub max_inflight: u16,

    /// Capacity of the request channel between client and event loop.
    pub request_channel_capacity: usize,

    /// Maximum packet size in bytes, applied to both directions.
    pub max_packet_size: usize,
}

impl Default for MqttSettings {
    fn default() -> Self {
        MqttSettings {
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            max_inflight: 100,
            request_channel_capacity: 64,
            max_packet_size: 256 * 1024,
        }
    }
}

impl From<&ClientConfig> for MqttSettings {
    fn from(config: &ClientConfig) -> Self {
        MqttSettings {
            keep_alive: Duration::from_secs(config.keep_alive),
            connect_timeout: Duration::from_secs(config.connect_timeout),
            max_inflight: u16::try_from(config.max_inflight).unwrap_or(u16::MAX),
            ..Default::default()
        }
    }
}

/// `rumqttc`-backed implementation of [`Transport`].
pub struct MqttTransport {
    settings: MqttSettings,
    next_handle: AtomicU64,
    links: Mutex<HashMap<ConnectionHandle, Arc<MqttLink>>>,
}

struct MqttLink {
    client: AsyncClient,
    inbox: AsyncMutex<mpsc::UnboundedReceiver<InboundMessage>>,
    shared: Arc<LinkShared>,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// State shared between request callers and the driver task.
#[derive(Default)]
struct LinkShared {
    status: Mutex<Option<LinkStatus>>,
    book: Mutex<AckBook>,
    routes: Mutex<Vec<Route>>,
    unacked: Mutex<Unacked>,
}

/// Inbound at-least-once publishes awaiting the client's confirm.
#[derive(Default)]
struct Unacked {
    next_tag: u64,
    publishes: HashMap<u64, Publish>,
}

impl Unacked {
    fn hold(&mut self, publish: Publish) -> u64 {
        self.next_tag += 1;
        self.publishes.insert(self.next_tag, publish);
        self.next_tag
    }

    fn take(&mut self, tag: u64) -> Option<Publish> {
        self.publishes.remove(&tag)
    }
}

/// Maps a wire filter back to the subscription it was created for.
#[derive(Debug, Clone)]
struct Route {
    filter: String,
    pattern: String,
    share: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RequestKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

/// Outstanding requests, first by submission order, then by packet id.
#[derive(Default)]
struct AckBook {
    queued: VecDeque<(RequestKind, Option<DeliveryAck>)>,
    by_pkid: HashMap<(RequestKind, u16), DeliveryAck>,
}

impl AckBook {
    fn enqueue(&mut self, kind: RequestKind, ack: Option<DeliveryAck>) {
        self.queued.push_back((kind, ack));
    }

    /// Undoes the last `enqueue` when the request never reached the client.
    fn abandon_last(&mut self) {
        self.queued.pop_back();
    }

    /// Binds the oldest queued request to the packet id the event loop chose.
    fn assign(&mut self, kind: RequestKind, pkid: u16) {
        let Some((queued_kind, ack)) = self.queued.pop_front() else {
            trace!("Outgoing {:?} {} has no queued request", kind, pkid);
            return;
        };
        if queued_kind != kind {
            warn!(
                "Outgoing {:?} {} matched a queued {:?} request",
                kind, pkid, queued_kind
            );
        }
        let Some(ack) = ack else {
            return;
        };
        if pkid == 0 {
            ack.confirm();
        } else {
            self.by_pkid.insert((kind, pkid), ack);
        }
    }

    fn settle(&mut self, kind: RequestKind, pkid: u16, result: Result<(), TransportError>) {
        if let Some(ack) = self.by_pkid.remove(&(kind, pkid)) {
            match result {
                Ok(()) => ack.confirm(),
                Err(err) => ack.fail(err),
            }
        }
    }

    fn fail_all(&mut self, err: &TransportError) {
        for (_, ack) in self.queued.drain(..) {
            if let Some(ack) = ack {
                ack.fail(err.clone());
            }
        }
        for (_, ack) in self.by_pkid.drain() {
            ack.fail(err.clone());
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MqttTransport {
    pub fn new(settings: MqttSettings) -> Self {
        MqttTransport {
            settings,
            next_handle: AtomicU64::new(1),
            links: Mutex::new(HashMap::new()),
        }
    }

    fn link(&self, handle: ConnectionHandle) -> Result<Arc<MqttLink>, TransportError> {
        lock(&self.links)
            .get(&handle)
            .cloned()
            .ok_or(TransportError::UnknownHandle(handle))
    }

    /// Builds `rumqttc` options for one connect attempt.
    async fn build_options(&self, request: &ConnectRequest) -> Result<MqttOptions, TransportError> {
        let service = &request.service;
        let mut opts = MqttOptions::new(request.client_id.clone(), service.host.clone(), service.port);
        opts.set_keep_alive(self.settings.keep_alive);
        opts.set_clean_session(true);
        opts.set_manual_acks(true);
        opts.set_inflight(self.settings.max_inflight.max(1));
        opts.set_max_packet_size(self.settings.max_packet_size, self.settings.max_packet_size);

        if let Some((user, password)) = service.credentials(&request.security) {
            opts.set_credentials(user, password);
        }

        if service.scheme.is_secure() {
            if !request.security.verify_name {
                warn!("Host name verification cannot be disabled for MQTT connections");
            }
            let transport = match &request.security.trust_certificate {
                Some(path) => {
                    let ca = tokio::fs::read(path).await.map_err(|e| {
                        TransportError::Rejected(format!(
                            "Failed to read trust certificate {path}: {e}"
                        ))
                    })?;
                    NetTransport::Tls(TlsConfiguration::Simple {
                        ca,
                        client_auth: None,
                        alpn: None,
                    })
                }
                None => NetTransport::tls_with_default_config(),
            };
            opts.set_transport(transport);
        }
        Ok(opts)
    }
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self::new(MqttSettings::default())
    }
}

/// Maps a subscription to its MQTT filter.
fn wire_filter(pattern: &str, share: Option<&str>) -> String {
    match share {
        Some(share) => format!("$share/{share}/{pattern}"),
        None => pattern.to_string(),
    }
}

fn to_mqtt_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
    }
}

fn from_mqtt_qos(qos: QoS) -> Qos {
    match qos {
        QoS::AtMostOnce => Qos::AtMostOnce,
        _ => Qos::AtLeastOnce,
    }
}

/// Drives the event loop until the CONNACK arrives.
async fn handshake(event_loop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(classify_connection_error(&ConnectionError::ConnectionRefused(
                        ack.code,
                    )))
                };
            }
            Ok(_) => {}
            Err(e) => return Err(classify_connection_error(&e)),
        }
    }
}

/// Owns the event loop of one link until it fails or is cancelled.
async fn drive(
    handle: ConnectionHandle,
    client: AsyncClient,
    mut event_loop: EventLoop,
    shared: Arc<LinkShared>,
    inbox: mpsc::UnboundedSender<InboundMessage>,
    cancel: CancellationToken,
) {
    let status = loop {
        tokio::select! {
            _ = cancel.cancelled() => break LinkStatus::Disconnected,

            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let route = {
                        let routes = lock(&shared.routes);
                        routes
                            .iter()
                            .find(|route| topic_matches(&route.pattern, &publish.topic))
                            .map(|route| (route.pattern.clone(), route.share.clone()))
                    };
                    let qos = from_mqtt_qos(publish.qos);
                    let Some((pattern, share)) = route else {
                        debug!("{} dropping publish on unsubscribed '{}'", handle, publish.topic);
                        if qos == Qos::AtLeastOnce {
                            if let Err(e) = client.try_ack(&publish) {
                                debug!("{} failed to ack unrouted publish: {}", handle, e);
                            }
                        }
                        continue;
                    };
                    let mut message = InboundMessage::new(
                        publish.topic.clone(),
                        publish.payload.clone(),
                        pattern,
                        share,
                        qos,
                    );
                    if qos == Qos::AtLeastOnce {
                        message = message.with_tag(lock(&shared.unacked).hold(publish));
                    }
                    if inbox.send(message).is_err() {
                        break LinkStatus::Disconnected;
                    }
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => {
                    lock(&shared.book).settle(RequestKind::Publish, ack.pkid, Ok(()));
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let refused = ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure));
                    let result = if refused {
                        Err(TransportError::Operation("subscription refused by broker".into()))
                    } else {
                        Ok(())
                    };
                    lock(&shared.book).settle(RequestKind::Subscribe, ack.pkid, result);
                }
                Ok(Event::Incoming(Packet::UnsubAck(ack))) => {
                    lock(&shared.book).settle(RequestKind::Unsubscribe, ack.pkid, Ok(()));
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("{} disconnected by broker", handle);
                    break LinkStatus::Error(TransportError::Closed("Disconnected by broker".into()));
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                    lock(&shared.book).assign(RequestKind::Publish, pkid);
                }
                Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                    lock(&shared.book).assign(RequestKind::Subscribe, pkid);
                }
                Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => {
                    lock(&shared.book).assign(RequestKind::Unsubscribe, pkid);
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break LinkStatus::Disconnected,
                Ok(other) => trace!("{} event: {:?}", handle, other),
                Err(e) => {
                    let err = classify_connection_error(&e);
                    debug!("{} event loop failed: {}", handle, get_error_message(&e));
                    break LinkStatus::Error(err);
                }
            }
        }
    };

    let closed = match &status {
        LinkStatus::Error(err) => err.clone(),
        _ => TransportError::Closed("connection closed".into()),
    };
    lock(&shared.book).fail_all(&closed);
    *lock(&shared.status) = Some(status);
    debug!("{} driver stopped", handle);
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self, request: ConnectRequest) -> Result<ConnectionHandle, TransportError> {
        let opts = self.build_options(&request).await?;
        let (client, mut event_loop) =
            AsyncClient::new(opts, self.settings.request_channel_capacity.max(1));

        match tokio::time::timeout(self.settings.connect_timeout, handshake(&mut event_loop)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(TransportError::Connect(format!(
                    "Timed out connecting to {}",
                    request.service
                )))
            }
        }

        let handle = ConnectionHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let shared = Arc::new(LinkShared::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let driver = tokio::spawn(drive(
            handle,
            client.clone(),
            event_loop,
            shared.clone(),
            tx,
            cancel.clone(),
        ));

        lock(&self.links).insert(
            handle,
            Arc::new(MqttLink {
                client,
                inbox: AsyncMutex::new(rx),
                shared,
                cancel,
                driver: Mutex::new(Some(driver)),
            }),
        );
        info!("Connected to {} as {}", request.service, handle);
        Ok(handle)
    }

    async fn disconnect(&self, handle: ConnectionHandle) {
        let Some(link) = lock(&self.links).remove(&handle) else {
            return;
        };
        if let Err(e) = link.client.disconnect().await {
            debug!("Error sending disconnect packet: {:?}", e);
        }
        let driver = lock(&link.driver).take();
        if let Some(mut driver) = driver {
            if tokio::time::timeout(Duration::from_secs(1), &mut driver)
                .await
                .is_err()
            {
                link.cancel.cancel();
                let _ = driver.await;
            }
        }
    }

    async fn subscribe(
        &self,
        handle: ConnectionHandle,
        subscription: &WireSubscription,
    ) -> Result<(), TransportError> {
        let link = self.link(handle)?;
        let filter = wire_filter(&subscription.pattern, subscription.share.as_deref());
        trace!(
            "Subscribing to '{}' (credit {}, ttl {}ms not carried by MQTT)",
            filter,
            subscription.credit,
            subscription.ttl
        );

        let (ack, token) = DeliveryToken::pending();
        lock(&link.shared.book).enqueue(RequestKind::Subscribe, Some(ack));
        if let Err(e) = link
            .client
            .subscribe(filter.clone(), to_mqtt_qos(subscription.qos))
            .await
        {
            lock(&link.shared.book).abandon_last();
            return Err(TransportError::Operation(e.to_string()));
        }
        token.confirmed().await?;

        let mut routes = lock(&link.shared.routes);
        routes.retain(|route| route.filter != filter);
        routes.push(Route {
            filter,
            pattern: subscription.pattern.clone(),
            share: subscription.share.clone(),
        });
        Ok(())
    }

    async fn unsubscribe(
        &self,
        handle: ConnectionHandle,
        pattern: &str,
        share: Option<&str>,
    ) -> Result<(), TransportError> {
        let link = self.link(handle)?;
        let filter = wire_filter(pattern, share);

        let (ack, token) = DeliveryToken::pending();
        lock(&link.shared.book).enqueue(RequestKind::Unsubscribe, Some(ack));
        if let Err(e) = link.client.unsubscribe(filter.clone()).await {
            lock(&link.shared.book).abandon_last();
            return Err(TransportError::Operation(e.to_string()));
        }
        lock(&link.shared.routes).retain(|route| route.filter != filter);
        token.confirmed().await
    }

    async fn send(
        &self,
        handle: ConnectionHandle,
        message: &WireMessage,
    ) -> Result<DeliveryToken, TransportError> {
        let link = self.link(handle)?;
        if message.ttl.is_some() {
            trace!("ttl on '{}' is not carried by MQTT 3.1.1", message.topic);
        }

        let (ack, token) = match message.qos {
            Qos::AtMostOnce => (None, DeliveryToken::settled()),
            Qos::AtLeastOnce => {
                let (ack, token) = DeliveryToken::pending();
                (Some(ack), token)
            }
        };
        lock(&link.shared.book).enqueue(RequestKind::Publish, ack);
        if let Err(e) = link
            .client
            .publish_bytes(
                message.topic.clone(),
                to_mqtt_qos(message.qos),
                false,
                message.payload.to_bytes(),
            )
            .await
        {
            lock(&link.shared.book).abandon_last();
            return Err(TransportError::Operation(e.to_string()));
        }
        Ok(token)
    }

    async fn poll_received(&self, handle: ConnectionHandle) -> Option<InboundMessage> {
        let link = self.link(handle).ok()?;
        let mut inbox = link.inbox.lock().await;
        inbox.recv().await
    }

    async fn confirm(&self, handle: ConnectionHandle, tag: u64) -> Result<(), TransportError> {
        let link = self.link(handle)?;
        let Some(publish) = lock(&link.shared.unacked).take(tag) else {
            trace!("{} has no unacknowledged delivery {}", handle, tag);
            return Ok(());
        };
        link.client
            .ack(&publish)
            .await
            .map_err(|e| TransportError::Operation(e.to_string()))
    }

    fn status(&self, handle: ConnectionHandle) -> LinkStatus {
        match self.link(handle) {
            Ok(link) => lock(&link.shared.status)
                .clone()
                .unwrap_or(LinkStatus::Connected),
            Err(_) => LinkStatus::Disconnected,
        }
    }
}

/// Sorts `rumqttc` connection errors into fatal and retryable ones.
fn classify_connection_error(err: &ConnectionError) -> TransportError {
    let message = get_error_message(err);
    match err {
        // Invalid certificates or incompatible crypto setup
        ConnectionError::Tls(_) => TransportError::Rejected(message),

        // Protocol-level failures
        ConnectionError::MqttState(_) | ConnectionError::NotConnAck(_) => {
            TransportError::Closed(message)
        }
        ConnectionError::RequestsDone => TransportError::Closed(message),

        ConnectionError::Io(e) => match e.kind() {
            // Local misconfiguration rather than a transient condition
            std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::InvalidInput => {
                TransportError::Rejected(message)
            }
            _ => TransportError::Connect(message),
        },

        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => {
            TransportError::Connect(message)
        }

        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::RefusedProtocolVersion
            | ConnectReturnCode::BadClientId
            | ConnectReturnCode::BadUserNamePassword
            | ConnectReturnCode::NotAuthorized => {
                error!("Broker refused connection: {:?}", code);
                TransportError::Rejected(format!("Connection refused: {code:?}"))
            }
            _ => TransportError::Connect(format!("Connection refused: {code:?}")),
        },

        #[allow(unreachable_patterns)]
        _ => TransportError::Connect(message),
    }
}

/// Extracts the innermost error message from an error chain.
fn get_error_message(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}
