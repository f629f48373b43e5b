//! Connection lifecycle: start, stop, retry and connection loss.
//!
//! The connection manager owns the client's [`LifecycleState`] and the one
//! transport connection that belongs to it. All state lives in [`Core`],
//! guarded by the client-wide lock; network I/O always happens outside it.
//!
//! # Architecture
//!
//! ```text
//! start() ──► connect loop (one per cycle)
//!               │  connect each service in order
//!               │  replay subscriptions
//!               ▼
//!            Started ──► writer task   (wire ops, in submission order)
//!                    └─► receiver task (inbound messages, link loss)
//! ```
//!
//! Each successful connect increments the generation. Results coming back
//! from an older generation are discarded, and the dispatcher drops queued
//! deliveries of any generation that is no longer live.
//!
//! # Retry
//!
//! Transient failures are retried forever with capped exponential backoff.
//! Each failed attempt is reported to the state listener as `Error` with the
//! cause while the client stays in the retry cycle. Only `stop` or a fatal
//! rejection (for example bad credentials) ends it.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    admission::Admission,
    backoff::Backoff,
    client::Inner,
    config::ServiceAddress,
    dispatcher::{StartCallback, StopCallback},
    error::{ClientError, Result},
    message::Qos,
    state::LifecycleState,
    subscription::SubscriptionTable,
    transport::{
        ConnectRequest, ConnectionHandle, LinkStatus, TransportError, WireMessage,
        WireSubscription,
    },
};

/// State guarded by the client-wide lock.
pub(crate) struct Core {
    pub(crate) state: LifecycleState,

    /// Incremented on every successful connect.
    pub(crate) generation: u64,

    /// Identifies the current connect loop.
    cycle: u64,
    cancel: CancellationToken,

    /// The live connection, present only while `Started`.
    pub(crate) link: Option<Link>,
    backoff: Backoff,

    pub(crate) subscriptions: SubscriptionTable,
    pub(crate) admission: Admission,

    start_waiters: Vec<StartCallback>,
    stop_waiters: Vec<StopCallback>,
    restart_after_stop: bool,

    /// Set after a connection loss so the next connect counts as a restart.
    reconnecting: bool,
}

/// One established connection.
pub(crate) struct Link {
    pub(crate) handle: ConnectionHandle,
    pub(crate) service: ServiceAddress,
    pub(crate) generation: u64,
    ops: mpsc::UnboundedSender<WireOp>,
}

/// Work for the writer task of a link.
#[derive(Debug)]
pub(crate) enum WireOp {
    Subscribe {
        id: u64,
        subscription: WireSubscription,
    },
    Unsubscribe {
        id: u64,
        pattern: String,
        share: Option<String>,
    },
    Send {
        seq: u64,
        message: WireMessage,
    },
    Confirm {
        tag: u64,
    },
}

impl Core {
    pub(crate) fn new(backoff: Backoff, max_inflight: usize) -> Self {
        Core {
            state: LifecycleState::Stopped,
            generation: 0,
            cycle: 0,
            cancel: CancellationToken::new(),
            link: None,
            backoff,
            subscriptions: SubscriptionTable::default(),
            admission: Admission::new(max_inflight),
            start_waiters: Vec::new(),
            stop_waiters: Vec::new(),
            restart_after_stop: false,
            reconnecting: false,
        }
    }

    /// Fails with `Stopped` unless the client is started.
    pub(crate) fn ensure_started(&self) -> Result<()> {
        match (&self.link, self.state) {
            (Some(_), LifecycleState::Started) => Ok(()),
            _ => Err(ClientError::Stopped(self.state)),
        }
    }

    /// Whether `generation` is the live connection.
    pub(crate) fn is_live(&self, generation: u64) -> bool {
        self.link
            .as_ref()
            .is_some_and(|link| link.generation == generation)
    }

    /// Cancels any connect loop and releases the live link, if one exists.
    pub(crate) fn shutdown(&mut self) -> Option<ConnectionHandle> {
        self.cancel.cancel();
        self.link.take().map(|link| link.handle)
    }

    /// Queues an operation on the live link's writer.
    pub(crate) fn submit(&self, op: WireOp) {
        match &self.link {
            Some(link) => {
                if link.ops.send(op).is_err() {
                    debug!("Writer for {} is gone, dropping wire operation", link.handle);
                }
            }
            None => trace!("No live link, dropping {:?}", op),
        }
    }
}

impl Inner {
    /// Starts the client, or queues `callback` until it is started.
    pub(crate) fn start(self: &Arc<Self>, callback: Option<StartCallback>) {
        let mut guard = self.core();
        let core = &mut *guard;
        match core.state {
            LifecycleState::Started => {
                if let Some(callback) = callback {
                    self.dispatcher.post("start", move |client| callback(client, Ok(())));
                }
            }
            LifecycleState::Starting | LifecycleState::Retrying => {
                core.start_waiters.extend(callback);
            }
            LifecycleState::Stopping => {
                debug!(client_id = %self.id, "Start requested while stopping, restart queued");
                core.start_waiters.extend(callback);
                core.restart_after_stop = true;
            }
            LifecycleState::Stopped | LifecycleState::Error => {
                core.start_waiters.extend(callback);
                core.reconnecting = false;
                self.set_state(core, LifecycleState::Starting, None);
                self.spawn_cycle(core);
            }
        }
    }

    /// Stops the client. `callback` fires once the client is `Stopped`.
    pub(crate) fn stop(self: &Arc<Self>, callback: Option<StopCallback>) {
        let mut guard = self.core();
        let core = &mut *guard;
        match core.state {
            LifecycleState::Stopped => {
                if let Some(callback) = callback {
                    self.dispatcher.post("stop", move |client| callback(client));
                }
            }
            LifecycleState::Error => {
                self.set_state(core, LifecycleState::Stopped, None);
                if let Some(callback) = callback {
                    self.dispatcher.post("stop", move |client| callback(client));
                }
            }
            LifecycleState::Stopping => {
                core.stop_waiters.extend(callback);
                if core.restart_after_stop {
                    core.restart_after_stop = false;
                    self.fail_start_waiters(core, ClientError::Stopped(LifecycleState::Stopping));
                }
            }
            LifecycleState::Starting | LifecycleState::Retrying | LifecycleState::Started => {
                core.stop_waiters.extend(callback);
                self.set_state(core, LifecycleState::Stopping, None);
                core.cancel.cancel();
                core.reconnecting = false;
                self.dispatcher.set_live(None);

                let handle = core.link.take().map(|link| link.handle);
                self.fail_outstanding(
                    core,
                    ClientError::Network("Client stopped before delivery was confirmed".into()),
                    ClientError::Stopped(LifecycleState::Stopping),
                );
                self.fail_start_waiters(core, ClientError::Stopped(LifecycleState::Stopping));

                let inner = self.clone();
                self.runtime.spawn(inner.finish_stop(handle));
            }
        }
    }

    async fn finish_stop(self: Arc<Self>, handle: Option<ConnectionHandle>) {
        if let Some(handle) = handle {
            self.transport.disconnect(handle).await;
        }

        let mut guard = self.core();
        let core = &mut *guard;
        self.set_state(core, LifecycleState::Stopped, None);
        if let Some(hook) = self.hooks.on_stopped.clone() {
            self.dispatcher.post("stopped", move |client| hook(client));
        }
        for callback in core.stop_waiters.drain(..) {
            self.dispatcher.post("stop", move |client| callback(client));
        }

        if core.restart_after_stop {
            core.restart_after_stop = false;
            info!(client_id = %self.id, "Restarting after stop");
            self.set_state(core, LifecycleState::Starting, None);
            self.spawn_cycle(core);
        }
    }

    /// Records a transition and tells the state listener.
    fn set_state(&self, core: &mut Core, state: LifecycleState, error: Option<ClientError>) {
        if core.state == state {
            return;
        }
        info!(client_id = %self.id, "Client state changed to: {}", state);
        core.state = state;
        self.notify(state, error);
    }

    fn notify(&self, state: LifecycleState, error: Option<ClientError>) {
        if let Some(listener) = self.hooks.on_state_changed.clone() {
            self.dispatcher.post("state", move |client| {
                listener(client, state, error.as_ref())
            });
        }
    }

    /// Starts a fresh connect loop, invalidating any previous one.
    fn spawn_cycle(self: &Arc<Self>, core: &mut Core) {
        core.cycle += 1;
        core.cancel = CancellationToken::new();
        core.backoff.reset();
        self.runtime.spawn(connect_loop(
            Arc::downgrade(self),
            core.cycle,
            core.cancel.clone(),
        ));
    }

    fn fail_start_waiters(&self, core: &mut Core, err: ClientError) {
        for callback in core.start_waiters.drain(..) {
            let err = err.clone();
            self.dispatcher.post("start", move |client| callback(client, Err(err)));
        }
    }

    /// Fails every admitted send and every pending subscription operation.
    fn fail_outstanding(&self, core: &mut Core, send_err: ClientError, op_err: ClientError) {
        let released = core.admission.fail_all(&send_err);
        self.finish_sends(released);
        for op in core.subscriptions.take_pending() {
            self.settle_op(&mut core.subscriptions, op, Err(op_err.clone()));
        }
    }

    fn disconnect_later(&self, handle: ConnectionHandle) {
        let transport = self.transport.clone();
        self.runtime.spawn(async move { transport.disconnect(handle).await });
    }

    /// One connect attempt: every service in order, then subscription replay.
    async fn attempt(&self) -> Result<(ConnectionHandle, ServiceAddress), TransportError> {
        let mut last_error = None;
        for service in &self.services {
            let request = ConnectRequest {
                client_id: self.id.clone(),
                service: service.clone(),
                security: self.security.clone(),
            };
            debug!(client_id = %self.id, "Connecting to {}", service);
            match self.transport.connect(request).await {
                Ok(handle) => match self.replay(handle).await {
                    Ok(()) => return Ok((handle, service.clone())),
                    Err(err) => {
                        warn!(client_id = %self.id, "Subscription replay on {} failed: {}", service, err);
                        self.transport.disconnect(handle).await;
                        last_error = Some(err);
                    }
                },
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    debug!(client_id = %self.id, "Connect to {} failed: {}", service, err);
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| TransportError::Connect("no service configured".into())))
    }

    /// Re-issues every stored subscription on a new connection.
    async fn replay(&self, handle: ConnectionHandle) -> Result<(), TransportError> {
        let subscriptions = self.core().subscriptions.wire_subscriptions();
        for subscription in &subscriptions {
            self.transport.subscribe(handle, subscription).await?;
        }
        if !subscriptions.is_empty() {
            debug!(client_id = %self.id, "Replayed {} subscriptions on {}", subscriptions.len(), handle);
        }
        Ok(())
    }

    fn connected(self: &Arc<Self>, cycle: u64, handle: ConnectionHandle, service: ServiceAddress) {
        let mut guard = self.core();
        let core = &mut *guard;
        if core.cycle != cycle || core.cancel.is_cancelled() {
            debug!(client_id = %self.id, "Connect cycle {} superseded, closing {}", cycle, handle);
            drop(guard);
            self.disconnect_later(handle);
            return;
        }

        core.generation += 1;
        let generation = core.generation;
        let (ops, ops_rx) = mpsc::unbounded_channel();
        info!(client_id = %self.id, "Connected to {} ({}, generation {})", service, handle, generation);
        core.link = Some(Link {
            handle,
            service,
            generation,
            ops,
        });
        core.backoff.reset();
        self.dispatcher.set_live(Some(generation));

        self.set_state(core, LifecycleState::Started, None);
        let hook = if core.reconnecting {
            self.hooks.on_restarted.clone()
        } else {
            self.hooks.on_started.clone()
        };
        core.reconnecting = false;
        if let Some(hook) = hook {
            self.dispatcher.post("started", move |client| hook(client));
        }
        for callback in core.start_waiters.drain(..) {
            self.dispatcher.post("start", move |client| callback(client, Ok(())));
        }

        // Operations interrupted by a connection loss are settled by the replay.
        for op in core.subscriptions.take_pending() {
            self.settle_op(&mut core.subscriptions, op, Ok(()));
        }

        let weak = Arc::downgrade(self);
        self.runtime
            .spawn(run_writer(weak.clone(), generation, handle, ops_rx));
        self.runtime.spawn(run_receiver(weak, generation, handle));
    }

    /// Handles a failed attempt. Returns the delay before the next one, or
    /// `None` when the cycle is over.
    fn connect_failed(&self, cycle: u64, err: TransportError) -> Option<Duration> {
        let mut guard = self.core();
        let core = &mut *guard;
        if core.cycle != cycle || core.cancel.is_cancelled() {
            return None;
        }

        let client_err = ClientError::from(err.clone());
        if err.is_fatal() {
            error!(client_id = %self.id, "Connection rejected, giving up: {}", err);
            core.reconnecting = false;
            self.set_state(core, LifecycleState::Error, Some(client_err.clone()));
            self.fail_outstanding(core, client_err.clone(), client_err.clone());
            self.fail_start_waiters(core, client_err);
            return None;
        }

        self.notify(LifecycleState::Error, Some(client_err));
        self.set_state(core, LifecycleState::Retrying, None);
        let delay = core.backoff.next_sleep();
        warn!(
            client_id = %self.id,
            "Connect attempt {} failed: {}. Retrying in {:.2} seconds",
            core.backoff.attempt(),
            err,
            delay.as_secs_f64()
        );
        Some(delay)
    }

    /// Handles the loss of the live connection.
    pub(crate) fn connection_lost(self: &Arc<Self>, generation: u64, err: TransportError) {
        let mut guard = self.core();
        let core = &mut *guard;
        if !core.is_live(generation) {
            return;
        }
        let Some(link) = core.link.take() else {
            return;
        };
        self.dispatcher.set_live(None);
        self.disconnect_later(link.handle);

        let client_err = ClientError::from(err.clone());
        let released = core.admission.fail_all(&ClientError::Network(format!(
            "Connection lost before delivery was confirmed: {err}"
        )));
        self.finish_sends(released);

        if err.is_fatal() {
            error!(client_id = %self.id, "Connection to {} rejected: {}", link.service, err);
            for op in core.subscriptions.take_pending() {
                self.settle_op(&mut core.subscriptions, op, Err(client_err.clone()));
            }
            self.set_state(core, LifecycleState::Error, Some(client_err));
            return;
        }

        warn!(client_id = %self.id, "Connection to {} lost: {}", link.service, err);
        core.reconnecting = true;
        self.set_state(core, LifecycleState::Retrying, Some(client_err));
        self.spawn_cycle(core);
    }
}

async fn connect_loop(weak: Weak<Inner>, cycle: u64, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let delay = match inner.attempt().await {
            Ok((handle, service)) => {
                inner.connected(cycle, handle, service);
                return;
            }
            Err(err) => match inner.connect_failed(cycle, err) {
                Some(delay) => delay,
                None => return,
            },
        };
        drop(inner);

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Retry cycle {} cancelled", cycle);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Performs wire operations of one link in submission order.
async fn run_writer(
    weak: Weak<Inner>,
    generation: u64,
    handle: ConnectionHandle,
    mut ops: mpsc::UnboundedReceiver<WireOp>,
) {
    while let Some(op) = ops.recv().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match op {
            WireOp::Subscribe { id, subscription } => {
                let result = inner.transport.subscribe(handle, &subscription).await;
                inner.complete_op(generation, id, result.map_err(ClientError::from));
            }
            WireOp::Unsubscribe { id, pattern, share } => {
                let result = inner
                    .transport
                    .unsubscribe(handle, &pattern, share.as_deref())
                    .await;
                inner.complete_op(generation, id, result.map_err(ClientError::from));
            }
            WireOp::Send { seq, message } => match inner.transport.send(handle, &message).await {
                Ok(token) if message.qos == Qos::AtMostOnce => {
                    drop(token);
                    inner.complete_send(generation, seq, Ok(()));
                }
                Ok(token) => {
                    let weak = weak.clone();
                    inner.runtime.spawn(async move {
                        let result = token.confirmed().await.map_err(ClientError::from);
                        if let Some(inner) = weak.upgrade() {
                            inner.complete_send(generation, seq, result);
                        }
                    });
                }
                Err(err) => inner.complete_send(generation, seq, Err(err.into())),
            },
            WireOp::Confirm { tag } => {
                if let Err(err) = inner.transport.confirm(handle, tag).await {
                    debug!("Confirm of delivery {} on {} failed: {}", tag, handle, err);
                }
            }
        }
    }
    trace!("Writer for {} finished", handle);
}

/// Forwards inbound messages of one link until it closes.
async fn run_receiver(weak: Weak<Inner>, generation: u64, handle: ConnectionHandle) {
    loop {
        let Some(transport) = weak.upgrade().map(|inner| inner.transport.clone()) else {
            return;
        };
        match transport.poll_received(handle).await {
            Some(message) => match weak.upgrade() {
                Some(inner) => inner.deliver(generation, message),
                None => return,
            },
            None => {
                let reason = match transport.status(handle) {
                    LinkStatus::Error(err) => err,
                    _ => TransportError::Closed("connection closed".into()),
                };
                if let Some(inner) = weak.upgrade() {
                    inner.connection_lost(generation, reason);
                }
                return;
            }
        }
    }
}
