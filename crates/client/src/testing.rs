//! Fixtures shared by the engine's unit tests.

use std::{
    sync::{mpsc, Arc, Mutex},
    time::{Duration, Instant},
};

use crate::{
    client::{Client, ClientBuilder},
    config::ClientConfig,
    error::ClientError,
    state::LifecycleState,
    transport::MemoryTransport,
};

const TIMEOUT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(5);

/// What the listeners installed by [`harness`] observed.
#[derive(Clone, Default)]
pub(crate) struct Events {
    log: Arc<Mutex<Vec<(LifecycleState, Option<ClientError>)>>>,
    restarts: Arc<Mutex<usize>>,
}

impl Events {
    /// Every state passed to the state listener, in order.
    pub(crate) fn states(&self) -> Vec<LifecycleState> {
        self.log.lock().unwrap().iter().map(|(state, _)| *state).collect()
    }

    /// Errors reported along with the `Error` state.
    pub(crate) fn errors(&self) -> Vec<ClientError> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(state, _)| *state == LifecycleState::Error)
            .filter_map(|(_, error)| error.clone())
            .collect()
    }

    pub(crate) fn restarts(&self) -> usize {
        *self.restarts.lock().unwrap()
    }

    /// Starts `client` and waits until it is started.
    pub(crate) async fn start(&self, client: &Client) {
        let (tx, rx) = mpsc::channel();
        client.start_with(move |_, result| {
            let _ = tx.send(result);
        });
        assert_eq!(recv(&rx).await, Ok(()));
    }

    /// Waits until the listener has seen `state`.
    pub(crate) async fn wait_for(&self, state: LifecycleState) {
        self.wait_for_count(state, 1).await
    }

    /// Waits until the listener has seen `state` at least `count` times.
    pub(crate) async fn wait_for_count(&self, state: LifecycleState, count: usize) {
        wait_until(|| self.states().iter().filter(|s| **s == state).count() >= count).await
    }

    /// Waits until the broker holds `count` subscriptions for the client's
    /// live connection.
    pub(crate) async fn wait_for_subscriptions(&self, transport: &MemoryTransport, count: usize) {
        wait_until(|| {
            transport
                .live_connections()
                .last()
                .is_some_and(|handle| transport.subscriptions(*handle).len() >= count)
        })
        .await
    }

    /// Waits until every callback queued so far has run.
    ///
    /// Only valid on a started client: the marker is a `start` completion.
    pub(crate) async fn flush(&self, client: &Client) {
        assert_eq!(client.state(), LifecycleState::Started);
        let (tx, rx) = mpsc::channel();
        client.start_with(move |_, _| {
            let _ = tx.send(());
        });
        recv(&rx).await
    }
}

/// A client on a fresh [`MemoryTransport`] at `amqp://localhost`.
pub(crate) fn harness(
    configure: impl FnOnce(ClientConfig) -> ClientConfig,
) -> (Client, Arc<MemoryTransport>, Events) {
    harness_with(configure, |builder| builder)
}

/// Like [`harness`], letting the test install further hooks.
pub(crate) fn harness_with(
    configure: impl FnOnce(ClientConfig) -> ClientConfig,
    customize: impl FnOnce(ClientBuilder) -> ClientBuilder,
) -> (Client, Arc<MemoryTransport>, Events) {
    let transport = Arc::new(MemoryTransport::new());
    let events = Events::default();

    let log = events.log.clone();
    let restarts = events.restarts.clone();
    let config = configure(ClientConfig::new("amqp://localhost").with_client_id("test_client"));
    let builder = Client::builder(config)
        .transport(transport.clone())
        .on_state_changed(move |_, state, error| {
            log.lock().unwrap().push((state, error.cloned()));
        })
        .on_restarted(move |_| *restarts.lock().unwrap() += 1);

    let client = customize(builder).build().unwrap();
    (client, transport, events)
}

/// Receives from a callback channel without blocking the runtime.
pub(crate) async fn recv<T>(rx: &mpsc::Receiver<T>) -> T {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        match rx.try_recv() {
            Ok(value) => return value,
            Err(mpsc::TryRecvError::Empty) if Instant::now() < deadline => {
                tokio::time::sleep(POLL).await
            }
            Err(mpsc::TryRecvError::Empty) => panic!("timed out waiting for callback"),
            Err(mpsc::TryRecvError::Disconnected) => panic!("callback dropped without firing"),
        }
    }
}

/// Polls `condition` until it holds.
pub(crate) async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        tokio::time::sleep(POLL).await;
    }
}
