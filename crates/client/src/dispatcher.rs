//! Serialized delivery of user callbacks.
//!
//! Every callback a client invokes (lifecycle hooks, completions, the state
//! listener, receive handlers) is posted to one FIFO queue and executed by a
//! dedicated thread, one at a time. User code may therefore call back into
//! the client from any callback without re-entering it: whatever it
//! triggers is queued behind the current callback.
//!
//! Jobs posted for a connection generation only run while that generation is
//! live. Once a newer connection has started, or the client stopped, queued
//! deliveries from the old connection are dropped.
//!
//! A panicking callback is logged and the queue moves on.

use std::{
    any::Any,
    fmt,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
};

use tokio::sync::mpsc;
use tracing::{error, trace};

use crate::{
    client::Client,
    error::{ClientError, Result},
    message::SentMessage,
    state::LifecycleState,
};

/// Completion of `start`.
pub type StartCallback = Box<dyn FnOnce(&Client, Result<()>) + Send>;

/// Completion of `stop`.
pub type StopCallback = Box<dyn FnOnce(&Client) + Send>;

/// Completion of `subscribe`/`unsubscribe`: result, pattern and share name.
pub type SubscribeCallback = Box<dyn FnOnce(&Client, Result<()>, &str, Option<&str>) + Send>;

/// Completion of `send`, with an echo of the message.
pub type SendCallback = Box<dyn FnOnce(&Client, Result<()>, &SentMessage) + Send>;

/// State-change listener: new state and the error that caused it, if any.
pub type StateListener = Arc<dyn Fn(&Client, LifecycleState, Option<&ClientError>) + Send + Sync>;

/// Hook without arguments beyond the client, e.g. `on_started`.
pub type LifecycleHook = Arc<dyn Fn(&Client) + Send + Sync>;

/// Where a job came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// Client-level event; always delivered.
    Client,

    /// Produced by one connection; dropped unless that connection is live.
    Generation(u64),
}

struct Job<C> {
    origin: Origin,
    label: &'static str,
    run: Box<dyn FnOnce(&C) + Send>,
}

/// Posting side of the queue.
pub(crate) struct Dispatcher<C> {
    tx: mpsc::UnboundedSender<Job<C>>,
    live: Arc<AtomicU64>,
}

/// Receiving side, consumed by [`DispatchQueue::spawn`].
pub(crate) struct DispatchQueue<C> {
    rx: mpsc::UnboundedReceiver<Job<C>>,
    live: Arc<AtomicU64>,
}

impl<C: 'static> Dispatcher<C> {
    pub(crate) fn new() -> (Dispatcher<C>, DispatchQueue<C>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let live = Arc::new(AtomicU64::new(0));
        (
            Dispatcher {
                tx,
                live: live.clone(),
            },
            DispatchQueue { rx, live },
        )
    }

    /// Queues a client-level callback.
    pub(crate) fn post<F>(&self, label: &'static str, run: F)
    where
        F: FnOnce(&C) + Send + 'static,
    {
        self.push(Origin::Client, label, Box::new(run));
    }

    /// Queues a callback that belongs to one connection generation.
    pub(crate) fn post_for<F>(&self, generation: u64, label: &'static str, run: F)
    where
        F: FnOnce(&C) + Send + 'static,
    {
        self.push(Origin::Generation(generation), label, Box::new(run));
    }

    fn push(&self, origin: Origin, label: &'static str, run: Box<dyn FnOnce(&C) + Send>) {
        if self.tx.send(Job { origin, label, run }).is_err() {
            trace!("Dispatcher closed, dropping '{}' callback", label);
        }
    }

    /// Marks the generation whose callbacks may run. `None` suppresses all
    /// generation-bound callbacks.
    pub(crate) fn set_live(&self, generation: Option<u64>) {
        self.live.store(generation.unwrap_or(0), Ordering::Release);
    }
}

impl<C: 'static> DispatchQueue<C> {
    /// Starts the dispatch thread.
    ///
    /// `resolve` produces the context handed to each callback. The thread
    /// exits when every [`Dispatcher`] is dropped or `resolve` returns `None`.
    pub(crate) fn spawn<R>(self, name: String, resolve: R) -> io::Result<thread::JoinHandle<()>>
    where
        R: Fn() -> Option<C> + Send + 'static,
    {
        thread::Builder::new()
            .name(name)
            .spawn(move || self.run(resolve))
    }

    fn run<R>(mut self, resolve: R)
    where
        R: Fn() -> Option<C>,
    {
        while let Some(job) = self.rx.blocking_recv() {
            if let Origin::Generation(generation) = job.origin {
                if self.live.load(Ordering::Acquire) != generation {
                    trace!(
                        "Suppressing '{}' callback from superseded connection {}",
                        job.label,
                        generation
                    );
                    continue;
                }
            }

            let Some(context) = resolve() else {
                break;
            };
            let run = job.run;
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| run(&context))) {
                error!(
                    "User callback '{}' panicked: {}",
                    job.label,
                    panic_message(panic.as_ref())
                );
            }
        }
        trace!("Dispatch thread exiting");
    }
}

impl<C> fmt::Debug for Dispatcher<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("live", &self.live.load(Ordering::Relaxed))
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
