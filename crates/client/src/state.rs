//! Client lifecycle state.
//!
//! A client is always in exactly one of these states. Transitions are made by
//! the connection manager while it holds the client lock, so every observer
//! sees them in one total order:
//!
//! ```text
//! Stopped ──start──▶ Starting ──connect ok──▶ Started
//!    ▲                  │                        │
//!    │             connect failed          connection lost
//!    │                  ▼                        ▼
//!    │               Retrying ◀──────────────────┘
//!    │                  │
//!  stop done      fatal rejection ──▶ Error
//!    │
//! Stopping ◀── stop (from any state except Stopped)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a [`Client`](crate::Client).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// A connect attempt is in progress and no attempt has failed yet.
    Starting,

    /// Connected; subscriptions have been replayed. The only state in which
    /// `subscribe`, `unsubscribe` and `send` are accepted.
    Started,

    /// The last connect attempt failed or an established connection was
    /// lost. Another attempt is scheduled by the retry policy.
    Retrying,

    /// `stop` was requested and the transport is being torn down.
    Stopping,

    /// Not connected and not trying to connect. Initial state.
    Stopped,

    /// The transport reported a non-recoverable condition (for example an
    /// authentication rejection). No retry is scheduled; `start` may be
    /// called again once the cause is fixed.
    Error,
}

impl LifecycleState {
    /// Short static name, used in logs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Starting => "starting",
            LifecycleState::Started => "started",
            LifecycleState::Retrying => "retrying",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Error => "error",
        }
    }

    /// Whether subscription and send operations are permitted.
    pub fn is_started(&self) -> bool {
        matches!(self, LifecycleState::Started)
    }

    /// Whether a connect cycle is currently running.
    pub fn is_connecting(&self) -> bool {
        matches!(self, LifecycleState::Starting | LifecycleState::Retrying)
    }

    /// Whether the client is at rest and needs `start` to do anything.
    pub fn is_stopped(&self) -> bool {
        matches!(self, LifecycleState::Stopped | LifecycleState::Error)
    }
}

impl Default for LifecycleState {
    fn default() -> Self {
        LifecycleState::Stopped
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
