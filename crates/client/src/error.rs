//! Error types for the client engine.
//!
//! `ClientError` is the only error a caller of [`Client`](crate::Client)
//! ever sees. It is returned synchronously when a precondition can be
//! checked at call time, and otherwise handed to exactly one completion
//! callback or to the state-change listener.
//!
//! # Error Categories
//!
//! **Caller errors** (raised synchronously, never retried):
//! - `InvalidArgument`: malformed or missing parameter
//! - `Range`: numeric value outside what the protocol can represent
//! - `Config`: client configuration failed validation
//!
//! **State errors** (raised synchronously):
//! - `Stopped`: operation needs a `Started` client
//! - `Unsubscribed`: no subscription matches the (pattern, share) key
//!
//! **Runtime errors** (reported through callbacks):
//! - `Network`: connect failure, lost confirmation, mid-flight disconnect
//! - `Security`: non-recoverable rejection by the service
//!
//! # Usage
//!
//! ```ignore
//! match client.send("sensors/a", "23.5", SendOptions::default()) {
//!     Ok(true) => {}
//!     Ok(false) => client.drained().await,
//!     Err(ClientError::Stopped(state)) => eprintln!("not connected ({state})"),
//!     Err(e) => return Err(e),
//! }
//! ```

use thiserror::Error;

use crate::state::LifecycleState;

/// Convenience result alias used throughout the crate.
pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// The unified error type for client operations.
///
/// Cloneable so that a single failure (for example a lost connection) can be
/// delivered to every affected completion callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// A parameter is malformed or missing.
    ///
    /// Examples: an empty topic pattern, a share name containing `:`, a
    /// service URL with an unsupported scheme.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A numeric value is outside the bounds the protocol can carry.
    ///
    /// Raised for negative, fractional, non-finite, or oversized time-to-live
    /// values.
    #[error("Range error: {0}")]
    Range(String),

    /// The operation requires a `Started` client.
    ///
    /// Carries the state the client was in when the call was made. Also the
    /// error handed to pending `start` callbacks when `stop` wins the race.
    #[error("Client is not started (state: {0})")]
    Stopped(LifecycleState),

    /// `unsubscribe` was called for a (pattern, share) pair that has no
    /// subscription.
    #[error("Client is not subscribed to pattern '{pattern}'{}", share_suffix(.share))]
    Unsubscribed {
        pattern: String,
        share: Option<String>,
    },

    /// The transport failed: connect failure, lost delivery confirmation,
    /// or a disconnect while a message was in flight.
    ///
    /// Recovery is automatic for the connection itself; the failed operation
    /// is reported once and not retried.
    #[error("Network error: {0}")]
    Network(String),

    /// The service rejected the client in a way that retrying cannot fix,
    /// such as bad credentials or an untrusted certificate.
    #[error("Security error: {0}")]
    Security(String),

    /// The client configuration failed validation.
    #[error("Configuration error: {0}")]
    Config(String),
}

fn share_suffix(share: &Option<String>) -> String {
    share
        .as_deref()
        .map(|name| format!(" with share '{name}'"))
        .unwrap_or_default()
}

impl ClientError {
    /// Whether this error came from argument validation.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ClientError::InvalidArgument(_) | ClientError::Range(_) | ClientError::Config(_)
        )
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        ClientError::InvalidArgument(message.into())
    }

    pub(crate) fn range(message: impl Into<String>) -> Self {
        ClientError::Range(message.into())
    }
}

impl From<validator::ValidationErrors> for ClientError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ClientError::Config(errors.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsubscribed_display() {
        let err = ClientError::Unsubscribed {
            pattern: "/foo".into(),
            share: None,
        };
        assert_eq!(err.to_string(), "Client is not subscribed to pattern '/foo'");

        let err = ClientError::Unsubscribed {
            pattern: "/foo".into(),
            share: Some("workers".into()),
        };
        assert_eq!(
            err.to_string(),
            "Client is not subscribed to pattern '/foo' with share 'workers'"
        );
    }

    #[test]
    fn test_stopped_display_carries_state() {
        let err = ClientError::Stopped(LifecycleState::Retrying);
        assert_eq!(err.to_string(), "Client is not started (state: retrying)");
    }

    #[test]
    fn test_is_validation() {
        assert!(ClientError::invalid("x").is_validation());
        assert!(ClientError::range("x").is_validation());
        assert!(!ClientError::Network("x".into()).is_validation());
        assert!(!ClientError::Stopped(LifecycleState::Stopped).is_validation());
    }
}
