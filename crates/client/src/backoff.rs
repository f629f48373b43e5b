//! Capped exponential backoff for reconnect attempts.
//!
//! When a connect attempt fails the client waits before trying again. The
//! delay doubles with every consecutive failure until it reaches a ceiling:
//!
//! ```text
//! delay[n] = min(ceiling, base * 2^n)     n = failed attempts so far
//! ```
//!
//! With the defaults (base=1s, ceiling=60s):
//! - Attempt 1 fails: wait 1s
//! - Attempt 2 fails: wait 2s
//! - Attempt 3 fails: wait 4s
//! - ...
//! - Attempt 7+ fails: wait 60s (capped)
//!
//! There is no attempt limit. The client keeps retrying until a connect
//! succeeds or `stop` is called; callers that want a bounded number of
//! attempts call `stop` from their state-change listener.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use lumen_client::Backoff;
//!
//! let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
//! assert_eq!(backoff.next_sleep(), Duration::from_millis(100));
//! assert_eq!(backoff.next_sleep(), Duration::from_millis(200));
//!
//! // Connection succeeded
//! backoff.reset();
//! assert_eq!(backoff.next_sleep(), Duration::from_millis(100));
//! ```

use std::time::Duration;

use crate::config::RetryConfig;

/// Largest exponent applied to the base delay. `2^32` times any sensible
/// base is already far beyond every ceiling, so stop growing there.
const MAX_EXPONENT: u32 = 32;

/// Exponential backoff controller for the connect loop.
///
/// Owned by the connection manager and mutated only under the client lock.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay before the first retry.
    base_delay: Duration,

    /// Maximum delay between attempts.
    max_delay: Duration,

    /// Count of failed attempts since the last successful connect.
    attempt: u32,
}

impl Backoff {
    /// Creates a backoff with the given base delay and ceiling.
    ///
    /// A ceiling lower than the base is raised to the base.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base_delay: base,
            max_delay: max.max(base),
            attempt: 0,
        }
    }

    /// Resets the attempt counter. Called on every successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Returns the delay to wait after the current failure and advances the
    /// attempt counter.
    ///
    /// Successive calls never return a shorter delay than the previous one
    /// until [`reset`](Self::reset) is called.
    pub fn next_sleep(&mut self) -> Duration {
        let sleep = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        sleep
    }

    /// Delay that the next call to [`next_sleep`](Self::next_sleep) returns.
    pub fn current_delay(&self) -> Duration {
        self.delay_for(self.attempt)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(MAX_EXPONENT));
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Number of failed attempts since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

impl Default for Backoff {
    /// Base delay of 1 second, capped at 60 seconds.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl From<&RetryConfig> for Backoff {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }
}
