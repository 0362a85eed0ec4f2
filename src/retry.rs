//! Bounded retry with a fixed delay between attempts
//!
//! Every outbound metadata call goes through [`Retry::exec`]. The delay is a
//! timer sleep, and the retry count is the only timeout mechanism: the worst
//! case time spent in one call is `max_retries * interval` plus the time of
//! the attempts themselves.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Default number of retries for metadata requests
pub const DEFAULT_RETRY_COUNT: u32 = 5;

/// Default delay between two attempts
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(4);

/// Retry policy for a metadata service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retry {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay between attempts
    pub interval: Duration,
    /// When false, the operation is attempted exactly once
    pub enabled: bool,
}

impl Default for Retry {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_COUNT, DEFAULT_RETRY_INTERVAL)
    }
}

impl Retry {
    pub fn new(max_retries: u32, interval: Duration) -> Self {
        Self {
            max_retries,
            interval,
            enabled: true,
        }
    }

    /// A policy that never retries
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            interval: Duration::ZERO,
            enabled: false,
        }
    }

    /// Derive the retry count from a total time budget and a poll interval.
    ///
    /// `from_budget(300s, 5s)` gives 60 retries five seconds apart.
    pub fn from_budget(total: Duration, poll: Duration) -> Self {
        let max_retries = if poll.is_zero() {
            0
        } else {
            (total.as_millis() / poll.as_millis()).min(u32::MAX as u128) as u32
        };
        Self::new(max_retries, poll)
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Run `op` until it succeeds or the retries are used up.
    ///
    /// The error of the last attempt is returned on exhaustion.
    pub async fn exec<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.exec_if(op, |_| true).await
    }

    /// Like [`Retry::exec`], but an error for which `retryable` is false is
    /// returned without waiting for another attempt.
    pub async fn exec_if<T, E, F, Fut, P>(&self, mut op: F, retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let mut retries_left = if self.enabled { self.max_retries } else { 0 };

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if retries_left > 0 && retryable(&e) => {
                    debug!(
                        "Attempt failed ({}), {} retries left, retrying in {:?}",
                        e, retries_left, self.interval
                    );
                    retries_left -= 1;
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}
