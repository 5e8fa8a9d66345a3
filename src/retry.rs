//! Reconnect policy and timeout utilities.
//!
//! Reconnects use a fixed delay between attempts with a hard cap on the number
//! of attempts since the last successful open. There is no backoff or jitter.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Policy controlling automatic reconnect attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum number of reconnect attempts after a connection is lost.
    ///
    /// `0` disables automatic reconnects.
    pub max_attempts: u32,
    /// Delay applied before every reconnect attempt.
    pub delay: Duration,
}

impl ReconnectPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
    pub const DEFAULT_DELAY: Duration = Duration::from_secs(3);

    /// Policy that never reconnects automatically.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            delay: Self::DEFAULT_DELAY,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            delay: Self::DEFAULT_DELAY,
        }
    }
}

/// Attempts made since the last successful open.
#[derive(Clone, Debug)]
pub(crate) struct RetryCounter {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl RetryCounter {
    pub(crate) fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Claims the next attempt and returns the delay to wait before it, or
    /// `None` once the cap is reached.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            debug!(
                event = "reconnect_attempts_exhausted",
                attempts = self.attempts,
                max_attempts = self.policy.max_attempts
            );
            return None;
        }
        self.attempts += 1;
        Some(self.policy.delay)
    }

    pub(crate) fn reset(&mut self) {
        self.attempts = 0;
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}
