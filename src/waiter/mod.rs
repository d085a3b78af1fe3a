//! Fixed-interval TCP reachability polling.
//!
//! Hosts booting into rescue or into a freshly imaged OS come up after a
//! roughly known delay, so the waiter polls on a fixed interval instead of
//! backing off. Each attempt and each sleep is clipped to the remaining
//! budget so a timed-out wait never overshoots its deadline by more than one
//! poll interval.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default budget for a single connection attempt.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default pause between attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Errors raised while waiting for an endpoint.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum WaitError {
    /// The endpoint never accepted a connection within the budget.
    #[error("{endpoint} not reachable after {}s ({attempts} attempts): {last_error}", .waited.as_secs())]
    TimedOut {
        /// Endpoint that was polled.
        endpoint: SocketAddr,
        /// Time spent waiting.
        waited: Duration,
        /// Number of connection attempts.
        attempts: u32,
        /// Error from the final attempt.
        last_error: String,
    },
    /// The wait was aborted through its cancellation token.
    #[error("wait for {endpoint} cancelled")]
    Cancelled {
        /// Endpoint that was polled.
        endpoint: SocketAddr,
    },
}

/// Polls a TCP endpoint until it accepts a connection.
#[derive(Clone, Debug)]
pub struct ReachabilityWaiter {
    attempt_timeout: Duration,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl Default for ReachabilityWaiter {
    fn default() -> Self {
        Self::new(DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_POLL_INTERVAL)
    }
}

impl ReachabilityWaiter {
    /// Creates a waiter with explicit attempt and poll durations.
    #[must_use]
    pub fn new(attempt_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            attempt_timeout,
            poll_interval,
            cancel: CancellationToken::new(),
        }
    }

    /// Aborts waits when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Pause between attempts.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Polls `endpoint` until it accepts a TCP connection or `budget`
    /// elapses.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::TimedOut`] once the deadline passes, or
    /// [`WaitError::Cancelled`] when the cancellation token fires.
    pub async fn wait_until_reachable(
        &self,
        endpoint: SocketAddr,
        budget: Duration,
    ) -> Result<(), WaitError> {
        let started = Instant::now();
        let deadline = started + budget;
        let mut attempts = 0_u32;

        loop {
            attempts = attempts.saturating_add(1);
            let remaining = deadline.saturating_duration_since(Instant::now());
            let last_error = match self.attempt(endpoint, remaining).await? {
                None => {
                    debug!(endpoint = %endpoint, attempts, "endpoint reachable");
                    return Ok(());
                }
                Some(err) => err,
            };

            let remaining_after = deadline.saturating_duration_since(Instant::now());
            if remaining_after.is_zero() {
                return Err(WaitError::TimedOut {
                    endpoint,
                    waited: started.elapsed(),
                    attempts,
                    last_error,
                });
            }

            debug!(endpoint = %endpoint, attempts, error = %last_error, "endpoint not reachable yet");
            tokio::select! {
                () = self.cancel.cancelled() => return Err(WaitError::Cancelled { endpoint }),
                () = sleep(self.poll_interval.min(remaining_after)) => {}
            }
        }
    }

    /// Runs the primary wait and, if it times out, one extended wait before
    /// giving up. The returned timeout covers both tiers.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::TimedOut`] when both tiers expire, or
    /// [`WaitError::Cancelled`] when the cancellation token fires.
    pub async fn wait_with_extension(
        &self,
        endpoint: SocketAddr,
        primary: Duration,
        extension: Duration,
    ) -> Result<(), WaitError> {
        let first = match self.wait_until_reachable(endpoint, primary).await {
            Ok(()) => return Ok(()),
            Err(WaitError::TimedOut {
                waited,
                attempts,
                last_error,
                ..
            }) => (waited, attempts, last_error),
            Err(err) => return Err(err),
        };

        warn!(
            endpoint = %endpoint,
            waited_secs = first.0.as_secs(),
            extension_secs = extension.as_secs(),
            "endpoint still unreachable, extending wait"
        );

        match self.wait_until_reachable(endpoint, extension).await {
            Ok(()) => {
                info!(endpoint = %endpoint, "endpoint reachable during extended wait");
                Ok(())
            }
            Err(WaitError::TimedOut {
                waited,
                attempts,
                last_error,
                ..
            }) => Err(WaitError::TimedOut {
                endpoint,
                waited: first.0 + waited,
                attempts: first.1.saturating_add(attempts),
                last_error: format!("{} / {last_error}", first.2),
            }),
            Err(err) => Err(err),
        }
    }

    async fn attempt(
        &self,
        endpoint: SocketAddr,
        remaining: Duration,
    ) -> Result<Option<String>, WaitError> {
        let budget = self.attempt_timeout.min(remaining);
        tokio::select! {
            () = self.cancel.cancelled() => Err(WaitError::Cancelled { endpoint }),
            connect = timeout(budget, TcpStream::connect(endpoint)) => Ok(match connect {
                Ok(Ok(_stream)) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(_) => Some(format!("connect timed out after {}ms", budget.as_millis())),
            }),
        }
    }
}
