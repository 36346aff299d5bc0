//! Fixed-delay retry policy for long-lived watch loops.

use std::{future::Future, time::Duration};

use backoff::backoff::{Backoff, Constant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("retry cancelled")]
    Cancelled,

    #[error(transparent)]
    Permanent(E),
}

impl<E> RetryError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled)
    }
}

/// Retries an operation indefinitely with a fixed delay until it succeeds,
/// fails permanently, or the token is cancelled.
///
/// The operation classifies its failures with [`backoff::Error`]:
/// `Transient` errors are logged and retried, `Permanent` errors stop the loop.
/// A running attempt is never interrupted; it is expected to watch the same
/// token and return once it fires. Only the wait between attempts is cut short.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    delay: Duration,
    cancel: CancellationToken,
}

impl RetryPolicy {
    pub fn new(delay: Duration, cancel: CancellationToken) -> Self {
        Self { delay, cancel }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub async fn run<T, E, F, Fut>(&self, name: &str, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, backoff::Error<E>>>,
        E: std::fmt::Display,
    {
        let mut backoff = Constant::new(self.delay);
        let mut attempt: u64 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
            attempt += 1;

            let (err, retry_after) = match op().await {
                Ok(value) => return Ok(value),
                Err(backoff::Error::Permanent(err)) => {
                    warn!(op = name, attempt, error = %err, "Giving up after permanent error");
                    return Err(RetryError::Permanent(err));
                }
                Err(backoff::Error::Transient { err, retry_after }) => (err, retry_after),
            };

            let delay = retry_after
                .or_else(|| backoff.next_backoff())
                .unwrap_or(self.delay);
            warn!(
                op = name,
                attempt,
                error = %err,
                "Operation failed, retrying in {:?}",
                delay
            );

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(op = name, "Retry loop cancelled while waiting");
                    return Err(RetryError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
