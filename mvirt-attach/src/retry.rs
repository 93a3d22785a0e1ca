//! Retry and cancellation policy for remote engine calls.
//!
//! A [`RetryStrategy`] is passed explicitly to every
//! [`AttachmentStore`](crate::store::AttachmentStore) call. Stores run each
//! remote attempt through [`RetryStrategy::run`] and perform no retries of
//! their own.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

/// Bounded retry with a fixed backoff, an optional per-attempt timeout and
/// an optional cancellation signal.
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    max_attempts: u32,
    backoff: Duration,
    timeout: Option<Duration>,
    cancel: Option<watch::Receiver<bool>>,
}

impl RetryStrategy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            timeout: None,
            cancel: None,
        }
    }

    /// Single attempt, no timeout, not cancellable.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Abort in-flight and future calls once `true` is sent on the channel.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Run `call` until it succeeds, fails permanently, or the attempt
    /// budget is spent. Only transient failures are retried.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if self.is_cancelled() {
                return Err(StoreError::Cancelled);
            }

            match self.attempt(call()).await {
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    warn!(
                        "{} failed (attempt {}/{}): {}, retrying in {:?}",
                        operation, attempt, self.max_attempts, e, self.backoff
                    );
                    self.pause().await?;
                }
                Err(e) => {
                    debug!("{} failed after {} attempt(s): {}", operation, attempt, e);
                    return Err(e);
                }
                Ok(value) => return Ok(value),
            }
        }
    }

    async fn attempt<T, Fut>(&self, call: Fut) -> StoreResult<T>
    where
        Fut: Future<Output = StoreResult<T>>,
    {
        let bounded = async {
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, call)
                    .await
                    .unwrap_or(Err(StoreError::Timeout(limit))),
                None => call.await,
            }
        };

        match &self.cancel {
            Some(rx) => {
                let mut rx = rx.clone();
                tokio::select! {
                    result = bounded => result,
                    _ = cancelled(&mut rx) => Err(StoreError::Cancelled),
                }
            }
            None => bounded.await,
        }
    }

    async fn pause(&self) -> StoreResult<()> {
        if self.backoff.is_zero() {
            return Ok(());
        }
        match &self.cancel {
            Some(rx) => {
                let mut rx = rx.clone();
                tokio::select! {
                    _ = tokio::time::sleep(self.backoff) => Ok(()),
                    _ = cancelled(&mut rx) => Err(StoreError::Cancelled),
                }
            }
            None => {
                tokio::time::sleep(self.backoff).await;
                Ok(())
            }
        }
    }
}

impl Default for RetryStrategy {
    /// 3 attempts, 1s apart, 60s per attempt.
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1)).with_timeout(Duration::from_secs(60))
    }
}

/// Resolves once cancellation is signalled. A dropped sender never cancels.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancel| *cancel).await.is_err() {
        std::future::pending::<()>().await;
    }
}
