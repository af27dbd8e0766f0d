use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use crate::errors::{Result, UploadError};

/// Fixed ladder of delays applied between attempts. The first attempt runs
/// immediately; each retry sleeps the next rung before running again.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self { delays: Vec::new() }
    }

    /// Delay before retry number `attempt` (zero-based), `None` once the
    /// ladder is exhausted.
    pub fn delay(&self, attempt: usize) -> Option<Duration> {
        self.delays.get(attempt).copied()
    }

    pub fn max_retries(&self) -> usize {
        self.delays.len()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delays: [0, 1000, 3000, 5000, 10_000]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
        }
    }
}

/// Runs `operation`, retrying transient failures per the policy. Errors for
/// which [`UploadError::is_transient`] is false surface immediately.
pub async fn retry_transient<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() => match policy.delay(attempt) {
                Some(delay) => {
                    tracing::debug!(attempt, ?delay, %error, "retrying transient failure");
                    sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(error),
            },
            Err(error) => return Err(error),
        }
    }
}
