use crate::error::{IngestError, StoreError};
use std::future::Future;
use std::time::Duration;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Bounded retry for transient storage failures. `retries` counts extra attempts
/// after the first one; delays double from `base_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(MAX_RETRY_DELAY, |delay| delay.min(MAX_RETRY_DELAY))
    }

    pub(super) async fn run<T, F, Fut>(&self, what: &'static str, mut op: F) -> Result<T, IngestError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt <= self.retries => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        error=%err,
                        operation = what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient storage failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(source) => {
                    return Err(IngestError::Persistence {
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }
}
