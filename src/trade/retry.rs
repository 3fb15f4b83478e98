use crate::ports::BrokerError;
use std::future::Future;
use std::time::Duration;

/// Bounded retry with multiplicative backoff around one collaborator call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff: f64,
    retryable: fn(&BrokerError) -> bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, backoff: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            backoff: backoff.max(1.0),
            retryable: BrokerError::is_transient,
        }
    }

    pub fn with_predicate(mut self, retryable: fn(&BrokerError) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn is_retryable(&self, err: &BrokerError) -> bool {
        (self.retryable)(err)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.backoff.powi(retry.saturating_sub(1) as i32);
        self.initial_delay.mul_f64(factor)
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, BrokerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= self.max_attempts || !self.is_retryable(&err) => {
                    if attempt > 1 {
                        log::error!(
                            "[RETRY] {} failed after {} attempts: {}",
                            operation,
                            attempt,
                            err
                        );
                    }
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.delay_for(attempt);
                    log::warn!(
                        "[RETRY] {} attempt {}/{} failed: {}; retrying in {:?}",
                        operation,
                        attempt,
                        self.max_attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
