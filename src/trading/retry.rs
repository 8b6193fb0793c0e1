//! Bounded retry for broker calls.

use std::future::Future;
use std::time::Duration;

use backoff::future::retry_notify;
use backoff::ExponentialBackoffBuilder;
use tracing::warn;

use super::error::{TradingError, TradingResult};

/// Attempt cap, first backoff interval and per-attempt timeout.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_interval: Duration, call_timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval,
            call_timeout,
        }
    }
}

/// Run `op` until it succeeds or `max_attempts` is spent.
///
/// Broker errors are retried with exponential backoff. A timed-out attempt is
/// not retried and surfaces as `TradingError::Timeout`.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, operation: &str, mut op: F) -> TradingResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TradingResult<T>>,
{
    let backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(policy.initial_interval)
        .with_max_elapsed_time(None)
        .build();

    let mut attempt = 0u32;
    retry_notify(
        backoff,
        || {
            attempt += 1;
            let current = attempt;
            let fut = op();
            async move {
                match tokio::time::timeout(policy.call_timeout, fut).await {
                    Err(_) => Err(backoff::Error::permanent(TradingError::timeout(operation))),
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e @ TradingError::Broker { .. })) if current < policy.max_attempts => {
                        Err(backoff::Error::transient(e))
                    }
                    Ok(Err(e)) => Err(backoff::Error::permanent(e)),
                }
            }
        },
        |e: TradingError, wait: Duration| {
            warn!(operation, error = %e, retry_in_ms = wait.as_millis() as u64, "Broker call failed, retrying");
        },
    )
    .await
}
