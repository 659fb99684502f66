use crate::error::ProxyError;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryStrategy {
    NoRetry,
    // Re-pick account/proxy and go again without waiting.
    Immediate,
    FixedDelay(Duration),
    // 2^attempt seconds, capped.
    ExponentialBackoff { attempt: u32, cap_secs: u64 },
}

// Wait policy by error kind. Overload gets its own attempt counter so a
// flapping upstream cannot starve the normal retry budget.
pub fn strategy_for(
    error: &ProxyError,
    overload_attempt: u32,
    retry_interval_secs: u64,
) -> RetryStrategy {
    match error {
        ProxyError::UpstreamOverloaded(_) => RetryStrategy::ExponentialBackoff {
            attempt: overload_attempt,
            cap_secs: 30,
        },
        ProxyError::RateLimited { .. }
        | ProxyError::InvalidCredentials(_)
        | ProxyError::ProxyTransport { .. } => RetryStrategy::Immediate,
        ProxyError::Network(_) => RetryStrategy::FixedDelay(Duration::from_secs(retry_interval_secs)),
        _ => RetryStrategy::NoRetry,
    }
}

pub fn backoff_delay(attempt: u32, cap_secs: u64) -> Duration {
    let secs = 2u64.saturating_pow(attempt).min(cap_secs);
    Duration::from_secs(secs)
}

// Sleep per the strategy; returns whether the caller should retry.
pub async fn apply(strategy: RetryStrategy, trace_id: &str) -> bool {
    match strategy {
        RetryStrategy::NoRetry => {
            debug!("[{}] Non-retryable error, stopping", trace_id);
            false
        }
        RetryStrategy::Immediate => true,
        RetryStrategy::FixedDelay(delay) => {
            info!("[{}] Retrying after {}ms", trace_id, delay.as_millis());
            sleep(delay).await;
            true
        }
        RetryStrategy::ExponentialBackoff { attempt, cap_secs } => {
            let delay = backoff_delay(attempt, cap_secs);
            info!(
                "[{}] Overload backoff: attempt {}, waiting {}s",
                trace_id,
                attempt + 1,
                delay.as_secs()
            );
            sleep(delay).await;
            true
        }
    }
}
