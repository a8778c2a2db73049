use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::OrchestrationResult;

/// Exponential delay for the given attempt (1-based), capped and optionally jittered.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let base = config.base_delay_ms.saturating_mul(1u64 << exponent);
    let capped = base.min(config.max_delay_ms);
    let millis = if config.jitter && capped > 0 {
        rand::rng().random_range(capped / 2..=capped)
    } else {
        capped
    };
    Duration::from_millis(millis)
}

/// Run `operation`, retrying transient failures with backoff.
pub async fn retry_transient<T, F, Fut>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> OrchestrationResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = OrchestrationResult<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = backoff_delay(config, attempt);
                warn!(
                    operation = %operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                debug!(operation = %operation_name, attempt, "Giving up");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestrationError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter: false,
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = config();
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&config, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(&config, 10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = RetryConfig {
            jitter: true,
            ..config()
        };
        for _ in 0..50 {
            let delay = backoff_delay(&config, 2);
            assert!(delay >= Duration::from_millis(100) && delay <= Duration::from_millis(200));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let attempts = AtomicU32::new(0);
        let result = retry_transient(&config(), "record", || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(OrchestrationError::Transient("busy".to_string()))
            } else {
                Ok("stored")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "stored");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_domain_errors_fail_fast() {
        let attempts = AtomicU32::new(0);
        let result: OrchestrationResult<()> = retry_transient(&config(), "record", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(OrchestrationError::validation("bad input"))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
