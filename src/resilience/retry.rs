use crate::config::InfraRetryConfig;
use crate::error::PipelineError;
use crate::messaging::MessagingError;
use crate::store::StoreError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Errors that can tell an unreachable backend apart from a real failure
pub trait InfraFailure {
    fn is_infrastructure(&self) -> bool;
}

impl InfraFailure for StoreError {
    fn is_infrastructure(&self) -> bool {
        StoreError::is_infrastructure(self)
    }
}

impl InfraFailure for MessagingError {
    fn is_infrastructure(&self) -> bool {
        MessagingError::is_infrastructure(self)
    }
}

impl InfraFailure for PipelineError {
    fn is_infrastructure(&self) -> bool {
        PipelineError::is_infrastructure(self)
    }
}

/// Run `op`, retrying infrastructure failures up to `config.max_retries`
/// times with exponential backoff. Any other error is returned at once.
pub async fn with_infra_retry<T, E, F, Fut>(
    operation: &str,
    config: &InfraRetryConfig,
    mut op: F,
) -> Result<T, E>
where
    E: InfraFailure + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut retries = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_infrastructure() && retries < config.max_retries => {
                retries += 1;
                let delay = backoff_delay(config, retries);
                warn!(
                    operation = operation,
                    retry = retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after infrastructure failure"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn backoff_delay(config: &InfraRetryConfig, retry: u32) -> Duration {
    let factor = 1u64.checked_shl(retry.saturating_sub(1)).unwrap_or(u64::MAX);
    let millis = config
        .initial_delay_ms
        .saturating_mul(factor)
        .min(config.max_delay_ms);
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(max_retries: u32) -> InfraRetryConfig {
        InfraRetryConfig {
            max_retries,
            initial_delay_ms: 1,
            max_delay_ms: 4,
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = InfraRetryConfig {
            max_retries: 10,
            initial_delay_ms: 50,
            max_delay_ms: 300,
        };
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(50));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(100));
        assert_eq!(backoff_delay(&config, 3), Duration::from_millis(200));
        assert_eq!(backoff_delay(&config, 4), Duration::from_millis(300));
        assert_eq!(backoff_delay(&config, 64), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_retries_infrastructure_failures_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, StoreError> = with_infra_retry("append", &config(3), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(StoreError::unavailable("append", "connection refused"))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), StoreError> = with_infra_retry("append", &config(2), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::unavailable("append", "down"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), MessagingError> = with_infra_retry("ack", &config(5), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(MessagingError::message_deserialization("bad payload"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
