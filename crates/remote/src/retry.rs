//! Retry with exponential backoff for remote operations

use crate::config::RetryConfig;
use crate::error::{RemoteError, Result};
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry a fallible async operation with exponential backoff.
///
/// Non-retryable errors fail immediately; cancellation interrupts the
/// backoff sleep and surfaces as `Unavailable`.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation_name: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut backoff = create_backoff(config);
    let mut attempts = 0;

    loop {
        attempts += 1;

        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                if !err.is_retryable() {
                    return Err(err);
                }

                if attempts >= config.max_attempts {
                    warn!(
                        operation = operation_name,
                        attempts,
                        error = %err,
                        "Operation failed after maximum retries"
                    );
                    return Err(RemoteError::RetryExhausted {
                        operation: operation_name.to_string(),
                        attempts,
                        last_error: err.to_string(),
                    });
                }

                let delay = backoff.next_backoff().unwrap_or(Duration::from_millis(
                    config.max_backoff_ms,
                ));
                warn!(
                    operation = operation_name,
                    attempts,
                    error = %err,
                    retry_in_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => {
                        return Err(RemoteError::unavailable("operation cancelled"));
                    }
                }
            }
        }
    }
}

fn create_backoff(config: &RetryConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(config.initial_backoff_ms))
        .with_max_interval(Duration::from_millis(config.max_backoff_ms))
        .with_multiplier(config.backoff_multiplier)
        .with_max_elapsed_time(None)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn quick_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            backoff_multiplier: 2.0,
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn succeeds_first_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let cancel = CancellationToken::new();

        let result = retry_with_backoff(&quick_config(), &cancel, "test", move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RemoteError>(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let cancel = CancellationToken::new();

        let result = retry_with_backoff(&quick_config(), &cancel, "test", move || {
            let calls = calls_clone.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RemoteError::unavailable("flaky"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let cancel = CancellationToken::new();

        let result: Result<()> = retry_with_backoff(&quick_config(), &cancel, "test", move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::unavailable("always down"))
            }
        })
        .await;

        assert!(matches!(result, Err(RemoteError::RetryExhausted { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_fast() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let cancel = CancellationToken::new();

        let result: Result<()> = retry_with_backoff(&quick_config(), &cancel, "test", move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::CacheTooFull)
            }
        })
        .await;

        assert!(matches!(result, Err(RemoteError::CacheTooFull)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
