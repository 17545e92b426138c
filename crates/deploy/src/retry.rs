//! Fixed-count, fixed-delay retries for transient calls.

use std::future::Future;

use anyhow::Result;
use backon::Retryable;

use crate::{config::RetrySettings, error::DeployError};

/// Typed failures that describe a definitive answer rather than a transient glitch.
fn is_transient(err: &anyhow::Error) -> bool {
    !matches!(
        DeployError::find(err),
        Some(DeployError::InvalidCredential(_) | DeployError::UserCancelled(_))
    )
}

/// Retry `call` according to `retry`. Only use this for idempotent, read-only calls.
pub async fn retry_transient<T, F, Fut>(retry: &RetrySettings, what: &str, call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    call.retry(retry.backoff())
        .sleep(tokio::time::sleep)
        .when(is_transient)
        .notify(|err: &anyhow::Error, delay| {
            tracing::debug!(call = what, error = %err, ?delay, "Transient call failed, retrying");
        })
        .await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn fast(attempts: usize) -> RetrySettings {
        RetrySettings {
            attempts,
            delay_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicUsize::new(0);
        let result = retry_transient(&fast(3), "flaky", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                anyhow::bail!("connection reset");
            }
            Ok(42)
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_transient(&fast(3), "down", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("unreachable")
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_definitive_failures_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_transient(&fast(3), "verify", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DeployError::InvalidCredential("revoked".to_string()).into())
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
