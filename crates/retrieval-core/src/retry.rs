//! Shared retry/backoff helper for RPC calls to external services
//! (embedding, reranker) that classify their own errors as transient or not.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{RetrievalError, RetrievalResult};

/// Retry `f` up to `max_attempts` times with exponential backoff and jitter,
/// stopping immediately on a non-transient error.
pub async fn with_retries<F, Fut, T>(max_attempts: u32, base_delay: Duration, mut f: F) -> RetrievalResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RetrievalResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.transient() && attempt < max_attempts => {
                let backoff = base_delay * 2u32.pow(attempt - 1);
                let jitter_ms = rand::thread_rng().gen_range(0..50);
                tracing::warn!(attempt, error = %err, "transient rpc error, retrying");
                tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Convenience wrapper for cases where a caller already knows it wants the
/// default attempt count, useful in tests.
#[cfg(test)]
pub async fn retry_default<F, Fut, T>(f: F) -> RetrievalResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RetrievalResult<T>>,
{
    with_retries(3, Duration::from_millis(1), f).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let result = with_retries(3, Duration::from_millis(1), || async { Ok::<_, RetrievalError>(42) }).await;
        assert_eq!(result.expect("ok"), 42);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = retry_default(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(RetrievalError::TransientRpc {
                        service: "embed".into(),
                        message: "timeout".into(),
                    })
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.expect("ok"), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let result: RetrievalResult<i32> = retry_default(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                Err(RetrievalError::PermanentRpc {
                    service: "embed".into(),
                    message: "bad request".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
