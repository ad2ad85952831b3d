//! Busy-retry with exponential backoff. SQLITE_BUSY is transient and must
//! not surface as a hard failure on its first occurrence.

use std::future::Future;
use std::time::Duration;

use crate::error::{LcmError, LcmResult};

const BASE_DELAY_MS: u64 = 20;

/// Run `op` up to `ceiling` times, doubling the delay between attempts
/// whenever it fails with a retryable (`StorageBusy`) error. Any other
/// error, or exhausting the ceiling, is returned immediately.
pub async fn with_busy_retry<T, F, Fut>(ceiling: u32, mut op: F) -> LcmResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LcmResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < ceiling => {
                let delay = BASE_DELAY_MS * 2u64.pow(attempt);
                tracing::debug!(attempt, delay_ms = delay, "storage busy, retrying");
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

pub fn busy_ceiling_default() -> u32 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let attempts = AtomicU32::new(0);
        let result = with_busy_retry(5, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(LcmError::StorageBusy("locked".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_at_ceiling() {
        let result: LcmResult<()> =
            with_busy_retry(2, || async { Err(LcmError::StorageBusy("locked".into())) }).await;
        assert!(matches!(result, Err(LcmError::StorageBusy(_))));
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let attempts = AtomicU32::new(0);
        let result: LcmResult<()> = with_busy_retry(5, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(LcmError::NotFound("x".into())) }
        })
        .await;
        assert!(matches!(result, Err(LcmError::NotFound(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
