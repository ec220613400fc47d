use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

use super::StoreError;
use crate::metrics;

pub const MAX_ATTEMPTS: u32 = 3;
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Runs a store write, retrying with exponential backoff. Returns `None`
/// once every attempt failed; the failure is logged and counted, never
/// propagated to the real-time path.
pub async fn persist_with_retry<F, Fut, T>(operation: &'static str, mut attempt_fn: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 1;
    loop {
        match attempt_fn().await {
            Ok(value) => return Some(value),
            Err(store_error) if attempt < MAX_ATTEMPTS => {
                warn!(
                    operation,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %store_error,
                    "store write failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
            }
            Err(store_error) => {
                error!(operation, attempts = attempt, error = %store_error, "store write failed, giving up");
                metrics::record_persistence_failure(operation);
                return None;
            }
        }
    }
}

/// Fire-and-forget variant used by the gateway.
pub fn spawn_persist<F, Fut, T>(operation: &'static str, attempt_fn: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, StoreError>> + Send,
    T: Send + 'static,
{
    tokio::spawn(async move {
        persist_with_retry(operation, attempt_fn).await;
    });
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use tokio::time::Instant;

    use super::*;

    fn flaky(failures: u32, calls: Arc<AtomicU32>) -> impl FnMut() -> std::future::Ready<Result<u32, StoreError>> {
        move || {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if call <= failures {
                Err(StoreError::Malformed(format!("attempt {call} failed")))
            } else {
                Ok(call)
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures_with_doubling_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let result = persist_with_retry("test_write", flaky(2, Arc::clone(&calls))).await;

        assert_eq!(result, Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100 + 200), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(400), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));

        let result = persist_with_retry("test_write", flaky(u32::MAX, Arc::clone(&calls))).await;

        assert_eq!(result, None);
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn first_success_does_not_sleep() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = persist_with_retry("test_write", flaky(0, Arc::clone(&calls))).await;
        assert_eq!(result, Some(1));
    }
}
