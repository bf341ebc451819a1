use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::cancel::OpContext;
use super::error::{StoreError, StoreResult};

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Policy for establishing the pool.
    pub const CONNECT: RetryPolicy = RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(8),
    };

    /// Policy for individual statements once connected.
    pub const EXECUTE: RetryPolicy = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(2),
    };

    /// Delay after the given failed attempt (1-based): base, 2*base, 4*base...
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

/// Runs `f` until it succeeds, fails with a non-transient error, exhausts
/// `policy.max_attempts`, or `ctx` fires.
pub async fn with_retry<T, F, Fut>(
    ctx: &OpContext,
    policy: RetryPolicy,
    op: &'static str,
    mut f: F,
) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match ctx.run(f()).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if err.is_cancellation() || !err.is_transient() {
            return Err(err);
        }
        if attempt >= max_attempts {
            return Err(StoreError::RetriesExhausted {
                op,
                attempts: attempt,
                last: Box::new(err),
            });
        }

        let delay = policy.delay_after(attempt);
        warn!(
            "Database: {} attempt {}/{} failed: {}; retrying in {:?}",
            op, attempt, max_attempts, err, delay
        );
        ctx.sleep(delay).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn busy() -> StoreError {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(5),
            Some("database is locked".to_string()),
        ))
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::CONNECT;
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_after(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_after(10), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = with_retry(&OpContext::background(), fast_policy(3), "probe", || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(busy())
                } else {
                    Ok("up")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "up");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: StoreResult<()> =
            with_retry(&OpContext::background(), fast_policy(4), "probe", || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(busy()) }
            })
            .await;

        match result {
            Err(StoreError::RetriesExhausted { op, attempts, .. }) => {
                assert_eq!(op, "probe");
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: StoreResult<()> =
            with_retry(&OpContext::background(), fast_policy(5), "probe", || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(StoreError::Invalid("bad dsn".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(StoreError::Invalid(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_stops_retrying() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
        };
        let ctx = OpContext::background().with_timeout(Duration::from_millis(50));

        let started = std::time::Instant::now();
        let result: StoreResult<()> = with_retry(&ctx, policy, "probe", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(busy()) }
        })
        .await;

        assert!(matches!(result, Err(StoreError::DeadlineExceeded)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
