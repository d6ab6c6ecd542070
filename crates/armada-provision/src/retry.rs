//! Bounded retry with fixed delays
//!
//! All retries in this crate run against a [`RetryPolicy`]: a fixed delay
//! between attempts and a total time budget. There is no unbounded retry
//! anywhere. Policies are driven through tokio's clock, so tests can pause
//! time and step through budgets instantly.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Fixed-delay retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause between attempts.
    pub delay: Duration,

    /// Total budget measured from the first attempt.
    pub total: Duration,
}

/// Short budget for shrugging off eventual consistency in listings.
pub const SHORT_ATTEMPT: RetryPolicy = RetryPolicy {
    delay: Duration::from_millis(200),
    total: Duration::from_secs(15),
};

/// Polling budget for a server leaving the build state.
pub const BUILD_POLL: RetryPolicy = RetryPolicy {
    delay: Duration::from_secs(10),
    total: Duration::from_secs(5 * 60),
};

/// Budget for operations that settle slowly, such as address association.
pub const LONG_ATTEMPT: RetryPolicy = RetryPolicy {
    delay: Duration::from_secs(1),
    total: Duration::from_secs(3 * 60),
};

/// Why a retried operation gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The classifier declared the error fatal; no further attempts ran.
    Fatal(E),

    /// The budget ran out. Carries the attempt count and the last error.
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    /// Unwraps to the underlying error, discarding how the retry ended.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Fatal(e) => e,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

/// Runs `op` until it succeeds, a non-retryable error occurs, or the policy
/// budget is spent. The attempt counter passed to `op` starts at 1.
pub async fn retry<T, E, F, Fut, R>(
    policy: RetryPolicy,
    mut op: F,
    mut retryable: R,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(&E) -> bool,
{
    retry_with_notify(policy, &mut op, &mut retryable, |_, _| {}).await
}

/// Like [`retry`], but invokes `notify` with the error and the attempt
/// number before each sleep. Used to surface progress while polling.
pub async fn retry_with_notify<T, E, F, Fut, R, N>(
    policy: RetryPolicy,
    mut op: F,
    mut retryable: R,
    mut notify: N,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(&E) -> bool,
    N: FnMut(&E, u32),
{
    let deadline = Instant::now() + policy.total;
    let mut attempt: u32 = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if !retryable(&err) => return Err(RetryError::Fatal(err)),
            Err(err) => {
                if Instant::now() + policy.delay >= deadline {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                notify(&err, attempt);
                sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result = retry(
            SHORT_ATTEMPT,
            move |_| {
                let calls = calls2.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("not yet")
                    } else {
                        Ok(42)
                    }
                }
            },
            |_| true,
        )
        .await;
        assert!(matches!(result, Ok(42)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<(), _> = retry(
            SHORT_ATTEMPT,
            move |_| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("fatal")
                }
            },
            |_| false,
        )
        .await;
        assert!(matches!(result, Err(RetryError::Fatal("fatal"))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_reports_attempts() {
        let result: Result<(), _> = retry(SHORT_ATTEMPT, |_| async { Err("busy") }, |_| true).await;
        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(last, "busy");
                // 15s budget at 200ms per pause allows 75 sleeps.
                assert_eq!(attempts, 75);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_sees_attempt_numbers() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let _ = retry_with_notify(
            SHORT_ATTEMPT,
            move |_| {
                let calls = calls2.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err("building")
                    } else {
                        Ok(())
                    }
                }
            },
            |_| true,
            move |err: &&str, attempt| seen2.lock().unwrap().push((err.to_string(), attempt)),
        )
        .await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], ("building".to_string(), 1));
        assert_eq!(seen[2], ("building".to_string(), 3));
    }
}
