//! Retry harness (spec.md §4.2).
//!
//! A single abstraction parameterized by `{classifier, backoff, max_attempts}`,
//! replacing the duplicated per-operation retry loops the design notes (§9)
//! call out as a defect in the source implementation.

use std::time::Duration;

use crate::error::{Error, Result};

const BACKOFF_CEILING: Duration = Duration::from_secs(8);

/// The outcome of one attempt of a retryable operation.
pub enum Attempt<T> {
    /// The operation succeeded.
    Ok(T),
    /// A transient store error (SQLSTATE 55P03, 40001, 40P01). The caller
    /// must have already rolled back the surrounding transaction.
    Transient(sqlx::Error),
    /// A non-retryable failure. Propagated immediately.
    Fatal(Error),
}

/// Selects the backoff shape for a retry loop. Each C4-C8 operation in
/// spec.md §4 specifies its own shape; this enum is the full set used across
/// the crate.
#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    /// `min(base_delay * 1.5^attempt, 8s)`, used by job acquisition (peek).
    JobAcquire,
    /// `min(base_delay * 2^attempt, 8s)`, used by serializable RPC operations.
    Serializable,
    /// Constant `base_delay`, used for lock-not-available waits on exclusive
    /// locks (push, clear, NOWAIT contention).
    Linear,
}

impl Backoff {
    pub fn delay(self, attempt: u32, base_delay: Duration) -> Duration {
        let scaled = match self {
            Backoff::JobAcquire => base_delay.mul_f64(1.5f64.powi(attempt as i32)),
            Backoff::Serializable => base_delay.mul_f64(2f64.powi(attempt as i32)),
            Backoff::Linear => base_delay,
        };
        scaled.min(BACKOFF_CEILING)
    }
}

/// SQLSTATEs classified as transient by the store adapter (spec.md §4.1).
pub const LOCK_NOT_AVAILABLE: &str = "55P03";
pub const SERIALIZATION_FAILURE: &str = "40001";
pub const DEADLOCK_DETECTED: &str = "40P01";

/// Returns the error's SQLSTATE code, if the error came from the database
/// rather than from connection/protocol-level failure.
pub fn sqlstate(err: &sqlx::Error) -> Option<std::borrow::Cow<'_, str>> {
    err.as_database_error().and_then(|e| e.code())
}

/// Classifies a store error as transient per spec.md §4.1. Any other
/// non-OK status is fatal.
pub fn is_transient(err: &sqlx::Error) -> bool {
    matches!(
        sqlstate(err).as_deref(),
        Some(LOCK_NOT_AVAILABLE) | Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED)
    )
}

/// Invokes `f` until it returns `Attempt::Ok`, `Attempt::Fatal`, or
/// `max_retries` attempts have been made. Sleeps `backoff.delay(attempt,
/// base_delay)` between attempts. On exhaustion, returns the last
/// transient error wrapped as `Error::RetriesExhausted`.
#[tracing::instrument(level = "debug", skip(f))]
pub async fn retry<T, F, Fut>(
    backoff: Backoff,
    max_retries: u32,
    base_delay: Duration,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Attempt<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Attempt::Ok(value) => return Ok(value),
            Attempt::Fatal(err) => return Err(err),
            Attempt::Transient(err) => {
                if attempt >= max_retries {
                    tracing::warn!(attempt, ?err, "retries exhausted");
                    return Err(Error::RetriesExhausted {
                        attempts: attempt + 1,
                        source: err,
                    });
                }
                let delay = backoff.delay(attempt, base_delay);
                tracing::debug!(attempt, ?delay, ?err, "retrying after transient error");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_acquire_backoff_grows_and_caps() {
        let base = Duration::from_millis(100);
        let d0 = Backoff::JobAcquire.delay(0, base);
        let d1 = Backoff::JobAcquire.delay(1, base);
        assert_eq!(d0, base);
        assert_eq!(d1, Duration::from_millis(150));
        let huge = Backoff::JobAcquire.delay(100, base);
        assert_eq!(huge, BACKOFF_CEILING);
    }

    #[test]
    fn serializable_backoff_doubles_and_caps() {
        let base = Duration::from_millis(50);
        assert_eq!(Backoff::Serializable.delay(0, base), Duration::from_millis(50));
        assert_eq!(Backoff::Serializable.delay(1, base), Duration::from_millis(100));
        assert_eq!(Backoff::Serializable.delay(2, base), Duration::from_millis(200));
        assert_eq!(Backoff::Serializable.delay(20, base), BACKOFF_CEILING);
    }

    #[test]
    fn linear_backoff_is_constant() {
        let base = Duration::from_millis(250);
        assert_eq!(Backoff::Linear.delay(0, base), base);
        assert_eq!(Backoff::Linear.delay(9, base), base);
    }

    #[tokio::test]
    async fn retry_succeeds_without_retrying_on_first_ok() {
        let mut calls = 0;
        let result: Result<i32> = retry(Backoff::Linear, 3, Duration::from_millis(1), || {
            calls += 1;
            async { Attempt::Ok(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_retries() {
        let mut calls = 0;
        let result: Result<i32> = retry(Backoff::Linear, 2, Duration::from_millis(1), || {
            calls += 1;
            async {
                Attempt::Transient(sqlx::Error::RowNotFound)
            }
        })
        .await;
        assert!(matches!(result, Err(Error::RetriesExhausted { attempts: 3, .. })));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn retry_propagates_fatal_immediately() {
        let mut calls = 0;
        let result: Result<i32> = retry(Backoff::Linear, 5, Duration::from_millis(1), || {
            calls += 1;
            async { Attempt::Fatal(Error::NoFreeSlot) }
        })
        .await;
        assert!(matches!(result, Err(Error::NoFreeSlot)));
        assert_eq!(calls, 1);
    }
}
