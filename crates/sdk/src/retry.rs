//! Retry with exponential backoff.
//!
//! Used when a client establishes its first connection. Backoff grows from
//! `initial_backoff` up to `max_backoff`, with jitter, for at most
//! `max_attempts` attempts in total.

use std::{
    future::Future,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use backon::{ExponentialBuilder, Retryable};
use tokio_util::sync::CancellationToken;

use crate::{
    config::RetryPolicy,
    error::{Result, SdkError},
};

fn backoff(policy: &RetryPolicy) -> ExponentialBuilder {
    // backon counts retries, not attempts.
    let max_retries = policy.max_attempts.saturating_sub(1) as usize;
    ExponentialBuilder::new()
        .with_min_delay(policy.initial_backoff)
        .with_max_delay(policy.max_backoff)
        .with_factor(2.0)
        .with_jitter()
        .with_max_times(max_retries)
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// the policy's attempts are used up.
///
/// # Errors
///
/// Returns the operation's error as-is when it is not retryable, and
/// [`SdkError::RetryExhausted`] carrying the attempt count otherwise.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let retries = AtomicU32::new(0);

    operation
        .retry(backoff(policy))
        .sleep(tokio::time::sleep)
        .when(SdkError::is_retryable)
        .notify(|err: &SdkError, dur: Duration| {
            let attempt = retries.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::debug!(
                attempt,
                backoff_ms = u64::try_from(dur.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "retrying after backoff"
            );
        })
        .await
        .map_err(|e| {
            if e.is_retryable() {
                SdkError::RetryExhausted {
                    attempts: retries.load(Ordering::SeqCst) + 1,
                    last_error: e.to_string(),
                }
            } else {
                e
            }
        })
}

/// Like [`with_retry`], but gives up with [`SdkError::Shutdown`] as soon as
/// `cancel` fires, including during a backoff sleep.
///
/// # Errors
///
/// Same as [`with_retry`], plus `Shutdown` on cancellation.
pub async fn with_retry_cancellable<F, Fut, T>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if cancel.is_cancelled() {
        return Err(SdkError::Shutdown);
    }
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(SdkError::Shutdown),
        result = with_retry(policy, operation) => result,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::sync::{Arc, atomic::AtomicUsize};

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .initial_backoff(Duration::from_millis(1))
            .max_backoff(Duration::from_millis(5))
            .build()
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result = with_retry(&fast_policy(3), || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SdkError::Timeout { duration_ms: 1 })
                } else {
                    Ok("connected")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "connected");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_reports_attempt_count() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = with_retry(&fast_policy(3), || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(SdkError::EmptyServerList)
            }
        })
        .await;
        assert!(matches!(result, Err(SdkError::RetryExhausted { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = with_retry(&fast_policy(5), || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(SdkError::ConfigInvalid { message: "bad".to_owned() })
            }
        })
        .await;
        assert!(matches!(result, Err(SdkError::ConfigInvalid { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> =
            with_retry_cancellable(&fast_policy(3), &cancel, || async { Ok(()) }).await;
        assert!(matches!(result, Err(SdkError::Shutdown)));
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::builder()
            .max_attempts(10)
            .initial_backoff(Duration::from_secs(30))
            .max_backoff(Duration::from_secs(30))
            .build();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let result: Result<()> = with_retry_cancellable(&policy, &cancel, || async {
            Err(SdkError::Timeout { duration_ms: 1 })
        })
        .await;
        assert!(matches!(result, Err(SdkError::Shutdown)));
    }
}
