//! Test assertion helpers.
//!
//! Provides polling-based assertions for async test scenarios.

use std::time::Duration;

use tokio::time::{Instant, sleep};

/// Default polling interval for [`assert_eventually`].
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polls a condition until it returns true or the timeout expires.
///
/// Client behavior such as server switches happens on background tasks, so
/// tests wait for the observable outcome instead of sleeping a fixed time.
///
/// Returns `true` if the condition became true before the timeout.
///
/// # Example
///
/// ```no_run
/// use std::sync::{
///     Arc,
///     atomic::{AtomicBool, Ordering},
/// };
/// use std::time::Duration;
///
/// use xgrpc_test_utils::assert_eventually;
///
/// # async fn example() {
/// let switched = Arc::new(AtomicBool::new(false));
/// let flag = Arc::clone(&switched);
/// tokio::spawn(async move {
///     tokio::time::sleep(Duration::from_millis(50)).await;
///     flag.store(true, Ordering::SeqCst);
/// });
///
/// assert!(assert_eventually(Duration::from_millis(200), || switched.load(Ordering::SeqCst)).await);
/// # }
/// ```
pub async fn assert_eventually<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(DEFAULT_POLL_INTERVAL).await;
    }

    // Final check after timeout
    condition()
}
