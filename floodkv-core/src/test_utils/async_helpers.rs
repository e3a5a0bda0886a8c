//! Async assertion helpers

use std::future::Future;
use std::time::Duration;

/// Poll `condition` until it holds or `timeout` elapses. Returns whether
/// the condition was ever observed true.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// `eventually` with the timeout most convergence tests want
pub async fn eventually_default<F, Fut>(condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    eventually(Duration::from_secs(10), condition).await
}
