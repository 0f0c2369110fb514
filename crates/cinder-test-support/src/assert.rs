//! Polling assertions for asynchronous state.

use std::future::Future;
use std::time::Duration;

use anyhow::{Result, bail};
use tokio::time::{Instant, sleep};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Wait until `condition` holds, failing after `limit`.
///
/// # Errors
///
/// Returns an error naming `what` when the deadline passes first.
pub async fn eventually<F>(what: &str, limit: Duration, mut condition: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + limit;
    loop {
        if condition() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!("timed out after {limit:?} waiting for {what}");
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Async variant of [`eventually`] for conditions that need to await.
///
/// # Errors
///
/// Returns an error naming `what` when the deadline passes first.
pub async fn eventually_async<F, Fut>(what: &str, limit: Duration, mut condition: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + limit;
    loop {
        if condition().await {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!("timed out after {limit:?} waiting for {what}");
        }
        sleep(POLL_INTERVAL).await;
    }
}
