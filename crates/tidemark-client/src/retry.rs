//! Retry executor for cluster calls.

use std::future::Future;

use tidemark_core::RetryPolicy;
use tracing::{debug, warn};

/// Run `f` until it succeeds, `should_retry` rejects the error, or the
/// policy's attempts are used up. The last error is returned.
pub async fn retry<T, E, F, Fut>(
    policy: RetryPolicy,
    op: &str,
    mut should_retry: impl FnMut(&E) -> bool,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && should_retry(&e) => {
                let delay = policy.delay_after(attempt);
                debug!(op, attempt, max_attempts = attempts, ?delay, error = %e, "retrying");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
            Err(e) => {
                if attempt > 1 {
                    warn!(op, attempts = attempt, error = %e, "giving up");
                }
                return Err(e);
            }
        }
    }
}

/// Poll `check` until it reports true. Returns false once the policy's
/// attempts are spent.
pub async fn poll_until<F, Fut>(policy: RetryPolicy, op: &str, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let attempts = policy.attempts();
    for attempt in 1..=attempts {
        if check().await {
            return true;
        }
        if attempt < attempts {
            let delay = policy.delay_after(attempt);
            debug!(op, attempt, max_attempts = attempts, ?delay, "condition not met yet");
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
    false
}
