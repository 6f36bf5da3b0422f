//! Single-retry policy for upstream dispatch: transport errors and provider
//! 5xx get exactly one more attempt after a short backoff, everything else
//! propagates immediately.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::domain::Result;

const MAX_ATTEMPTS: usize = 2;
const INITIAL_BACKOFF: Duration = Duration::from_millis(400);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

pub async fn with_retry<F, Fut, T>(operation_name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(operation = operation_name, attempt, "retry succeeded");
                }
                return Ok(result);
            }
            Err(err) if err.is_retryable() && attempt < MAX_ATTEMPTS => {
                let backoff = backoff_for(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    error = %err,
                    backoff_ms = backoff.as_millis() as u64,
                    "retryable upstream failure"
                );
                metrics::increment_counter!("gateway_upstream_retries_total");
                sleep(backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
}

fn backoff_for(attempt: usize) -> Duration {
    let exp = INITIAL_BACKOFF.saturating_mul(1 << (attempt - 1) as u32);
    // Spread retries out a little so synchronized failures do not re-converge.
    let jitter = Duration::from_millis(rand::random::<u64>() % 100);
    exp.min(MAX_BACKOFF) + jitter
}
