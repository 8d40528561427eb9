// crates/reverie-server/src/retry.rs
// Timeout + exponential backoff with jitter for provider and store calls

use crate::config::RetryConfig;
use crate::error::{Result, ReverieError};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Base delay for `attempt` plus up to 10% random jitter, capped at max_delay_ms.
pub fn compute_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.base_delay(attempt);
    let jitter = base.mul_f64(0.1 * rand::random::<f64>());
    (base + jitter).min(Duration::from_millis(config.max_delay_ms))
}

/// Run `op` with a per-attempt deadline, retrying transient failures.
///
/// Non-transient errors return immediately. An elapsed deadline counts as a
/// transient `Timeout`. Exhaustion returns the last error.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    timeout: Duration,
    label: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        let outcome = match tokio::time::timeout(timeout, op()).await {
            Ok(r) => r,
            Err(_) => Err(ReverieError::Timeout(timeout)),
        };

        match outcome {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_transient() || attempt >= config.max_retries => return Err(e),
            Err(e) => {
                let delay = compute_delay(config, attempt);
                warn!(
                    op = label,
                    attempt = attempt + 1,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
