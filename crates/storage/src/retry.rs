//! Retry with exponential backoff for transient storage failures

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use run_core::{Error, Result, RetryConfig};
use tracing::warn;

/// Execute an async operation, retrying retryable errors per `config`
///
/// With the default config a single attempt is made and its error returned.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: &str, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !e.is_retryable() || attempt >= config.max_retries {
                    return Err(e);
                }

                let delay = jittered(config, config.delay_for(attempt));
                warn!(
                    %operation,
                    attempt = attempt + 1,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis(),
                    error = %e,
                    "Retrying after transient error"
                );

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

fn jittered(config: &RetryConfig, delay: Duration) -> Duration {
    if !config.jitter || delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(0.5..=1.0);
    delay.mul_f64(factor)
}

/// Map a failure after all retries into a storage error with context
pub fn exhausted(operation: &str, error: Error) -> Error {
    match error {
        Error::Storage { message } => Error::Storage {
            message: format!("{} failed: {}", operation, message),
        },
        other => other,
    }
}
