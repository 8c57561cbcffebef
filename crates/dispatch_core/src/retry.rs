//! Bounded retry with exponential backoff for calls to external providers.

use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::config::RetryConfig;

/// Runs `op` until it succeeds, `is_transient` says an error is final, or the
/// attempts run out. Returns the last error.
pub fn retry_with_backoff<T, E, F, P>(
    config: &RetryConfig,
    label: &str,
    mut op: F,
    is_transient: P,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let attempts = config.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts && is_transient(&err) => {
                let delay = backoff_delay(config, attempt);
                debug!(label, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Full-jitter exponential delay for the given (1-based) attempt.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    if config.base_delay_ms == 0 {
        return Duration::ZERO;
    }
    let exp = config
        .base_delay_ms
        .saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
    let capped = exp.min(config.max_delay_ms.max(config.base_delay_ms));
    let jittered = rand::thread_rng().gen_range(capped / 2..=capped);
    Duration::from_millis(jittered)
}
