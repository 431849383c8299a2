//! Backoff/retry policy shared by the HTTP request engine (C3) and the
//! blockchain submitter (C9).

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// `base = initial_delay * multiplier^(attempt-1)`, capped at `max_delay`.
/// `attempt` is 1-indexed, matching §4.1's `k`.
fn base_delay(cfg: &RetryConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1);
    let factor = cfg.multiplier.powi(exp as i32);
    let base_secs = cfg.initial_delay.as_secs_f64() * factor;
    let capped = base_secs.min(cfg.max_delay.as_secs_f64());
    Duration::from_secs_f64(capped.max(0.0))
}

/// Computes the sleep duration before attempt `attempt`, applying jitter
/// `U(0.5, 1.0)` when configured. Never returns full-zero jitter.
pub fn delay_for_attempt(cfg: &RetryConfig, attempt: u32) -> Duration {
    let base = base_delay(cfg, attempt);
    if !cfg.jitter {
        return base;
    }
    let factor = rand::thread_rng().gen_range(0.5..=1.0);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

/// Classification of an HTTP outcome for retry purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    Retryable,
    Terminal,
}

/// Network-level failures (no status code available) are always retryable.
pub fn classify_network_error() -> Retryability {
    Retryability::Retryable
}

/// 5xx, 408, 425, 429 are retryable; other 4xx are terminal; 2xx/3xx never
/// reach this function (they are successes).
pub fn classify_status(status: u16) -> Retryability {
    match status {
        408 | 425 | 429 => Retryability::Retryable,
        s if (500..600).contains(&s) => Retryability::Retryable,
        _ => Retryability::Terminal,
    }
}

/// Retry-After header value, upper-bounded by `max_delay`.
pub fn retry_after_delay(cfg: &RetryConfig, retry_after_secs: u64) -> Duration {
    Duration::from_secs(retry_after_secs).min(cfg.max_delay)
}
