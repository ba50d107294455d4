use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter and a cap.
///
/// Used for whole-job retries by the runner and for per-call retries by the
/// infrastructure client decorator.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base: Duration,
    pub max: Duration,
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max: Duration::from_secs(15 * 60),
            jitter_pct: 0.20,
        }
    }
}

impl RetryConfig {
    /// Deterministic config, handy for tests and tight loops.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base: delay,
            max: delay,
            jitter_pct: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
    Cancelled,
}

pub fn next_delay(attempt_no: i32, cfg: &RetryConfig, rng: &mut impl Rng) -> Duration {
    let attempt_no = attempt_no.max(1) as u32;

    // exponent = attempt_no - 1
    let exp = attempt_no.saturating_sub(1);

    // 2^exp; past 2^31 the cap wins anyway.
    let pow2 = 1_u32.checked_shl(exp).unwrap_or(u32::MAX);

    let base_ms = cfg.base.as_millis().min(u64::MAX as u128) as u64;
    let max_ms = cfg.max.as_millis().min(u64::MAX as u128) as u64;

    let delay_ms = base_ms.saturating_mul(pow2 as u64).min(max_ms);

    if cfg.jitter_pct <= 0.0 || delay_ms == 0 {
        return Duration::from_millis(delay_ms);
    }

    // jitter in range [-jitter_pct, +jitter_pct]
    let jitter_range = (delay_ms as f64) * cfg.jitter_pct;
    let jitter = rng.gen_range(-jitter_range..=jitter_range);

    let jittered = (delay_ms as f64 + jitter).round().max(0.0) as u64;
    Duration::from_millis(jittered.min(max_ms))
}
