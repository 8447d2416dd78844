//! Retry primitives for adjutant: backoff, circuit breaking, rate limiting.
//!
//! Three orthogonal, composable wrappers around any unit of work:
//!
//! - [`Backoff`] - full-jitter exponential backoff for transient failures
//! - [`CircuitBreaker`] - per-resource closed/open/half-open gate
//! - [`TokenBucket`] - per-channel rate limiter with discrete refill ticks
//!
//! All three share the [`Clock`] abstraction so tests advance time
//! deterministically instead of sleeping.
//!
//! # Example
//!
//! ```
//! use adjutant_retry::{Backoff, BackoffConfig, SystemClock};
//! use std::sync::Arc;
//!
//! let backoff = Backoff::new(
//!     BackoffConfig { max_attempts: 3, ..Default::default() },
//!     Arc::new(SystemClock::new()),
//! );
//! let result: Result<&str, &str> = backoff.run(|attempt| {
//!     if attempt < 2 { Err("flaky") } else { Ok("done") }
//! });
//! assert_eq!(result, Ok("done"));
//! ```

mod breaker;
mod bucket;
mod clock;

pub use breaker::{BreakerConfig, BreakerError, BreakerState, CircuitBreaker};
pub use bucket::{BucketConfig, RateLimited, TokenBucket};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for exponential backoff with full jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Maximum number of attempts (first try included).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay; attempt `n` waits up to `base · 2^(n-1)`.
    #[serde(default = "default_base_delay")]
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Cap on any single wait.
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Full jitter: the actual wait is uniform in `[0, computed]`.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(120)
}

fn default_jitter() -> bool {
    true
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
            jitter: true,
        }
    }
}

/// Compute the backoff ceiling for `attempt` (1-indexed), before jitter.
pub fn delay_ceiling(config: &BackoffConfig, attempt: u32) -> Duration {
    let pow = attempt.saturating_sub(1).min(16);
    let raw = config.base_delay.saturating_mul(2_u32.saturating_pow(pow));
    raw.min(config.max_delay)
}

/// Compute the actual delay for `attempt`, applying full jitter if enabled.
pub fn calculate_delay(config: &BackoffConfig, attempt: u32) -> Duration {
    let ceiling = delay_ceiling(config, attempt);
    if !config.jitter || ceiling.is_zero() {
        return ceiling;
    }
    use rand::Rng;
    let mut rng = rand::rng();
    Duration::from_millis(rng.random_range(0..=ceiling.as_millis() as u64))
}

/// A retry executor that runs a fallible operation under a [`BackoffConfig`].
pub struct Backoff {
    config: BackoffConfig,
    clock: SharedClock,
}

impl Backoff {
    pub fn new(config: BackoffConfig, clock: SharedClock) -> Self {
        Self { config, clock }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Run `operation` until it succeeds or attempts are exhausted. Every
    /// failure is treated as transient; use [`Backoff::run_classified`] when
    /// permanent failures must propagate immediately.
    ///
    /// The operation receives the current attempt number (starting at 1).
    pub fn run<T, E, F>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
    {
        self.run_classified(|attempt| operation(attempt), |_| true)
    }

    /// Run `operation`, retrying only failures `is_transient` accepts.
    /// Permanent failures propagate on the attempt that produced them.
    pub fn run_classified<T, E, F, C>(&self, mut operation: F, is_transient: C) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        C: Fn(&E) -> bool,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !is_transient(&e) || attempt >= self.config.max_attempts {
                        return Err(e);
                    }
                    self.clock.sleep(calculate_delay(&self.config, attempt));
                    attempt += 1;
                }
            }
        }
    }
}
