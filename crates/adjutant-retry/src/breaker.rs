//! Per-resource circuit breaker.
//!
//! States run `closed -> open -> half-open`. Consecutive failures trip the
//! breaker at the configured threshold; after the cooldown one probe call is
//! admitted, and its outcome decides between `closed` and another `open`
//! round. Breaker state is process-local and rebuilt empty on start.

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;

/// Breaker tuning for one named resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the breaker rejects calls once open.
    #[serde(default = "default_cooldown")]
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown() -> Duration {
    Duration::from_secs(300)
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(300),
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Error from a breaker-wrapped call.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BreakerError<E> {
    /// The breaker is open; the call was not attempted.
    #[error("circuit breaker '{name}' is open, retry after {retry_after:?}")]
    Open { name: String, retry_after: Duration },
    /// The call ran and failed; its failure was counted.
    #[error("{0}")]
    Inner(E),
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Duration,
}

/// A circuit breaker for one named resource.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: SharedClock,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: Duration::ZERO,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, resolving an elapsed cooldown to `HalfOpen`.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().unwrap();
        self.resolve_cooldown(&mut inner);
        inner.state
    }

    fn resolve_cooldown(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open
            && self.clock.now().saturating_sub(inner.opened_at) >= self.config.cooldown
        {
            inner.state = BreakerState::HalfOpen;
        }
    }

    /// Admit or reject a call without running it. A `HalfOpen` admit is the
    /// single probe; callers must report the outcome via `record_*`.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut inner = self.inner.lock().unwrap();
        self.resolve_cooldown(&mut inner);
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = self.clock.now().saturating_sub(inner.opened_at);
                Err(self.config.cooldown.saturating_sub(elapsed))
            }
        }
    }

    /// Report a successful call: back to `Closed`, counter reset.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
    }

    /// Report a failed call. A half-open probe failure reopens immediately;
    /// in `Closed`, the threshold decides.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.resolve_cooldown(&mut inner);
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let trip = inner.state == BreakerState::HalfOpen
            || inner.consecutive_failures >= self.config.failure_threshold;
        if trip {
            inner.state = BreakerState::Open;
            inner.opened_at = self.clock.now();
        }
    }

    /// Run `operation` behind the breaker.
    pub fn call<T, E, F>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        match self.try_acquire() {
            Ok(()) => {}
            Err(retry_after) => {
                return Err(BreakerError::Open {
                    name: self.name.clone(),
                    retry_after,
                });
            }
        }
        match operation() {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn breaker(threshold: u32, cooldown_secs: u64) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let breaker = CircuitBreaker::new(
            "imap",
            BreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_secs(cooldown_secs),
            },
            clock.clone(),
        );
        (breaker, clock)
    }

    #[test]
    fn stays_closed_under_threshold() {
        let (b, _) = breaker(3, 60);
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn opens_at_threshold_and_rejects() {
        let (b, _) = breaker(3, 60);
        for _ in 0..3 {
            b.record_failure();
        }
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.try_acquire().is_err());
    }

    #[test]
    fn half_open_after_cooldown_then_closes_on_success() {
        let (b, clock) = breaker(2, 60);
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);

        clock.advance(Duration::from_secs(60));
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(b.try_acquire().is_ok());

        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let (b, clock) = breaker(2, 60);
        b.record_failure();
        b.record_failure();
        clock.advance(Duration::from_secs(60));
        assert_eq!(b.state(), BreakerState::HalfOpen);

        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        // A fresh cooldown applies from the reopen.
        clock.advance(Duration::from_secs(30));
        assert_eq!(b.state(), BreakerState::Open);
        clock.advance(Duration::from_secs(30));
        assert_eq!(b.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn success_resets_the_failure_count() {
        let (b, _) = breaker(3, 60);
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn call_wraps_acquire_and_outcome() {
        let (b, _) = breaker(1, 60);
        let err: Result<(), _> = b.call(|| Err::<(), _>("boom"));
        assert_eq!(err, Err(BreakerError::Inner("boom")));

        let rejected: Result<(), _> = b.call(|| Ok::<(), &str>(()));
        match rejected {
            Err(BreakerError::Open { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::from_secs(60));
            }
            other => panic!("expected open breaker, got {other:?}"),
        }
    }
}
