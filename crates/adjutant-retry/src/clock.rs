//! Clock abstraction shared by backoff, breaker, bucket, and the scheduler.
//!
//! Time is modelled as a monotonic [`Duration`] since an arbitrary origin, so
//! a manual clock can be advanced deterministically in tests without ever
//! constructing an `Instant`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Monotonic time source.
pub trait Clock: Send + Sync {
    /// Time elapsed since this clock's origin.
    fn now(&self) -> Duration;

    /// Block the caller for `d` (or advance virtual time by `d`).
    fn sleep(&self, d: Duration);
}

/// A clock shared across components of one process.
pub type SharedClock = Arc<dyn Clock>;

/// Wall-clock-backed monotonic clock.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, d: Duration) {
        std::thread::sleep(d);
    }
}

/// Virtual clock for tests. `sleep` advances time instead of blocking.
#[derive(Debug, Default)]
pub struct ManualClock {
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move virtual time forward.
    pub fn advance(&self, d: Duration) {
        *self.elapsed.lock().unwrap() += d;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.elapsed.lock().unwrap()
    }

    fn sleep(&self, d: Duration) {
        *self.elapsed.lock().unwrap() += d;
    }
}
