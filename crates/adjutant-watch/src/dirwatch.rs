//! Directory watching with a polling fallback.
//!
//! Native filesystem notifications (via `notify`) wake the caller promptly;
//! the fallback tick bounds staleness on platforms where notifications are
//! unreliable (network mounts, some containers). Callers treat both wake
//! reasons identically and rescan the directory, so missed or coalesced
//! events are harmless.

use std::path::Path;
use std::sync::mpsc;
use std::time::Duration;

use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};

/// Why `wait` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// A filesystem event arrived for the watched directory.
    Event,
    /// The fallback interval elapsed with no event.
    Tick,
}

/// A watch on one directory.
pub struct DirWatch {
    rx: mpsc::Receiver<notify::Result<notify::Event>>,
    // Kept alive for the OS-level watch; dropped watchers stop delivering.
    _watcher: Option<RecommendedWatcher>,
    poll_interval: Duration,
}

impl DirWatch {
    /// Watch `dir` (non-recursive). If the native watcher cannot be set up
    /// the instance degrades to pure polling at `poll_interval`.
    pub fn new(dir: &Path, poll_interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel();
        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                let _ = tx.send(res);
            },
            Config::default(),
        )
        .ok()
        .and_then(|mut w| w.watch(dir, RecursiveMode::NonRecursive).ok().map(|()| w));

        Self {
            rx,
            _watcher: watcher,
            poll_interval,
        }
    }

    /// Whether native notifications are active (false means pure polling).
    pub fn is_native(&self) -> bool {
        self._watcher.is_some()
    }

    /// Block until an event arrives or the fallback interval elapses.
    /// Coalesces a burst of queued events into one wake.
    pub fn wait(&self) -> Wake {
        match self.rx.recv_timeout(self.poll_interval) {
            Ok(_) => {
                while self.rx.try_recv().is_ok() {}
                Wake::Event
            }
            Err(_) => Wake::Tick,
        }
    }

    /// Wait with an explicit timeout (used by shutdown-aware loops that
    /// want to re-check a cancel flag more often than the poll interval).
    pub fn wait_timeout(&self, timeout: Duration) -> Wake {
        match self.rx.recv_timeout(timeout.min(self.poll_interval)) {
            Ok(_) => {
                while self.rx.try_recv().is_ok() {}
                Wake::Event
            }
            Err(_) => Wake::Tick,
        }
    }
}
