//! Watcher framework: observe one external source, emit action notes.
//!
//! Every watcher is the same loop with a different [`Source`] plugged in:
//!
//! 1. poll the source at its cadence (or on filesystem events)
//! 2. dedup against a persistent seen-set keyed by source-native ids
//! 3. emit one action note per new item
//! 4. wrap every source call in backoff + circuit breaker
//! 5. on a permanent source failure, write an `URGENT_` note and stop
//!
//! The one in-core source is [`InboxSource`]: it hoists well-formed notes
//! from `Inbox/` to `Needs_Action/` and turns foreign file drops into
//! `FILE_*` action notes. Network sources (mailboxes, social inboxes) live
//! outside the core and implement the same trait.

mod dirwatch;
mod inbox;
mod runner;
mod seen;
mod source;

pub use dirwatch::{DirWatch, Wake};
pub use inbox::InboxSource;
pub use runner::{RunStats, WatchError, WatcherOptions, WatcherRunner};
pub use seen::{SeenSet, default_sidecar_dir, fingerprint};
pub use source::{Source, SourceError, SourceItem};
