//! The common watcher loop.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use adjutant_retry::{
    Backoff, BackoffConfig, BreakerConfig, BreakerError, BucketConfig, CircuitBreaker,
    SharedClock, TokenBucket,
};
use adjutant_types::{EventKind, LogRecord, NoteStatus, NoteType, Priority, Stage};
use adjutant_vault::{ActionNote, Preamble, Stem, Vault, VaultError};

use crate::dirwatch::DirWatch;
use crate::seen::SeenSet;
use crate::source::{Source, SourceError};

/// Failure of a watcher cycle.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The source failed permanently; the watcher must stop.
    #[error("permanent source failure: {0}")]
    Permanent(String),
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Knobs for one watcher instance.
#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub dry_run: bool,
    pub backoff: BackoffConfig,
    pub breaker: BreakerConfig,
    /// Ceiling on note emission; `None` disables the limiter.
    pub emit_limit: Option<BucketConfig>,
    pub sidecar_dir: PathBuf,
    /// Override the source's own cadence (CLI `--interval`).
    pub interval: Option<Duration>,
}

impl WatcherOptions {
    pub fn new(sidecar_dir: impl Into<PathBuf>) -> Self {
        Self {
            dry_run: false,
            backoff: BackoffConfig::default(),
            breaker: BreakerConfig::default(),
            emit_limit: Some(BucketConfig::per_interval(60, Duration::from_secs(60))),
            sidecar_dir: sidecar_dir.into(),
            interval: None,
        }
    }
}

/// Outcome counts for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub polled: usize,
    pub emitted: usize,
    pub duplicates: usize,
    /// The breaker rejected the poll; the cycle did nothing.
    pub breaker_open: bool,
}

/// Drives one [`Source`] against one vault.
pub struct WatcherRunner {
    vault: Vault,
    source: Box<dyn Source>,
    seen: SeenSet,
    backoff: Backoff,
    breaker: CircuitBreaker,
    emit_limit: Option<TokenBucket>,
    clock: SharedClock,
    dry_run: bool,
    interval: Duration,
}

impl WatcherRunner {
    pub fn new(
        vault: &Vault,
        source: Box<dyn Source>,
        clock: SharedClock,
        options: WatcherOptions,
    ) -> anyhow::Result<Self> {
        let seen = SeenSet::load(&options.sidecar_dir, source.name())?;
        let actor = format!("watcher-{}", source.name());
        let interval = options.interval.unwrap_or_else(|| source.cadence());
        Ok(Self {
            vault: vault.as_actor(actor),
            breaker: CircuitBreaker::new(source.name(), options.breaker, clock.clone()),
            backoff: Backoff::new(options.backoff, clock.clone()),
            emit_limit: options
                .emit_limit
                .map(|cfg| TokenBucket::new("watcher_emit", cfg, clock.clone())),
            seen,
            source,
            clock,
            dry_run: options.dry_run,
            interval,
        })
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run `--setup` for the underlying source.
    pub fn setup(&mut self) -> anyhow::Result<()> {
        self.source.setup()
    }

    /// One poll-dedup-emit cycle.
    pub fn run_once(&mut self) -> Result<RunStats, WatchError> {
        let mut stats = RunStats::default();

        let source = &mut self.source;
        let backoff = &self.backoff;
        let polled = self.breaker.call(|| {
            backoff.run_classified(
                |_attempt| source.poll(),
                |e| matches!(e, SourceError::Transient(_)),
            )
        });

        let items = match polled {
            Ok(items) => items,
            Err(BreakerError::Open { retry_after, .. }) => {
                stats.breaker_open = true;
                self.vault.append(
                    LogRecord::new(EventKind::WatcherError, self.vault.actor())
                        .with_result("breaker_open")
                        .with_detail(format!("retry after {retry_after:?}")),
                )?;
                return Ok(stats);
            }
            Err(BreakerError::Inner(SourceError::Transient(message))) => {
                // Exhausted backoff; the next cycle tries again.
                self.vault.append(
                    LogRecord::new(EventKind::WatcherError, self.vault.actor())
                        .with_result("transient")
                        .with_detail(message),
                )?;
                return Ok(stats);
            }
            Err(BreakerError::Inner(SourceError::Permanent(message))) => {
                self.handle_permanent(&message)?;
                return Err(WatchError::Permanent(message));
            }
        };

        stats.polled = items.len();
        let target = self.source.target_stage();
        let kind = self.source.event_kind();
        let mut dirty = false;
        for item in items {
            if self.seen.contains(&item.id) {
                stats.duplicates += 1;
                continue;
            }

            if self.dry_run {
                self.vault.append(
                    LogRecord::new(kind.clone(), self.vault.actor())
                        .with_file(item.stem.as_str())
                        .with_action(item.note.preamble.action.as_str())
                        .with_result("dry_run"),
                )?;
            } else {
                if let Some(bucket) = &self.emit_limit {
                    bucket.acquire_blocking();
                }
                let emitted = self.vault.emit(target, &item.stem, &item.note)?;
                self.vault.append(
                    LogRecord::new(kind.clone(), self.vault.actor())
                        .with_file(emitted.stem.as_str())
                        .with_action(item.note.preamble.action.as_str())
                        .with_result("ok"),
                )?;
            }

            self.seen.insert(&item.id);
            dirty = true;
            stats.emitted += 1;
        }
        if dirty {
            self.seen.save()?;
        }
        Ok(stats)
    }

    /// Permanent failure: page the operator and record why this watcher
    /// went down. The caller stops the loop; the breaker stays open so a
    /// restart without fixed credentials trips again quickly.
    fn handle_permanent(&self, message: &str) -> Result<(), WatchError> {
        let now = chrono::Utc::now();
        let stem = Stem::build("URGENT", self.source.name(), now);
        let note = ActionNote::new(
            Preamble::new(
                NoteType::SecurityReview,
                adjutant_types::ActionVerb::AcknowledgeAndArchive,
            )
            .with_priority(Priority::P0)
            .with_status(NoteStatus::Pending)
            .with_created(now)
            .with_field("watcher", self.source.name()),
            format!(
                "Watcher `{}` stopped on a permanent source failure:\n\n    {message}\n\nFix the source (credentials, schema) and restart the watcher.\n",
                self.source.name()
            ),
        );
        if !self.dry_run {
            self.vault.emit(Stage::NeedsAction, &stem, &note)?;
        }
        self.vault.append(
            LogRecord::new(EventKind::Urgent, self.vault.actor())
                .with_file(stem.as_str())
                .with_result("watcher_stopped")
                .with_detail(message.to_string()),
        )?;
        Ok(())
    }

    /// Poll until cancelled or the source fails permanently. `dirwatch`
    /// turns the sleep into an event-driven wait for filesystem sources.
    pub fn run_loop(
        &mut self,
        cancel: &AtomicBool,
        dirwatch: Option<&DirWatch>,
    ) -> Result<(), WatchError> {
        while !cancel.load(Ordering::Relaxed) {
            self.run_once()?;
            match dirwatch {
                Some(watch) => {
                    watch.wait_timeout(self.interval);
                }
                None => {
                    // Sleep in slices so shutdown stays responsive.
                    let mut remaining = self.interval;
                    let slice = Duration::from_millis(500);
                    while !remaining.is_zero() && !cancel.load(Ordering::Relaxed) {
                        let step = remaining.min(slice);
                        self.clock.sleep(step);
                        remaining -= step;
                    }
                }
            }
        }
        Ok(())
    }
}
