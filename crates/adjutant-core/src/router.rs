//! The orchestrator router: `Approved/` in, terminal stages out.
//!
//! The router watches `Approved/` (native notifications plus a polling
//! fallback), classifies each file by its preamble, re-checks policy even
//! though a human approved it, and dispatches through the matching adapter
//! under backoff and a per-adapter circuit breaker. Files are dispatched in
//! filename-ascending order per adapter with a small worker pool; deferred
//! stems carry a cooldown so one rate-limited file cannot hot-loop a scan.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;

use adjutant_config::Config;
use adjutant_retry::{
    Backoff, BackoffConfig, BreakerConfig, BucketConfig, CircuitBreaker, SharedClock, TokenBucket,
};
use adjutant_types::{DispatchOutcome, ErrorClass, EventKind, LogRecord, Stage};
use adjutant_vault::{ActionNote, NoteRef, Stem, Vault, VaultError};
use adjutant_watch::DirWatch;

use crate::adapter::{AdapterSet, DispatchCtx, DispatchError};
use crate::policy::{self, PolicyVerdict, PolicyViolation};

/// Router tuning, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub threshold: f64,
    pub deadline: Duration,
    pub defer_cooldown: Duration,
    pub workers_per_adapter: usize,
    pub poll_interval: Duration,
    pub dry_run: bool,
    pub backoff: BackoffConfig,
    pub breaker: BreakerConfig,
    pub channels: BTreeMap<String, BucketConfig>,
}

impl RouterOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            threshold: config.policy.approval_threshold,
            deadline: config.policy.adapter_deadline,
            defer_cooldown: config.policy.defer_cooldown,
            workers_per_adapter: config.policy.workers_per_adapter.max(1),
            poll_interval: config.watch.poll_interval,
            dry_run: config.vault.dry_run,
            backoff: config.retry.backoff.clone(),
            breaker: config.retry.breaker.clone(),
            channels: config.limits.channels.clone(),
        }
    }
}

/// Outcome counts for one scan of `Approved/`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub observed: usize,
    pub sent: usize,
    pub deferred: usize,
    pub rejected: usize,
    pub quarantined: usize,
    /// Still cooling down from an earlier deferral.
    pub cooling: usize,
}

impl ScanStats {
    fn absorb(&mut self, other: ScanStats) {
        self.observed += other.observed;
        self.sent += other.sent;
        self.deferred += other.deferred;
        self.rejected += other.rejected;
        self.quarantined += other.quarantined;
        self.cooling += other.cooling;
    }
}

enum FileOutcome {
    Sent,
    Deferred,
    Rejected,
    Quarantined,
}

pub struct Router {
    vault: Vault,
    adapters: AdapterSet,
    buckets: HashMap<String, TokenBucket>,
    breakers: HashMap<String, CircuitBreaker>,
    backoff: Backoff,
    clock: SharedClock,
    options: RouterOptions,
    /// stem -> earliest monotonic instant the next attempt may run.
    deferrals: Mutex<HashMap<String, Duration>>,
}

impl Router {
    pub fn new(
        vault: &Vault,
        adapters: AdapterSet,
        clock: SharedClock,
        options: RouterOptions,
    ) -> Self {
        let buckets = options
            .channels
            .iter()
            .map(|(name, cfg)| {
                (
                    name.clone(),
                    TokenBucket::new(name.clone(), cfg.clone(), clock.clone()),
                )
            })
            .collect();
        let breakers = adapters
            .names()
            .into_iter()
            .map(|name| {
                (
                    name.to_string(),
                    CircuitBreaker::new(name, options.breaker.clone(), clock.clone()),
                )
            })
            .collect();
        Self {
            vault: vault.clone(),
            adapters,
            buckets,
            breakers,
            backoff: Backoff::new(options.backoff.clone(), clock.clone()),
            clock,
            options,
            deferrals: Mutex::new(HashMap::new()),
        }
    }

    /// One pass over `Approved/`. Dispatch order is filename-ascending per
    /// adapter; up to `workers_per_adapter` files of the same adapter run
    /// concurrently.
    pub fn scan_once(&self, cancel: &AtomicBool) -> Result<ScanStats> {
        let mut stats = ScanStats::default();
        let refs = self
            .vault
            .list(Stage::Approved)
            .context("failed to list Approved")?;
        stats.observed = refs.len();

        // Classify up front; unreadable preambles are quarantined here so a
        // corrupt file cannot wedge a worker queue.
        let mut queues: BTreeMap<String, VecDeque<(NoteRef, ActionNote)>> = BTreeMap::new();
        let now = self.clock.now();
        for note_ref in refs {
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            let cooling = {
                let deferrals = self.deferrals.lock().unwrap();
                deferrals
                    .get(note_ref.stem.as_str())
                    .is_some_and(|until| *until > now)
            };
            if cooling {
                stats.cooling += 1;
                continue;
            }
            let note = match self.vault.read_note(&note_ref) {
                Ok(note) => note,
                Err(e @ VaultError::Preamble { .. }) => {
                    self.quarantine(&note_ref.stem, &e.to_string())?;
                    stats.quarantined += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let adapter = self.adapters.select(&note.preamble);
            queues
                .entry(adapter.name().to_string())
                .or_default()
                .push_back((note_ref, note));
        }

        let worker_count = self.options.workers_per_adapter;
        let work: Vec<(String, Mutex<VecDeque<(NoteRef, ActionNote)>>)> = queues
            .into_iter()
            .map(|(name, queue)| (name, Mutex::new(queue)))
            .collect();

        std::thread::scope(|scope| -> Result<()> {
            let mut handles = Vec::new();
            for (adapter_name, queue) in &work {
                let workers = worker_count.min(queue.lock().unwrap().len()).max(1);
                for _ in 0..workers {
                    handles.push(scope.spawn(move || -> Result<ScanStats> {
                        let mut local = ScanStats::default();
                        loop {
                            if cancel.load(Ordering::Relaxed) {
                                break;
                            }
                            let next = queue.lock().unwrap().pop_front();
                            let Some((note_ref, note)) = next else { break };
                            match self.dispatch_prepared(adapter_name, &note_ref, &note)? {
                                FileOutcome::Sent => local.sent += 1,
                                FileOutcome::Deferred => local.deferred += 1,
                                FileOutcome::Rejected => local.rejected += 1,
                                FileOutcome::Quarantined => local.quarantined += 1,
                            }
                        }
                        Ok(local)
                    }));
                }
            }
            for handle in handles {
                match handle.join() {
                    Ok(result) => stats.absorb(result?),
                    Err(_) => bail!("router worker panicked"),
                }
            }
            Ok(())
        })?;

        Ok(stats)
    }

    /// Dispatch one approved file immediately (`--send-now`). Returns
    /// `None` when the stem is already in `Done/` (a deliberate no-op).
    pub fn send_now(&self, file: &Path) -> Result<Option<DispatchOutcome>> {
        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow::anyhow!("not a file name: {}", file.display()))?;
        let stem = Stem::from_file_name(name);

        if self.vault.find_in(Stage::Done, &stem)?.is_some() {
            self.vault.append(
                LogRecord::new(EventKind::Dispatch, self.vault.actor())
                    .with_file(stem.as_str())
                    .with_result("duplicate")
                    .with_detail("already in Done; send-now is a no-op"),
            )?;
            return Ok(None);
        }

        let Some(note_ref) = self.vault.find_in(Stage::Approved, &stem)? else {
            bail!("'{stem}' is not in Approved/ (send-now dispatches approved files only)");
        };
        let note = self.vault.read_note(&note_ref)?;
        let adapter = self.adapters.select(&note.preamble);
        let outcome = match self.dispatch_prepared(adapter.name(), &note_ref, &note)? {
            FileOutcome::Sent => DispatchOutcome::Sent,
            FileOutcome::Deferred => DispatchOutcome::Deferred,
            FileOutcome::Rejected | FileOutcome::Quarantined => DispatchOutcome::Rejected,
        };
        Ok(Some(outcome))
    }

    /// Watch `Approved/` until cancelled.
    pub fn run(&self, cancel: &AtomicBool) -> Result<()> {
        let watch = DirWatch::new(
            &self.vault.stage_dir(Stage::Approved),
            self.options.poll_interval,
        );
        while !cancel.load(Ordering::Relaxed) {
            self.scan_once(cancel)?;
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            watch.wait_timeout(self.options.poll_interval);
        }
        Ok(())
    }

    fn dispatch_prepared(
        &self,
        adapter_name: &str,
        note_ref: &NoteRef,
        note: &ActionNote,
    ) -> Result<FileOutcome> {
        let stem = &note_ref.stem;

        // Idempotency: a stem that already reached Done/ must never produce
        // a second side-effect. Its presence in Approved/ too is a stem
        // uniqueness violation, so the duplicate is quarantined.
        if self.vault.find_in(Stage::Done, stem)?.is_some() {
            self.quarantine(stem, "stem already present in Done")?;
            return Ok(FileOutcome::Quarantined);
        }

        match policy::check(&self.vault, stem, note, self.options.threshold, Utc::now())? {
            PolicyVerdict::Pass => {}
            PolicyVerdict::Reject(violation) => {
                let (event, result) = match &violation {
                    PolicyViolation::Expired { .. } => (EventKind::ApprovalExpired, "expired"),
                    PolicyViolation::UnapprovedAmount { .. } => {
                        (EventKind::PolicyReject, "rejected")
                    }
                };
                self.reject(stem, ErrorClass::Policy, &violation.reason())?;
                self.vault.append(
                    LogRecord::new(event, self.vault.actor())
                        .with_file(stem.as_str())
                        .with_action(note.preamble.action.as_str())
                        .with_result(result)
                        .with_detail(violation.reason()),
                )?;
                return Ok(FileOutcome::Rejected);
            }
        }

        let adapter = self.adapters.select(&note.preamble);

        // Pay the channel before the side-effect.
        if let Some(channel) = adapter.channel() {
            if let Some(bucket) = self.buckets.get(channel) {
                if let Err(limited) = bucket.try_acquire() {
                    self.defer(stem, limited.retry_after);
                    self.log_dispatch(stem, note, "deferred", format!("rate_limited: {channel}"))?;
                    return Ok(FileOutcome::Deferred);
                }
            }
        }

        let breaker = &self.breakers[adapter_name];
        if let Err(retry_after) = breaker.try_acquire() {
            self.defer(stem, retry_after);
            self.log_dispatch(stem, note, "deferred", format!("breaker_open: {adapter_name}"))?;
            return Ok(FileOutcome::Deferred);
        }

        let ctx = DispatchCtx {
            deadline: self.options.deadline,
            dry_run: self.options.dry_run,
        };
        let dispatched = self.backoff.run_classified(
            |_attempt| adapter.dispatch(&ctx, stem, note),
            |e| matches!(e, DispatchError::Transient(_)),
        );

        match dispatched {
            Ok(outcome) => {
                breaker.record_success();
                self.clear_deferral(stem);
                match outcome {
                    DispatchOutcome::Sent | DispatchOutcome::Drafted => {
                        self.vault.move_note(stem, Stage::Approved, Stage::Done)?;
                        self.log_dispatch(stem, note, outcome.as_str(), adapter.name().to_string())?;
                        Ok(FileOutcome::Sent)
                    }
                    DispatchOutcome::Rejected => {
                        self.reject(stem, ErrorClass::Permanent, "adapter rejected the note")?;
                        self.log_dispatch(stem, note, "rejected", adapter.name().to_string())?;
                        Ok(FileOutcome::Rejected)
                    }
                    DispatchOutcome::Deferred => {
                        self.defer(stem, self.options.defer_cooldown);
                        self.log_dispatch(stem, note, "deferred", adapter.name().to_string())?;
                        Ok(FileOutcome::Deferred)
                    }
                }
            }
            Err(DispatchError::Transient(message)) => {
                breaker.record_failure();
                self.defer(stem, self.options.defer_cooldown);
                self.log_dispatch(stem, note, "deferred", message)?;
                Ok(FileOutcome::Deferred)
            }
            Err(DispatchError::Permanent(message)) => {
                breaker.record_failure();
                self.reject(stem, ErrorClass::Permanent, &message)?;
                self.log_dispatch(stem, note, "rejected", message)?;
                Ok(FileOutcome::Rejected)
            }
        }
    }

    fn defer(&self, stem: &Stem, wait: Duration) {
        let until = self.clock.now() + wait.max(Duration::from_secs(1));
        self.deferrals
            .lock()
            .unwrap()
            .insert(stem.as_str().to_string(), until);
    }

    fn clear_deferral(&self, stem: &Stem) {
        self.deferrals.lock().unwrap().remove(stem.as_str());
    }

    /// Move a file out of `Approved/` into `Rejected/` with an error
    /// sibling. Collisions inside `Rejected/` are tolerated: the sibling
    /// emit suffixes itself and the move is best-effort logged.
    fn reject(&self, stem: &Stem, class: ErrorClass, reason: &str) -> Result<()> {
        self.vault.write_error_sibling(stem, class, reason)?;
        match self.vault.move_note(stem, Stage::Approved, Stage::Rejected) {
            Ok(_) => Ok(()),
            Err(VaultError::Collision(path)) => {
                self.vault.append(
                    LogRecord::new(EventKind::Quarantine, self.vault.actor())
                        .with_file(stem.as_str())
                        .with_result("collision")
                        .with_detail(format!("rejected copy already at {}", path.display())),
                )?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn quarantine(&self, stem: &Stem, reason: &str) -> Result<()> {
        self.reject(stem, ErrorClass::Integrity, reason)?;
        self.vault.append(
            LogRecord::new(EventKind::Quarantine, self.vault.actor())
                .with_file(stem.as_str())
                .with_result("quarantined")
                .with_detail(reason.to_string()),
        )?;
        Ok(())
    }

    fn log_dispatch(
        &self,
        stem: &Stem,
        note: &ActionNote,
        result: &str,
        detail: String,
    ) -> Result<()> {
        self.vault.append(
            LogRecord::new(EventKind::Dispatch, self.vault.actor())
                .with_file(stem.as_str())
                .with_action(note.preamble.action.as_str())
                .with_result(result)
                .with_detail(detail),
        )?;
        Ok(())
    }
}
