//! Process wiring: router, claim loop, and scheduler in one process.
//!
//! The router gets its own thread (it blocks on the `Approved/` watch);
//! claims and the scheduler share the main loop. Shutdown is cooperative:
//! the cancel flag stops intake everywhere, in-flight adapter calls finish,
//! and whatever was mid-dispatch stays in `Approved/` for the next start.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;

use adjutant_config::Config;
use adjutant_retry::SharedClock;
use adjutant_types::Peer;
use adjutant_vault::Vault;
use adjutant_watch::InboxSource;

use crate::adapter::AdapterSet;
use crate::briefing;
use crate::claims::{ClaimWorker, NoopReasoner, Reasoner};
use crate::policy;
use crate::router::{Router, RouterOptions, ScanStats};
use crate::scheduler::{Cadence, Scheduler};
use crate::signals;
use crate::sync::SyncBridge;

/// One orchestrator process: router + claims + embedded scheduler.
pub struct Orchestrator {
    vault: Vault,
    peer: Peer,
    router: Router,
    claims: ClaimWorker,
    scheduler: Scheduler,
    clock: SharedClock,
}

impl Orchestrator {
    pub fn new(
        vault: &Vault,
        config: &Config,
        adapters: AdapterSet,
        reasoner: Box<dyn Reasoner>,
        clock: SharedClock,
    ) -> Result<Self> {
        let peer = config.agent.mode;
        let vault = vault.as_actor(format!("orchestrator-{peer}"));
        let router = Router::new(&vault, adapters, clock.clone(), RouterOptions::from_config(config));
        let claims = ClaimWorker::new(&vault, peer, reasoner, config.agent.claim_ttl);
        let scheduler = build_scheduler(&vault, config)?;
        Ok(Self {
            vault,
            peer,
            router,
            claims,
            scheduler,
            clock,
        })
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// One full cycle: claim pending work, scan `Approved/`, tick the
    /// scheduler. Used by `--once` and by tests.
    pub fn run_once(&mut self) -> Result<ScanStats> {
        let claim_stats = self.claims.process_pending()?;
        if self.peer == Peer::Cloud && claim_stats.claimed > 0 {
            signals::write_cloud_status(
                &self.vault,
                self.peer,
                &format!(
                    "claimed {} note(s): {} completed, {} released",
                    claim_stats.claimed, claim_stats.completed, claim_stats.released
                ),
            )?;
        }
        let scan = self.router.scan_once(&AtomicBool::new(false))?;
        self.scheduler.tick(Local::now());
        Ok(scan)
    }

    /// Run until `cancel` is set.
    pub fn run(&mut self, cancel: &AtomicBool) -> Result<()> {
        let router = &self.router;
        let claims = &self.claims;
        let vault = &self.vault;
        let peer = self.peer;
        let scheduler = &mut self.scheduler;
        let clock = &self.clock;

        std::thread::scope(|scope| -> Result<()> {
            let router_handle = scope.spawn(move || router.run(cancel));

            let mut loop_result = Ok(());
            while !cancel.load(Ordering::Relaxed) && !router_handle.is_finished() {
                let step = (|| -> Result<()> {
                    let claim_stats = claims.process_pending()?;
                    if peer == Peer::Cloud && claim_stats.claimed > 0 {
                        signals::write_cloud_status(
                            vault,
                            peer,
                            &format!(
                                "claimed {} note(s): {} completed, {} released",
                                claim_stats.claimed, claim_stats.completed, claim_stats.released
                            ),
                        )?;
                    }
                    scheduler.tick(Local::now());
                    Ok(())
                })();
                if let Err(e) = step {
                    loop_result = Err(e);
                    break;
                }
                clock.sleep(Duration::from_secs(1));
            }

            // Stop intake everywhere before joining; scope would otherwise
            // wait on a router still parked in its watch.
            cancel.store(true, Ordering::Relaxed);
            let router_result = router_handle
                .join()
                .map_err(|_| anyhow::anyhow!("router thread panicked"))?
                .context("router loop failed");
            loop_result.and(router_result)
        })
    }
}

/// Register the built-in job table.
fn build_scheduler(vault: &Vault, config: &Config) -> Result<Scheduler> {
    let mut scheduler = Scheduler::new(vault);
    let now = Local::now();

    scheduler.add_job(
        "inbox-processing",
        Cadence::Every(Duration::from_secs(30 * 60)),
        now,
        Box::new(|vault| {
            let mut source = InboxSource::new(vault);
            let pending = adjutant_watch::Source::poll(&mut source)
                .map_err(|e| anyhow::anyhow!("inbox poll failed: {e}"))?;
            let expired = policy::sweep_expired(vault, chrono::Utc::now())?;
            Ok(format!(
                "{} foreign file(s) awaiting the file watcher, {} expired approval(s) swept",
                pending.len(),
                expired
            ))
        }),
    );

    scheduler.add_job(
        "dashboard-refresh",
        Cadence::Hourly,
        now,
        Box::new(|vault| {
            signals::refresh_stage_counts(vault)?;
            Ok("stage counts refreshed".to_string())
        }),
    );

    scheduler.add_job(
        "morning-briefing",
        "daily 08:00".parse::<Cadence>().map_err(anyhow::Error::msg)?,
        now,
        Box::new(|vault| {
            let briefing = briefing::morning_briefing(vault, Local::now())?;
            Ok(format!("wrote {}", briefing.file_name))
        }),
    );

    scheduler.add_job(
        "weekly-audit",
        "weekly mon 07:00".parse::<Cadence>().map_err(anyhow::Error::msg)?,
        now,
        Box::new(|vault| {
            let audit = briefing::weekly_audit(vault, Local::now())?;
            Ok(format!("wrote {}", audit.file_name))
        }),
    );

    // Peered mode only: the vault lives in a git clone.
    if let Some(branch) = config.sync.branch.clone() {
        let remote = config.sync.remote.clone();
        let interval = config.sync.interval;
        scheduler.add_job(
            "vault-sync",
            Cadence::Every(interval),
            now,
            Box::new(move |vault| {
                let outcome = SyncBridge::new(vault, remote.clone(), branch.clone()).cycle()?;
                Ok(outcome.summary())
            }),
        );
    }

    if config.agent.mode == Peer::Local {
        scheduler.add_job(
            "signal-merge",
            Cadence::Every(Duration::from_secs(30 * 60)),
            now,
            Box::new(|vault| {
                signals::merge_signals(vault)?;
                Ok("dashboard signals region updated".to_string())
            }),
        );
    }

    let peer = config.agent.mode;
    let claim_ttl = config.agent.claim_ttl;
    scheduler.add_job(
        "claim-sweep",
        Cadence::Every(Duration::from_secs(10 * 60)),
        now,
        Box::new(move |vault| {
            let worker = ClaimWorker::new(vault, peer, Box::new(NoopReasoner), claim_ttl);
            let swept = worker.sweep_stale()?;
            Ok(format!("{swept} stale claim(s) swept"))
        }),
    );

    Ok(scheduler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use adjutant_retry::ManualClock;
    use adjutant_types::{ActionVerb, NoteType, Stage};
    use adjutant_vault::{ActionNote, Preamble, Stem};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn orchestrator(config: Config) -> (tempfile::TempDir, Orchestrator) {
        let td = tempdir().expect("tempdir");
        let vault = Vault::init(td.path().join("vault"), "test").expect("init");
        let clock = Arc::new(ManualClock::new());
        let orchestrator = Orchestrator::new(
            &vault,
            &config,
            AdapterSet::null_transports(),
            Box::new(NoopReasoner),
            clock,
        )
        .expect("orchestrator");
        (td, orchestrator)
    }

    fn email_note() -> ActionNote {
        ActionNote::new(
            Preamble::new(NoteType::Email, ActionVerb::SendEmail)
                .with_created(Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap())
                .with_field("to", "bob@example.com"),
            "Body.\n",
        )
    }

    #[test]
    fn builtin_job_table_matches_the_cadence_contract() {
        let (_td, orchestrator) = orchestrator(Config::default());
        let names = orchestrator.scheduler.job_names();
        assert!(names.contains(&"inbox-processing"));
        assert!(names.contains(&"dashboard-refresh"));
        assert!(names.contains(&"morning-briefing"));
        assert!(names.contains(&"weekly-audit"));
        assert!(names.contains(&"signal-merge"));
        assert!(names.contains(&"claim-sweep"));
        // No branch configured: not peered, no sync job.
        assert!(!names.contains(&"vault-sync"));
    }

    #[test]
    fn peered_config_registers_the_sync_job() {
        let mut config = Config::default();
        config.sync.branch = Some("agents".to_string());
        let (_td, orchestrator) = orchestrator(config);
        assert!(orchestrator.scheduler.job_names().contains(&"vault-sync"));
    }

    #[test]
    fn cloud_mode_skips_the_signal_merge_job() {
        let mut config = Config::default();
        config.agent.mode = Peer::Cloud;
        let (_td, orchestrator) = orchestrator(config);
        assert!(!orchestrator.scheduler.job_names().contains(&"signal-merge"));
    }

    #[test]
    fn run_once_claims_and_dispatches() {
        let (_td, mut orchestrator) = orchestrator(Config::default());
        let vault = orchestrator.vault().clone();

        // A pending note for the claim loop...
        let pending = Stem::from_raw("EMAIL_ack_20250102030405");
        let mut ack = email_note();
        ack.preamble.action = ActionVerb::AcknowledgeAndArchive;
        vault.emit(Stage::NeedsAction, &pending, &ack).expect("emit");

        // ...and an approved note for the router.
        let approved = Stem::from_raw("EMAIL_reply_20250102030405");
        vault
            .emit(Stage::Approved, &approved, &email_note())
            .expect("emit");

        let scan = orchestrator.run_once().expect("cycle");
        assert_eq!(scan.sent, 1);
        assert!(vault.find_in(Stage::Done, &approved).expect("find").is_some());
        assert!(vault.find_in(Stage::Done, &pending).expect("find").is_some());
    }

    #[test]
    fn cloud_run_once_writes_a_status_signal() {
        let mut config = Config::default();
        config.agent.mode = Peer::Cloud;
        let (_td, mut orchestrator) = orchestrator(config);
        let vault = orchestrator.vault().clone();

        let stem = Stem::from_raw("EMAIL_draft_20250102030405");
        let mut draft = email_note();
        draft.preamble.action = ActionVerb::DraftReply;
        vault.emit(Stage::NeedsAction, &stem, &draft).expect("emit");

        orchestrator.run_once().expect("cycle");

        let signals = vault.list(Stage::Signals).expect("list");
        assert!(
            signals
                .iter()
                .any(|r| r.stem.has_kind_prefix("CLOUD_STATUS")),
            "cloud peer reports via Signals/"
        );
    }
}
