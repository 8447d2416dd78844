//! Peer claim protocol over `Needs_Action/`.
//!
//! Two orchestrators (one `local`, one `cloud`) share a vault through the
//! sync bridge. Both poll `Needs_Action/` and claim files by atomic rename
//! into their own `In_Progress/<peer>/`; the rename guarantees at most one
//! winner per stem. Work zones keep the peers off each other's turf: verbs
//! with an external side-effect belong to the local peer, drafting belongs
//! to the cloud peer, everything else goes to whichever peer gets there
//! first.
//!
//! The reasoning layer is a subprocess, never a library call: a claimed
//! note is handed to a [`Reasoner`] which reads and writes the same vault
//! and reports only an exit code.

use std::path::Path;
use std::process::Command;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};

use adjutant_types::{ActionVerb, ErrorClass, EventKind, LogRecord, Peer, Stage};
use adjutant_vault::{NoteRef, Vault, VaultError};

/// The reasoning layer as the core sees it: a black box invoked per note.
pub trait Reasoner: Send + Sync {
    /// Process one claimed note. Exit code 0 means the note is handled
    /// (plans/approvals written as vault files); non-zero means the peer
    /// should release the claim.
    fn invoke(&self, vault_root: &Path, note: &NoteRef) -> Result<i32>;
}

/// Runs an external command with the vault root and note path appended.
pub struct CommandReasoner {
    program: String,
    args: Vec<String>,
}

impl CommandReasoner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl Reasoner for CommandReasoner {
    fn invoke(&self, vault_root: &Path, note: &NoteRef) -> Result<i32> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(vault_root)
            .arg(&note.path)
            .status()
            .with_context(|| format!("failed to run reasoner '{}'", self.program))?;
        Ok(status.code().unwrap_or(-1))
    }
}

/// Reasoner that accepts every note without doing anything. Useful for
/// dry runs and for tests of the claim mechanics.
pub struct NoopReasoner;

impl Reasoner for NoopReasoner {
    fn invoke(&self, _vault_root: &Path, _note: &NoteRef) -> Result<i32> {
        Ok(0)
    }
}

/// Whether `peer` may work on a note with this action.
pub fn in_zone(peer: Peer, action: &ActionVerb) -> bool {
    if action.has_side_effect() {
        return peer == Peer::Local;
    }
    if *action == ActionVerb::DraftReply {
        return peer == Peer::Cloud;
    }
    true
}

/// Outcome counts for one claim pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClaimStats {
    pub claimed: usize,
    /// Another peer won the rename race.
    pub misses: usize,
    pub out_of_zone: usize,
    pub completed: usize,
    pub released: usize,
    pub quarantined: usize,
}

/// One peer's claim loop.
pub struct ClaimWorker {
    vault: Vault,
    peer: Peer,
    reasoner: Box<dyn Reasoner>,
    claim_ttl: Duration,
}

impl ClaimWorker {
    pub fn new(vault: &Vault, peer: Peer, reasoner: Box<dyn Reasoner>, claim_ttl: Duration) -> Self {
        Self {
            vault: vault.as_actor(format!("orchestrator-{peer}")),
            peer,
            reasoner,
            claim_ttl,
        }
    }

    pub fn peer(&self) -> Peer {
        self.peer
    }

    /// Claim and process every in-zone pending note once.
    pub fn process_pending(&self) -> Result<ClaimStats> {
        let mut stats = ClaimStats::default();
        for note_ref in self.vault.list(Stage::NeedsAction)? {
            let note = match self.vault.read_note(&note_ref) {
                Ok(note) => note,
                Err(VaultError::Preamble { .. }) => {
                    // Unreadable notes are nobody's zone; quarantine so the
                    // queue cannot wedge.
                    self.vault.write_error_sibling(
                        &note_ref.stem,
                        ErrorClass::Integrity,
                        "unreadable preamble in Needs_Action",
                    )?;
                    match self
                        .vault
                        .move_note(&note_ref.stem, Stage::NeedsAction, Stage::Rejected)
                    {
                        Ok(_) | Err(VaultError::Collision(_)) | Err(VaultError::NotFound { .. }) => {}
                        Err(e) => return Err(e.into()),
                    }
                    stats.quarantined += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if !in_zone(self.peer, &note.preamble.action) {
                stats.out_of_zone += 1;
                continue;
            }

            let claimed = match self.vault.claim(&note_ref.stem, self.peer) {
                Ok(claimed) => claimed,
                Err(VaultError::ClaimLost { .. }) => {
                    stats.misses += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            stats.claimed += 1;

            // Re-read from the claimed path; the pending copy may have been
            // rewritten between listing and claiming.
            let note = self.vault.read_note(&claimed)?;
            if !in_zone(self.peer, &note.preamble.action) {
                self.vault.release(&claimed.stem, self.peer)?;
                stats.out_of_zone += 1;
                continue;
            }

            match self.reasoner.invoke(self.vault.root(), &claimed) {
                Ok(0) => {
                    self.vault
                        .move_note(&claimed.stem, Stage::InProgress(self.peer), Stage::Done)?;
                    stats.completed += 1;
                }
                Ok(code) => {
                    self.vault.release(&claimed.stem, self.peer)?;
                    self.vault.append(
                        LogRecord::new(EventKind::Other("claim_released".to_string()), self.vault.actor())
                            .with_file(claimed.stem.as_str())
                            .with_result("released")
                            .with_detail(format!("reasoner exit code {code}")),
                    )?;
                    stats.released += 1;
                }
                Err(e) => {
                    self.vault.release(&claimed.stem, self.peer)?;
                    self.vault.append(
                        LogRecord::new(EventKind::Other("claim_released".to_string()), self.vault.actor())
                            .with_file(claimed.stem.as_str())
                            .with_result("released")
                            .with_detail(format!("reasoner failed: {e:#}")),
                    )?;
                    stats.released += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Sweep the *other* peer's `In_Progress/` for stale claims (mtime
    /// older than the claim TTL) and hand them back to `Needs_Action/`.
    pub fn sweep_stale(&self) -> Result<usize> {
        let other = self.peer.other();
        let mut swept = 0;
        for note_ref in self.vault.list(Stage::InProgress(other))? {
            let stale = std::fs::metadata(&note_ref.path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
                .is_some_and(|age| age >= self.claim_ttl);
            if !stale {
                continue;
            }
            match self
                .vault
                .move_note(&note_ref.stem, Stage::InProgress(other), Stage::NeedsAction)
            {
                Ok(_) => {
                    self.vault.append(
                        LogRecord::new(EventKind::ClaimSwept, self.vault.actor())
                            .with_file(note_ref.stem.as_str())
                            .with_result("swept")
                            .with_detail(format!("stale claim of peer '{other}'")),
                    )?;
                    swept += 1;
                }
                // The other peer finished or re-claimed concurrently.
                Err(VaultError::NotFound { .. }) | Err(VaultError::Collision(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adjutant_types::NoteType;
    use adjutant_vault::{ActionNote, Preamble, Stem};
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn vault() -> (tempfile::TempDir, Vault) {
        let td = tempdir().expect("tempdir");
        let vault = Vault::init(td.path().join("vault"), "test").expect("init");
        (td, vault)
    }

    fn note(action: ActionVerb) -> ActionNote {
        ActionNote::new(
            Preamble::new(NoteType::Email, action)
                .with_created(Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap()),
            "Body.\n",
        )
    }

    #[test]
    fn zones_split_side_effects_from_drafting() {
        assert!(in_zone(Peer::Local, &ActionVerb::SendEmail));
        assert!(!in_zone(Peer::Cloud, &ActionVerb::SendEmail));
        assert!(!in_zone(Peer::Cloud, &ActionVerb::CreateInvoice));
        assert!(in_zone(Peer::Cloud, &ActionVerb::DraftReply));
        assert!(!in_zone(Peer::Local, &ActionVerb::DraftReply));
        // Neutral verbs are first-come-first-served.
        assert!(in_zone(Peer::Local, &ActionVerb::AcknowledgeAndArchive));
        assert!(in_zone(Peer::Cloud, &ActionVerb::AcknowledgeAndArchive));
    }

    #[test]
    fn in_zone_notes_are_claimed_and_completed() {
        let (_td, vault) = vault();
        let stem = Stem::from_raw("EMAIL_reply_20250102030405");
        vault
            .emit(Stage::NeedsAction, &stem, &note(ActionVerb::SendEmail))
            .expect("emit");

        let worker = ClaimWorker::new(
            &vault,
            Peer::Local,
            Box::new(NoopReasoner),
            Duration::from_secs(1800),
        );
        let stats = worker.process_pending().expect("process");
        assert_eq!((stats.claimed, stats.completed), (1, 1));
        assert!(vault.find_in(Stage::Done, &stem).expect("find").is_some());
    }

    #[test]
    fn out_of_zone_notes_are_left_alone() {
        let (_td, vault) = vault();
        let stem = Stem::from_raw("EMAIL_reply_20250102030405");
        vault
            .emit(Stage::NeedsAction, &stem, &note(ActionVerb::SendEmail))
            .expect("emit");

        let worker = ClaimWorker::new(
            &vault,
            Peer::Cloud,
            Box::new(NoopReasoner),
            Duration::from_secs(1800),
        );
        let stats = worker.process_pending().expect("process");
        assert_eq!((stats.claimed, stats.out_of_zone), (0, 1));
        assert!(vault.find_in(Stage::NeedsAction, &stem).expect("find").is_some());
    }

    #[test]
    fn failing_reasoner_releases_the_claim() {
        struct RefusingReasoner;
        impl Reasoner for RefusingReasoner {
            fn invoke(&self, _vault_root: &Path, _note: &NoteRef) -> Result<i32> {
                Ok(7)
            }
        }

        let (_td, vault) = vault();
        let stem = Stem::from_raw("EMAIL_reply_20250102030405");
        vault
            .emit(Stage::NeedsAction, &stem, &note(ActionVerb::SendEmail))
            .expect("emit");

        let worker = ClaimWorker::new(
            &vault,
            Peer::Local,
            Box::new(RefusingReasoner),
            Duration::from_secs(1800),
        );
        let stats = worker.process_pending().expect("process");
        assert_eq!((stats.claimed, stats.released), (1, 1));
        assert!(vault.find_in(Stage::NeedsAction, &stem).expect("find").is_some());
    }

    #[test]
    fn unreadable_pending_notes_are_quarantined() {
        let (_td, vault) = vault();
        std::fs::write(
            vault.stage_dir(Stage::NeedsAction).join("BAD_x_20250101000000.md"),
            "garbage",
        )
        .unwrap();

        let worker = ClaimWorker::new(
            &vault,
            Peer::Local,
            Box::new(NoopReasoner),
            Duration::from_secs(1800),
        );
        let stats = worker.process_pending().expect("process");
        assert_eq!(stats.quarantined, 1);
        assert!(
            vault
                .find_in(Stage::Rejected, &Stem::from_raw("BAD_x_20250101000000"))
                .expect("find")
                .is_some()
        );
    }

    #[test]
    fn stale_claims_are_swept_back_by_the_other_peer() {
        let (_td, vault) = vault();
        let stem = Stem::from_raw("EMAIL_reply_20250102030405");
        vault
            .emit(Stage::NeedsAction, &stem, &note(ActionVerb::DraftReply))
            .expect("emit");
        vault.claim(&stem, Peer::Cloud).expect("claim");

        // TTL zero: everything in the peer directory counts as stale.
        let local = ClaimWorker::new(&vault, Peer::Local, Box::new(NoopReasoner), Duration::ZERO);
        let swept = local.sweep_stale().expect("sweep");
        assert_eq!(swept, 1);
        assert!(vault.find_in(Stage::NeedsAction, &stem).expect("find").is_some());
        assert!(
            vault
                .find_in(Stage::InProgress(Peer::Cloud), &stem)
                .expect("find")
                .is_none()
        );
    }

    #[test]
    fn fresh_claims_survive_the_sweep() {
        let (_td, vault) = vault();
        let stem = Stem::from_raw("EMAIL_reply_20250102030405");
        vault
            .emit(Stage::NeedsAction, &stem, &note(ActionVerb::DraftReply))
            .expect("emit");
        vault.claim(&stem, Peer::Cloud).expect("claim");

        let local = ClaimWorker::new(
            &vault,
            Peer::Local,
            Box::new(NoopReasoner),
            Duration::from_secs(3600),
        );
        assert_eq!(local.sweep_stale().expect("sweep"), 0);
        assert!(
            vault
                .find_in(Stage::InProgress(Peer::Cloud), &stem)
                .expect("find")
                .is_some()
        );
    }

    #[cfg(unix)]
    #[test]
    fn command_reasoner_reports_the_exit_code() {
        let (_td, vault) = vault();
        let stem = Stem::from_raw("EMAIL_reply_20250102030405");
        let emitted = vault
            .emit(Stage::NeedsAction, &stem, &note(ActionVerb::SendEmail))
            .expect("emit");

        let ok = CommandReasoner::new("sh", vec!["-c".to_string(), "exit 0".to_string()]);
        assert_eq!(ok.invoke(vault.root(), &emitted).expect("invoke"), 0);

        let refusing = CommandReasoner::new("sh", vec!["-c".to_string(), "exit 3".to_string()]);
        assert_eq!(refusing.invoke(vault.root(), &emitted).expect("invoke"), 3);
    }
}
