//! Sync bridge: one vault, two peers, one git remote.
//!
//! Each cycle commits local changes, pulls the shared branch, resolves
//! conflicts by the per-directory policy, refuses remote deletions outside
//! the cloud-authoritative directories, and pushes. The vault's rename
//! discipline keeps conflicts rare: peers write distinct stems everywhere
//! except the approval directories, where the copy with the later `status`
//! wins.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, bail};
use chrono::Utc;

use adjutant_types::{EventKind, LogRecord, NoteStatus, Stage};
use adjutant_vault::{ActionNote, Vault};

use crate::signals::SYNC_STATUS_FILE;

/// How a conflicted path is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Remote is authoritative (`Needs_Action/`, `Signals/`).
    Theirs,
    /// Local wins (`Done/`, `Rejected/`, `Logs/`, never-synced files).
    Ours,
    /// Both sides parsed; the copy with the later `status` rank wins
    /// (`Pending_Approval/`, `Approved/`).
    StatusRank,
}

/// Policy for a path relative to the vault root.
pub fn policy_for(rel_path: &Path) -> ConflictPolicy {
    let first = rel_path
        .components()
        .next()
        .and_then(|c| c.as_os_str().to_str())
        .unwrap_or("");
    match first {
        "Needs_Action" | "Signals" => ConflictPolicy::Theirs,
        "Pending_Approval" | "Approved" => ConflictPolicy::StatusRank,
        _ => ConflictPolicy::Ours,
    }
}

/// Whether a remote deletion of this path is honoured. The handbook's
/// never-delete rule holds everywhere except the cloud-authoritative
/// directories, where the remote pruning a consumed note is the protocol
/// working as intended.
pub fn deletion_allowed(rel_path: &Path) -> bool {
    matches!(policy_for(rel_path), ConflictPolicy::Theirs)
}

/// Counts from one sync cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub committed: bool,
    pub pulled: bool,
    pub pushed: bool,
    pub conflicts_resolved: usize,
    pub deletions_restored: usize,
}

impl SyncOutcome {
    pub fn summary(&self) -> String {
        format!(
            "sync {}: pushed={} conflicts={} restored_deletions={}",
            if self.pulled { "ok" } else { "pull-failed" },
            self.pushed,
            self.conflicts_resolved,
            self.deletions_restored,
        )
    }
}

/// The bridge daemon for one peer's working copy of the vault.
pub struct SyncBridge {
    vault: Vault,
    remote: String,
    branch: String,
}

impl SyncBridge {
    pub fn new(vault: &Vault, remote: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            vault: vault.as_actor("sync-bridge"),
            remote: remote.into(),
            branch: branch.into(),
        }
    }

    fn git(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(self.vault.root())
            .output()
            .with_context(|| format!("failed to run git {}", args.join(" ")))
    }

    fn git_ok(&self, args: &[&str]) -> Result<String> {
        let output = self.git(args)?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Whether the vault root is inside a git work tree.
    pub fn is_repo(&self) -> bool {
        self.git(&["rev-parse", "--is-inside-work-tree"])
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn has_staged_changes(&self) -> Result<bool> {
        // `diff --cached --quiet` exits 1 when something is staged.
        Ok(!self.git(&["diff", "--cached", "--quiet"])?.status.success())
    }

    fn commit_local(&self) -> Result<bool> {
        self.git_ok(&["add", "-A"])?;
        if !self.has_staged_changes()? {
            return Ok(false);
        }
        let message = format!("adjutant({}): local changes", self.vault.actor());
        self.git_ok(&["commit", "-m", &message])?;
        Ok(true)
    }

    fn conflicted_paths(&self) -> Result<Vec<PathBuf>> {
        Ok(self
            .git_ok(&["diff", "--name-only", "--diff-filter=U"])?
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(PathBuf::from)
            .collect())
    }

    /// Resolve a same-stem conflict in the approval directories: parse
    /// both sides, keep the one whose `status` ranks later. Unparseable
    /// sides lose; two unparseable sides fall back to ours.
    fn resolve_status_rank(&self, rel_path: &Path) -> Result<()> {
        let rel = rel_path.to_string_lossy();
        let ours = self.git(&["show", &format!(":2:{rel}")])?;
        let theirs = self.git(&["show", &format!(":3:{rel}")])?;

        let rank = |raw: &Output| -> Option<u8> {
            if !raw.status.success() {
                return None;
            }
            let text = String::from_utf8_lossy(&raw.stdout);
            ActionNote::parse(&text).ok().map(|n| n.preamble.status.rank())
        };

        let ours_rank = rank(&ours).unwrap_or(NoteStatus::Pending.rank());
        let theirs_rank = rank(&theirs);

        let side = match theirs_rank {
            Some(theirs_rank) if theirs_rank > ours_rank => "--theirs",
            _ => "--ours",
        };
        self.git_ok(&["checkout", side, "--", &rel])?;
        Ok(())
    }

    fn resolve_conflicts(&self) -> Result<usize> {
        let conflicted = self.conflicted_paths()?;
        let count = conflicted.len();
        for rel_path in conflicted {
            match policy_for(&rel_path) {
                ConflictPolicy::Theirs => {
                    let rel = rel_path.to_string_lossy();
                    // A remote deletion shows up as a conflict with no
                    // stage-3 blob; accept it by removing our copy.
                    if self.git(&["checkout", "--theirs", "--", &rel])?.status.success() {
                        continue;
                    }
                    self.git_ok(&["rm", "--force", "--quiet", "--", &rel])?;
                }
                ConflictPolicy::Ours => {
                    let rel = rel_path.to_string_lossy();
                    if self.git(&["checkout", "--ours", "--", &rel])?.status.success() {
                        continue;
                    }
                    // Deleted on our side while the remote modified it; the
                    // local deletion stands.
                    self.git_ok(&["rm", "--force", "--quiet", "--", &rel])?;
                }
                ConflictPolicy::StatusRank => self.resolve_status_rank(&rel_path)?,
            }
        }
        if count > 0 {
            self.git_ok(&["add", "-A"])?;
            self.git_ok(&["commit", "--no-edit"])?;
        }
        Ok(count)
    }

    /// Restore files the pulled merge deleted in directories where remote
    /// deletions are refused.
    fn restore_protected_deletions(&self) -> Result<usize> {
        if !self
            .git(&["rev-parse", "--verify", "--quiet", "ORIG_HEAD"])?
            .status
            .success()
        {
            return Ok(0);
        }
        let deleted = self.git_ok(&["diff", "--name-only", "--diff-filter=D", "ORIG_HEAD", "HEAD"])?;
        let mut restored = 0;
        for line in deleted.lines().filter(|l| !l.trim().is_empty()) {
            let rel_path = Path::new(line);
            if deletion_allowed(rel_path) {
                continue;
            }
            self.git_ok(&["checkout", "ORIG_HEAD", "--", line])?;
            restored += 1;
        }
        if restored > 0 {
            self.git_ok(&["add", "-A"])?;
            self.git_ok(&["commit", "-m", "adjutant(sync-bridge): refuse remote deletions"])?;
        }
        Ok(restored)
    }

    /// One full pull-resolve-push cycle. Writes the `SYNC_STATUS` signal
    /// and one audit record regardless of outcome.
    pub fn cycle(&self) -> Result<SyncOutcome> {
        if !self.is_repo() {
            bail!(
                "vault at {} is not a git repository (peered mode needs one)",
                self.vault.root().display()
            );
        }

        let mut outcome = SyncOutcome::default();
        outcome.committed = self.commit_local()?;

        let pull = self.git(&["pull", "--no-rebase", "--no-edit", &self.remote, &self.branch])?;
        if pull.status.success() {
            outcome.pulled = true;
        } else {
            outcome.conflicts_resolved = self.resolve_conflicts()?;
            // Anything else (no remote branch yet, network down) counts as
            // a failed pull; the push below may still succeed.
            outcome.pulled = outcome.conflicts_resolved > 0;
        }
        outcome.deletions_restored = self.restore_protected_deletions()?;

        let push = self.git(&["push", &self.remote, &format!("HEAD:{}", self.branch)])?;
        outcome.pushed = push.status.success();

        self.write_sync_status(&outcome)?;
        self.vault.append(
            LogRecord::new(EventKind::SyncCycle, self.vault.actor())
                .with_result(if outcome.pulled && outcome.pushed {
                    "ok".to_string()
                } else {
                    "partial".to_string()
                })
                .with_detail(outcome.summary()),
        )?;
        Ok(outcome)
    }

    /// Rewrite `Signals/SYNC_STATUS.md` (rename-after-write; this file is
    /// a singleton, not a queue entry).
    fn write_sync_status(&self, outcome: &SyncOutcome) -> Result<()> {
        let path = self.vault.stage_dir(Stage::Signals).join(SYNC_STATUS_FILE);
        let body = format!(
            "{}\n\n- at: {}\n- committed_local: {}\n- pulled: {}\n- pushed: {}\n- conflicts_resolved: {}\n- deletions_restored: {}\n",
            outcome.summary(),
            Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            outcome.committed,
            outcome.pulled,
            outcome.pushed,
            outcome.conflicts_resolved,
            outcome.deletions_restored,
        );
        let tmp = path.with_extension("md.tmp");
        std::fs::write(&tmp, body)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to commit {}", path.display()))?;
        Ok(())
    }
}
