//! The policy gate.
//!
//! Approval by the human is necessary but not sufficient: even files found
//! in `Approved/` are re-checked against the handbook rules before any
//! side-effect. The gate is deliberately file-based - evidence must exist
//! in the vault itself, because the reasoning layer writes files directly
//! and never goes through this process's memory.

use anyhow::Result;
use chrono::{DateTime, Utc};

use adjutant_types::{ErrorClass, EventKind, LogRecord, Stage};
use adjutant_vault::{ActionNote, Stem, Vault, VaultError};

/// Result of the gate for one approved file.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyVerdict {
    Pass,
    /// The file must move to `Rejected/`; no adapter runs.
    Reject(PolicyViolation),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PolicyViolation {
    /// `expires` is in the past.
    Expired { expired_at: DateTime<Utc> },
    /// Amount above threshold without an approval record in the vault.
    UnapprovedAmount { amount: f64, threshold: f64 },
}

impl PolicyViolation {
    pub fn reason(&self) -> String {
        match self {
            PolicyViolation::Expired { expired_at } => {
                format!("approval expired at {}", expired_at.to_rfc3339())
            }
            PolicyViolation::UnapprovedAmount { amount, threshold } => format!(
                "amount {amount} exceeds threshold {threshold} with no matching approval record"
            ),
        }
    }
}

/// Evidence that an over-threshold action was explicitly approved: either
/// the dispatched file is itself an `APPROVAL_*` note, or an `APPROVAL_*`
/// stem with the same topic has reached `Approved/` or `Done/`.
pub fn has_prior_approval(
    vault: &Vault,
    stem: &Stem,
    note: &ActionNote,
) -> Result<bool, VaultError> {
    if stem.has_kind_prefix("APPROVAL") {
        return Ok(true);
    }

    // An explicit pointer beats topic matching.
    if let Some(reference) = note.preamble.field("approval_ref") {
        let referenced = Stem::from_raw(reference);
        for stage in [Stage::Approved, Stage::Done] {
            if vault.find_in(stage, &referenced)?.is_some() {
                return Ok(true);
            }
        }
    }

    let Some(topic) = stem.topic() else {
        return Ok(false);
    };
    for stage in [Stage::Approved, Stage::Done] {
        for candidate in vault.list(stage)? {
            if candidate.stem.has_kind_prefix("APPROVAL")
                && candidate.stem.topic().is_some_and(|t| t.ends_with(topic))
            {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Run the gate for one file sitting in `Approved/`.
pub fn check(
    vault: &Vault,
    stem: &Stem,
    note: &ActionNote,
    threshold: f64,
    now: DateTime<Utc>,
) -> Result<PolicyVerdict, VaultError> {
    if note.preamble.is_expired(now) {
        return Ok(PolicyVerdict::Reject(PolicyViolation::Expired {
            expired_at: note.preamble.expires.unwrap_or(now),
        }));
    }

    if let Some(amount) = note.preamble.amount() {
        if amount > threshold && !has_prior_approval(vault, stem, note)? {
            return Ok(PolicyVerdict::Reject(PolicyViolation::UnapprovedAmount {
                amount,
                threshold,
            }));
        }
    }

    Ok(PolicyVerdict::Pass)
}

/// Sweep `Pending_Approval/` and `Approved/` for notes whose `expires`
/// deadline has passed: each moves to `Rejected/` with an error sibling and
/// an `approval_expired` record. Returns how many were swept.
pub fn sweep_expired(vault: &Vault, now: DateTime<Utc>) -> Result<usize> {
    let mut swept = 0;
    for stage in [Stage::PendingApproval, Stage::Approved] {
        for note_ref in vault.list(stage)? {
            let Ok(note) = vault.read_note(&note_ref) else {
                // Unreadable files are the router's quarantine problem.
                continue;
            };
            if !note.preamble.is_expired(now) {
                continue;
            }
            let violation = PolicyViolation::Expired {
                expired_at: note.preamble.expires.unwrap_or(now),
            };
            vault.write_error_sibling(&note_ref.stem, ErrorClass::Policy, &violation.reason())?;
            match vault.move_note(&note_ref.stem, stage, Stage::Rejected) {
                Ok(_) => {}
                Err(VaultError::Collision(_)) => continue,
                Err(e) => return Err(e.into()),
            }
            vault.append(
                LogRecord::new(EventKind::ApprovalExpired, vault.actor())
                    .with_file(note_ref.stem.as_str())
                    .with_action(note.preamble.action.as_str())
                    .with_result("expired")
                    .with_detail(violation.reason()),
            )?;
            swept += 1;
        }
    }
    Ok(swept)
}
