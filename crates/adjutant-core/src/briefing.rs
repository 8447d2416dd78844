//! Morning briefings and the weekly audit.
//!
//! Both are plain markdown notes written into `Briefings/`, assembled from
//! the audit log and the current queue depths. They exist for the human:
//! what happened, what is stuck, what needs a decision.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Duration, Local};

use adjutant_types::{ActionVerb, NoteStatus, NoteType, Stage};
use adjutant_vault::{ActionNote, NoteRef, Preamble, Stem, Vault};

fn count_events(vault: &Vault, days_back: i64, now: DateTime<Local>) -> Result<BTreeMap<String, usize>> {
    let mut counts = BTreeMap::new();
    for offset in 0..=days_back {
        let date = now.date_naive() - Duration::days(offset);
        for record in vault.log().read_day(date)? {
            let key = format!("{}/{}", record.event_type.as_str(), record.result);
            *counts.entry(key).or_insert(0) += 1;
        }
    }
    Ok(counts)
}

fn render_counts(counts: &BTreeMap<String, usize>) -> String {
    if counts.is_empty() {
        return "- (no recorded activity)".to_string();
    }
    counts
        .iter()
        .map(|(key, n)| format!("- {key}: {n}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn backlog_lines(vault: &Vault, stage: Stage, cap: usize) -> Result<String> {
    let refs = vault.list(stage)?;
    if refs.is_empty() {
        return Ok("- (empty)".to_string());
    }
    let mut lines: Vec<String> = refs
        .iter()
        .take(cap)
        .map(|r| format!("- `{}`", r.stem))
        .collect();
    if refs.len() > cap {
        lines.push(format!("- ... and {} more", refs.len() - cap));
    }
    Ok(lines.join("\n"))
}

fn briefing_note(body: String, now: DateTime<Local>) -> ActionNote {
    ActionNote::new(
        Preamble::new(
            NoteType::Other("briefing".to_string()),
            ActionVerb::AcknowledgeAndArchive,
        )
        .with_status(NoteStatus::Done)
        .with_created(now.with_timezone(&chrono::Utc)),
        body,
    )
}

/// Write the morning briefing: yesterday and today so far.
pub fn morning_briefing(vault: &Vault, now: DateTime<Local>) -> Result<NoteRef> {
    let counts = count_events(vault, 1, now)?;
    let body = format!(
        "# Morning briefing - {}\n\n\
         ## Activity (yesterday and today)\n\n{}\n\n\
         ## Waiting on you\n\nPending approval:\n{}\n\n\
         ## Queue\n\nNeeds action:\n{}\n",
        now.format("%Y-%m-%d"),
        render_counts(&counts),
        backlog_lines(vault, Stage::PendingApproval, 10)?,
        backlog_lines(vault, Stage::NeedsAction, 10)?,
    );
    let stem = Stem::build("BRIEFING", "morning", now.with_timezone(&chrono::Utc));
    Ok(vault.emit(Stage::Briefings, &stem, &briefing_note(body, now))?)
}

/// Write the weekly audit: the last seven days plus everything that landed
/// in `Rejected/`.
pub fn weekly_audit(vault: &Vault, now: DateTime<Local>) -> Result<NoteRef> {
    let counts = count_events(vault, 7, now)?;
    let rejected = vault.list(Stage::Rejected)?;
    let failures: Vec<String> = rejected
        .iter()
        .filter(|r| !r.stem.as_str().ends_with("_error"))
        .take(25)
        .map(|r| format!("- `{}`", r.stem))
        .collect();
    let failures = if failures.is_empty() {
        "- (none)".to_string()
    } else {
        failures.join("\n")
    };

    let body = format!(
        "# Weekly audit - week ending {}\n\n\
         ## Activity (last 7 days)\n\n{}\n\n\
         ## Rejected work\n\n{}\n\n\
         ## Terminal totals\n\n- `Done`: {}\n- `Rejected`: {}\n",
        now.format("%Y-%m-%d"),
        render_counts(&counts),
        failures,
        vault.list(Stage::Done)?.len(),
        rejected.len(),
    );
    let stem = Stem::build("BRIEFING", "weekly-audit", now.with_timezone(&chrono::Utc));
    Ok(vault.emit(Stage::Briefings, &stem, &briefing_note(body, now))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use adjutant_types::{EventKind, LogRecord};
    use tempfile::tempdir;

    fn vault() -> (tempfile::TempDir, Vault) {
        let td = tempdir().expect("tempdir");
        let vault = Vault::init(td.path().join("vault"), "test").expect("init");
        (td, vault)
    }

    #[test]
    fn morning_briefing_summarises_activity_and_backlog() {
        let (_td, vault) = vault();
        vault
            .append(
                LogRecord::new(EventKind::Dispatch, "orchestrator-local")
                    .with_file("EMAIL_x_20250101000000")
                    .with_result("sent"),
            )
            .expect("append");
        let pending = ActionNote::new(
            Preamble::new(NoteType::Invoice, ActionVerb::CreateInvoice),
            "Invoice.\n",
        );
        vault
            .emit(
                Stage::PendingApproval,
                &Stem::build("APPROVAL", "invoice", pending.preamble.created),
                &pending,
            )
            .expect("emit");

        let briefing = morning_briefing(&vault, Local::now()).expect("briefing");
        assert!(briefing.stem.as_str().starts_with("BRIEFING_morning_"));

        let note = vault.read_note(&briefing).expect("read");
        assert!(note.body.contains("dispatch/sent: 1"));
        assert!(note.body.contains("APPROVAL_invoice_"));
    }

    #[test]
    fn weekly_audit_lists_rejected_stems_without_error_siblings() {
        let (_td, vault) = vault();
        let rejected = ActionNote::new(
            Preamble::new(NoteType::Email, ActionVerb::SendEmail),
            "Body.\n",
        );
        let stem = Stem::build("EMAIL", "bounced", rejected.preamble.created);
        vault.emit(Stage::Rejected, &stem, &rejected).expect("emit");
        vault
            .write_error_sibling(&stem, adjutant_types::ErrorClass::Permanent, "mailbox gone")
            .expect("sibling");

        let audit = weekly_audit(&vault, Local::now()).expect("audit");
        let note = vault.read_note(&audit).expect("read");
        assert!(note.body.contains(&format!("`{stem}`")));
        assert!(!note.body.contains("_error`"));
        assert!(note.body.contains("- `Rejected`: 2"));
    }

    #[test]
    fn empty_vault_produces_a_calm_briefing() {
        let (_td, vault) = vault();
        let briefing = morning_briefing(&vault, Local::now()).expect("briefing");
        let note = vault.read_note(&briefing).expect("read");
        assert!(note.body.contains("(empty)"));
    }
}
