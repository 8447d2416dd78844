//! Signal merge and dashboard regions.
//!
//! Peers never edit each other's prose: machine-written dashboard content
//! lives strictly between fence markers, and the two singletons that do get
//! rewritten (`Dashboard.md` and `Signals/SYNC_STATUS.md`) are replaced via
//! temp-file-plus-rename so readers never observe a half-written file.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;

use adjutant_types::{ActionVerb, NoteStatus, NoteType, Peer, Stage};
use adjutant_vault::{
    ActionNote, NoteRef, Preamble, SIGNALS_REGION_BEGIN, SIGNALS_REGION_END, STAGES_REGION_BEGIN,
    STAGES_REGION_END, Stem, Vault,
};

/// Sync status singleton inside `Signals/`.
pub const SYNC_STATUS_FILE: &str = "SYNC_STATUS.md";

/// Replace the fenced region `begin..end` in `path`, leaving every other
/// byte untouched. Missing markers append a fresh region at the end;
/// a missing file is created around the region.
pub fn rewrite_region(path: &Path, begin: &str, end: &str, content: &str) -> Result<()> {
    let existing = if path.exists() {
        fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?
    } else {
        String::new()
    };

    let region = format!("{begin}\n{content}\n{end}");
    let updated = match (existing.find(begin), existing.find(end)) {
        (Some(start), Some(end_at)) if end_at >= start => {
            let mut out = String::with_capacity(existing.len() + content.len());
            out.push_str(&existing[..start]);
            out.push_str(&region);
            out.push_str(&existing[end_at + end.len()..]);
            out
        }
        _ => {
            let mut out = existing;
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&region);
            out.push('\n');
            out
        }
    };

    let tmp = path.with_extension("md.tmp");
    fs::write(&tmp, updated).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to commit {}", path.display()))?;
    Ok(())
}

/// Rewrite the stage-count region of the dashboard. Returns the rendered
/// content for the caller's log detail.
pub fn refresh_stage_counts(vault: &Vault) -> Result<String> {
    let mut lines = vec![format!(
        "Stage summary as of {}:",
        Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    )];
    lines.push(String::new());
    for stage in Stage::all() {
        if matches!(stage, Stage::Logs) {
            continue;
        }
        let count = vault.list(stage)?.len();
        lines.push(format!("- `{stage}`: {count}"));
    }
    let content = lines.join("\n");
    rewrite_region(
        &vault.dashboard_path(),
        STAGES_REGION_BEGIN,
        STAGES_REGION_END,
        &content,
    )?;
    Ok(content)
}

/// Emit a `CLOUD_STATUS_*` signal describing what the cloud peer just did.
pub fn write_cloud_status(vault: &Vault, peer: Peer, summary: &str) -> Result<NoteRef> {
    let now = Utc::now();
    let stem = Stem::build("CLOUD_STATUS", peer.dir_name(), now);
    let note = ActionNote::new(
        Preamble::new(
            NoteType::Other("peer_status".to_string()),
            ActionVerb::AcknowledgeAndArchive,
        )
        .with_status(NoteStatus::Done)
        .with_created(now)
        .with_field("peer", peer.dir_name())
        .with_field("host", gethostname::gethostname().to_string_lossy()),
        format!("{summary}\n"),
    );
    Ok(vault.emit(Stage::Signals, &stem, &note)?)
}

/// Consume `Signals/CLOUD_STATUS_*` and `Signals/SYNC_STATUS.md`, then
/// rewrite the signals region of the dashboard. Returns the rendered
/// summary.
pub fn merge_signals(vault: &Vault) -> Result<String> {
    let signals = vault.list(Stage::Signals)?;

    let mut lines = vec![format!(
        "Peer activity as of {}:",
        Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    )];
    lines.push(String::new());

    let sync_status_path = vault.stage_dir(Stage::Signals).join(SYNC_STATUS_FILE);
    if sync_status_path.exists() {
        let text = fs::read_to_string(&sync_status_path)
            .with_context(|| format!("failed to read {}", sync_status_path.display()))?;
        if let Some(first) = text.lines().find(|l| !l.trim().is_empty()) {
            lines.push(format!("- sync: {}", first.trim()));
        }
    } else {
        lines.push("- sync: no sync cycle recorded".to_string());
    }

    // Newest cloud status notes first; filenames are timestamp-ordered.
    let mut cloud: Vec<&NoteRef> = signals
        .iter()
        .filter(|r| r.stem.has_kind_prefix("CLOUD_STATUS") || r.stem.kind() == "CLOUD")
        .collect();
    cloud.reverse();
    if cloud.is_empty() {
        lines.push("- cloud peer: no status signals".to_string());
    }
    for note_ref in cloud.iter().take(5) {
        match vault.read_note(note_ref) {
            Ok(note) => {
                let headline = note
                    .body
                    .lines()
                    .find(|l| !l.trim().is_empty())
                    .unwrap_or("(empty status)");
                let when = note
                    .preamble
                    .created
                    .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
                lines.push(format!("- cloud peer at {when}: {}", headline.trim()));
            }
            Err(_) => {
                lines.push(format!("- unreadable signal: {}", note_ref.file_name));
            }
        }
    }

    let content = lines.join("\n");
    rewrite_region(
        &vault.dashboard_path(),
        SIGNALS_REGION_BEGIN,
        SIGNALS_REGION_END,
        &content,
    )?;
    Ok(content)
}
