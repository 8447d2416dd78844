//! The inbox file-drop source.
//!
//! `Inbox/` is the vault's front door. Two kinds of things land there:
//! well-formed action notes written by out-of-core watchers, which are
//! hoisted to `Needs_Action/` unchanged, and foreign files dropped by the
//! operator, which become `FILE_*` action notes describing the drop. The
//! dropped file itself stays in `Inbox/` (nothing is deleted); the seen-set
//! keeps it from producing a second note.

use std::fs;
use std::time::{Duration, UNIX_EPOCH};

use chrono::Utc;

use adjutant_types::{ActionVerb, EventKind, LogRecord, NoteType, Priority, Stage};
use adjutant_vault::{ActionNote, Preamble, Stem, Vault, VaultError};

use crate::source::{Source, SourceError, SourceItem};

const INBOX_FALLBACK_CADENCE: Duration = Duration::from_secs(5);

/// Watches `Inbox/` for new notes and file drops.
pub struct InboxSource {
    vault: Vault,
}

impl InboxSource {
    pub fn new(vault: &Vault) -> Self {
        Self {
            vault: vault.as_actor("watcher-files"),
        }
    }

    /// Hoist a well-formed note up to `Needs_Action/`. A stem collision is
    /// quarantined so the inbox cannot wedge on one bad file.
    fn hoist(&self, stem: &Stem) -> Result<(), VaultError> {
        match self.vault.move_note(stem, Stage::Inbox, Stage::NeedsAction) {
            Ok(_) => Ok(()),
            Err(VaultError::Collision(_)) => {
                self.vault.write_error_sibling(
                    stem,
                    adjutant_types::ErrorClass::Integrity,
                    "stem already present in Needs_Action; quarantined from Inbox",
                )?;
                match self.vault.move_note(stem, Stage::Inbox, Stage::Rejected) {
                    Ok(_) | Err(VaultError::Collision(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }
}

impl Source for InboxSource {
    fn name(&self) -> &str {
        "files"
    }

    fn event_kind(&self) -> EventKind {
        EventKind::FileDrop
    }

    fn cadence(&self) -> Duration {
        INBOX_FALLBACK_CADENCE
    }

    fn poll(&mut self) -> Result<Vec<SourceItem>, SourceError> {
        let refs = self
            .vault
            .list(Stage::Inbox)
            .map_err(|e| SourceError::Transient(e.to_string()))?;

        let mut items = Vec::new();
        for note_ref in refs {
            // Well-formed notes move on unchanged.
            if note_ref.file_name.ends_with(".md") {
                if let Ok(text) = fs::read_to_string(&note_ref.path) {
                    if ActionNote::parse(&text).is_ok() {
                        self.hoist(&note_ref.stem)
                            .map_err(|e| SourceError::Transient(e.to_string()))?;
                        continue;
                    }
                }
            }

            // Anything else is a file drop worth a note of its own.
            let metadata = match fs::metadata(&note_ref.path) {
                Ok(m) => m,
                // Vanished between list and stat; the next poll settles it.
                Err(_) => continue,
            };
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let id = format!("{}|{}|{}", note_ref.file_name, metadata.len(), mtime);

            let now = Utc::now();
            let topic = note_ref
                .file_name
                .rsplit_once('.')
                .map(|(stem, _)| stem)
                .unwrap_or(&note_ref.file_name);
            let note = ActionNote::new(
                Preamble::new(NoteType::FileDrop, ActionVerb::AcknowledgeAndArchive)
                    .with_priority(Priority::P3)
                    .with_created(now)
                    .with_field("source_file", format!("Inbox/{}", note_ref.file_name))
                    .with_field("size_bytes", metadata.len().to_string()),
                format!(
                    "New file dropped into the inbox: `{}` ({} bytes).\n\nReview it and decide what, if anything, to do.\n",
                    note_ref.file_name,
                    metadata.len()
                ),
            );
            items.push(SourceItem {
                id,
                stem: Stem::build("FILE", topic, now),
                note,
            });
        }
        Ok(items)
    }

    fn setup(&mut self) -> anyhow::Result<()> {
        // Nothing interactive to bootstrap; just make sure the stage
        // directories exist and record that setup ran.
        self.vault.ensure_layout()?;
        self.vault.append(
            LogRecord::new(EventKind::Other("watcher_setup".to_string()), self.vault.actor())
                .with_result("ok"),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adjutant_types::NoteStatus;
    use tempfile::tempdir;

    fn vault() -> (tempfile::TempDir, Vault) {
        let td = tempdir().expect("tempdir");
        let vault = Vault::init(td.path().join("vault"), "test").expect("init");
        (td, vault)
    }

    #[test]
    fn foreign_file_becomes_a_file_drop_item() {
        let (_td, vault) = vault();
        fs::write(vault.stage_dir(Stage::Inbox).join("note.txt"), "hello").unwrap();

        let mut source = InboxSource::new(&vault);
        let items = source.poll().expect("poll");
        assert_eq!(items.len(), 1);

        let item = &items[0];
        assert!(item.stem.as_str().starts_with("FILE_note_"));
        assert_eq!(item.note.preamble.note_type, NoteType::FileDrop);
        assert_eq!(item.note.preamble.priority, Priority::P3);
        assert_eq!(item.note.preamble.field("size_bytes"), Some("5"));
        // The dropped file stays put.
        assert!(vault.stage_dir(Stage::Inbox).join("note.txt").exists());
    }

    #[test]
    fn stable_id_until_the_file_changes() {
        let (_td, vault) = vault();
        let path = vault.stage_dir(Stage::Inbox).join("note.txt");
        fs::write(&path, "hello").unwrap();

        let mut source = InboxSource::new(&vault);
        let first = source.poll().expect("poll");
        let second = source.poll().expect("poll");
        assert_eq!(first[0].id, second[0].id);

        fs::write(&path, "hello world").unwrap();
        let third = source.poll().expect("poll");
        assert_ne!(first[0].id, third[0].id, "size change changes the id");
    }

    #[test]
    fn well_formed_notes_are_hoisted() {
        let (_td, vault) = vault();
        let note = ActionNote::new(
            Preamble::new(NoteType::Email, ActionVerb::SendEmail)
                .with_status(NoteStatus::Pending),
            "Body.\n",
        );
        let stem = Stem::build("EMAIL", "reply", note.preamble.created);
        vault.emit(Stage::Inbox, &stem, &note).expect("emit");

        let mut source = InboxSource::new(&vault);
        let items = source.poll().expect("poll");
        assert!(items.is_empty(), "hoisting is a move, not an emission");
        assert!(vault.find_in(Stage::NeedsAction, &stem).expect("find").is_some());
        assert!(vault.find_in(Stage::Inbox, &stem).expect("find").is_none());
    }

    #[test]
    fn malformed_markdown_is_treated_as_a_drop() {
        let (_td, vault) = vault();
        fs::write(
            vault.stage_dir(Stage::Inbox).join("scribbles.md"),
            "just some text, no preamble",
        )
        .unwrap();

        let mut source = InboxSource::new(&vault);
        let items = source.poll().expect("poll");
        assert_eq!(items.len(), 1);
        assert!(items[0].stem.as_str().starts_with("FILE_scribbles_"));
    }

    #[test]
    fn hoist_collision_quarantines_to_rejected() {
        let (_td, vault) = vault();
        let note = ActionNote::new(
            Preamble::new(NoteType::Email, ActionVerb::SendEmail),
            "Body.\n",
        );
        let stem = Stem::build("EMAIL", "dupe", note.preamble.created);
        vault.emit(Stage::NeedsAction, &stem, &note).expect("emit");
        vault.emit(Stage::Inbox, &stem, &note).expect("emit");

        let mut source = InboxSource::new(&vault);
        source.poll().expect("poll");

        assert!(vault.find_in(Stage::Rejected, &stem).expect("find").is_some());
        let sibling = Stem::from_raw(format!("{stem}_error"));
        assert!(vault.find_in(Stage::Rejected, &sibling).expect("find").is_some());
    }
}
