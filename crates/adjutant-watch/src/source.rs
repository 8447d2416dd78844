//! The contract every external-source observer implements.

use std::time::Duration;

use adjutant_types::{ErrorClass, EventKind, Stage};
use adjutant_vault::{ActionNote, Stem};

/// Source failure, split along the line that decides recovery: transient
/// failures are retried with backoff and feed the breaker; permanent ones
/// stop the watcher and page the operator with an `URGENT_` note.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// Network trouble, 5xx, upstream rate limiting.
    #[error("transient source failure: {0}")]
    Transient(String),
    /// Auth failure, 4xx, schema or parse mismatch.
    #[error("permanent source failure: {0}")]
    Permanent(String),
}

impl SourceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SourceError::Transient(_) => ErrorClass::Transient,
            SourceError::Permanent(_) => ErrorClass::Permanent,
        }
    }
}

/// One new item observed at the source, ready to become an action note.
#[derive(Debug, Clone)]
pub struct SourceItem {
    /// Source-native identifier; the dedup key. Must be stable across
    /// polls for the same underlying item.
    pub id: String,
    /// Stem for the emitted note (collisions get suffixed on emit).
    pub stem: Stem,
    /// The note to write.
    pub note: ActionNote,
}

/// An observer of one external source.
///
/// `poll` returns every currently-visible item; the runner handles dedup,
/// so returning the same item twice is expected and cheap. Implementations
/// must not write into the vault from `poll` except for moves of their own
/// staging area (the inbox source hoists well-formed notes this way).
pub trait Source {
    /// Short name; used for the seen-set sidecar, breaker, and log actor.
    fn name(&self) -> &str;

    /// Audit-log kind for items this source emits.
    fn event_kind(&self) -> EventKind;

    /// Stage new notes land in. `Inbox/` for sources whose output needs
    /// hoisting, `Needs_Action/` for sources that emit ready notes.
    fn target_stage(&self) -> Stage {
        Stage::NeedsAction
    }

    /// Poll cadence. Local filesystem sources run effectively real-time
    /// (short fallback), network sources every 30-180 s.
    fn cadence(&self) -> Duration;

    /// Observe the source once.
    fn poll(&mut self) -> Result<Vec<SourceItem>, SourceError>;

    /// Interactive bootstrap (session creation, credential exchange),
    /// invoked once out-of-band via `--setup`.
    fn setup(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}
