//! Vault state machine: directories as queues, renames as commits.
//!
//! A vault is a rooted directory tree whose sub-directories (the *stages*)
//! act as queues ordered by filename. Every mutation is either a new file
//! (`emit`) or a rename between stages (`move_note`, `claim`, `release`);
//! the rename is the commit point, and every committed transition appends
//! one record to the audit log.
//!
//! Invariants enforced at this layer:
//! - never overwrite: a move fails if the destination name exists
//! - terminality: nothing moves out of `Done/` or `Rejected/`
//! - single claim: `claim` is one atomic rename, so racing peers get
//!   exactly one winner
//! - audit completeness: one log record per transition
//!
//! # Example
//!
//! ```no_run
//! use adjutant_vault::{ActionNote, Preamble, Stem, Vault};
//! use adjutant_types::{ActionVerb, NoteType, Stage};
//!
//! let vault = Vault::init("vault", "orchestrator-local").expect("init");
//! let note = ActionNote::new(
//!     Preamble::new(NoteType::Email, ActionVerb::SendEmail),
//!     "Draft body.\n",
//! );
//! let stem = Stem::build("EMAIL", "reply", note.preamble.created);
//! vault.emit(Stage::NeedsAction, &stem, &note).expect("emit");
//! ```

mod layout;
mod note;
mod stem;

pub use layout::{
    DASHBOARD_FILE, GOALS_FILE, HANDBOOK_FILE, SIGNALS_REGION_BEGIN, SIGNALS_REGION_END,
    STAGES_REGION_BEGIN, STAGES_REGION_END, create_singletons, create_stages, missing_stages,
};
pub use note::{ActionNote, Preamble, PreambleError};
pub use stem::Stem;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use adjutant_events::EventLog;
use adjutant_types::{ErrorClass, EventKind, LogRecord, Peer, Stage};

/// Extension used for notes the core itself creates.
pub const NOTE_EXT: &str = "md";

/// A note as found on disk: stem plus its current location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteRef {
    pub stem: Stem,
    pub file_name: String,
    pub path: PathBuf,
}

/// Typed vault failure. `class()` maps each variant onto the error
/// taxonomy so routing layers can decide between retry, quarantine, and
/// exit without string-matching.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("vault root {0} does not exist")]
    RootMissing(PathBuf),
    #[error("missing stage directory {0}")]
    MissingStage(PathBuf),
    #[error("no file with stem '{stem}' in {stage}")]
    NotFound { stem: Stem, stage: Stage },
    #[error("claim lost for '{stem}': no longer pending")]
    ClaimLost { stem: Stem },
    #[error("refusing to overwrite {0}")]
    Collision(PathBuf),
    #[error("stage {stage} is terminal; '{stem}' cannot leave it")]
    Terminal { stem: Stem, stage: Stage },
    #[error("unreadable preamble in {path}")]
    Preamble {
        path: PathBuf,
        #[source]
        source: PreambleError,
    },
    #[error("vault io error at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("audit log append failed")]
    Audit(#[source] anyhow::Error),
}

impl VaultError {
    pub fn class(&self) -> ErrorClass {
        match self {
            VaultError::RootMissing(_) => ErrorClass::Fatal,
            VaultError::Audit(_) => ErrorClass::Fatal,
            VaultError::MissingStage(_)
            | VaultError::NotFound { .. }
            | VaultError::Collision(_)
            | VaultError::Terminal { .. }
            | VaultError::Preamble { .. } => ErrorClass::Integrity,
            VaultError::ClaimLost { .. } | VaultError::Io { .. } => ErrorClass::Transient,
        }
    }

    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        VaultError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Handle to a vault rooted at one directory, tied to an actor name used
/// in every audit record this handle writes.
#[derive(Debug, Clone)]
pub struct Vault {
    root: PathBuf,
    log: EventLog,
    actor: String,
}

impl Vault {
    /// Open an existing vault. The root must already exist; a missing root
    /// is fatal and left to the supervisor.
    pub fn open(root: impl Into<PathBuf>, actor: impl Into<String>) -> Result<Self, VaultError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(VaultError::RootMissing(root));
        }
        let log = EventLog::new(root.join(Stage::Logs.rel_path()));
        Ok(Self {
            root,
            log,
            actor: actor.into(),
        })
    }

    /// Create the full layout (stages plus singletons) and open the vault.
    pub fn init(root: impl Into<PathBuf>, actor: impl Into<String>) -> Result<Self, VaultError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| VaultError::io(&root, e))?;
        layout::create_stages(&root).map_err(|e| VaultError::io(&root, e))?;
        layout::create_singletons(&root).map_err(|e| VaultError::io(&root, e))?;
        Self::open(root, actor)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// Same vault, different actor name (one process, several duties).
    pub fn as_actor(&self, actor: impl Into<String>) -> Self {
        Self {
            root: self.root.clone(),
            log: self.log.clone(),
            actor: actor.into(),
        }
    }

    pub fn stage_dir(&self, stage: Stage) -> PathBuf {
        self.root.join(stage.rel_path())
    }

    pub fn dashboard_path(&self) -> PathBuf {
        self.root.join(DASHBOARD_FILE)
    }

    /// Recreate any missing stage directories.
    pub fn ensure_layout(&self) -> Result<(), VaultError> {
        layout::create_stages(&self.root).map_err(|e| VaultError::io(&self.root, e))
    }

    /// Notes in `stage`, ascending by file name. Dotfiles, temp files, and
    /// sub-directories are skipped.
    pub fn list(&self, stage: Stage) -> Result<Vec<NoteRef>, VaultError> {
        let dir = self.stage_dir(stage);
        if !dir.is_dir() {
            return Err(VaultError::MissingStage(dir));
        }
        let mut refs = Vec::new();
        let entries = fs::read_dir(&dir).map_err(|e| VaultError::io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| VaultError::io(&dir, e))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if file_name.starts_with('.') {
                continue;
            }
            refs.push(NoteRef {
                stem: Stem::from_file_name(file_name),
                file_name: file_name.to_string(),
                path,
            });
        }
        refs.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(refs)
    }

    /// Find `stem` in one stage.
    pub fn find_in(&self, stage: Stage, stem: &Stem) -> Result<Option<NoteRef>, VaultError> {
        Ok(self.list(stage)?.into_iter().find(|r| &r.stem == stem))
    }

    /// Scan every note stage for `stem`. Used for uniqueness checks and
    /// dispatch idempotency.
    pub fn locate(&self, stem: &Stem) -> Result<Option<(Stage, NoteRef)>, VaultError> {
        for stage in Stage::all() {
            if matches!(stage, Stage::Logs) {
                continue;
            }
            if let Some(found) = self.find_in(stage, stem)? {
                return Ok(Some((stage, found)));
            }
        }
        Ok(None)
    }

    /// Rename `stem` from one stage to another, preserving the file name.
    /// The rename is the commit point; a colliding destination name fails
    /// the move without touching anything.
    pub fn move_note(&self, stem: &Stem, from: Stage, to: Stage) -> Result<NoteRef, VaultError> {
        if from.is_terminal() {
            return Err(VaultError::Terminal {
                stem: stem.clone(),
                stage: from,
            });
        }
        let source = self
            .find_in(from, stem)?
            .ok_or_else(|| VaultError::NotFound {
                stem: stem.clone(),
                stage: from,
            })?;
        let dest_dir = self.stage_dir(to);
        if !dest_dir.is_dir() {
            return Err(VaultError::MissingStage(dest_dir));
        }
        let dest = dest_dir.join(&source.file_name);
        if dest.exists() {
            return Err(VaultError::Collision(dest));
        }
        fs::rename(&source.path, &dest).map_err(|e| VaultError::io(&source.path, e))?;

        self.append(
            LogRecord::new(EventKind::StageTransition, self.actor.as_str())
                .with_file(stem.as_str())
                .with_detail(format!("{from} -> {to}")),
        )?;

        Ok(NoteRef {
            stem: stem.clone(),
            file_name: source.file_name,
            path: dest,
        })
    }

    /// Atomically claim a pending note for `peer`. Exactly one of any set
    /// of racing peers wins; the losers get [`VaultError::ClaimLost`] and
    /// must move on, not retry.
    pub fn claim(&self, stem: &Stem, peer: Peer) -> Result<NoteRef, VaultError> {
        let source = self
            .find_in(Stage::NeedsAction, stem)?
            .ok_or_else(|| VaultError::ClaimLost { stem: stem.clone() })?;
        let dest_dir = self.stage_dir(Stage::InProgress(peer));
        if !dest_dir.is_dir() {
            return Err(VaultError::MissingStage(dest_dir));
        }
        let dest = dest_dir.join(&source.file_name);
        if dest.exists() {
            return Err(VaultError::Collision(dest));
        }
        match fs::rename(&source.path, &dest) {
            Ok(()) => {}
            // The other peer's rename got there first.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VaultError::ClaimLost { stem: stem.clone() });
            }
            Err(e) => return Err(VaultError::io(&source.path, e)),
        }

        self.append(
            LogRecord::new(EventKind::StageTransition, self.actor.as_str())
                .with_file(stem.as_str())
                .with_detail(format!("{} -> {} (claim)", Stage::NeedsAction, Stage::InProgress(peer))),
        )?;

        Ok(NoteRef {
            stem: stem.clone(),
            file_name: source.file_name,
            path: dest,
        })
    }

    /// Hand a claimed note back when the owner cannot finish it.
    pub fn release(&self, stem: &Stem, peer: Peer) -> Result<NoteRef, VaultError> {
        self.move_note(stem, Stage::InProgress(peer), Stage::NeedsAction)
    }

    /// Create a new note in `stage`. A colliding stem gets `_N` suffixes
    /// (N >= 2) until a free name is found; the returned ref carries the
    /// stem actually used. Content lands via temp-file-plus-rename so
    /// concurrent readers never see a half-written note.
    pub fn emit(
        &self,
        stage: Stage,
        stem: &Stem,
        note: &ActionNote,
    ) -> Result<NoteRef, VaultError> {
        let dir = self.stage_dir(stage);
        if !dir.is_dir() {
            return Err(VaultError::MissingStage(dir));
        }

        let tmp = dir.join(format!(".{}.tmp", stem.as_str()));
        {
            let mut file = fs::File::create(&tmp).map_err(|e| VaultError::io(&tmp, e))?;
            file.write_all(note.render().as_bytes())
                .map_err(|e| VaultError::io(&tmp, e))?;
            file.sync_data().map_err(|e| VaultError::io(&tmp, e))?;
        }

        let mut chosen = stem.clone();
        let mut n = 2;
        let final_path = loop {
            let candidate = dir.join(chosen.file_name(NOTE_EXT));
            if !candidate.exists() {
                break candidate;
            }
            chosen = stem.with_suffix(n);
            n += 1;
        };
        fs::rename(&tmp, &final_path).map_err(|e| VaultError::io(&tmp, e))?;

        self.append(
            LogRecord::new(EventKind::NoteEmitted, self.actor.as_str())
                .with_file(chosen.as_str())
                .with_action(note.preamble.action.as_str())
                .with_detail(format!("emitted into {stage}")),
        )?;

        Ok(NoteRef {
            file_name: chosen.file_name(NOTE_EXT),
            path: final_path,
            stem: chosen,
        })
    }

    /// Parse the note behind a ref.
    pub fn read_note(&self, note_ref: &NoteRef) -> Result<ActionNote, VaultError> {
        let text = fs::read_to_string(&note_ref.path)
            .map_err(|e| VaultError::io(&note_ref.path, e))?;
        ActionNote::parse(&text).map_err(|source| VaultError::Preamble {
            path: note_ref.path.clone(),
            source,
        })
    }

    /// Write a `<stem>_error.md` sibling into `Rejected/` describing why a
    /// note was refused. The record is itself a note so briefings can
    /// aggregate failures with the same parser.
    pub fn write_error_sibling(
        &self,
        stem: &Stem,
        class: ErrorClass,
        message: &str,
    ) -> Result<NoteRef, VaultError> {
        let sibling_stem = Stem::from_raw(format!("{stem}_error"));
        let note = ActionNote::new(
            Preamble::new(
                adjutant_types::NoteType::Other("error_record".to_string()),
                adjutant_types::ActionVerb::Other("none".to_string()),
            )
            .with_status(adjutant_types::NoteStatus::Rejected)
            .with_field("error_class", class.as_str())
            .with_field("subject", stem.as_str()),
            format!("{message}\n"),
        );
        self.emit(Stage::Rejected, &sibling_stem, &note)
    }

    /// Append one audit record; wraps the log failure as fatal.
    pub fn append(&self, record: LogRecord) -> Result<(), VaultError> {
        self.log.append(&record).map_err(VaultError::Audit)
    }
}
