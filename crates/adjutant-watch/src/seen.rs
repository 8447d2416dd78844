//! Persistent seen-set: the watcher-side dedup map.
//!
//! One small JSON file per watcher, living outside the vault so sync never
//! ships watcher bookkeeping between peers. Keys are sha256 fingerprints of
//! source-native ids; values record when the id was first seen, which makes
//! the sidecar greppable when an operator wonders why something was skipped.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Hex sha256 of a source-native id, truncated to 16 bytes of output.
/// Source ids can be long (message ids, URLs); the fingerprint keeps the
/// sidecar compact without meaningful collision risk at watcher scale.
pub fn fingerprint(id: &str) -> String {
    let digest = Sha256::digest(id.as_bytes());
    hex::encode(&digest[..16])
}

/// Default sidecar directory: the platform state dir, falling back to the
/// data dir, under an `adjutant` namespace.
pub fn default_sidecar_dir() -> Option<PathBuf> {
    dirs::state_dir()
        .or_else(dirs::data_dir)
        .map(|d| d.join("adjutant"))
}

/// A watcher's persistent set of already-processed source ids.
#[derive(Debug)]
pub struct SeenSet {
    path: PathBuf,
    entries: BTreeMap<String, DateTime<Utc>>,
}

impl SeenSet {
    /// Load the seen-set for `watcher_name` from `sidecar_dir`, creating an
    /// empty one if the file does not exist.
    pub fn load(sidecar_dir: &Path, watcher_name: &str) -> Result<Self> {
        let path = sidecar_dir.join(format!("{watcher_name}.seen.json"));
        let entries = if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("failed to read seen-set {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("failed to parse seen-set {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether this source id has been processed before.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(&fingerprint(id))
    }

    /// Record an id as processed. Returns `false` if it was already there.
    pub fn insert(&mut self, id: &str) -> bool {
        self.entries
            .insert(fingerprint(id), Utc::now())
            .is_none()
    }

    /// Persist via temp-file-plus-rename so a crash mid-write never loses
    /// the previous generation.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create sidecar dir {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(&self.entries)
            .context("failed to serialize seen-set")?;
        fs::write(&tmp, text)
            .with_context(|| format!("failed to write seen-set temp {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to commit seen-set {}", self.path.display()))?;
        Ok(())
    }
}
