//! Stems: the stable identity of a note across stages.
//!
//! Canonical form is `<KIND>_<TOPIC>_<YYYYMMDDHHMMSS>`. Moves preserve the
//! stem byte-for-byte, which makes it the natural key for deduplication and
//! the `file` field of audit records. `emit` resolves collisions by
//! appending `_N` (N >= 2), which parsing tolerates.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// A filename without its extension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Stem(String);

impl Stem {
    /// Build a canonical stem. The topic is sanitized to `[A-Za-z0-9-]`
    /// runs joined by underscores so it can never masquerade as the
    /// timestamp or collision-suffix segments.
    pub fn build(kind: &str, topic: &str, at: DateTime<Utc>) -> Self {
        let topic = sanitize_topic(topic);
        let stamp = at.format(TIMESTAMP_FORMAT);
        Self(format!("{kind}_{topic}_{stamp}"))
    }

    /// Wrap an existing stem string verbatim.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Stem of a file name (everything before the final `.ext`).
    pub fn from_file_name(name: &str) -> Self {
        match name.rsplit_once('.') {
            Some((stem, _ext)) if !stem.is_empty() => Self(stem.to_string()),
            _ => Self(name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading `KIND` segment (up to the first underscore).
    pub fn kind(&self) -> &str {
        self.0.split('_').next().unwrap_or("")
    }

    /// Whether the stem's kind-prefix matches, e.g. `APPROVAL` matches
    /// `APPROVAL_invoice_…` and `APPROVAL_payment_…`.
    pub fn has_kind_prefix(&self, prefix: &str) -> bool {
        self.0.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('_'))
    }

    /// The `TOPIC` portion: segments between the kind and the timestamp.
    pub fn topic(&self) -> Option<&str> {
        let segments: Vec<&str> = self.0.split('_').collect();
        let ts_index = self.timestamp_segment_index(&segments)?;
        if ts_index < 2 {
            return None;
        }
        let start = segments[0].len() + 1;
        let end: usize =
            segments[..ts_index].iter().map(|s| s.len()).sum::<usize>() + ts_index - 1;
        self.0.get(start..end)
    }

    /// Parse the embedded `YYYYMMDDHHMMSS` timestamp, tolerating a trailing
    /// `_N` collision suffix.
    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        let segments: Vec<&str> = self.0.split('_').collect();
        let idx = self.timestamp_segment_index(&segments)?;
        NaiveDateTime::parse_from_str(segments[idx], TIMESTAMP_FORMAT).ok()
    }

    fn timestamp_segment_index(&self, segments: &[&str]) -> Option<usize> {
        for (i, segment) in segments.iter().enumerate().rev() {
            if segment.len() == 14 && segment.chars().all(|c| c.is_ascii_digit()) {
                return Some(i);
            }
        }
        None
    }

    /// Stem with collision suffix `_n` appended.
    pub fn with_suffix(&self, n: u32) -> Self {
        Self(format!("{}_{n}", self.0))
    }

    /// File name for this stem with the given extension.
    pub fn file_name(&self, ext: &str) -> String {
        format!("{}.{ext}", self.0)
    }
}

fn sanitize_topic(topic: &str) -> String {
    let mut out = String::with_capacity(topic.len());
    let mut last_was_sep = true;
    for c in topic.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            out.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    let trimmed = out.trim_end_matches('_');
    if trimmed.is_empty() {
        "note".to_string()
    } else {
        trimmed.to_string()
    }
}

impl fmt::Display for Stem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Stem> for String {
    fn from(stem: Stem) -> Self {
        stem.0
    }
}
