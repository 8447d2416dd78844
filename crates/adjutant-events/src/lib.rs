//! Append-only daily JSONL audit log.
//!
//! One file per calendar date under `Logs/`, named `YYYY-MM-DD.jsonl`, one
//! JSON object per line. Rotation is lazy: the day's file is created on the
//! first append after midnight (local time). Writers assemble the whole line
//! in memory and issue a single append followed by flush and fsync, so
//! concurrent readers only ever see whole lines plus at most one torn tail.
//!
//! # Example
//!
//! ```no_run
//! use adjutant_events::EventLog;
//! use adjutant_types::{EventKind, LogRecord};
//! use std::path::Path;
//!
//! let log = EventLog::new(Path::new("vault/Logs"));
//! log.append(
//!     &LogRecord::new(EventKind::NoteEmitted, "watcher-files")
//!         .with_file("FILE_report_20250101120000"),
//! ).expect("append");
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};

use adjutant_types::LogRecord;

/// Log file name for a given date.
pub fn log_file_name(date: NaiveDate) -> String {
    format!("{}.jsonl", date.format("%Y-%m-%d"))
}

/// Path of the log file a record with `timestamp` belongs to. Daily
/// rotation follows the local calendar, not UTC.
pub fn log_path_for(logs_dir: &Path, timestamp: DateTime<Utc>) -> PathBuf {
    let local_date = timestamp.with_timezone(&Local).date_naive();
    logs_dir.join(log_file_name(local_date))
}

/// Writer/reader over a `Logs/` directory.
#[derive(Debug, Clone)]
pub struct EventLog {
    logs_dir: PathBuf,
}

impl EventLog {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
        }
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    /// Append one record to the day file its timestamp selects.
    ///
    /// The record is serialized to a single line up front; the file write is
    /// one `write_all` plus flush and fsync, which keeps lines atomic for
    /// same-process readers and durable across crashes.
    pub fn append(&self, record: &LogRecord) -> Result<()> {
        fs::create_dir_all(&self.logs_dir)
            .with_context(|| format!("failed to create log dir {}", self.logs_dir.display()))?;

        let path = log_path_for(&self.logs_dir, record.timestamp);
        let mut line =
            serde_json::to_string(record).context("failed to serialize log record")?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("failed to append to {}", path.display()))?;
        file.flush()
            .with_context(|| format!("failed to flush {}", path.display()))?;
        file.sync_data()
            .with_context(|| format!("failed to sync {}", path.display()))?;
        Ok(())
    }

    /// Read every parseable record for one local date. Missing files yield
    /// an empty vec; a torn trailing line (a writer mid-append) is skipped.
    pub fn read_day(&self, date: NaiveDate) -> Result<Vec<LogRecord>> {
        let path = self.logs_dir.join(log_file_name(date));
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        let reader = BufReader::new(file);

        let mut records = Vec::new();
        for line in reader.lines() {
            let line =
                line.with_context(|| format!("failed to read line from {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRecord>(&line) {
                Ok(record) => records.push(record),
                // Torn or foreign line; audit readers are best-effort.
                Err(_) => continue,
            }
        }
        Ok(records)
    }

    /// All records for a stem across the given dates, oldest date first.
    pub fn records_for_stem(&self, stem: &str, dates: &[NaiveDate]) -> Result<Vec<LogRecord>> {
        let mut out = Vec::new();
        for date in dates {
            out.extend(
                self.read_day(*date)?
                    .into_iter()
                    .filter(|r| r.file.as_deref() == Some(stem)),
            );
        }
        Ok(out)
    }

    /// Dates for which a day file exists, ascending.
    pub fn available_dates(&self) -> Result<Vec<NaiveDate>> {
        if !self.logs_dir.exists() {
            return Ok(Vec::new());
        }
        let mut dates = Vec::new();
        for entry in fs::read_dir(&self.logs_dir)
            .with_context(|| format!("failed to read {}", self.logs_dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(date_part) = name.strip_suffix(".jsonl") else {
                continue;
            };
            if let Ok(date) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") {
                dates.push(date);
            }
        }
        dates.sort_unstable();
        Ok(dates)
    }
}
