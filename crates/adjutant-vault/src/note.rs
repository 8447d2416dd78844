//! Action-note codec.
//!
//! A note is a text file whose head is a `---`-fenced key/value preamble and
//! whose body is free-form markdown. Rendering is deterministic: required
//! fields first in a fixed order, then extra fields in insertion order, so a
//! parse/render cycle is byte-stable.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};

use adjutant_types::{ActionVerb, NoteStatus, NoteType, Priority};

/// Preamble parse failure; classified as an integrity error by callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreambleError {
    #[error("missing preamble fence ('---') at the top of the note")]
    MissingFence,
    #[error("preamble fence never closed")]
    UnclosedFence,
    #[error("malformed preamble line: '{0}' (expected 'key: value')")]
    MalformedLine(String),
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("invalid value for '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// The structured head of an action note.
#[derive(Debug, Clone, PartialEq)]
pub struct Preamble {
    pub note_type: NoteType,
    pub action: ActionVerb,
    pub priority: Priority,
    pub status: NoteStatus,
    pub created: DateTime<Utc>,
    /// Unapproved notes past this deadline are auto-rejected.
    pub expires: Option<DateTime<Utc>>,
    /// Type-specific fields (sender, amount, platform, …), insertion order
    /// preserved.
    pub extra: Vec<(String, String)>,
}

impl Preamble {
    pub fn new(note_type: NoteType, action: ActionVerb) -> Self {
        Self {
            note_type,
            action,
            priority: Priority::default(),
            status: NoteStatus::default(),
            created: Utc::now(),
            expires: None,
            extra: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_status(mut self, status: NoteStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_created(mut self, created: DateTime<Utc>) -> Self {
        self.created = created;
        self
    }

    pub fn with_expires(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_field(key.into(), value.into());
        self
    }

    /// Set or replace an extra field, preserving its original position.
    pub fn set_field(&mut self, key: String, value: String) {
        if let Some(slot) = self.extra.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.extra.push((key, value));
        }
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.extra
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The `amount` field as a number, if present and well-formed.
    pub fn amount(&self) -> Option<f64> {
        self.field("amount").and_then(|v| v.trim().parse().ok())
    }

    /// Whether `expires` has passed as of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|deadline| deadline < now)
    }
}

/// One unit of pending or completed work: preamble plus free-form body.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionNote {
    pub preamble: Preamble,
    pub body: String,
}

impl ActionNote {
    pub fn new(preamble: Preamble, body: impl Into<String>) -> Self {
        Self {
            preamble,
            body: body.into(),
        }
    }

    /// Parse a note from its full text.
    pub fn parse(text: &str) -> Result<Self, PreambleError> {
        let mut lines = text.lines();
        match lines.next() {
            Some(line) if line.trim_end() == "---" => {}
            _ => return Err(PreambleError::MissingFence),
        }

        let mut fields: Vec<(String, String)> = Vec::new();
        let mut closed = false;
        let mut consumed = text.find('\n').map(|i| i + 1).unwrap_or(text.len());
        for line in text[consumed..].lines() {
            // Track the byte offset so the body keeps its exact form.
            consumed += line.len();
            if text[consumed..].starts_with("\r\n") {
                consumed += 2;
            } else if text[consumed..].starts_with('\n') {
                consumed += 1;
            }
            if line.trim_end() == "---" {
                closed = true;
                break;
            }
            if line.trim().is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                return Err(PreambleError::MalformedLine(line.to_string()));
            };
            fields.push((key.trim().to_string(), value.trim().to_string()));
        }
        if !closed {
            return Err(PreambleError::UnclosedFence);
        }

        let body = text[consumed..].to_string();

        let mut note_type = None;
        let mut action = None;
        let mut priority = None;
        let mut status = None;
        let mut created = None;
        let mut expires = None;
        let mut extra = Vec::new();

        for (key, value) in fields {
            match key.as_str() {
                "type" => note_type = Some(NoteType::from(value)),
                "action" => action = Some(ActionVerb::from(value)),
                "priority" => {
                    priority = Some(Priority::from_str(&value).map_err(|reason| {
                        PreambleError::InvalidField {
                            field: "priority",
                            reason,
                        }
                    })?);
                }
                "status" => {
                    status = Some(NoteStatus::from_str(&value).map_err(|reason| {
                        PreambleError::InvalidField {
                            field: "status",
                            reason,
                        }
                    })?);
                }
                "created" => created = Some(parse_timestamp("created", &value)?),
                "expires" => expires = Some(parse_timestamp("expires", &value)?),
                _ => extra.push((key, value)),
            }
        }

        Ok(Self {
            preamble: Preamble {
                note_type: note_type.ok_or(PreambleError::MissingField("type"))?,
                action: action.ok_or(PreambleError::MissingField("action"))?,
                priority: priority.ok_or(PreambleError::MissingField("priority"))?,
                status: status.ok_or(PreambleError::MissingField("status"))?,
                created: created.ok_or(PreambleError::MissingField("created"))?,
                expires,
                extra,
            },
            body,
        })
    }

    /// Render the note to its canonical text form.
    pub fn render(&self) -> String {
        self.to_string()
    }
}

fn parse_timestamp(field: &'static str, value: &str) -> Result<DateTime<Utc>, PreambleError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PreambleError::InvalidField {
            field,
            reason: e.to_string(),
        })
}

impl fmt::Display for ActionNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = &self.preamble;
        writeln!(f, "---")?;
        writeln!(f, "type: {}", p.note_type)?;
        writeln!(f, "action: {}", p.action)?;
        writeln!(f, "priority: {}", p.priority)?;
        writeln!(f, "status: {}", p.status)?;
        writeln!(
            f,
            "created: {}",
            p.created.to_rfc3339_opts(SecondsFormat::Secs, true)
        )?;
        if let Some(expires) = p.expires {
            writeln!(
                f,
                "expires: {}",
                expires.to_rfc3339_opts(SecondsFormat::Secs, true)
            )?;
        }
        for (key, value) in &p.extra {
            writeln!(f, "{key}: {value}")?;
        }
        writeln!(f, "---")?;
        f.write_str(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use insta::assert_snapshot;

    fn created() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap()
    }

    fn sample() -> ActionNote {
        ActionNote::new(
            Preamble::new(NoteType::Email, ActionVerb::SendEmail)
                .with_priority(Priority::P1)
                .with_created(created())
                .with_field("sender", "bob@example.com")
                .with_field("subject", "Quarterly invoice"),
            "Reply draft goes here.\n",
        )
    }

    #[test]
    fn render_is_canonical() {
        assert_snapshot!(sample().render(), @r"
        ---
        type: email
        action: send_email
        priority: P1
        status: pending
        created: 2025-01-02T03:04:05Z
        sender: bob@example.com
        subject: Quarterly invoice
        ---
        Reply draft goes here.
        ");
    }

    #[test]
    fn parse_render_round_trips() {
        let note = sample();
        let parsed = ActionNote::parse(&note.render()).expect("parse");
        assert_eq!(parsed, note);
        assert_eq!(parsed.render(), note.render());
    }

    #[test]
    fn body_is_preserved_verbatim() {
        let text = "---\ntype: file_drop\naction: acknowledge_and_archive\npriority: P3\nstatus: pending\ncreated: 2025-01-02T03:04:05Z\n---\nline one\n\n  indented line\n";
        let note = ActionNote::parse(text).expect("parse");
        assert_eq!(note.body, "line one\n\n  indented line\n");
    }

    #[test]
    fn missing_fence_is_rejected() {
        let err = ActionNote::parse("type: email\n").unwrap_err();
        assert_eq!(err, PreambleError::MissingFence);
    }

    #[test]
    fn unclosed_fence_is_rejected() {
        let err = ActionNote::parse("---\ntype: email\n").unwrap_err();
        assert_eq!(err, PreambleError::UnclosedFence);
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let text = "---\ntype: email\naction: send_email\npriority: P2\nstatus: pending\n---\n";
        let err = ActionNote::parse(text).unwrap_err();
        assert_eq!(err, PreambleError::MissingField("created"));
    }

    #[test]
    fn unknown_fields_ride_along_in_order() {
        let text = "---\ntype: odoo_action\naction: create_invoice\npriority: P2\nstatus: pending\ncreated: 2025-01-02T03:04:05Z\namount: 1500\ncurrency: USD\ncustomer: ACME\n---\n";
        let note = ActionNote::parse(text).expect("parse");
        assert_eq!(
            note.preamble.extra,
            vec![
                ("amount".to_string(), "1500".to_string()),
                ("currency".to_string(), "USD".to_string()),
                ("customer".to_string(), "ACME".to_string()),
            ]
        );
        assert_eq!(note.preamble.amount(), Some(1500.0));
    }

    #[test]
    fn expiry_check_uses_now() {
        let note = Preamble::new(NoteType::Invoice, ActionVerb::CreateInvoice)
            .with_created(created())
            .with_expires(Utc.with_ymd_and_hms(2025, 1, 3, 0, 0, 0).unwrap());
        assert!(!note.is_expired(Utc.with_ymd_and_hms(2025, 1, 2, 12, 0, 0).unwrap()));
        assert!(note.is_expired(Utc.with_ymd_and_hms(2025, 1, 4, 0, 0, 0).unwrap()));
    }

    #[test]
    fn malformed_line_is_rejected() {
        let text = "---\ntype: email\nthis is not a field\n---\n";
        let err = ActionNote::parse(text).unwrap_err();
        assert_eq!(
            err,
            PreambleError::MalformedLine("this is not a field".to_string())
        );
    }

    #[test]
    fn set_field_replaces_in_place() {
        let mut p = Preamble::new(NoteType::Email, ActionVerb::SendEmail)
            .with_field("a", "1")
            .with_field("b", "2");
        p.set_field("a".to_string(), "3".to_string());
        assert_eq!(
            p.extra,
            vec![
                ("a".to_string(), "3".to_string()),
                ("b".to_string(), "2".to_string()),
            ]
        );
    }
}
