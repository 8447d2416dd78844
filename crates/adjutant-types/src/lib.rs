//! Core domain types for adjutant.
//!
//! This crate defines the vocabulary shared by every adjutant component:
//! - [`Stage`] - the fixed set of vault queue directories
//! - [`Peer`] - orchestrator identity (`local` or `cloud`)
//! - [`Priority`] - urgency bands `P0`..`P3` with their due windows
//! - [`NoteStatus`], [`NoteType`], [`ActionVerb`] - action-note preamble fields
//! - [`DispatchOutcome`] - result of handing one approved file to an adapter
//! - [`ErrorClass`] - the error taxonomy consulted by retry and routing
//! - [`LogRecord`] / [`EventKind`] - the audit-log line format
//!
//! ## Serialization
//!
//! All wire forms are `snake_case` strings via `serde`. Open-ended
//! discriminators (`NoteType`, `ActionVerb`, `EventKind`) round-trip unknown
//! values through an `Other` variant so foreign notes never fail to parse.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Orchestrator peer identity. Two peers may share one vault; each claims
/// work into its own `In_Progress/<peer>/` directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Peer {
    /// The peer with access to real transports (mail, browser sessions).
    #[default]
    Local,
    /// The drafting peer; writes only `Signals/` and `CLOUD_DRAFT_*` files.
    Cloud,
}

impl Peer {
    /// Directory component under `In_Progress/`.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Peer::Local => "local",
            Peer::Cloud => "cloud",
        }
    }

    /// The opposite peer (used by the stale-claim sweep).
    pub fn other(&self) -> Peer {
        match self {
            Peer::Local => Peer::Cloud,
            Peer::Cloud => Peer::Local,
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl FromStr for Peer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Peer::Local),
            "cloud" => Ok(Peer::Cloud),
            other => Err(format!("unknown peer: {other} (expected local|cloud)")),
        }
    }
}

/// A vault stage directory. Stages are queues ordered by filename; the
/// vault's whole state is which filenames sit in which stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Inbox,
    NeedsAction,
    InProgress(Peer),
    Plans,
    PendingApproval,
    Approved,
    Rejected,
    Done,
    Logs,
    Briefings,
    Accounting,
    Signals,
}

impl Stage {
    /// Every stage directory that must exist in a well-formed vault.
    pub fn all() -> [Stage; 13] {
        [
            Stage::Inbox,
            Stage::NeedsAction,
            Stage::InProgress(Peer::Local),
            Stage::InProgress(Peer::Cloud),
            Stage::Plans,
            Stage::PendingApproval,
            Stage::Approved,
            Stage::Rejected,
            Stage::Done,
            Stage::Logs,
            Stage::Briefings,
            Stage::Accounting,
            Stage::Signals,
        ]
    }

    /// Path of this stage relative to the vault root.
    pub fn rel_path(&self) -> PathBuf {
        match self {
            Stage::Inbox => PathBuf::from("Inbox"),
            Stage::NeedsAction => PathBuf::from("Needs_Action"),
            Stage::InProgress(peer) => PathBuf::from("In_Progress").join(peer.dir_name()),
            Stage::Plans => PathBuf::from("Plans"),
            Stage::PendingApproval => PathBuf::from("Pending_Approval"),
            Stage::Approved => PathBuf::from("Approved"),
            Stage::Rejected => PathBuf::from("Rejected"),
            Stage::Done => PathBuf::from("Done"),
            Stage::Logs => PathBuf::from("Logs"),
            Stage::Briefings => PathBuf::from("Briefings"),
            Stage::Accounting => PathBuf::from("Accounting"),
            Stage::Signals => PathBuf::from("Signals"),
        }
    }

    /// `Done/` and `Rejected/` are absorbing: nothing ever leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Rejected)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.rel_path().display())
    }
}

/// Urgency band of an action note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    /// Immediate.
    P0,
    /// Due within 2 hours.
    P1,
    /// Due within 24 hours.
    P2,
    /// Due within 72 hours.
    #[default]
    P3,
}

impl Priority {
    /// How long a note in this band may sit before it is overdue.
    pub fn due_window(&self) -> Duration {
        match self {
            Priority::P0 => Duration::ZERO,
            Priority::P1 => Duration::from_secs(2 * 3600),
            Priority::P2 => Duration::from_secs(24 * 3600),
            Priority::P3 => Duration::from_secs(72 * 3600),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::P0 => "P0",
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "P0" | "p0" => Ok(Priority::P0),
            "P1" | "p1" => Ok(Priority::P1),
            "P2" | "p2" => Ok(Priority::P2),
            "P3" | "p3" => Ok(Priority::P3),
            other => Err(format!("unknown priority: {other} (expected P0..P3)")),
        }
    }
}

/// Lifecycle status carried in a note's preamble.
///
/// The rank ordering is used by the sync bridge when both peers hold the
/// same stem: the copy with the later status wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteStatus {
    #[default]
    Pending,
    InProgress,
    Approved,
    Rejected,
    Done,
}

impl NoteStatus {
    /// Later statuses beat earlier ones on sync conflicts.
    pub fn rank(&self) -> u8 {
        match self {
            NoteStatus::Pending => 0,
            NoteStatus::InProgress => 1,
            NoteStatus::Approved => 2,
            NoteStatus::Rejected => 3,
            NoteStatus::Done => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NoteStatus::Pending => "pending",
            NoteStatus::InProgress => "in_progress",
            NoteStatus::Approved => "approved",
            NoteStatus::Rejected => "rejected",
            NoteStatus::Done => "done",
        }
    }
}

impl fmt::Display for NoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NoteStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(NoteStatus::Pending),
            "in_progress" => Ok(NoteStatus::InProgress),
            "approved" => Ok(NoteStatus::Approved),
            "rejected" => Ok(NoteStatus::Rejected),
            "done" => Ok(NoteStatus::Done),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// Source discriminator of an action note.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NoteType {
    Email,
    FileDrop,
    LinkedinMessage,
    SocialPostApproval,
    OdooAction,
    SecurityReview,
    Invoice,
    /// Foreign or future type; preserved verbatim.
    Other(String),
}

impl NoteType {
    pub fn as_str(&self) -> &str {
        match self {
            NoteType::Email => "email",
            NoteType::FileDrop => "file_drop",
            NoteType::LinkedinMessage => "linkedin_message",
            NoteType::SocialPostApproval => "social_post_approval",
            NoteType::OdooAction => "odoo_action",
            NoteType::SecurityReview => "security_review",
            NoteType::Invoice => "invoice",
            NoteType::Other(s) => s,
        }
    }
}

impl From<String> for NoteType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "email" => NoteType::Email,
            "file_drop" => NoteType::FileDrop,
            "linkedin_message" => NoteType::LinkedinMessage,
            "social_post_approval" => NoteType::SocialPostApproval,
            "odoo_action" => NoteType::OdooAction,
            "security_review" => NoteType::SecurityReview,
            "invoice" => NoteType::Invoice,
            _ => NoteType::Other(s),
        }
    }
}

impl From<NoteType> for String {
    fn from(t: NoteType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for NoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch verb of an action note. Selects the adapter and, for verbs with
/// an external side-effect, the rate-limit channel that must be paid first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionVerb {
    SendEmail,
    PostToTwitter,
    PostToLinkedin,
    CreateInvoice,
    PostInvoice,
    DraftReply,
    AcknowledgeAndArchive,
    /// Foreign or future verb; routed to the generic adapter.
    Other(String),
}

impl ActionVerb {
    pub fn as_str(&self) -> &str {
        match self {
            ActionVerb::SendEmail => "send_email",
            ActionVerb::PostToTwitter => "post_to_twitter",
            ActionVerb::PostToLinkedin => "post_to_linkedin",
            ActionVerb::CreateInvoice => "create_invoice",
            ActionVerb::PostInvoice => "post_invoice",
            ActionVerb::DraftReply => "draft_reply",
            ActionVerb::AcknowledgeAndArchive => "acknowledge_and_archive",
            ActionVerb::Other(s) => s,
        }
    }

    /// Rate-limit channel this verb draws from, if it has an external
    /// side-effect at all.
    pub fn channel(&self) -> Option<&'static str> {
        match self {
            ActionVerb::SendEmail => Some("email"),
            ActionVerb::PostToTwitter | ActionVerb::PostToLinkedin => Some("social_post"),
            ActionVerb::CreateInvoice | ActionVerb::PostInvoice => Some("payment"),
            _ => None,
        }
    }

    /// Whether dispatching this verb touches the outside world. Verbs
    /// without a side-effect skip the approval-gate bookkeeping.
    pub fn has_side_effect(&self) -> bool {
        self.channel().is_some()
    }
}

impl From<String> for ActionVerb {
    fn from(s: String) -> Self {
        match s.as_str() {
            "send_email" => ActionVerb::SendEmail,
            "post_to_twitter" => ActionVerb::PostToTwitter,
            "post_to_linkedin" => ActionVerb::PostToLinkedin,
            "create_invoice" => ActionVerb::CreateInvoice,
            "post_invoice" => ActionVerb::PostInvoice,
            "draft_reply" => ActionVerb::DraftReply,
            "acknowledge_and_archive" => ActionVerb::AcknowledgeAndArchive,
            _ => ActionVerb::Other(s),
        }
    }
}

impl From<ActionVerb> for String {
    fn from(v: ActionVerb) -> Self {
        v.as_str().to_string()
    }
}

impl fmt::Display for ActionVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of dispatching one approved file to an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Side-effect performed; file moved to `Done/`.
    Sent,
    /// No side-effect; artifact written for human review.
    Drafted,
    /// Policy or permanent failure; file moved to `Rejected/`.
    Rejected,
    /// Transient failure or rate limit; file left in `Approved/` for a
    /// later scan.
    Deferred,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Sent => "sent",
            DispatchOutcome::Drafted => "drafted",
            DispatchOutcome::Rejected => "rejected",
            DispatchOutcome::Deferred => "deferred",
        }
    }
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error taxonomy. Retry wrappers only ever retry `Transient`; everything
/// else surfaces through routing (`Rejected/` siblings, `URGENT_` notes, or
/// a non-zero exit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network timeout, 5xx, rate-limited upstream. Retried with backoff.
    Transient,
    /// Auth failure, schema mismatch, parse error at the source.
    Permanent,
    /// Expired approval, over rate-limit, over amount threshold.
    Policy,
    /// Stem collision, missing stage directory, unreadable preamble.
    Integrity,
    /// Vault root missing, log unwriteable. The process exits.
    Fatal,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Transient)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Policy => "policy",
            ErrorClass::Integrity => "integrity",
            ErrorClass::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind discriminator of an audit-log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    /// A note changed stage (`detail` carries `from -> to`).
    StageTransition,
    /// A new note was created via `emit`.
    NoteEmitted,
    /// A watcher observed a dropped file.
    FileDrop,
    /// An adapter was invoked for an approved file.
    Dispatch,
    /// The policy gate rejected a file.
    PolicyReject,
    /// A pending or approved note passed its `expires` deadline.
    ApprovalExpired,
    /// An unreadable or duplicate note was quarantined to `Rejected/`.
    Quarantine,
    /// A stale claim was swept back to `Needs_Action/`.
    ClaimSwept,
    /// One sync-bridge cycle finished.
    SyncCycle,
    /// A scheduler job ran.
    SchedulerJob,
    /// A watcher hit a source error.
    WatcherError,
    /// An `URGENT_` note was written for the operator.
    Urgent,
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::StageTransition => "stage_transition",
            EventKind::NoteEmitted => "note_emitted",
            EventKind::FileDrop => "file_drop",
            EventKind::Dispatch => "dispatch",
            EventKind::PolicyReject => "policy_reject",
            EventKind::ApprovalExpired => "approval_expired",
            EventKind::Quarantine => "quarantine",
            EventKind::ClaimSwept => "claim_swept",
            EventKind::SyncCycle => "sync_cycle",
            EventKind::SchedulerJob => "scheduler_job",
            EventKind::WatcherError => "watcher_error",
            EventKind::Urgent => "urgent",
            EventKind::Other(s) => s,
        }
    }
}

impl From<String> for EventKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "stage_transition" => EventKind::StageTransition,
            "note_emitted" => EventKind::NoteEmitted,
            "file_drop" => EventKind::FileDrop,
            "dispatch" => EventKind::Dispatch,
            "policy_reject" => EventKind::PolicyReject,
            "approval_expired" => EventKind::ApprovalExpired,
            "quarantine" => EventKind::Quarantine,
            "claim_swept" => EventKind::ClaimSwept,
            "sync_cycle" => EventKind::SyncCycle,
            "scheduler_job" => EventKind::SchedulerJob,
            "watcher_error" => EventKind::WatcherError,
            "urgent" => EventKind::Urgent,
            _ => EventKind::Other(s),
        }
    }
}

impl From<EventKind> for String {
    fn from(k: EventKind) -> Self {
        k.as_str().to_string()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of the daily audit log.
///
/// Serialized as a single JSON object per line; `file` holds the stem so
/// every transition of a note can be traced by grepping one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub event_type: EventKind,
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub action: Option<String>,
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub detail: Option<String>,
}

impl LogRecord {
    /// Start a record with `result: "ok"`; refine with the builder methods.
    pub fn new(event_type: EventKind, actor: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            actor: actor.into(),
            file: None,
            action: None,
            result: "ok".to_string(),
            detail: None,
        }
    }

    pub fn with_file(mut self, stem: impl Into<String>) -> Self {
        self.file = Some(stem.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = result.into();
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn stage_paths_are_stable() {
        assert_eq!(Stage::NeedsAction.rel_path(), PathBuf::from("Needs_Action"));
        assert_eq!(
            Stage::InProgress(Peer::Cloud).rel_path(),
            PathBuf::from("In_Progress").join("cloud")
        );
        assert_eq!(Stage::PendingApproval.rel_path(), PathBuf::from("Pending_Approval"));
    }

    #[test]
    fn only_done_and_rejected_are_terminal() {
        for stage in Stage::all() {
            let expected = matches!(stage, Stage::Done | Stage::Rejected);
            assert_eq!(stage.is_terminal(), expected, "{stage}");
        }
    }

    #[test]
    fn priority_due_windows_are_ordered() {
        assert_eq!(Priority::P0.due_window(), Duration::ZERO);
        assert!(Priority::P1.due_window() < Priority::P2.due_window());
        assert!(Priority::P2.due_window() < Priority::P3.due_window());
    }

    #[test]
    fn priority_parses_both_cases() {
        assert_eq!("P1".parse::<Priority>().unwrap(), Priority::P1);
        assert_eq!("p3".parse::<Priority>().unwrap(), Priority::P3);
        assert!("P4".parse::<Priority>().is_err());
    }

    #[test]
    fn status_rank_orders_lifecycle() {
        assert!(NoteStatus::Pending.rank() < NoteStatus::InProgress.rank());
        assert!(NoteStatus::InProgress.rank() < NoteStatus::Approved.rank());
        assert!(NoteStatus::Approved.rank() < NoteStatus::Done.rank());
    }

    #[test]
    fn note_type_preserves_unknown_values() {
        let t = NoteType::from("carrier_pigeon".to_string());
        assert_eq!(t, NoteType::Other("carrier_pigeon".to_string()));
        assert_eq!(t.as_str(), "carrier_pigeon");
    }

    #[test]
    fn action_verb_channels() {
        assert_eq!(ActionVerb::SendEmail.channel(), Some("email"));
        assert_eq!(ActionVerb::PostToTwitter.channel(), Some("social_post"));
        assert_eq!(ActionVerb::CreateInvoice.channel(), Some("payment"));
        assert_eq!(ActionVerb::AcknowledgeAndArchive.channel(), None);
        assert!(!ActionVerb::DraftReply.has_side_effect());
    }

    #[test]
    fn log_record_serializes_without_empty_options() {
        let record = LogRecord::new(EventKind::Dispatch, "orchestrator")
            .with_file("EMAIL_reply_20250101120000")
            .with_action("send_email")
            .with_result("sent");
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"event_type\":\"dispatch\""));
        assert!(json.contains("\"result\":\"sent\""));
        assert!(!json.contains("detail"));
    }

    #[test]
    fn log_record_round_trips() {
        let record = LogRecord::new(EventKind::ApprovalExpired, "scheduler")
            .with_file("APPROVAL_invoice_20250101120000")
            .with_result("expired")
            .with_detail("expires was 2025-01-01T00:00:00Z");
        let json = serde_json::to_string(&record).unwrap();
        let parsed: LogRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }

    proptest! {
        #[test]
        fn note_type_round_trips(s in "[a-z_]{1,24}") {
            let t = NoteType::from(s.clone());
            let back = String::from(t.clone());
            let again = NoteType::from(back);
            prop_assert_eq!(t, again);
        }

        #[test]
        fn action_verb_round_trips(s in "[a-z_]{1,24}") {
            let v = ActionVerb::from(s.clone());
            let back = String::from(v.clone());
            let again = ActionVerb::from(back);
            prop_assert_eq!(v, again);
        }

        #[test]
        fn event_kind_round_trips(s in "[a-z_]{1,24}") {
            let k = EventKind::from(s.clone());
            let json = serde_json::to_string(&k).unwrap();
            let parsed: EventKind = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(k, parsed);
        }
    }
}
