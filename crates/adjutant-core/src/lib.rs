//! Core engine behind the `adjutant` CLI.
//!
//! Everything interesting in adjutant happens by moving files between the
//! stage directories of a vault; this crate is the process that does the
//! moving. It contains:
//!
//! - [`adapter`] - the uniform contract for performing one external
//!   side-effect per approved file, plus the built-in adapter set
//! - [`policy`] - the gate that re-checks handbook rules after human
//!   approval (expiry, amount thresholds)
//! - [`router`] - the `Approved/` watcher that classifies, gates, and
//!   dispatches under backoff and circuit breakers
//! - [`scheduler`] - the time-driven job table (briefings, sweeps, sync)
//! - [`claims`] - the peer claim protocol over `Needs_Action/` and the
//!   stale-claim sweep
//! - [`sync`] - the git bridge that lets two peers share one vault
//! - [`signals`] - peer status signals and the fenced dashboard regions
//! - [`briefing`] - morning briefings and the weekly audit
//! - [`orchestrator`] - the wiring that runs router, claims, and scheduler
//!   as one process

pub mod adapter;
pub mod briefing;
pub mod claims;
pub mod orchestrator;
pub mod policy;
pub mod router;
pub mod scheduler;
pub mod signals;
pub mod sync;

pub use adapter::{
    AccountingAdapter, Adapter, AdapterSet, DispatchCtx, DispatchError, EmailAdapter,
    GenericAdapter, NullTransport, SocialAdapter, Transport,
};
pub use claims::{ClaimStats, ClaimWorker, CommandReasoner, NoopReasoner, Reasoner, in_zone};
pub use orchestrator::Orchestrator;
pub use policy::{PolicyVerdict, PolicyViolation, check as policy_check, sweep_expired};
pub use router::{Router, RouterOptions, ScanStats};
pub use scheduler::{Cadence, Scheduler};
pub use signals::{SYNC_STATUS_FILE, merge_signals, refresh_stage_counts, write_cloud_status};
pub use sync::{ConflictPolicy, SyncBridge, SyncOutcome, deletion_allowed, policy_for};
