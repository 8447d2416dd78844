//! Adapter contract and the built-in adapter set.
//!
//! An adapter consumes exactly one approved file and performs at most one
//! external side-effect. The actual transports (SMTP, browser sessions,
//! ERP clients) are opaque to the core and injected behind [`Transport`];
//! the adapter owns classification, the rate-limit channel, and the mapping
//! of transport failures onto dispatch outcomes. Idempotency is keyed on
//! the stem: the router never hands an adapter a stem that already sits in
//! `Done/`.

use std::time::Duration;

use adjutant_types::{ActionVerb, DispatchOutcome};
use adjutant_vault::{ActionNote, Preamble, Stem};

/// Dispatch failure, split the same way source errors are: transient
/// failures defer the file, permanent ones reject it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("transient adapter failure: {0}")]
    Transient(String),
    #[error("permanent adapter failure: {0}")]
    Permanent(String),
}

/// Context handed to an adapter for one dispatch.
#[derive(Debug, Clone, Copy)]
pub struct DispatchCtx {
    /// Per-call deadline the transport must honour.
    pub deadline: Duration,
    /// When set, transports must not touch the outside world.
    pub dry_run: bool,
}

/// The opaque side-effect performer behind an adapter.
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Perform the side-effect for one note. Must be idempotent per stem:
    /// delivering the same stem twice must not duplicate the effect.
    fn deliver(&self, ctx: &DispatchCtx, stem: &Stem, note: &ActionNote)
    -> Result<(), DispatchError>;
}

/// Transport that performs nothing. Used for `--dry-run` and anywhere a
/// real transport has not been wired up yet.
#[derive(Debug, Default)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn name(&self) -> &str {
        "null"
    }

    fn deliver(
        &self,
        _ctx: &DispatchCtx,
        _stem: &Stem,
        _note: &ActionNote,
    ) -> Result<(), DispatchError> {
        Ok(())
    }
}

/// A unit that consumes one approved file.
pub trait Adapter: Send + Sync {
    /// Stable name; also the breaker resource name.
    fn name(&self) -> &str;

    /// Rate-limit channel to pay before the side-effect, if any.
    fn channel(&self) -> Option<&str>;

    /// Whether this adapter handles the given preamble.
    fn matches(&self, preamble: &Preamble) -> bool;

    /// Perform the dispatch. The side-effect is the commit point: the
    /// router moves the file only after `Ok`.
    fn dispatch(
        &self,
        ctx: &DispatchCtx,
        stem: &Stem,
        note: &ActionNote,
    ) -> Result<DispatchOutcome, DispatchError>;
}

/// Sends approved email replies and outreach.
pub struct EmailAdapter {
    transport: Box<dyn Transport>,
}

impl EmailAdapter {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }
}

impl Adapter for EmailAdapter {
    fn name(&self) -> &str {
        "email"
    }

    fn channel(&self) -> Option<&str> {
        Some("email")
    }

    fn matches(&self, preamble: &Preamble) -> bool {
        preamble.action == ActionVerb::SendEmail
    }

    fn dispatch(
        &self,
        ctx: &DispatchCtx,
        stem: &Stem,
        note: &ActionNote,
    ) -> Result<DispatchOutcome, DispatchError> {
        if note.preamble.field("to").is_none() && note.preamble.field("sender").is_none() {
            return Err(DispatchError::Permanent(
                "email note has neither 'to' nor 'sender'".to_string(),
            ));
        }
        self.transport.deliver(ctx, stem, note)?;
        Ok(DispatchOutcome::Sent)
    }
}

/// Posts approved content to one social platform.
pub struct SocialAdapter {
    platform: String,
    verb: ActionVerb,
    transport: Box<dyn Transport>,
}

impl SocialAdapter {
    pub fn new(platform: impl Into<String>, verb: ActionVerb, transport: Box<dyn Transport>) -> Self {
        Self {
            platform: platform.into(),
            verb,
            transport,
        }
    }
}

impl Adapter for SocialAdapter {
    fn name(&self) -> &str {
        &self.platform
    }

    fn channel(&self) -> Option<&str> {
        Some("social_post")
    }

    fn matches(&self, preamble: &Preamble) -> bool {
        preamble.action == self.verb
    }

    fn dispatch(
        &self,
        ctx: &DispatchCtx,
        stem: &Stem,
        note: &ActionNote,
    ) -> Result<DispatchOutcome, DispatchError> {
        if note.body.trim().is_empty() {
            return Err(DispatchError::Permanent("post body is empty".to_string()));
        }
        self.transport.deliver(ctx, stem, note)?;
        Ok(DispatchOutcome::Sent)
    }
}

/// Creates or posts accounting documents in the ERP.
pub struct AccountingAdapter {
    transport: Box<dyn Transport>,
}

impl AccountingAdapter {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }
}

impl Adapter for AccountingAdapter {
    fn name(&self) -> &str {
        "accounting"
    }

    fn channel(&self) -> Option<&str> {
        Some("payment")
    }

    fn matches(&self, preamble: &Preamble) -> bool {
        matches!(
            preamble.action,
            ActionVerb::CreateInvoice | ActionVerb::PostInvoice
        )
    }

    fn dispatch(
        &self,
        ctx: &DispatchCtx,
        stem: &Stem,
        note: &ActionNote,
    ) -> Result<DispatchOutcome, DispatchError> {
        if note.preamble.amount().is_none() {
            return Err(DispatchError::Permanent(
                "accounting note is missing a numeric 'amount'".to_string(),
            ));
        }
        self.transport.deliver(ctx, stem, note)?;
        Ok(DispatchOutcome::Sent)
    }
}

/// Fallback for notes no specific adapter claims: no side-effect, the
/// router archives the file to `Done/`.
pub struct GenericAdapter;

impl Adapter for GenericAdapter {
    fn name(&self) -> &str {
        "generic"
    }

    fn channel(&self) -> Option<&str> {
        None
    }

    fn matches(&self, _preamble: &Preamble) -> bool {
        true
    }

    fn dispatch(
        &self,
        _ctx: &DispatchCtx,
        _stem: &Stem,
        _note: &ActionNote,
    ) -> Result<DispatchOutcome, DispatchError> {
        Ok(DispatchOutcome::Sent)
    }
}

/// The selection table: specific adapters in declaration order, generic
/// fallback last.
pub struct AdapterSet {
    adapters: Vec<Box<dyn Adapter>>,
    generic: GenericAdapter,
}

impl AdapterSet {
    pub fn new(adapters: Vec<Box<dyn Adapter>>) -> Self {
        Self {
            adapters,
            generic: GenericAdapter,
        }
    }

    /// The full built-in set over null transports: everything classifies
    /// and rate-limits normally but no side-effect leaves the process.
    pub fn null_transports() -> Self {
        Self::new(vec![
            Box::new(EmailAdapter::new(Box::new(NullTransport))),
            Box::new(SocialAdapter::new(
                "social-twitter",
                ActionVerb::PostToTwitter,
                Box::new(NullTransport),
            )),
            Box::new(SocialAdapter::new(
                "social-linkedin",
                ActionVerb::PostToLinkedin,
                Box::new(NullTransport),
            )),
            Box::new(AccountingAdapter::new(Box::new(NullTransport))),
        ])
    }

    /// Pick the adapter for a preamble.
    pub fn select(&self, preamble: &Preamble) -> &dyn Adapter {
        self.adapters
            .iter()
            .find(|a| a.matches(preamble))
            .map(|a| a.as_ref())
            .unwrap_or(&self.generic)
    }

    /// Names of every adapter, generic included.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.iter().map(|a| a.name()).collect();
        names.push(self.generic.name());
        names
    }
}
