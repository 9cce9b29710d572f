//! Capability interfaces the dispatcher composes: policy checks, envelope and
//! body modifiers, delivery targets and their per-transaction sessions, and
//! the status collector used for streaming (LMTP-style) delivery reports.
//!
//! Everything here is a narrow trait meant to be implemented by concrete
//! modules elsewhere and faked in tests.

use std::sync::{
    Arc, PoisonError, RwLock,
    atomic::{AtomicBool, Ordering},
};

use ahash::AHashMap;
use async_trait::async_trait;
use courier_common::{body::Body, header::Header};

use crate::error::{DispatchError, Rejection, Result};

/// Per-transaction message metadata, shared between the dispatcher and every
/// backend session it starts.
///
/// `original_rcpts` maps each recipient in its final rewritten form back to
/// the form the client presented. It is populated while recipients are added
/// and only read afterwards, so interior mutability with a read-write lock is
/// enough; lock poisoning is recovered since the map holds plain strings.
#[derive(Debug)]
pub struct MsgMeta {
    id: String,
    quarantine: AtomicBool,
    original_rcpts: RwLock<AHashMap<String, String>>,
}

impl MsgMeta {
    /// Fresh metadata with a generated ULID message id.
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(ulid::Ulid::new().to_string())
    }

    #[must_use]
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            quarantine: AtomicBool::new(false),
            original_rcpts: RwLock::new(AHashMap::new()),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the message was flagged for quarantine by accumulated check
    /// scores. Backends decide what quarantine means for them.
    #[must_use]
    pub fn is_quarantined(&self) -> bool {
        self.quarantine.load(Ordering::Relaxed)
    }

    pub(crate) fn set_quarantined(&self) {
        self.quarantine.store(true, Ordering::Relaxed);
    }

    /// The recipient as presented by the client, given its final rewritten
    /// form. `None` when the recipient was never rewritten.
    #[must_use]
    pub fn original_rcpt(&self, rewritten: &str) -> Option<String> {
        self.original_rcpts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(rewritten)
            .cloned()
    }

    pub(crate) fn record_original_rcpt(&self, rewritten: &str, original: &str) {
        self.original_rcpts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(rewritten.to_string(), original.to_string());
    }
}

impl Default for MsgMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// What a single check run contributed to the transaction.
///
/// A hard rejection short-circuits the stage it was produced in. Score
/// contributions accumulate across the whole transaction and are judged
/// against the configured thresholds at the body phase. Authentication
/// result fragments are aggregated into one `Authentication-Results` header.
#[derive(Debug, Clone, Default)]
pub struct CheckOutcome {
    pub reject: Option<Rejection>,
    pub score: i32,
    pub auth_results: Vec<String>,
}

impl CheckOutcome {
    /// Nothing to report.
    #[must_use]
    pub fn accept() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn reject(rejection: Rejection) -> Self {
        Self {
            reject: Some(rejection),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn score(score: i32) -> Self {
        Self {
            score,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_auth_result(mut self, fragment: impl Into<String>) -> Self {
        self.auth_results.push(fragment.into());
        self
    }
}

/// A policy check, consulted at up to three points of a transaction.
///
/// The default for every stage is to accept, so implementations only
/// override the stages they care about. A returned error means the check
/// itself failed operationally; policy verdicts go in the [`CheckOutcome`].
#[async_trait]
pub trait Check: Send + Sync {
    /// Name used in logs and `Authentication-Results`.
    fn name(&self) -> &str;

    async fn check_conn_sender(&self, meta: &MsgMeta, mail_from: &str) -> Result<CheckOutcome> {
        let _ = (meta, mail_from);
        Ok(CheckOutcome::accept())
    }

    async fn check_rcpt(&self, meta: &MsgMeta, rcpt: &str) -> Result<CheckOutcome> {
        let _ = (meta, rcpt);
        Ok(CheckOutcome::accept())
    }

    async fn check_body(&self, meta: &MsgMeta, header: &Header, body: &Body) -> Result<CheckOutcome> {
        let _ = (meta, header, body);
        Ok(CheckOutcome::accept())
    }
}

/// Factory for per-message modifier state.
#[async_trait]
pub trait Modifier: Send + Sync {
    fn name(&self) -> &str;

    /// Open state for one message. The returned state sees every envelope
    /// and body of that message and is closed exactly once.
    async fn open(&self, meta: &Arc<MsgMeta>) -> Result<Box<dyn ModifierState>>;
}

/// Per-message modifier state. Rewrites default to the identity.
#[async_trait]
pub trait ModifierState: Send {
    async fn rewrite_sender(&mut self, mail_from: &str) -> Result<String> {
        Ok(mail_from.to_string())
    }

    async fn rewrite_rcpt(&mut self, rcpt: &str) -> Result<String> {
        Ok(rcpt.to_string())
    }

    async fn rewrite_body(&mut self, header: &mut Header, body: &mut Body) -> Result<()> {
        let _ = (header, body);
        Ok(())
    }

    async fn close(&mut self);
}

/// A named delivery backend capable of accepting messages.
#[async_trait]
pub trait DeliveryTarget: Send + Sync {
    /// The backend kind, e.g. `remote` or `maildir`.
    fn name(&self) -> &str;

    /// The configured instance, for diagnostics.
    fn instance_name(&self) -> &str {
        self.name()
    }

    /// Begin a delivery for one message.
    async fn start(&self, meta: &Arc<MsgMeta>, mail_from: &str) -> Result<Box<dyn DeliverySession>>;
}

/// A per-transaction handle returned by [`DeliveryTarget::start`].
///
/// Exactly one of `commit` or `abort` terminates every session that was
/// started successfully.
#[async_trait]
pub trait DeliverySession: Send {
    async fn add_rcpt(&mut self, to: &str) -> Result<()>;

    /// Atomic body delivery: one status for the whole message.
    async fn body(&mut self, header: &Header, body: &Body) -> Result<()>;

    /// Probe for the streaming capability. Sessions that can report
    /// per-recipient statuses as they go return themselves here.
    fn partial(&mut self) -> Option<&mut dyn PartialDelivery> {
        None
    }

    async fn commit(&mut self) -> Result<()>;

    async fn abort(&mut self) -> Result<()>;
}

/// Streaming body delivery with per-recipient statuses, as required by
/// line-at-a-time protocols like LMTP. Statuses flow through the collector;
/// the call itself does not fail.
#[async_trait]
pub trait PartialDelivery: Send {
    async fn body_non_atomic(
        &mut self,
        collector: &mut dyn StatusCollector,
        header: &Header,
        body: &Body,
    );
}

/// Sink for per-recipient delivery statuses.
pub trait StatusCollector: Send {
    fn set_status(&mut self, rcpt: &str, status: std::result::Result<(), &DispatchError>);
}
