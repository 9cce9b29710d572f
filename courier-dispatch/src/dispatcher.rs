//! The immutable routing tree: a dispatcher holds per-sender source blocks,
//! each source block holds per-recipient blocks, and each recipient block
//! names the delivery targets that receive a copy of the message.
//!
//! The tree is built once (configuration parsing lives elsewhere) and shared
//! by reference across every concurrent transaction.

use std::sync::Arc;

use ahash::AHashMap;
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    delivery::DispatchDelivery,
    error::{Rejection, Result},
    modify::ModifierSet,
    module::{Check, DeliverySession, DeliveryTarget, MsgMeta},
};

/// Scalar dispatcher settings.
///
/// `reject_score` and `quarantine_score` are thresholds for the accumulated
/// check score; either may be unset, in which case the corresponding verdict
/// is never applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Hostname used to key the aggregated `Authentication-Results` header.
    pub hostname: String,
    #[serde(default)]
    pub reject_score: Option<i32>,
    #[serde(default)]
    pub quarantine_score: Option<i32>,
}

impl DispatchSettings {
    #[must_use]
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            reject_score: None,
            quarantine_score: None,
        }
    }

    #[must_use]
    pub const fn with_reject_score(mut self, score: i32) -> Self {
        self.reject_score = Some(score);
        self
    }

    #[must_use]
    pub const fn with_quarantine_score(mut self, score: i32) -> Self {
        self.quarantine_score = Some(score);
        self
    }
}

/// Routing leaf selected by a recipient address within a source block.
pub struct RcptBlock {
    pub(crate) checks: Vec<Arc<dyn Check>>,
    pub(crate) modifiers: ModifierSet,
    pub(crate) reject: Option<Rejection>,
    pub(crate) targets: Vec<Arc<dyn DeliveryTarget>>,
}

impl RcptBlock {
    #[must_use]
    pub fn new(targets: Vec<Arc<dyn DeliveryTarget>>) -> Self {
        Self {
            checks: Vec::new(),
            modifiers: ModifierSet::default(),
            reject: None,
            targets,
        }
    }

    /// A block that rejects every recipient routed to it.
    #[must_use]
    pub fn rejecting(rejection: Rejection) -> Self {
        Self {
            checks: Vec::new(),
            modifiers: ModifierSet::default(),
            reject: Some(rejection),
            targets: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_checks(mut self, checks: Vec<Arc<dyn Check>>) -> Self {
        self.checks = checks;
        self
    }

    #[must_use]
    pub fn with_modifiers(mut self, modifiers: ModifierSet) -> Self {
        self.modifiers = modifiers;
        self
    }

    /// Reject every recipient routed here, before its checks and modifiers
    /// are consulted.
    #[must_use]
    pub fn with_reject(mut self, rejection: Rejection) -> Self {
        self.reject = Some(rejection);
        self
    }
}

/// Routing block selected by the envelope sender.
pub struct SourceBlock {
    pub(crate) checks: Vec<Arc<dyn Check>>,
    pub(crate) modifiers: ModifierSet,
    pub(crate) reject: Option<Rejection>,
    pub(crate) per_rcpt: AHashMap<String, Arc<RcptBlock>>,
    pub(crate) default_rcpt: Arc<RcptBlock>,
}

impl SourceBlock {
    #[must_use]
    pub fn new(default_rcpt: Arc<RcptBlock>) -> Self {
        Self {
            checks: Vec::new(),
            modifiers: ModifierSet::default(),
            reject: None,
            per_rcpt: AHashMap::new(),
            default_rcpt,
        }
    }

    /// A block that rejects every sender routed to it.
    #[must_use]
    pub fn rejecting(rejection: Rejection) -> Self {
        let default_rcpt = Arc::new(RcptBlock::rejecting(rejection.clone()));
        Self {
            checks: Vec::new(),
            modifiers: ModifierSet::default(),
            reject: Some(rejection),
            per_rcpt: AHashMap::new(),
            default_rcpt,
        }
    }

    /// Route recipients matching `key` (a full address or a bare domain,
    /// matched case-insensitively) to `block`.
    #[must_use]
    pub fn with_rcpt(mut self, key: impl AsRef<str>, block: Arc<RcptBlock>) -> Self {
        self.per_rcpt.insert(key.as_ref().to_lowercase(), block);
        self
    }

    #[must_use]
    pub fn with_checks(mut self, checks: Vec<Arc<dyn Check>>) -> Self {
        self.checks = checks;
        self
    }

    #[must_use]
    pub fn with_modifiers(mut self, modifiers: ModifierSet) -> Self {
        self.modifiers = modifiers;
        self
    }

    /// Reject every sender routed here, before its checks and modifiers are
    /// consulted.
    #[must_use]
    pub fn with_reject(mut self, rejection: Rejection) -> Self {
        self.reject = Some(rejection);
        self
    }
}

pub(crate) struct DispatchCore {
    pub(crate) hostname: String,
    pub(crate) reject_score: Option<i32>,
    pub(crate) quarantine_score: Option<i32>,
    pub(crate) checks: Vec<Arc<dyn Check>>,
    pub(crate) modifiers: ModifierSet,
    pub(crate) per_source: AHashMap<String, Arc<SourceBlock>>,
    pub(crate) default_source: Arc<SourceBlock>,
}

/// Selects delivery targets for each recipient of a message and runs the
/// configured checks and modifiers on the way.
///
/// A `Dispatcher` is cheap to clone and is itself a [`DeliveryTarget`], so a
/// whole dispatcher can be mounted wherever a backend is expected. It is
/// driven by a mail source (an SMTP, submission or LMTP listener), one
/// transaction per [`Dispatcher::start`].
#[derive(Clone)]
pub struct Dispatcher {
    pub(crate) core: Arc<DispatchCore>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher {
    #[must_use]
    pub fn builder(settings: DispatchSettings) -> DispatcherBuilder {
        DispatcherBuilder {
            settings,
            checks: Vec::new(),
            modifiers: ModifierSet::default(),
            per_source: AHashMap::new(),
            default_source: None,
        }
    }

    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.core.hostname
    }

    /// Begin a new transaction: run global and source-scope connection and
    /// sender checks, apply sender rewrites, and select the source block.
    ///
    /// # Errors
    /// Fails on a check rejection, a configured sender rejection, a modifier
    /// failure, or a malformed non-empty sender address. All state opened
    /// before the failure is released; no backend has been started yet.
    pub async fn start(&self, meta: &Arc<MsgMeta>, mail_from: &str) -> Result<DispatchDelivery> {
        DispatchDelivery::start(self.core.clone(), meta.clone(), mail_from).await
    }
}

#[async_trait]
impl DeliveryTarget for Dispatcher {
    fn name(&self) -> &str {
        "dispatch"
    }

    fn instance_name(&self) -> &str {
        &self.core.hostname
    }

    async fn start(&self, meta: &Arc<MsgMeta>, mail_from: &str) -> Result<Box<dyn DeliverySession>> {
        Ok(Box::new(Dispatcher::start(self, meta, mail_from).await?))
    }
}

pub struct DispatcherBuilder {
    settings: DispatchSettings,
    checks: Vec<Arc<dyn Check>>,
    modifiers: ModifierSet,
    per_source: AHashMap<String, Arc<SourceBlock>>,
    default_source: Option<Arc<SourceBlock>>,
}

impl DispatcherBuilder {
    /// Add a check consulted for every transaction, at every stage.
    #[must_use]
    pub fn global_check(mut self, check: Arc<dyn Check>) -> Self {
        self.checks.push(check);
        self
    }

    /// Set the modifiers applied to every transaction.
    #[must_use]
    pub fn global_modifiers(mut self, modifiers: ModifierSet) -> Self {
        self.modifiers = modifiers;
        self
    }

    /// Route senders matching `key` (a full address or a bare domain,
    /// matched case-insensitively) to `block`.
    #[must_use]
    pub fn source(mut self, key: impl AsRef<str>, block: Arc<SourceBlock>) -> Self {
        self.per_source.insert(key.as_ref().to_lowercase(), block);
        self
    }

    /// The source block used when no per-sender entry matches. Required.
    #[must_use]
    pub fn default_source(mut self, block: Arc<SourceBlock>) -> Self {
        self.default_source = Some(block);
        self
    }

    /// Validate the tree and produce the dispatcher.
    ///
    /// # Errors
    /// Fails when no default source is set or when a recipient block that is
    /// not a rejection has no delivery targets.
    pub fn build(self) -> anyhow::Result<Dispatcher> {
        let default_source = self
            .default_source
            .context("dispatcher requires a default source block")?;

        for (key, block) in self
            .per_source
            .iter()
            .map(|(key, block)| (key.as_str(), block))
            .chain(std::iter::once(("(default)", &default_source)))
        {
            validate_source(key, block)?;
        }

        Ok(Dispatcher {
            core: Arc::new(DispatchCore {
                hostname: self.settings.hostname,
                reject_score: self.settings.reject_score,
                quarantine_score: self.settings.quarantine_score,
                checks: self.checks,
                modifiers: self.modifiers,
                per_source: self.per_source,
                default_source,
            }),
        })
    }
}

fn validate_source(source_key: &str, block: &SourceBlock) -> anyhow::Result<()> {
    if block.reject.is_some() {
        return Ok(());
    }
    for (key, rcpt) in block
        .per_rcpt
        .iter()
        .map(|(key, rcpt)| (key.as_str(), rcpt))
        .chain(std::iter::once(("(default)", &block.default_rcpt)))
    {
        if rcpt.reject.is_none() && rcpt.targets.is_empty() {
            anyhow::bail!("recipient block '{key}' in source block '{source_key}' has no delivery targets");
        }
    }
    Ok(())
}
