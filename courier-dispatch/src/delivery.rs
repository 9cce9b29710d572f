//! Drives one mail transaction end to end: envelope checks and rewrites,
//! recipient routing, body fan-out across backend sessions, and the terminal
//! commit or abort that releases every resource the transaction acquired.

use std::{collections::hash_map::Entry, sync::Arc};

use ahash::AHashMap;
use async_trait::async_trait;
use courier_common::{address, body::Body, header::Header};

use crate::{
    checks::CheckRunner,
    dispatcher::{DispatchCore, SourceBlock},
    error::{DispatchError, Result},
    matcher::{self, MatchKind},
    modify::ModifierStack,
    module::{DeliverySession, DeliveryTarget, MsgMeta, PartialDelivery, StatusCollector},
};

/// One open backend session and the recipients routed to it, kept in their
/// original client-presented form for status reporting.
struct BackendSession {
    key: usize,
    name: String,
    session: Box<dyn DeliverySession>,
    recipients: Vec<String>,
}

/// An in-flight transaction produced by [`crate::Dispatcher::start`].
///
/// The caller sequences the operations: any number of `add_rcpt`, then one
/// body phase, then exactly one of `commit` or `abort`. After a failed
/// `add_rcpt` or `body` the caller is expected to `abort`.
pub struct DispatchDelivery {
    core: Arc<DispatchCore>,
    meta: Arc<MsgMeta>,
    runner: CheckRunner,
    global_mods: Option<ModifierStack>,
    source_mods: Option<ModifierStack>,
    rcpt_mods: AHashMap<usize, ModifierStack>,
    source_addr: String,
    source_block: Arc<SourceBlock>,
    sessions: Vec<BackendSession>,
    closed: bool,
}

impl std::fmt::Debug for DispatchDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchDelivery")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl DispatchDelivery {
    pub(crate) async fn start(
        core: Arc<DispatchCore>,
        meta: Arc<MsgMeta>,
        mail_from: &str,
    ) -> Result<Self> {
        let runner = CheckRunner::new(meta.clone(), core.quarantine_score, core.reject_score);
        let mut delivery = Self {
            source_block: core.default_source.clone(),
            runner,
            core,
            meta,
            global_mods: None,
            source_mods: None,
            rcpt_mods: AHashMap::new(),
            source_addr: String::new(),
            sessions: Vec::new(),
            closed: false,
        };

        if let Err(err) = delivery.open(mail_from).await {
            delivery.close().await;
            return Err(err);
        }
        Ok(delivery)
    }

    async fn open(&mut self, mail_from: &str) -> Result<()> {
        self.runner
            .check_conn_sender(&self.core.checks, mail_from)
            .await?;

        self.global_mods = Some(self.core.modifiers.open(&self.meta).await?);
        let mut mail_from = mail_from.to_string();
        if let Some(mods) = self.global_mods.as_mut() {
            mail_from = mods.rewrite_sender(&mail_from).await?;
        }

        let source_block = self.source_for(&mail_from)?;
        if let Some(rejection) = &source_block.reject {
            tracing::debug!(
                msg = %self.meta.id(),
                sender = %mail_from,
                reply = %rejection,
                "sender rejected by source block"
            );
            return Err(rejection.clone().into());
        }
        self.source_block = source_block;

        self.runner
            .check_conn_sender(&self.source_block.checks, &mail_from)
            .await?;

        let stack = self.source_block.modifiers.open(&self.meta).await?;
        self.source_mods = Some(stack);
        if let Some(mods) = self.source_mods.as_mut() {
            mail_from = mods.rewrite_sender(&mail_from).await?;
        }

        self.source_addr = mail_from;
        Ok(())
    }

    fn source_for(&self, mail_from: &str) -> Result<Arc<SourceBlock>> {
        let (block, kind) =
            matcher::lookup(mail_from, &self.core.per_source, &self.core.default_source, true)
                .map_err(|source| DispatchError::InvalidSender {
                    addr: mail_from.to_string(),
                    source,
                })?;
        match kind {
            MatchKind::Exact => tracing::debug!(
                msg = %self.meta.id(),
                sender = %mail_from,
                rule = %mail_from.to_lowercase(),
                "sender matched by address rule"
            ),
            MatchKind::Domain => tracing::debug!(
                msg = %self.meta.id(),
                sender = %mail_from,
                rule = %address::domain(mail_from).unwrap_or_default().to_lowercase(),
                "sender matched by domain rule"
            ),
            MatchKind::Default => tracing::debug!(
                msg = %self.meta.id(),
                sender = %mail_from,
                "sender matched by default rule"
            ),
        }
        Ok(block.clone())
    }

    /// Add one recipient: run global, source and recipient-scope checks,
    /// apply recipient rewrites, route to a recipient block and announce the
    /// final address to each of the block's targets.
    ///
    /// # Errors
    /// On any failure the recipient is not added anywhere and the caller is
    /// expected to abort the transaction.
    pub async fn add_rcpt(&mut self, to: &str) -> Result<()> {
        self.runner.check_rcpt(&self.core.checks, to).await?;
        self.runner
            .check_rcpt(&self.source_block.checks, to)
            .await?;

        let original_to = to.to_string();
        let mut to = to.to_string();

        if let Some(mods) = self.global_mods.as_mut() {
            let new_to = mods.rewrite_rcpt(&to).await?;
            if new_to != to {
                tracing::debug!(msg = %self.meta.id(), from = %to, to = %new_to, "global rcpt rewrite");
            }
            to = new_to;
        }
        if let Some(mods) = self.source_mods.as_mut() {
            let new_to = mods.rewrite_rcpt(&to).await?;
            if new_to != to {
                tracing::debug!(msg = %self.meta.id(), from = %to, to = %new_to, "source rcpt rewrite");
            }
            to = new_to;
        }

        let rcpt_block = {
            let (block, kind) = matcher::lookup(
                &to,
                &self.source_block.per_rcpt,
                &self.source_block.default_rcpt,
                false,
            )
            .map_err(|source| DispatchError::InvalidRecipient {
                addr: to.clone(),
                source,
            })?;
            match kind {
                MatchKind::Exact => tracing::debug!(
                    msg = %self.meta.id(),
                    rcpt = %to,
                    rule = %to.to_lowercase(),
                    "recipient matched by address rule"
                ),
                MatchKind::Domain => tracing::debug!(
                    msg = %self.meta.id(),
                    rcpt = %to,
                    rule = %address::domain(&to).unwrap_or_default().to_lowercase(),
                    "recipient matched by domain rule"
                ),
                MatchKind::Default => tracing::debug!(
                    msg = %self.meta.id(),
                    rcpt = %to,
                    "recipient matched by default rule"
                ),
            }
            block.clone()
        };

        if let Some(rejection) = &rcpt_block.reject {
            tracing::debug!(msg = %self.meta.id(), rcpt = %to, reply = %rejection, "recipient rejected");
            return Err(rejection.clone().into());
        }

        self.runner.check_rcpt(&rcpt_block.checks, &to).await?;

        // Per-recipient-block modifier state is shared by every recipient
        // routing to the same block and opened on first use.
        let key = Arc::as_ptr(&rcpt_block) as usize;
        let meta = self.meta.clone();
        let source_addr = self.source_addr.clone();
        let stack = match self.rcpt_mods.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let mut stack = rcpt_block.modifiers.open(&meta).await?;
                // Recipient-scope modifiers cannot change the sender.
                if let Ok(new_sender) = stack.rewrite_sender(&source_addr).await
                    && new_sender != source_addr
                {
                    tracing::warn!(
                        msg = %meta.id(),
                        rcpt = %to,
                        mail_from = %source_addr,
                        rewritten = %new_sender,
                        "per-recipient modifier changed the sender address; ignored"
                    );
                }
                entry.insert(stack)
            }
        };

        let new_to = stack.rewrite_rcpt(&to).await?;
        if new_to != to {
            tracing::debug!(msg = %self.meta.id(), from = %to, to = %new_to, "per-rcpt rewrite");
        }
        to = new_to;

        if original_to != to {
            self.meta.record_original_rcpt(&to, &original_to);
        }

        for target in rcpt_block.targets.clone() {
            let session = self.session_for(&target).await?;
            if let Err(err) = session.session.add_rcpt(&to).await {
                tracing::debug!(
                    msg = %meta.id(),
                    rcpt = %to,
                    target = %session.name,
                    error = %err,
                    "backend add_rcpt failed"
                );
                return Err(err);
            }
            tracing::debug!(msg = %meta.id(), rcpt = %to, target = %session.name, "backend add_rcpt ok");
            session.recipients.push(original_to.clone());
        }

        Ok(())
    }

    async fn session_for(&mut self, target: &Arc<dyn DeliveryTarget>) -> Result<&mut BackendSession> {
        let key = Arc::as_ptr(target) as *const () as usize;
        let found = self.sessions.iter().position(|s| s.key == key);
        let idx = match found {
            Some(idx) => idx,
            None => {
                let session = match target.start(&self.meta, &self.source_addr).await {
                    Ok(session) => session,
                    Err(err) => {
                        tracing::debug!(
                            msg = %self.meta.id(),
                            target = %target.instance_name(),
                            kind = %target.name(),
                            error = %err,
                            "backend failed to start"
                        );
                        return Err(err);
                    }
                };
                tracing::debug!(
                    msg = %self.meta.id(),
                    target = %target.instance_name(),
                    kind = %target.name(),
                    "backend session started"
                );
                self.sessions.push(BackendSession {
                    key,
                    name: target.instance_name().to_string(),
                    session,
                    recipients: Vec::new(),
                });
                self.sessions.len() - 1
            }
        };
        Ok(&mut self.sessions[idx])
    }

    /// Body checks, the `Authentication-Results` prepend and body rewrites,
    /// shared between the atomic and the streaming body phase.
    async fn prepare_body(&mut self, header: &mut Header, body: &mut Body) -> Result<()> {
        self.runner
            .check_body(&self.core.checks, header, body)
            .await?;
        self.runner
            .check_body(&self.source_block.checks, header, body)
            .await?;
        // TODO: decide whether recipient-scope body checks should run; today
        // only global and source scope see the body.

        self.runner.apply_results(&self.core.hostname, header)?;

        // Rewriters run after the Authentication-Results prepend so that
        // signatures computed by them cover it.
        if let Some(mods) = self.global_mods.as_mut() {
            mods.rewrite_body(header, body).await?;
        }
        if let Some(mods) = self.source_mods.as_mut() {
            mods.rewrite_body(header, body).await?;
        }
        Ok(())
    }

    /// Atomic body delivery: the body goes to every backend session and the
    /// first failure fails the whole phase.
    ///
    /// # Errors
    /// Check rejections, the accumulated-score verdict, modifier failures
    /// and backend failures all propagate; the caller is expected to abort.
    pub async fn body(&mut self, header: &Header, body: &Body) -> Result<()> {
        let mut header = header.clone();
        let mut body = body.clone();
        self.prepare_body(&mut header, &mut body).await?;

        for session in &mut self.sessions {
            if let Err(err) = session.session.body(&header, &body).await {
                tracing::debug!(
                    msg = %self.meta.id(),
                    target = %session.name,
                    error = %err,
                    "backend body failed"
                );
                return Err(err);
            }
            tracing::debug!(msg = %self.meta.id(), target = %session.name, "backend body ok");
        }
        Ok(())
    }

    /// Streaming body delivery: statuses are reported per recipient through
    /// `collector` as soon as they are known, as LMTP requires. The call
    /// itself never fails; prelude errors are fanned to every recipient.
    pub async fn body_non_atomic(
        &mut self,
        collector: &mut dyn StatusCollector,
        header: &Header,
        body: &Body,
    ) {
        let mut header = header.clone();
        let mut body = body.clone();
        if let Err(err) = self.prepare_body(&mut header, &mut body).await {
            for session in &self.sessions {
                for rcpt in &session.recipients {
                    collector.set_status(rcpt, Err(&err));
                }
            }
            return;
        }

        for session in &mut self.sessions {
            if let Some(partial) = session.session.partial() {
                let mut translate = TranslatingCollector {
                    meta: &self.meta,
                    wrapped: &mut *collector,
                };
                partial.body_non_atomic(&mut translate, &header, &body).await;
                continue;
            }

            // No streaming support: fall back to the atomic body and spread
            // a failure over every recipient this session owns. On success
            // the backend is responsible for its recipients' statuses.
            if let Err(err) = session.session.body(&header, &body).await {
                tracing::debug!(
                    msg = %self.meta.id(),
                    target = %session.name,
                    error = %err,
                    "backend body failed"
                );
                for rcpt in &session.recipients {
                    collector.set_status(rcpt, Err(&err));
                }
            } else {
                tracing::debug!(msg = %self.meta.id(), target = %session.name, "backend body ok");
            }
        }
    }

    /// Commit every backend session, in the order sessions were started.
    ///
    /// # Errors
    /// The first commit failure is returned and the remaining sessions are
    /// left uncommitted.
    pub async fn commit(&mut self) -> Result<()> {
        self.close().await;

        for mut session in std::mem::take(&mut self.sessions) {
            if let Err(err) = session.session.commit().await {
                tracing::debug!(
                    msg = %self.meta.id(),
                    target = %session.name,
                    error = %err,
                    "backend commit failed"
                );
                // No point committing the rest; the transaction is already
                // inconsistent across backends.
                return Err(err);
            }
            tracing::debug!(msg = %self.meta.id(), target = %session.name, "backend commit ok");
        }
        Ok(())
    }

    /// Abort every backend session, best effort.
    ///
    /// # Errors
    /// Returns the last abort failure observed; every session is visited
    /// regardless.
    pub async fn abort(&mut self) -> Result<()> {
        self.close().await;

        let mut last_err = None;
        for mut session in std::mem::take(&mut self.sessions) {
            if let Err(err) = session.session.abort().await {
                tracing::debug!(
                    msg = %self.meta.id(),
                    target = %session.name,
                    error = %err,
                    "backend abort failed"
                );
                last_err = Some(err);
                continue;
            }
            tracing::debug!(msg = %self.meta.id(), target = %session.name, "backend abort ok");
        }
        tracing::debug!(msg = %self.meta.id(), "delivery aborted");

        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Release the check runner and every modifier state. Idempotent; runs
    /// before the backend fan-out of both terminal operations.
    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.runner.close();
        if let Some(mut mods) = self.global_mods.take() {
            mods.close().await;
        }
        if let Some(mut mods) = self.source_mods.take() {
            mods.close().await;
        }
        for (_, mut mods) in self.rcpt_mods.drain() {
            mods.close().await;
        }
    }
}

#[async_trait]
impl DeliverySession for DispatchDelivery {
    async fn add_rcpt(&mut self, to: &str) -> Result<()> {
        DispatchDelivery::add_rcpt(self, to).await
    }

    async fn body(&mut self, header: &Header, body: &Body) -> Result<()> {
        DispatchDelivery::body(self, header, body).await
    }

    fn partial(&mut self) -> Option<&mut dyn PartialDelivery> {
        Some(self)
    }

    async fn commit(&mut self) -> Result<()> {
        DispatchDelivery::commit(self).await
    }

    async fn abort(&mut self) -> Result<()> {
        DispatchDelivery::abort(self).await
    }
}

#[async_trait]
impl PartialDelivery for DispatchDelivery {
    async fn body_non_atomic(
        &mut self,
        collector: &mut dyn StatusCollector,
        header: &Header,
        body: &Body,
    ) {
        DispatchDelivery::body_non_atomic(self, collector, header, body).await;
    }
}

/// Wraps the caller's collector and translates rewritten recipients back to
/// the form the client presented. Backends only ever see rewritten
/// addresses, yet statuses must name the original ones, and streaming
/// backends report as they go, so the translation happens inline instead of
/// collect-then-report.
struct TranslatingCollector<'a> {
    meta: &'a MsgMeta,
    wrapped: &'a mut dyn StatusCollector,
}

impl StatusCollector for TranslatingCollector<'_> {
    fn set_status(&mut self, rcpt: &str, status: std::result::Result<(), &DispatchError>) {
        match self.meta.original_rcpt(rcpt) {
            Some(original) => self.wrapped.set_status(&original, status),
            None => self.wrapped.set_status(rcpt, status),
        }
    }
}
