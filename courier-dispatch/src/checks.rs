//! Runs policy checks at the three transaction stages and accumulates their
//! verdicts: hard rejections short-circuit, scores add up against the
//! configured thresholds, and authentication results are collected for one
//! aggregated `Authentication-Results` header.

use std::sync::Arc;

use courier_common::{body::Body, header::Header};

use crate::{
    error::Result,
    module::{Check, CheckOutcome, MsgMeta},
};

pub(crate) struct CheckRunner {
    meta: Arc<MsgMeta>,
    quarantine_score: Option<i32>,
    reject_score: Option<i32>,
    score: i32,
    auth_results: Vec<String>,
    closed: bool,
}

impl CheckRunner {
    pub(crate) fn new(
        meta: Arc<MsgMeta>,
        quarantine_score: Option<i32>,
        reject_score: Option<i32>,
    ) -> Self {
        Self {
            meta,
            quarantine_score,
            reject_score,
            score: 0,
            auth_results: Vec::new(),
            closed: false,
        }
    }

    pub(crate) async fn check_conn_sender(
        &mut self,
        checks: &[Arc<dyn Check>],
        mail_from: &str,
    ) -> Result<()> {
        for check in checks {
            let outcome = check.check_conn_sender(&self.meta, mail_from).await?;
            self.merge(check.name(), outcome)?;
        }
        Ok(())
    }

    pub(crate) async fn check_rcpt(&mut self, checks: &[Arc<dyn Check>], rcpt: &str) -> Result<()> {
        for check in checks {
            let outcome = check.check_rcpt(&self.meta, rcpt).await?;
            self.merge(check.name(), outcome)?;
        }
        Ok(())
    }

    pub(crate) async fn check_body(
        &mut self,
        checks: &[Arc<dyn Check>],
        header: &Header,
        body: &Body,
    ) -> Result<()> {
        for check in checks {
            let outcome = check.check_body(&self.meta, header, body).await?;
            self.merge(check.name(), outcome)?;
        }
        Ok(())
    }

    fn merge(&mut self, name: &str, outcome: CheckOutcome) -> Result<()> {
        if outcome.score != 0 {
            self.score += outcome.score;
            tracing::debug!(
                msg = %self.meta.id(),
                check = name,
                delta = outcome.score,
                total = self.score,
                "check contributed score"
            );
        }
        self.auth_results.extend(outcome.auth_results);

        if let Some(rejection) = outcome.reject {
            tracing::debug!(msg = %self.meta.id(), check = name, reply = %rejection, "check rejected message");
            return Err(rejection.into());
        }
        Ok(())
    }

    /// Attach the aggregated `Authentication-Results` header and apply the
    /// score verdict. Called once, before body rewriters run.
    pub(crate) fn apply_results(&mut self, hostname: &str, header: &mut Header) -> Result<()> {
        if !self.auth_results.is_empty() {
            let value = format!("{hostname}; {}", self.auth_results.join("; "));
            header.prepend("Authentication-Results", value);
        }

        if let Some(threshold) = self.reject_score
            && self.score >= threshold
        {
            return Err(crate::error::DispatchError::ScoreReject {
                score: self.score,
                threshold,
            });
        }
        if let Some(threshold) = self.quarantine_score
            && self.score >= threshold
        {
            tracing::debug!(
                msg = %self.meta.id(),
                score = self.score,
                threshold,
                "message flagged for quarantine"
            );
            self.meta.set_quarantined();
        }
        Ok(())
    }

    pub(crate) fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.auth_results.clear();
    }
}
