//! Ordered sets of modifiers and their per-message state.
//!
//! A [`ModifierSet`] belongs to one scope of the routing tree. Opening it for
//! a message yields a [`ModifierStack`] whose rewrites chain through the
//! member states in configuration order. Stacks own their states until
//! closed; closing is idempotent so the transaction teardown can be blunt.

use std::sync::Arc;

use courier_common::{body::Body, header::Header};

use crate::{
    error::Result,
    module::{Modifier, ModifierState, MsgMeta},
};

#[derive(Clone, Default)]
pub struct ModifierSet {
    modifiers: Vec<Arc<dyn Modifier>>,
}

impl ModifierSet {
    #[must_use]
    pub fn new(modifiers: Vec<Arc<dyn Modifier>>) -> Self {
        Self { modifiers }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modifiers.is_empty()
    }

    /// Open per-message state for every member, in order. If a member fails
    /// to open, the already-open states are closed before the error returns.
    pub(crate) async fn open(&self, meta: &Arc<MsgMeta>) -> Result<ModifierStack> {
        let mut states = Vec::with_capacity(self.modifiers.len());
        for modifier in &self.modifiers {
            match modifier.open(meta).await {
                Ok(state) => states.push(state),
                Err(err) => {
                    tracing::debug!(
                        msg = %meta.id(),
                        modifier = modifier.name(),
                        error = %err,
                        "modifier failed to open"
                    );
                    let mut partial = ModifierStack {
                        states,
                        closed: false,
                    };
                    partial.close().await;
                    return Err(err);
                }
            }
        }
        Ok(ModifierStack {
            states,
            closed: false,
        })
    }
}

impl From<Vec<Arc<dyn Modifier>>> for ModifierSet {
    fn from(modifiers: Vec<Arc<dyn Modifier>>) -> Self {
        Self::new(modifiers)
    }
}

pub(crate) struct ModifierStack {
    states: Vec<Box<dyn ModifierState>>,
    closed: bool,
}

impl ModifierStack {
    pub(crate) async fn rewrite_sender(&mut self, mail_from: &str) -> Result<String> {
        let mut addr = mail_from.to_string();
        for state in &mut self.states {
            addr = state.rewrite_sender(&addr).await?;
        }
        Ok(addr)
    }

    pub(crate) async fn rewrite_rcpt(&mut self, rcpt: &str) -> Result<String> {
        let mut addr = rcpt.to_string();
        for state in &mut self.states {
            addr = state.rewrite_rcpt(&addr).await?;
        }
        Ok(addr)
    }

    pub(crate) async fn rewrite_body(&mut self, header: &mut Header, body: &mut Body) -> Result<()> {
        for state in &mut self.states {
            state.rewrite_body(header, body).await?;
        }
        Ok(())
    }

    pub(crate) async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for state in &mut self.states {
            state.close().await;
        }
        self.states.clear();
    }
}
