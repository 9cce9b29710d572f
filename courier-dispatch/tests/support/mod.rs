//! In-memory fakes for driving the dispatcher: recording delivery targets,
//! scripted checks, configurable modifiers and a collecting status sink.

#![allow(dead_code)] // each test binary uses a subset of the fakes

use std::sync::{
    Arc, Mutex, Once,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use courier_common::{body::Body, header::Header};
use courier_dispatch::{
    Check, CheckOutcome, DeliverySession, DeliveryTarget, DispatchError, Modifier, ModifierState,
    MsgMeta, PartialDelivery, Result, StatusCollector,
};

static INIT: Once = Once::new();

/// Message metadata with logging set up once per test binary.
pub fn msg() -> Arc<MsgMeta> {
    INIT.call_once(courier_common::logging::init);
    Arc::new(MsgMeta::new())
}

pub fn header() -> Header {
    let mut header = Header::new();
    header.append("Subject", "test");
    header
}

pub fn body() -> Body {
    Body::from("Hello World!\r\n")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetEvent {
    Started { mail_from: String },
    AddRcpt { to: String },
    Body { header: String, body: String },
    BodyNonAtomic,
    Commit,
    Abort,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TargetBehavior {
    pub fail_start: bool,
    pub fail_add_rcpt: bool,
    pub fail_body: bool,
    pub fail_commit: bool,
    pub fail_abort: bool,
    /// Advertise the streaming (per-recipient status) capability.
    pub streaming: bool,
}

/// A delivery backend that records every call it receives.
pub struct TestTarget {
    instance: &'static str,
    behavior: TargetBehavior,
    events: Arc<Mutex<Vec<TargetEvent>>>,
}

impl TestTarget {
    pub fn new(instance: &'static str) -> Arc<Self> {
        Self::with_behavior(instance, TargetBehavior::default())
    }

    pub fn with_behavior(instance: &'static str, behavior: TargetBehavior) -> Arc<Self> {
        Arc::new(Self {
            instance,
            behavior,
            events: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Every event recorded so far, in order.
    ///
    /// # Panics
    /// Panics if the event mutex is poisoned.
    pub fn events(&self) -> Vec<TargetEvent> {
        self.events.lock().expect("event mutex poisoned").clone()
    }

    pub fn committed(&self) -> bool {
        self.events().contains(&TargetEvent::Commit)
    }

    pub fn aborted(&self) -> bool {
        self.events().contains(&TargetEvent::Abort)
    }

    pub fn started(&self) -> bool {
        self.events()
            .iter()
            .any(|e| matches!(e, TargetEvent::Started { .. }))
    }

    fn record(&self, event: TargetEvent) {
        self.events.lock().expect("event mutex poisoned").push(event);
    }
}

#[async_trait]
impl DeliveryTarget for TestTarget {
    fn name(&self) -> &str {
        "test"
    }

    fn instance_name(&self) -> &str {
        self.instance
    }

    async fn start(&self, _meta: &Arc<MsgMeta>, mail_from: &str) -> Result<Box<dyn DeliverySession>> {
        if self.behavior.fail_start {
            return Err(anyhow::anyhow!("{}: start refused", self.instance).into());
        }
        self.record(TargetEvent::Started {
            mail_from: mail_from.to_string(),
        });
        Ok(Box::new(TestSession {
            instance: self.instance,
            behavior: self.behavior,
            events: self.events.clone(),
            rcpts: Vec::new(),
        }))
    }
}

pub struct TestSession {
    instance: &'static str,
    behavior: TargetBehavior,
    events: Arc<Mutex<Vec<TargetEvent>>>,
    rcpts: Vec<String>,
}

impl TestSession {
    fn record(&self, event: TargetEvent) {
        self.events.lock().expect("event mutex poisoned").push(event);
    }
}

#[async_trait]
impl DeliverySession for TestSession {
    async fn add_rcpt(&mut self, to: &str) -> Result<()> {
        if self.behavior.fail_add_rcpt {
            return Err(anyhow::anyhow!("{}: rcpt refused", self.instance).into());
        }
        self.record(TargetEvent::AddRcpt { to: to.to_string() });
        self.rcpts.push(to.to_string());
        Ok(())
    }

    async fn body(&mut self, header: &Header, body: &Body) -> Result<()> {
        if self.behavior.fail_body {
            return Err(anyhow::anyhow!("{}: body refused", self.instance).into());
        }
        self.record(TargetEvent::Body {
            header: header.to_string(),
            body: String::from_utf8_lossy(body.as_bytes()).into_owned(),
        });
        Ok(())
    }

    fn partial(&mut self) -> Option<&mut dyn PartialDelivery> {
        if self.behavior.streaming { Some(self) } else { None }
    }

    async fn commit(&mut self) -> Result<()> {
        self.record(TargetEvent::Commit);
        if self.behavior.fail_commit {
            return Err(anyhow::anyhow!("{}: commit refused", self.instance).into());
        }
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        self.record(TargetEvent::Abort);
        if self.behavior.fail_abort {
            return Err(anyhow::anyhow!("{}: abort refused", self.instance).into());
        }
        Ok(())
    }
}

#[async_trait]
impl PartialDelivery for TestSession {
    async fn body_non_atomic(
        &mut self,
        collector: &mut dyn StatusCollector,
        _header: &Header,
        _body: &Body,
    ) {
        self.record(TargetEvent::BodyNonAtomic);
        if self.behavior.fail_body {
            let err = DispatchError::from(anyhow::anyhow!("{}: stream refused", self.instance));
            for rcpt in &self.rcpts {
                collector.set_status(rcpt, Err(&err));
            }
        } else {
            for rcpt in &self.rcpts {
                collector.set_status(rcpt, Ok(()));
            }
        }
    }
}

/// A check returning fixed outcomes and recording which stages ran.
pub struct ScriptedCheck {
    name: &'static str,
    conn: CheckOutcome,
    rcpt: CheckOutcome,
    body: CheckOutcome,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedCheck {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            conn: CheckOutcome::accept(),
            rcpt: CheckOutcome::accept(),
            body: CheckOutcome::accept(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn on_conn(mut self, outcome: CheckOutcome) -> Self {
        self.conn = outcome;
        self
    }

    pub fn on_rcpt(mut self, outcome: CheckOutcome) -> Self {
        self.rcpt = outcome;
        self
    }

    pub fn on_body(mut self, outcome: CheckOutcome) -> Self {
        self.body = outcome;
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Stages this check ran, e.g. `conn:alice@a.example` or `body`.
    ///
    /// # Panics
    /// Panics if the call mutex is poisoned.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("call mutex poisoned").clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("call mutex poisoned").push(call);
    }
}

#[async_trait]
impl Check for ScriptedCheck {
    fn name(&self) -> &str {
        self.name
    }

    async fn check_conn_sender(&self, _meta: &MsgMeta, mail_from: &str) -> Result<CheckOutcome> {
        self.record(format!("conn:{mail_from}"));
        Ok(self.conn.clone())
    }

    async fn check_rcpt(&self, _meta: &MsgMeta, rcpt: &str) -> Result<CheckOutcome> {
        self.record(format!("rcpt:{rcpt}"));
        Ok(self.rcpt.clone())
    }

    async fn check_body(&self, _meta: &MsgMeta, _header: &Header, _body: &Body) -> Result<CheckOutcome> {
        self.record("body".to_string());
        Ok(self.body.clone())
    }
}

/// Shared open/close counters for [`TestModifier`] states.
#[derive(Debug, Clone, Default)]
pub struct ModifierStats {
    opens: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl ModifierStats {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// A modifier whose rewrites are configured per test. The default rewrites
/// nothing and only counts its state lifecycle.
pub struct TestModifier {
    name: &'static str,
    stats: ModifierStats,
    fail_open: bool,
    sender_to: Option<String>,
    rcpt_map: Vec<(String, String)>,
    stamp: Option<(String, String)>,
    saw_auth_header: Arc<Mutex<Option<bool>>>,
}

impl TestModifier {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            stats: ModifierStats::default(),
            fail_open: false,
            sender_to: None,
            rcpt_map: Vec::new(),
            stamp: None,
            saw_auth_header: Arc::new(Mutex::new(None)),
        }
    }

    pub fn fail_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Rewrite every sender to the given address.
    pub fn sender_to(mut self, addr: &str) -> Self {
        self.sender_to = Some(addr.to_string());
        self
    }

    /// Rewrite recipients matching `from` to `to`.
    pub fn rcpt(mut self, from: &str, to: &str) -> Self {
        self.rcpt_map.push((from.to_string(), to.to_string()));
        self
    }

    /// Append a header field during the body rewrite.
    pub fn stamp(mut self, name: &str, value: &str) -> Self {
        self.stamp = Some((name.to_string(), value.to_string()));
        self
    }

    pub fn stats(&self) -> ModifierStats {
        self.stats.clone()
    }

    /// Whether `Authentication-Results` was present when the body rewrite
    /// ran; `None` until it does.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned.
    pub fn saw_auth_header(&self) -> Option<bool> {
        *self.saw_auth_header.lock().expect("mutex poisoned")
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl Modifier for TestModifier {
    fn name(&self) -> &str {
        self.name
    }

    async fn open(&self, _meta: &Arc<MsgMeta>) -> Result<Box<dyn ModifierState>> {
        if self.fail_open {
            return Err(anyhow::anyhow!("{}: open refused", self.name).into());
        }
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TestModifierState {
            closes: self.stats.closes.clone(),
            sender_to: self.sender_to.clone(),
            rcpt_map: self.rcpt_map.clone(),
            stamp: self.stamp.clone(),
            saw_auth_header: self.saw_auth_header.clone(),
        }))
    }
}

struct TestModifierState {
    closes: Arc<AtomicUsize>,
    sender_to: Option<String>,
    rcpt_map: Vec<(String, String)>,
    stamp: Option<(String, String)>,
    saw_auth_header: Arc<Mutex<Option<bool>>>,
}

#[async_trait]
impl ModifierState for TestModifierState {
    async fn rewrite_sender(&mut self, mail_from: &str) -> Result<String> {
        Ok(self
            .sender_to
            .clone()
            .unwrap_or_else(|| mail_from.to_string()))
    }

    async fn rewrite_rcpt(&mut self, rcpt: &str) -> Result<String> {
        for (from, to) in &self.rcpt_map {
            if from == rcpt {
                return Ok(to.clone());
            }
        }
        Ok(rcpt.to_string())
    }

    async fn rewrite_body(&mut self, header: &mut Header, _body: &mut Body) -> Result<()> {
        *self.saw_auth_header.lock().expect("mutex poisoned") =
            Some(header.get("Authentication-Results").is_some());
        if let Some((name, value)) = &self.stamp {
            header.append(name.clone(), value.clone());
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Status sink recording `(recipient, error message)` pairs; `None` marks a
/// success status.
#[derive(Default)]
pub struct CollectingStatus {
    statuses: Mutex<Vec<(String, Option<String>)>>,
}

impl CollectingStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Panics
    /// Panics if the status mutex is poisoned.
    pub fn statuses(&self) -> Vec<(String, Option<String>)> {
        self.statuses.lock().expect("status mutex poisoned").clone()
    }

    pub fn rcpts(&self) -> Vec<String> {
        self.statuses().into_iter().map(|(rcpt, _)| rcpt).collect()
    }
}

impl StatusCollector for CollectingStatus {
    fn set_status(&mut self, rcpt: &str, status: std::result::Result<(), &DispatchError>) {
        self.statuses
            .lock()
            .expect("status mutex poisoned")
            .push((rcpt.to_string(), status.err().map(ToString::to_string)));
    }
}
