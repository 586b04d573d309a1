//! Agents shared by the integration tests

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use troupe::{
    Agent, AgentContext, AgentId, AgentState, CorrelationId, Event, EventEnvelope, HandlerError,
    HandlerResult, Handlers, Handles, MemoryStorage, Placement, Route, Runtime, RuntimeBuilder,
    StateChanged, Version,
};

// ---- state ----

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tally {
    pub total: u64,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TallyEvent {
    Add(u64),
    Note(String),
    /// Not folded by `Tally`
    Unknown,
}

impl AgentState for Tally {
    type Event = TallyEvent;

    fn reduce(&self, event: &TallyEvent) -> Option<Self> {
        match event {
            TallyEvent::Add(amount) => Some(Tally {
                total: self.total + amount,
                notes: self.notes.clone(),
            }),
            TallyEvent::Note(note) => {
                let mut next = self.clone();
                next.notes.push(note.clone());
                Some(next)
            }
            TallyEvent::Unknown => None,
        }
    }
}

// ---- events ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub amount: u64,
}

impl Event for Tick {}

/// Ask a scheduler to publish a tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub channel: String,
    pub amount: u64,
}

impl Event for Trigger {}

/// Fails the first time a user handles it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flaky;

impl Event for Flaky {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping;

impl Event for Ping {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartWork {
    pub millis: u64,
}

impl Event for StartWork {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkDone {
    pub millis: u64,
}

impl Event for WorkDone {}

/// Holds the worker's execution slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stall {
    pub millis: u64,
}

impl Event for Stall {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cascade {
    pub amount: u64,
}

impl Event for Cascade {}

/// Children answer a poll with a vote to their parent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Poll;

impl Event for Poll {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote;

impl Event for Vote {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Numbered {
    pub n: u64,
}

impl Event for Numbered {}

// ---- agents ----

/// Publishes ticks on request; runs on scheduler groups only
pub struct Scheduler;

#[async_trait]
impl Agent for Scheduler {
    const AGENT_TYPE: &'static str = "scheduler";
    type State = Tally;

    fn create(_id: &AgentId) -> Self {
        Scheduler
    }

    fn placement() -> Placement {
        Placement::role("Scheduler")
    }

    fn handlers(handlers: &mut Handlers<Self>) {
        handlers.on::<Trigger>();
    }
}

#[async_trait]
impl Handles<Trigger> for Scheduler {
    async fn handle(
        &mut self,
        ctx: &mut AgentContext<Self>,
        envelope: EventEnvelope<Trigger>,
    ) -> HandlerResult {
        let trigger = envelope.into_event();
        ctx.broadcast(&trigger.channel, &Tick {
            amount: trigger.amount,
        })
        .await?;
        Ok(())
    }
}

/// Accumulates ticks; runs on user groups only
#[derive(Default)]
pub struct User {
    pub failed_once: bool,
    pub changes: Vec<Version>,
    pub last_correlation: Option<CorrelationId>,
}

#[async_trait]
impl Agent for User {
    const AGENT_TYPE: &'static str = "user";
    type State = Tally;

    fn create(_id: &AgentId) -> Self {
        User::default()
    }

    fn placement() -> Placement {
        Placement::role("User")
    }

    fn handlers(handlers: &mut Handlers<Self>) {
        handlers.on::<Tick>().on::<Flaky>();
    }

    fn on_state_changed(&mut self, _ctx: &AgentContext<Self>, changed: &StateChanged) {
        self.changes.push(changed.version);
    }
}

#[async_trait]
impl Handles<Tick> for User {
    async fn handle(&mut self, ctx: &mut AgentContext<Self>, envelope: EventEnvelope<Tick>) -> HandlerResult {
        self.last_correlation = Some(envelope.correlation_id);
        ctx.raise(TallyEvent::Add(envelope.event.amount));
        ctx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl Handles<Flaky> for User {
    async fn handle(&mut self, ctx: &mut AgentContext<Self>, _envelope: EventEnvelope<Flaky>) -> HandlerResult {
        if !self.failed_once {
            self.failed_once = true;
            return Err(HandlerError::failed("first attempt"));
        }
        ctx.raise(TallyEvent::Note("flaky".into()));
        ctx.commit().await?;
        Ok(())
    }
}

/// Offloads slow work and keeps serving its mailbox meanwhile
#[derive(Default)]
pub struct Worker {
    pub started_with: Option<CorrelationId>,
    pub finished_with: Option<CorrelationId>,
}

#[async_trait]
impl Agent for Worker {
    const AGENT_TYPE: &'static str = "worker";
    type State = Tally;

    fn create(_id: &AgentId) -> Self {
        Worker::default()
    }

    fn handlers(handlers: &mut Handlers<Self>) {
        handlers
            .on::<StartWork>()
            .on::<WorkDone>()
            .on::<Ping>()
            .on::<Stall>();
    }
}

#[async_trait]
impl Handles<StartWork> for Worker {
    async fn handle(
        &mut self,
        ctx: &mut AgentContext<Self>,
        envelope: EventEnvelope<StartWork>,
    ) -> HandlerResult {
        self.started_with = Some(envelope.correlation_id);
        let millis = envelope.event.millis;
        ctx.spawn_detached(async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            WorkDone { millis }
        });
        ctx.raise(TallyEvent::Note("started".into()));
        ctx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl Handles<WorkDone> for Worker {
    async fn handle(
        &mut self,
        ctx: &mut AgentContext<Self>,
        envelope: EventEnvelope<WorkDone>,
    ) -> HandlerResult {
        self.finished_with = Some(envelope.correlation_id);
        ctx.raise(TallyEvent::Note("done".into()));
        ctx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl Handles<Ping> for Worker {
    async fn handle(&mut self, ctx: &mut AgentContext<Self>, _envelope: EventEnvelope<Ping>) -> HandlerResult {
        ctx.raise(TallyEvent::Note("ping".into()));
        ctx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl Handles<Stall> for Worker {
    async fn handle(&mut self, _ctx: &mut AgentContext<Self>, envelope: EventEnvelope<Stall>) -> HandlerResult {
        tokio::time::sleep(Duration::from_millis(envelope.event.millis)).await;
        Ok(())
    }
}

/// Relays cascades to its children
pub struct Parent;

#[async_trait]
impl Agent for Parent {
    const AGENT_TYPE: &'static str = "parent";
    type State = Tally;

    fn create(_id: &AgentId) -> Self {
        Parent
    }

    fn handlers(handlers: &mut Handlers<Self>) {
        handlers.on::<Cascade>().on::<Vote>();
    }
}

#[async_trait]
impl Handles<Vote> for Parent {
    async fn handle(&mut self, ctx: &mut AgentContext<Self>, envelope: EventEnvelope<Vote>) -> HandlerResult {
        if let Some(voter) = envelope.sender.agent() {
            ctx.raise(TallyEvent::Note(format!("vote from {voter}")));
        }
        ctx.raise(TallyEvent::Add(1));
        ctx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl Handles<Cascade> for Parent {
    async fn handle(
        &mut self,
        ctx: &mut AgentContext<Self>,
        envelope: EventEnvelope<Cascade>,
    ) -> HandlerResult {
        let report = ctx.publish_to_children(&envelope.event).await?;
        ctx.raise(TallyEvent::Add(report.delivered_count() as u64));
        ctx.commit().await?;
        Ok(())
    }
}

/// Counts cascades and notes which parent sent them
pub struct Child;

#[async_trait]
impl Agent for Child {
    const AGENT_TYPE: &'static str = "child";
    type State = Tally;

    fn create(_id: &AgentId) -> Self {
        Child
    }

    fn handlers(handlers: &mut Handlers<Self>) {
        handlers.on::<Cascade>().on::<Poll>();
    }
}

#[async_trait]
impl Handles<Poll> for Child {
    async fn handle(&mut self, ctx: &mut AgentContext<Self>, _envelope: EventEnvelope<Poll>) -> HandlerResult {
        if let Some(parent) = ctx.parent().cloned() {
            ctx.send(&parent, &Vote).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Handles<Cascade> for Child {
    async fn handle(
        &mut self,
        ctx: &mut AgentContext<Self>,
        envelope: EventEnvelope<Cascade>,
    ) -> HandlerResult {
        if let Route::Hierarchy { parent } = &envelope.route {
            ctx.raise(TallyEvent::Note(format!("from {parent}")));
        }
        ctx.raise(TallyEvent::Add(envelope.event.amount));
        ctx.commit().await?;
        Ok(())
    }
}

/// Exempt from idle eviction
pub struct Sentinel;

#[async_trait]
impl Agent for Sentinel {
    const AGENT_TYPE: &'static str = "sentinel";
    type State = Tally;

    fn create(_id: &AgentId) -> Self {
        Sentinel
    }

    fn keep_alive() -> bool {
        true
    }
}

/// Times `Lingerer` has entered `on_deactivate`
pub static LINGERING: AtomicUsize = AtomicUsize::new(0);

/// Notes numbered events in arrival order and is slow to deactivate
pub struct Lingerer;

#[async_trait]
impl Agent for Lingerer {
    const AGENT_TYPE: &'static str = "lingerer";
    type State = Tally;

    fn create(_id: &AgentId) -> Self {
        Lingerer
    }

    fn handlers(handlers: &mut Handlers<Self>) {
        handlers.on::<Numbered>();
    }

    async fn on_deactivate(&mut self, _ctx: &mut AgentContext<Self>) -> Result<(), HandlerError> {
        LINGERING.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(())
    }
}

#[async_trait]
impl Handles<Numbered> for Lingerer {
    async fn handle(
        &mut self,
        ctx: &mut AgentContext<Self>,
        envelope: EventEnvelope<Numbered>,
    ) -> HandlerResult {
        ctx.raise(TallyEvent::Note(envelope.event.n.to_string()));
        ctx.commit().await?;
        Ok(())
    }
}

/// Requires a group no test configures
pub struct Misplaced;

#[async_trait]
impl Agent for Misplaced {
    const AGENT_TYPE: &'static str = "misplaced";
    type State = Tally;

    fn create(_id: &AgentId) -> Self {
        Misplaced
    }

    fn placement() -> Placement {
        Placement::role("Gpu")
    }
}

/// Declares an empty role pattern
pub struct Blank;

#[async_trait]
impl Agent for Blank {
    const AGENT_TYPE: &'static str = "blank";
    type State = Tally;

    fn create(_id: &AgentId) -> Self {
        Blank
    }

    fn placement() -> Placement {
        Placement::role("")
    }
}

// ---- helpers ----

pub const GROUPS: [&str; 3] = ["Scheduler-1", "User-1", "User-2"];

/// Builder with the standard groups, in-memory storage and no idle eviction
pub fn builder() -> RuntimeBuilder {
    Runtime::builder()
        .execution_groups(GROUPS)
        .storage(Arc::new(MemoryStorage::new()))
        .idle_timeout(None)
        .register::<Scheduler>()
        .register::<User>()
        .register::<Worker>()
        .register::<Parent>()
        .register::<Child>()
        .register::<Sentinel>()
        .register::<Lingerer>()
}

pub fn runtime() -> Runtime {
    builder().build().unwrap()
}

/// Poll `check` until it holds, failing after two seconds
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
