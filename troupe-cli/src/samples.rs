//! Sample agents bundled with the host binary
//!
//! Two topologies:
//! - broadcast: one scheduler publishes beats that every listener counts
//! - hierarchy: layers relay pulses down a parent/child tree

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use troupe::{
    Agent, AgentContext, AgentId, AgentState, Event, EventEnvelope, HandlerResult, Handlers,
    Handles, Placement, RuntimeBuilder,
};

/// Channel the scheduler publishes on
pub const SCHEDULE_CHANNEL: &str = "BroadcastScheduleAgent";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Counter {
    pub count: u64,
    pub last_seq: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum CounterEvent {
    Counted { seq: u64, amount: u64 },
}

impl AgentState for Counter {
    type Event = CounterEvent;

    fn reduce(&self, event: &CounterEvent) -> Option<Self> {
        match event {
            CounterEvent::Counted { seq, amount } => Some(Counter {
                count: self.count + amount,
                last_seq: Some(*seq),
            }),
        }
    }
}

/// Asks the scheduler to publish beat `seq`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub seq: u64,
}

impl Event for Schedule {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Beat {
    pub seq: u64,
}

impl Event for Beat {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pulse {
    pub seq: u64,
    pub value: u64,
}

impl Event for Pulse {}

pub struct Scheduler;

#[async_trait]
impl Agent for Scheduler {
    const AGENT_TYPE: &'static str = "scheduler";
    type State = Counter;

    fn create(_id: &AgentId) -> Self {
        Scheduler
    }

    fn placement() -> Placement {
        Placement::role("Scheduler")
    }

    fn handlers(handlers: &mut Handlers<Self>) {
        handlers.on::<Schedule>();
    }
}

#[async_trait]
impl Handles<Schedule> for Scheduler {
    async fn handle(
        &mut self,
        ctx: &mut AgentContext<Self>,
        envelope: EventEnvelope<Schedule>,
    ) -> HandlerResult {
        let seq = envelope.event.seq;
        let report = ctx.broadcast(SCHEDULE_CHANNEL, &Beat { seq }).await?;
        ctx.raise(CounterEvent::Counted {
            seq,
            amount: report.delivered_count() as u64,
        });
        ctx.commit().await?;
        Ok(())
    }
}

/// Counts beats; kept alive so warm-up can restore its subscription
pub struct Listener;

#[async_trait]
impl Agent for Listener {
    const AGENT_TYPE: &'static str = "user";
    type State = Counter;

    fn create(_id: &AgentId) -> Self {
        Listener
    }

    fn placement() -> Placement {
        Placement::role("User")
    }

    fn keep_alive() -> bool {
        true
    }

    fn handlers(handlers: &mut Handlers<Self>) {
        handlers.on::<Beat>();
    }
}

#[async_trait]
impl Handles<Beat> for Listener {
    async fn handle(&mut self, ctx: &mut AgentContext<Self>, envelope: EventEnvelope<Beat>) -> HandlerResult {
        ctx.raise(CounterEvent::Counted {
            seq: envelope.event.seq,
            amount: 1,
        });
        ctx.commit().await?;
        Ok(())
    }
}

/// One node of the layered sample
pub struct Layer;

#[async_trait]
impl Agent for Layer {
    const AGENT_TYPE: &'static str = "layer";
    type State = Counter;

    fn create(_id: &AgentId) -> Self {
        Layer
    }

    fn handlers(handlers: &mut Handlers<Self>) {
        handlers.on::<Pulse>();
    }
}

#[async_trait]
impl Handles<Pulse> for Layer {
    async fn handle(&mut self, ctx: &mut AgentContext<Self>, envelope: EventEnvelope<Pulse>) -> HandlerResult {
        let pulse = envelope.into_event();
        ctx.raise(CounterEvent::Counted {
            seq: pulse.seq,
            amount: pulse.value,
        });
        ctx.commit().await?;
        if ctx.child_count() > 0 {
            ctx.publish_to_children(&pulse).await?;
        }
        Ok(())
    }
}

/// Register every sample agent type
pub fn register(builder: RuntimeBuilder) -> RuntimeBuilder {
    builder
        .register::<Scheduler>()
        .register::<Listener>()
        .register::<Layer>()
}
