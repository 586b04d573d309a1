//! Agent trait and handler dispatch
//!
//! An agent is a type with an [`AgentState`], a type name, and a set of
//! per-event-type handlers. The runtime runs each activation on its own task
//! and feeds it one mailbox item at a time, so a handler always has exclusive
//! access to the agent and its [`AgentContext`].

pub mod context;
pub mod dedup;

use std::collections::HashMap;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::HandlerError;
use crate::event::{Envelope, Event, EventEnvelope};
use crate::placement::Placement;
use crate::state::{AgentState, StateChanged};
use crate::types::AgentId;

pub use context::AgentContext;
pub use dedup::SeenCorrelations;

/// Domain events of an agent's state
pub type EventOf<A> = <<A as Agent>::State as AgentState>::Event;

/// A stateful, addressable unit of computation
///
/// # Example
///
/// ```ignore
/// struct Greeter;
///
/// #[async_trait]
/// impl Agent for Greeter {
///     const AGENT_TYPE: &'static str = "greeter";
///     type State = Greetings;
///
///     fn create(_id: &AgentId) -> Self {
///         Greeter
///     }
///
///     fn handlers(handlers: &mut Handlers<Self>) {
///         handlers.on::<Hello>();
///     }
/// }
///
/// #[async_trait]
/// impl Handles<Hello> for Greeter {
///     async fn handle(
///         &mut self,
///         ctx: &mut AgentContext<Self>,
///         envelope: EventEnvelope<Hello>,
///     ) -> Result<(), HandlerError> {
///         ctx.raise(GreetingEvent::Greeted(envelope.event.name));
///         ctx.commit().await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Agent: Sized + Send + 'static {
    /// Type name; the first half of every identity of this type
    const AGENT_TYPE: &'static str;

    type State: AgentState;

    /// Build the in-memory agent for a new activation
    ///
    /// Persisted state is restored separately and is available through the
    /// context by the time `on_activate` runs.
    fn create(id: &AgentId) -> Self;

    /// Where activations of this type may run
    fn placement() -> Placement {
        Placement::Unconstrained
    }

    /// Exempt activations from idle eviction
    fn keep_alive() -> bool {
        false
    }

    /// Register the event types this agent handles
    fn handlers(handlers: &mut Handlers<Self>) {
        let _ = handlers;
    }

    /// Called once the record has been restored, before any mailbox item
    async fn on_activate(&mut self, _ctx: &mut AgentContext<Self>) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Called before the activation is evicted
    async fn on_deactivate(&mut self, _ctx: &mut AgentContext<Self>) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Called once for every successful commit, after the turn that made it
    fn on_state_changed(&mut self, ctx: &AgentContext<Self>, changed: &StateChanged) {
        let _ = (ctx, changed);
    }
}

/// Handler for one event type
#[async_trait]
pub trait Handles<E: Event>: Agent {
    async fn handle(
        &mut self,
        ctx: &mut AgentContext<Self>,
        envelope: EventEnvelope<E>,
    ) -> Result<(), HandlerError>;
}

/// Type-erased entry in a handler table
pub type HandlerFn<A> = for<'a> fn(
    &'a mut A,
    &'a mut AgentContext<A>,
    Envelope,
) -> BoxFuture<'a, Result<(), HandlerError>>;

fn dispatch<'a, A, E>(
    agent: &'a mut A,
    ctx: &'a mut AgentContext<A>,
    envelope: Envelope,
) -> BoxFuture<'a, Result<(), HandlerError>>
where
    A: Handles<E>,
    E: Event,
{
    Box::pin(async move {
        let envelope = envelope.decode::<E>()?;
        agent.handle(ctx, envelope).await
    })
}

/// Handlers of one agent type, keyed by event type name
pub struct Handlers<A: Agent> {
    table: HashMap<&'static str, HandlerFn<A>>,
}

impl<A: Agent> Handlers<A> {
    pub(crate) fn collect() -> Self {
        let mut handlers = Self {
            table: HashMap::new(),
        };
        A::handlers(&mut handlers);
        handlers
    }

    /// Route envelopes carrying `E` to `A`'s `Handles<E>` impl
    pub fn on<E: Event>(&mut self) -> &mut Self
    where
        A: Handles<E>,
    {
        self.table.insert(E::event_type(), dispatch::<A, E> as HandlerFn<A>);
        self
    }

    pub fn get(&self, event_type: &str) -> Option<HandlerFn<A>> {
        self.table.get(event_type).copied()
    }

    pub fn handles(&self, event_type: &str) -> bool {
        self.table.contains_key(event_type)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
