//! Typed handles to agents

use std::fmt;
use std::marker::PhantomData;

use futures::future::BoxFuture;
use tokio::sync::oneshot;

use super::activation::{call_fn, Mail};
use super::Runtime;
use crate::agent::{Agent, AgentContext, EventOf, Handles};
use crate::error::{Result, RuntimeError};
use crate::event::Event;
use crate::hierarchy::FanOutReport;
use crate::placement::ExecutionGroup;
use crate::types::{AgentId, SubscriptionId, Version};

/// Handle to one agent identity
///
/// Holding a handle does not keep the agent active. Every call resolves the
/// current activation (creating it if needed) and runs inside its execution
/// slot, so calls are serialized with the agent's handlers.
///
/// A call made from inside a handler waits for the callee's slot. Two agents
/// calling each other from their handlers wait on each other until the call
/// timeout; use [`AgentContext::send`] for those paths.
pub struct AgentRef<A: Agent> {
    runtime: Runtime,
    id: AgentId,
    _agent: PhantomData<fn() -> A>,
}

impl<A: Agent> Clone for AgentRef<A> {
    fn clone(&self) -> Self {
        Self {
            runtime: self.runtime.clone(),
            id: self.id.clone(),
            _agent: PhantomData,
        }
    }
}

impl<A: Agent> fmt::Debug for AgentRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AgentRef").field(&self.id).finish()
    }
}

impl<A: Agent> AgentRef<A> {
    pub(crate) fn new(runtime: Runtime, id: AgentId) -> Self {
        Self {
            runtime,
            id,
            _agent: PhantomData,
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    /// Make sure an activation exists and has finished `on_activate`
    pub async fn activate(&self) -> Result<()> {
        self.runtime.resolve(&self.id).await?;
        Ok(())
    }

    /// Run `f` inside the agent's execution slot and return its output
    ///
    /// Bounded by the configured call timeout. On timeout the call may still
    /// run later.
    pub async fn ask<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: for<'a> FnOnce(&'a mut A, &'a mut AgentContext<A>) -> BoxFuture<'a, R> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let call = call_fn::<A, _>(move |agent, ctx| {
            Box::pin(async move {
                let output = f(agent, ctx).await;
                // The caller may have timed out and gone away
                let _ = tx.send(output);
            })
        });
        self.runtime.enqueue::<A>(&self.id, Mail::Call(call)).await?;

        let after = self.runtime.settings().call_timeout();
        match tokio::time::timeout(after, rx).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(_)) => Err(RuntimeError::Abandoned(self.id.clone())),
            Err(_) => Err(RuntimeError::Timeout {
                agent: self.id.clone(),
                after,
            }),
        }
    }

    /// Snapshot of the committed state
    pub async fn state(&self) -> Result<A::State> {
        self.ask(|_, ctx| Box::pin(async move { ctx.state().clone() }))
            .await
    }

    pub async fn version(&self) -> Result<Version> {
        self.ask(|_, ctx| Box::pin(async move { ctx.version() })).await
    }

    /// Group hosting the current activation
    pub async fn group(&self) -> Result<ExecutionGroup> {
        self.ask(|_, ctx| Box::pin(async move { ctx.group().clone() }))
            .await
    }

    /// Queue a domain event; nothing is persisted until [`commit`](Self::commit)
    pub async fn raise(&self, event: EventOf<A>) -> Result<()> {
        self.ask(move |_, ctx| Box::pin(async move { ctx.raise(event) }))
            .await
    }

    /// Persist everything queued; `None` if nothing changed
    pub async fn commit(&self) -> Result<Option<Version>> {
        let committed = self
            .ask(|_, ctx| Box::pin(async move { ctx.commit().await }))
            .await?;
        Ok(committed?)
    }

    pub async fn raise_and_commit(&self, event: EventOf<A>) -> Result<Option<Version>> {
        let committed = self
            .ask(move |_, ctx| {
                Box::pin(async move {
                    ctx.raise(event);
                    ctx.commit().await
                })
            })
            .await?;
        Ok(committed?)
    }

    /// Deliver an event as an external sender
    pub async fn send<E: Event>(&self, event: &E) -> Result<()> {
        self.runtime.send(&self.id, event).await?;
        Ok(())
    }

    /// Subscribe the agent to `channel` for events of type `E`
    pub async fn subscribe<E: Event>(&self, channel: &str) -> Result<SubscriptionId>
    where
        A: Handles<E>,
    {
        let channel = channel.to_string();
        let subscribed = self
            .ask(move |_, ctx| Box::pin(async move { ctx.subscribe::<E>(&channel).await }))
            .await?;
        Ok(subscribed?)
    }

    pub async fn unsubscribe<E: Event>(&self, channel: &str) -> Result<bool> {
        let channel = channel.to_string();
        let left = self
            .ask(move |_, ctx| Box::pin(async move { ctx.unsubscribe::<E>(&channel).await }))
            .await?;
        Ok(left?)
    }

    pub async fn register_child(&self, child: &AgentId) -> Result<bool> {
        let child = child.clone();
        let added = self
            .ask(move |_, ctx| Box::pin(async move { ctx.register_child(&child).await }))
            .await?;
        Ok(added?)
    }

    pub async fn register_children(&self, children: Vec<AgentId>) -> Result<usize> {
        let added = self
            .ask(move |_, ctx| Box::pin(async move { ctx.register_children(&children).await }))
            .await?;
        Ok(added?)
    }

    pub async fn remove_child(&self, child: &AgentId) -> Result<bool> {
        let child = child.clone();
        let removed = self
            .ask(move |_, ctx| Box::pin(async move { ctx.remove_child(&child).await }))
            .await?;
        Ok(removed?)
    }

    /// Children in identity order
    pub async fn children(&self) -> Result<Vec<AgentId>> {
        self.ask(|_, ctx| Box::pin(async move { ctx.children().iter().cloned().collect() }))
            .await
    }

    pub async fn child_count(&self) -> Result<usize> {
        self.ask(|_, ctx| Box::pin(async move { ctx.child_count() }))
            .await
    }

    pub async fn parent(&self) -> Result<Option<AgentId>> {
        self.ask(|_, ctx| Box::pin(async move { ctx.parent().cloned() }))
            .await
    }

    /// Fan an event out to every current child on the agent's behalf
    pub async fn publish_to_children<E: Event>(&self, event: E) -> Result<FanOutReport> {
        let report = self
            .ask(move |_, ctx| Box::pin(async move { ctx.publish_to_children(&event).await }))
            .await?;
        Ok(report?)
    }
}
