//! Agent execution context
//!
//! The context is the agent's view of the runtime while it holds its
//! execution slot: the committed record, the pending event queue, and the
//! operations that reach other agents.

use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::dedup::SeenCorrelations;
use super::{Agent, EventOf, Handles};
use crate::broadcast::{self, PublishReport};
use crate::error::{CommitError, DeliveryError, HierarchyError};
use crate::event::{Envelope, Event, Route, Sender};
use crate::hierarchy::{self, FanOutReport, HierarchyNotice, HIERARCHY_NOTICE};
use crate::placement::ExecutionGroup;
use crate::runtime::Runtime;
use crate::state::{EventLog, LogEvent, StateChanged, SystemEvent};
use crate::types::{AgentId, CorrelationId, StreamId, SubscriptionId, Version};

/// Execution context of one activation
pub struct AgentContext<A: Agent> {
    id: AgentId,
    group: ExecutionGroup,
    runtime: Runtime,
    log: EventLog<A::State>,
    seen: SeenCorrelations,
    current: Option<CorrelationId>,
    emitted: AtomicU32,
    committed: Vec<StateChanged>,
    _agent: PhantomData<fn() -> A>,
}

impl<A: Agent> AgentContext<A> {
    pub(crate) fn new(
        id: AgentId,
        group: ExecutionGroup,
        runtime: Runtime,
        log: EventLog<A::State>,
    ) -> Self {
        let seen = SeenCorrelations::new(runtime.settings().dedup_capacity);
        Self {
            id,
            group,
            runtime,
            log,
            seen,
            current: None,
            emitted: AtomicU32::new(0),
            committed: Vec::new(),
            _agent: PhantomData,
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    /// Execution group this activation was placed on
    pub fn group(&self) -> &ExecutionGroup {
        &self.group
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Last committed domain state
    pub fn state(&self) -> &A::State {
        &self.log.record().state
    }

    /// Last committed version
    pub fn version(&self) -> Version {
        self.log.version()
    }

    /// Raised events waiting for the next commit
    pub fn pending(&self) -> usize {
        self.log.pending()
    }

    /// Correlation id of the envelope being handled, if any
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.current
    }

    // ---- event log ----

    /// Queue a domain event
    pub fn raise(&mut self, event: EventOf<A>) {
        self.log.raise(LogEvent::Domain(event));
    }

    /// Commit every queued event as one version step
    ///
    /// Returns the new version, or `None` if nothing was committed. On error
    /// the queue is kept and the commit can be retried.
    pub async fn commit(&mut self) -> Result<Option<Version>, CommitError> {
        let before = self.log.record().subscriptions.clone();
        let Some(changed) = self.log.commit().await? else {
            return Ok(None);
        };
        self.sync_subscriptions(&before);
        self.runtime.counters().record_commit();

        let version = changed.version;
        self.committed.push(changed);
        Ok(Some(version))
    }

    /// Mirror committed subscriptions into the shared registry
    fn sync_subscriptions(&self, before: &BTreeSet<StreamId>) {
        let registry = self.runtime.broadcast();
        let after = &self.log.record().subscriptions;
        for stream in after.difference(before) {
            registry.subscribe(stream.clone(), self.id.clone());
        }
        for stream in before.difference(after) {
            registry.unsubscribe(stream, &self.id);
        }
    }

    // ---- addressed channel ----

    /// Envelope for an event sent from this agent
    ///
    /// While handling an envelope, outgoing correlation ids are derived from
    /// the inbound one, this agent's identity and the emission order.
    pub fn envelope<E: Event>(&self, event: &E) -> Result<Envelope, DeliveryError> {
        let envelope = Envelope::wrap(event, Sender::Agent(self.id.clone()), Route::Direct)?;
        Ok(match self.current {
            Some(inbound) => {
                let ordinal = self.emitted.fetch_add(1, Ordering::Relaxed);
                envelope.with_correlation(inbound.derive(&self.id, ordinal))
            }
            None => envelope,
        })
    }

    /// Send an event to one agent
    pub async fn send<E: Event>(&self, to: &AgentId, event: &E) -> Result<(), DeliveryError> {
        let envelope = self.envelope(event)?;
        self.runtime.channel().send(envelope, to).await
    }

    // ---- broadcast ----

    /// Publish an event under a logical channel name
    pub async fn broadcast<E: Event>(
        &self,
        channel: &str,
        event: &E,
    ) -> Result<PublishReport, DeliveryError> {
        let stream = StreamId::new(channel, E::event_type());
        let envelope = self.envelope(event)?;
        Ok(broadcast::publish(self.runtime.broadcast(), &self.runtime.channel(), stream, envelope).await)
    }

    /// Join `channel` for events of type `E`
    ///
    /// The subscription is part of the persisted record, so this commits
    /// (together with anything else already queued).
    pub async fn subscribe<E: Event>(&mut self, channel: &str) -> Result<SubscriptionId, CommitError>
    where
        A: Handles<E>,
    {
        let stream = StreamId::new(channel, E::event_type());
        self.log
            .raise(LogEvent::System(SystemEvent::Subscribed(vec![stream.clone()])));
        self.commit().await?;
        Ok(self.runtime.broadcast().subscribe(stream, self.id.clone()))
    }

    /// Join several channels for events of type `E` with a single commit
    pub async fn subscribe_many<E: Event>(
        &mut self,
        channels: &[&str],
    ) -> Result<Vec<SubscriptionId>, CommitError>
    where
        A: Handles<E>,
    {
        let streams: Vec<StreamId> = channels
            .iter()
            .map(|channel| StreamId::new(*channel, E::event_type()))
            .collect();
        if streams.is_empty() {
            return Ok(Vec::new());
        }
        self.log
            .raise(LogEvent::System(SystemEvent::Subscribed(streams.clone())));
        self.commit().await?;

        let registry = self.runtime.broadcast();
        Ok(streams
            .into_iter()
            .map(|stream| registry.subscribe(stream, self.id.clone()))
            .collect())
    }

    /// Leave `channel` for events of type `E`
    ///
    /// Once this returns, no new publish reaches this agent. Envelopes that
    /// were already in the mailbox are dropped on arrival.
    pub async fn unsubscribe<E: Event>(&mut self, channel: &str) -> Result<bool, CommitError> {
        let stream = StreamId::new(channel, E::event_type());
        if !self.is_subscribed(&stream) {
            return Ok(false);
        }
        self.log
            .raise(LogEvent::System(SystemEvent::Unsubscribed(stream)));
        self.commit().await?;
        Ok(true)
    }

    pub fn subscriptions(&self) -> &BTreeSet<StreamId> {
        &self.log.record().subscriptions
    }

    pub fn is_subscribed(&self, stream: &StreamId) -> bool {
        self.log.record().subscriptions.contains(stream)
    }

    // ---- hierarchy ----

    pub fn children(&self) -> &BTreeSet<AgentId> {
        self.log.record().hierarchy.children()
    }

    /// Number of completed registrations
    pub fn child_count(&self) -> usize {
        self.children().len()
    }

    /// Parent that registered this agent, if any
    pub fn parent(&self) -> Option<&AgentId> {
        self.log.record().hierarchy.parent()
    }

    /// Register one child; returns false if it was already registered
    pub async fn register_child(&mut self, child: &AgentId) -> Result<bool, HierarchyError> {
        Ok(self.register_children(std::slice::from_ref(child)).await? == 1)
    }

    /// Register several children with one commit
    ///
    /// Returns how many were newly registered.
    pub async fn register_children(&mut self, children: &[AgentId]) -> Result<usize, HierarchyError> {
        if children.contains(&self.id) {
            return Err(HierarchyError::SelfRegistration(self.id.clone()));
        }
        for child in children {
            if !self.runtime.is_registered(child.agent_type()) {
                return Err(DeliveryError::UnknownAgentType(child.agent_type().to_string()).into());
            }
        }

        let mut unique = HashSet::new();
        let fresh: Vec<AgentId> = children
            .iter()
            .filter(|child| !self.children().contains(*child) && unique.insert(*child))
            .cloned()
            .collect();
        if fresh.is_empty() {
            return Ok(0);
        }

        self.log
            .raise(LogEvent::System(SystemEvent::ChildrenAdded(fresh.clone())));
        self.commit().await?;

        for child in &fresh {
            self.notify_child(
                child,
                HierarchyNotice::Adopted {
                    parent: self.id.clone(),
                },
            )
            .await;
        }
        info!(
            parent = %self.id,
            added = fresh.len(),
            children = self.child_count(),
            "Registered children"
        );
        Ok(fresh.len())
    }

    /// Stop fanning out to `child`; in-flight deliveries are not recalled
    pub async fn remove_child(&mut self, child: &AgentId) -> Result<bool, HierarchyError> {
        if !self.children().contains(child) {
            return Ok(false);
        }
        self.log
            .raise(LogEvent::System(SystemEvent::ChildRemoved(child.clone())));
        self.commit().await?;

        self.notify_child(
            child,
            HierarchyNotice::Released {
                parent: self.id.clone(),
            },
        )
        .await;
        info!(parent = %self.id, child = %child, children = self.child_count(), "Removed child");
        Ok(true)
    }

    /// Send an event to every child registered right now
    pub async fn publish_to_children<E: Event>(&self, event: &E) -> Result<FanOutReport, DeliveryError> {
        let children: Vec<AgentId> = self.children().iter().cloned().collect();
        let envelope = self.envelope(event)?;
        Ok(hierarchy::fan_out(&self.runtime.channel(), &self.id, children, envelope).await)
    }

    async fn notify_child(&self, child: &AgentId, notice: HierarchyNotice) {
        let envelope = match Envelope::wrap_raw(
            HIERARCHY_NOTICE,
            &notice,
            Sender::Agent(self.id.clone()),
            Route::Direct,
        ) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(parent = %self.id, child = %child, error = %e, "Failed to encode hierarchy notice");
                return;
            }
        };
        if let Err(e) = self.runtime.channel().send(envelope, child).await {
            warn!(parent = %self.id, child = %child, error = %e, "Child did not receive hierarchy notice");
        }
    }

    /// Record a parent link change sent by a parent
    pub(crate) async fn apply_hierarchy_notice(&mut self, envelope: Envelope) {
        let notice: HierarchyNotice = match serde_json::from_value(envelope.payload) {
            Ok(notice) => notice,
            Err(e) => {
                warn!(agent = %self.id, error = %e, "Malformed hierarchy notice");
                return;
            }
        };
        self.log.raise(LogEvent::System(notice.into_system_event()));
        if let Err(e) = self.commit().await {
            warn!(agent = %self.id, error = %e, "Failed to record parent link");
        }
    }

    // ---- background work ----

    /// Run `work` off the execution slot and deliver its output back here
    ///
    /// The output arrives as an ordinary envelope with a fresh correlation
    /// id, so completion flows through the agent's `Handles<E>` impl.
    pub fn spawn_detached<F, E>(&self, work: F) -> JoinHandle<()>
    where
        F: Future<Output = E> + Send + 'static,
        E: Event,
        A: Handles<E>,
    {
        let channel = self.runtime.channel();
        let id = self.id.clone();
        tokio::spawn(async move {
            let output = work.await;
            let envelope = match Envelope::wrap(&output, Sender::Agent(id.clone()), Route::Direct) {
                Ok(envelope) => envelope,
                Err(e) => {
                    error!(agent = %id, error = %e, "Failed to encode background result");
                    return;
                }
            };
            if let Err(e) = channel.send(envelope, &id).await {
                warn!(agent = %id, error = %e, "Background result could not be delivered");
            }
        })
    }

    // ---- activation plumbing ----

    pub(crate) fn already_processed(&mut self, envelope: &Envelope) -> bool {
        self.seen.contains(&envelope.dedup_key())
    }

    pub(crate) fn mark_processed(&mut self, envelope_key: (CorrelationId, String)) {
        self.seen.record(envelope_key);
    }

    pub(crate) fn set_current(&mut self, correlation_id: Option<CorrelationId>) {
        self.current = correlation_id;
        *self.emitted.get_mut() = 0;
    }

    /// Change notifications produced since the last call
    pub(crate) fn take_committed(&mut self) -> Vec<StateChanged> {
        std::mem::take(&mut self.committed)
    }

    /// Re-enter the registry for every persisted subscription
    pub(crate) fn resume_subscriptions(&self) {
        self.sync_subscriptions(&BTreeSet::new());
    }
}
