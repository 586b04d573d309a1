//! Runtime coordinator for agents
//!
//! The runtime manages:
//! - Agent types (registration, placement constraints)
//! - Activations (on-demand creation, idle eviction, the directory)
//! - Delivery (the addressed channel and the broadcast registry)
//! - Durable records (the storage backend and the change feed)

mod activation;
mod agent_ref;
mod directory;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast as feed;
use tracing::{debug, error, info, trace, warn};

use crate::agent::Agent;
use crate::broadcast::{self, BroadcastRegistry, PublishReport};
use crate::channel::AddressedChannel;
use crate::config::RuntimeSettings;
use crate::error::{DeliveryError, PlacementError, Result, RuntimeError};
use crate::event::{Envelope, Event, Route, Sender};
use crate::placement::{ExecutionGroup, GroupSelector, Placement, PlacementDirector};
use crate::state::{StateChanged, StateStorage};
use crate::types::{AgentId, Endpoint, StreamId};

use activation::{LaunchFn, Mail, MailboxSender};
use directory::{ActivationHandle, Claim, Directory};

pub use agent_ref::AgentRef;

/// Attempts made when an activation closes while we hand it mail
pub(crate) const DELIVERY_ATTEMPTS: usize = 3;

/// A registered agent type with its erased constructor
struct AgentType {
    name: &'static str,
    placement: Placement,
    keep_alive: bool,
    launch: LaunchFn,
}

/// The agent runtime
///
/// Cheap to clone; every clone drives the same activations.
///
/// # Example
///
/// ```ignore
/// use troupe::Runtime;
///
/// let runtime = Runtime::builder()
///     .execution_groups(["Scheduler-1", "User-1"])
///     .register::<Scheduler>()
///     .register::<User>()
///     .build()?;
///
/// let user = runtime.agent::<User>("alice");
/// user.raise(UserEvent::Joined).await?;
/// user.commit().await?;
/// ```
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    settings: RuntimeSettings,
    storage: Arc<dyn StateStorage>,
    director: PlacementDirector,
    selector: GroupSelector,
    types: HashMap<&'static str, AgentType>,
    directory: Directory,
    broadcast: BroadcastRegistry,
    changes: feed::Sender<StateChanged>,
    counters: Counters,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Typed handle to the agent of type `A` with the given key
    ///
    /// Nothing is activated until the handle is used.
    pub fn agent<A: Agent>(&self, key: impl Into<String>) -> AgentRef<A> {
        AgentRef::new(self.clone(), AgentId::new(A::AGENT_TYPE, key))
    }

    /// The point-to-point transport
    pub fn channel(&self) -> AddressedChannel {
        AddressedChannel::new(self.clone())
    }

    pub fn broadcast(&self) -> &BroadcastRegistry {
        &self.inner.broadcast
    }

    /// Send an event to one agent from outside the runtime
    pub async fn send<E: Event>(&self, to: &AgentId, event: &E) -> std::result::Result<(), DeliveryError> {
        let envelope = Envelope::wrap(event, Sender::External, Route::Direct)?;
        self.channel().send(envelope, to).await
    }

    /// Publish an event under a channel name from outside the runtime
    pub async fn publish<E: Event>(
        &self,
        channel: &str,
        event: &E,
    ) -> std::result::Result<PublishReport, DeliveryError> {
        let stream = StreamId::new(channel, E::event_type());
        let envelope = Envelope::wrap(event, Sender::External, Route::Direct)?;
        Ok(broadcast::publish(&self.inner.broadcast, &self.channel(), stream, envelope).await)
    }

    /// Subscribe to every state-change notification
    pub fn watch(&self) -> feed::Receiver<StateChanged> {
        self.inner.changes.subscribe()
    }

    /// Activate every stored agent of type `A`
    ///
    /// Returns how many activations are live afterwards. Restores broadcast
    /// subscriptions after a restart, since activation re-enters them.
    pub async fn warm_up<A: Agent>(&self) -> Result<usize> {
        let stored = self.inner.storage.list(A::AGENT_TYPE).await?;
        let mut activated = 0;
        for id in &stored {
            match self.resolve(id).await {
                Ok(_) => activated += 1,
                Err(e) => warn!(agent = %id, error = %e, "Warm-up activation failed"),
            }
        }
        info!(agent_type = A::AGENT_TYPE, stored = stored.len(), activated, "Warmed up");
        Ok(activated)
    }

    /// Check that every registered type can be placed on some group
    pub fn validate_placement(&self) -> std::result::Result<(), PlacementError> {
        for name in self.agent_types() {
            let agent_type = &self.inner.types[name];
            self.inner.director.validate(name, &agent_type.placement)?;
        }
        Ok(())
    }

    /// Placement constraint of a registered type
    pub fn placement_of(&self, agent_type: &str) -> Option<&Placement> {
        self.inner.types.get(agent_type).map(|t| &t.placement)
    }

    /// Registered type names in sorted order
    pub fn agent_types(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.inner.types.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn is_registered(&self, agent_type: &str) -> bool {
        self.inner.types.contains_key(agent_type)
    }

    pub fn execution_groups(&self) -> &[ExecutionGroup] {
        self.inner.director.groups()
    }

    /// Identities with a live activation
    pub fn active_agents(&self) -> Vec<AgentId> {
        self.inner.directory.ids()
    }

    /// Group hosting the live activation of `agent`, if any
    pub fn placement_for(&self, agent: &AgentId) -> Option<ExecutionGroup> {
        self.inner
            .directory
            .lookup(&Endpoint::of(agent))
            .map(|handle| handle.group().clone())
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.inner.settings
    }

    pub fn storage(&self) -> Arc<dyn StateStorage> {
        self.inner.storage.clone()
    }

    /// Drop every activation handle
    ///
    /// Each activation runs `on_deactivate` once its mailbox drains. Agents
    /// addressed afterwards are activated again.
    pub fn shutdown(&self) {
        info!(active = self.inner.directory.len(), "Shutting down activations");
        self.inner.directory.clear();
    }

    /// Get runtime statistics
    pub fn stats(&self) -> RuntimeStats {
        let c = &self.inner.counters;
        RuntimeStats {
            agent_types: self.inner.types.len(),
            active_agents: self.inner.directory.len(),
            activations: c.activations.load(Ordering::Relaxed),
            deactivations: c.deactivations.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            unhandled: c.unhandled.load(Ordering::Relaxed),
            handler_failures: c.handler_failures.load(Ordering::Relaxed),
            commits: c.commits.load(Ordering::Relaxed),
            streams: self.inner.broadcast.stream_count(),
            subscriptions: self.inner.broadcast.subscription_count(),
        }
    }

    // ---- crate internals ----

    pub(crate) fn counters(&self) -> &Counters {
        &self.inner.counters
    }

    pub(crate) fn change_feed(&self) -> feed::Sender<StateChanged> {
        self.inner.changes.clone()
    }

    fn directory(&self) -> &Directory {
        &self.inner.directory
    }

    /// The ready activation serving `id`, creating it if needed
    ///
    /// An activation that is deactivating keeps its entry until it has
    /// released it or handed its leftover mail to a successor, so callers
    /// wait for that instead of racing the forwarded mail.
    pub(crate) async fn resolve(&self, id: &AgentId) -> std::result::Result<ActivationHandle, DeliveryError> {
        let agent_type = self
            .inner
            .types
            .get(id.agent_type())
            .ok_or_else(|| DeliveryError::UnknownAgentType(id.agent_type().to_string()))?;
        let endpoint = Endpoint::of(id);

        loop {
            let handle = match self.inner.directory.lookup(&endpoint) {
                Some(handle) => handle,
                None => self.activate(id, endpoint.clone(), agent_type)?,
            };
            handle.ready().await?;
            if handle.is_open() {
                return Ok(handle);
            }
            trace!(agent = %id, "Activation is deactivating, waiting for its successor");
            handle.stopped().await;
        }
    }

    /// Launch an activation for `id` and claim its endpoint
    fn activate(
        &self,
        id: &AgentId,
        endpoint: Endpoint,
        agent_type: &AgentType,
    ) -> std::result::Result<ActivationHandle, DeliveryError> {
        let group = self
            .inner
            .selector
            .place(&self.inner.director, agent_type.name, &agent_type.placement)
            .map_err(|e| {
                error!(agent = %id, error = %e, "Placement failed");
                e
            })?;

        let generation = self.inner.directory.next_generation();
        let (handle, start) = (agent_type.launch)(self, id.clone(), group, generation);
        Ok(match self.inner.directory.claim(endpoint, handle) {
            Claim::Won(handle) => {
                debug!(agent = %handle.id(), group = %handle.group(), generation, "Claimed activation");
                // The task only goes away before this if the runtime is torn down
                let _ = start.send(());
                handle
            }
            Claim::Lost(existing) => existing,
        })
    }

    /// Hand typed mail to the activation serving `id`
    pub(crate) async fn enqueue<A: Agent>(
        &self,
        id: &AgentId,
        mail: Mail<A>,
    ) -> std::result::Result<(), DeliveryError> {
        let mut mail = mail;
        for _ in 0..DELIVERY_ATTEMPTS {
            let handle = self.resolve(id).await?;
            let mailbox = handle
                .mailbox()
                .as_any()
                .downcast_ref::<MailboxSender<A>>()
                .ok_or_else(|| DeliveryError::TypeMismatch {
                    agent: id.clone(),
                    expected: A::AGENT_TYPE,
                })?;
            match mailbox.send(mail) {
                Ok(()) => return Ok(()),
                Err(returned) => mail = returned,
            }
        }
        Err(DeliveryError::Closed(id.clone()))
    }
}

/// Builder for [`Runtime`]
pub struct RuntimeBuilder {
    settings: RuntimeSettings,
    storage: Option<Arc<dyn StateStorage>>,
    groups: Option<Vec<ExecutionGroup>>,
    types: HashMap<&'static str, AgentType>,
    duplicate: Option<&'static str>,
    invalid: Option<&'static str>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::from_settings(RuntimeSettings::default())
    }

    /// Start from loaded settings
    pub fn from_settings(settings: RuntimeSettings) -> Self {
        Self {
            settings,
            storage: None,
            groups: None,
            types: HashMap::new(),
            duplicate: None,
            invalid: None,
        }
    }

    /// Use this storage instead of the one named in the settings
    pub fn storage(mut self, storage: Arc<dyn StateStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn execution_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = Some(groups.into_iter().map(|g| ExecutionGroup::new(g)).collect());
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.settings.call_timeout_ms = timeout.as_millis().max(1) as u64;
        self
    }

    /// `None` disables idle eviction
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.settings.idle_timeout_ms = timeout.map_or(0, |t| t.as_millis().max(1) as u64);
        self
    }

    pub fn dedup_capacity(mut self, capacity: usize) -> Self {
        self.settings.dedup_capacity = capacity;
        self
    }

    /// Make agents of type `A` addressable
    ///
    /// The type name must pass [`AgentId::is_valid_type_name`], otherwise
    /// [`build`](Self::build) fails.
    pub fn register<A: Agent>(mut self) -> Self {
        if !AgentId::is_valid_type_name(A::AGENT_TYPE) {
            self.invalid.get_or_insert(A::AGENT_TYPE);
            return self;
        }
        let agent_type = AgentType {
            name: A::AGENT_TYPE,
            placement: A::placement(),
            keep_alive: A::keep_alive(),
            launch: activation::launch::<A>,
        };
        if self.types.insert(A::AGENT_TYPE, agent_type).is_some() {
            self.duplicate.get_or_insert(A::AGENT_TYPE);
        }
        self
    }

    pub fn build(self) -> Result<Runtime> {
        if let Some(name) = self.invalid {
            return Err(RuntimeError::InvalidAgentType(name));
        }
        if let Some(name) = self.duplicate {
            return Err(RuntimeError::DuplicateAgentType(name));
        }

        let storage = match self.storage {
            Some(storage) => storage,
            None => self
                .settings
                .open_storage()
                .map_err(|e| RuntimeError::Config(e.to_string()))?,
        };
        let groups = self.groups.unwrap_or_else(|| self.settings.groups());
        let director = PlacementDirector::new(groups);

        for agent_type in self.types.values() {
            if let Err(e) = director.validate(agent_type.name, &agent_type.placement) {
                warn!(agent_type = agent_type.name, error = %e, "Agent type cannot be placed");
            }
        }

        let (changes, _) = feed::channel(self.settings.change_feed_capacity.max(1));
        let keep_alive = self.types.values().filter(|t| t.keep_alive).count();
        info!(
            agent_types = self.types.len(),
            keep_alive,
            groups = director.groups().len(),
            "Runtime built"
        );

        Ok(Runtime {
            inner: Arc::new(RuntimeInner {
                settings: self.settings,
                storage,
                director,
                selector: GroupSelector::new(),
                types: self.types,
                directory: Directory::default(),
                broadcast: BroadcastRegistry::new(),
                changes,
                counters: Counters::default(),
            }),
        })
    }
}

/// Monotonic runtime counters
#[derive(Debug, Default)]
pub(crate) struct Counters {
    activations: AtomicU64,
    deactivations: AtomicU64,
    delivered: AtomicU64,
    duplicates: AtomicU64,
    dropped: AtomicU64,
    unhandled: AtomicU64,
    handler_failures: AtomicU64,
    commits: AtomicU64,
}

impl Counters {
    pub(crate) fn record_activation(&self) {
        self.activations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deactivation(&self) {
        self.deactivations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivery(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unhandled(&self) {
        self.unhandled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }
}

/// Statistics about the runtime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeStats {
    /// Number of registered agent types
    pub agent_types: usize,
    /// Number of live activations
    pub active_agents: usize,
    pub activations: u64,
    pub deactivations: u64,
    /// Envelopes accepted into a mailbox
    pub delivered: u64,
    /// Redeliveries discarded by correlation id
    pub duplicates: u64,
    /// Broadcasts that arrived after their stream was left
    pub dropped: u64,
    /// Envelopes with no handler for their event type
    pub unhandled: u64,
    pub handler_failures: u64,
    pub commits: u64,
    /// Broadcast streams with at least one subscriber
    pub streams: usize,
    pub subscriptions: usize,
}
