//! Troupe - event-sourced agent runtime
//!
//! Agents are addressable, stateful units identified by `(type, key)`. Each
//! agent's state is rebuilt from durable records and changed only by raising
//! events and committing them. Agents reach each other through an addressed
//! channel, a broadcast registry, and parent/child fan-out.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Runtime                            │
//! │  (Coordinator - agent types, directory, placement, feed)    │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌───────────────────┐        ┌──────────────────────────┐  │
//! │  │ AddressedChannel  │◄───────┤    BroadcastRegistry     │  │
//! │  │ (endpoint → mail) │        │ (stream → subscribers)   │  │
//! │  └─────────┬─────────┘        └──────────────────────────┘  │
//! │            │   Envelopes (correlation id, sender, route)    │
//! │            ▼                                                │
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │                    Activations                       │   │
//! │  │  ┌──────────────────┐  ┌──────────────────┐          │   │
//! │  │  │ user/alice       │  │ scheduler/main   │  ...     │   │
//! │  │  │  ┌────────────┐  │  │  ┌────────────┐  │          │   │
//! │  │  │  │ EventLog   │  │  │  │ EventLog   │  │          │   │
//! │  │  │  │ raise →    │  │  │  │ raise →    │  │          │   │
//! │  │  │  │   commit   │  │  │  │   commit   │  │          │   │
//! │  │  │  └─────┬──────┘  │  │  └─────┬──────┘  │          │   │
//! │  │  └────────┼─────────┘  └────────┼─────────┘          │   │
//! │  └───────────┼─────────────────────┼────────────────────┘   │
//! │              ▼                     ▼                        │
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │           StateStorage (memory / file)               │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Core Concepts
//!
//! ## Agents and activations
//!
//! An **agent** implements [`Agent`] plus one [`Handles<E>`] impl per event
//! type it reacts to. The runtime creates an **activation** the first time an
//! identity is addressed and evicts it after an idle period. At most one
//! activation per identity exists at a time, and it processes one envelope
//! at a time.
//!
//! ## Event sourcing
//!
//! Handlers never mutate state directly. They [`raise`](AgentContext::raise)
//! domain events and [`commit`](AgentContext::commit) them. A commit that
//! changes the state bumps the [`Version`] by exactly one and emits exactly
//! one [`StateChanged`] notification.
//!
//! ## Delivery
//!
//! - **Addressed**: [`AgentContext::send`] to one identity
//! - **Broadcast**: [`AgentContext::broadcast`] to everyone subscribed to a
//!   `(channel, event type)` stream
//! - **Hierarchy**: [`AgentContext::publish_to_children`] to every registered
//!   child
//!
//! Redelivered envelopes are recognised by correlation id and discarded.
//!
//! ## Placement
//!
//! An agent type may restrict its activations to execution groups whose name
//! starts with a role pattern, see [`Placement`].
//!
//! # Example
//!
//! ```ignore
//! use troupe::Runtime;
//!
//! let runtime = Runtime::builder()
//!     .execution_groups(["Scheduler-1", "User-1", "User-2"])
//!     .register::<Scheduler>()
//!     .register::<User>()
//!     .build()?;
//!
//! // Subscribe, then publish from another agent
//! runtime.agent::<User>("alice").subscribe::<Tick>("clock").await?;
//! runtime.publish("clock", &Tick { at: 1 }).await?;
//! ```

// Modules
pub mod agent;
pub mod broadcast;
pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod hierarchy;
pub mod placement;
pub mod runtime;
pub mod state;
pub mod types;

// Re-exports for convenience
pub use agent::{Agent, AgentContext, EventOf, Handlers, Handles};
pub use broadcast::{BroadcastRegistry, PublishReport};
pub use channel::AddressedChannel;
pub use config::{ConfigError, RuntimeSettings, StorageSettings};
pub use error::{
    CommitError, DeliveryError, HandlerError, HandlerResult, HierarchyError, PlacementError,
    RuntimeError, StorageError,
};
pub use event::{Envelope, Event, EventEnvelope, Route, Sender};
pub use hierarchy::{FanOutReport, HierarchyState};
pub use placement::{ExecutionGroup, GroupSelector, Placement, PlacementDirector};
pub use runtime::{AgentRef, Runtime, RuntimeBuilder, RuntimeStats};
pub use state::{
    AgentRecord, AgentState, EventLog, FileStorage, LogEvent, MemoryStorage, StateChanged,
    StateStorage, StoredState, SystemEvent, VersionTracker,
};
pub use types::{AgentId, CorrelationId, Endpoint, StreamId, SubscriptionId, Version};
