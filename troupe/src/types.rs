//! Core type definitions for the troupe runtime
//!
//! These are the identity, versioning and addressing types shared by
//! every other module.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Namespace for deterministic storage keys (UUID v5 over `type/key`).
const STORAGE_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a8e_4b7d_4e0a_9c3f_5d2b_8a71_e604);

/// Agent identity
///
/// An agent is identified by its type name and a key. The pair is stable
/// and globally unique: re-activating the same identity always finds the
/// same persisted record. Type names must be non-empty and free of `/`
/// (see [`AgentId::is_valid_type_name`]); the runtime refuses to register
/// any other, so an identity with such a type never resolves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId {
    agent_type: String,
    key: String,
}

impl AgentId {
    /// Create an identity from a type name and key
    pub fn new(agent_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            key: key.into(),
        }
    }

    /// Whether `name` can be used as an agent type
    ///
    /// The `type/key` form splits at the first `/`, and storage uses the type
    /// name as a directory name.
    pub fn is_valid_type_name(name: &str) -> bool {
        !name.is_empty() && !name.contains('/') && name != "." && name != ".."
    }

    /// The agent type name
    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    /// The key within the agent type
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Deterministic storage key derived from (type, key)
    pub fn storage_key(&self) -> Uuid {
        Uuid::new_v5(&STORAGE_NAMESPACE, self.to_string().as_bytes())
    }

    /// Parse the `type/key` form produced by `Display`
    pub fn parse(s: &str) -> Option<Self> {
        let (agent_type, key) = s.split_once('/')?;
        if !Self::is_valid_type_name(agent_type) {
            return None;
        }
        Some(Self::new(agent_type, key))
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.agent_type, self.key)
    }
}

/// Committed-state version of one agent
///
/// Starts at zero (nothing committed) and advances by exactly one per
/// successful commit. Never rolled back.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Version(pub u64);

impl Version {
    /// The version of an agent that has never committed
    pub fn genesis() -> Self {
        Self(0)
    }

    /// The version following this one
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Raw counter value
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Correlation identifier carried by every envelope
///
/// Unique per logical send and preserved across redelivery, so receivers
/// can recognize a second arrival of the same occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    /// Create a fresh correlation id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Id of the `ordinal`-th envelope `emitter` sends while handling this one
    ///
    /// Deterministic, so a handler that runs again emits the same ids. Every
    /// recipient of a fan-out sees the same inbound id, so the emitter is
    /// part of the derivation.
    pub fn derive(&self, emitter: &AgentId, ordinal: u32) -> Self {
        Self(Uuid::new_v5(&self.0, format!("{emitter}#{ordinal}").as_bytes()))
    }

    /// Get the underlying UUID
    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c:{}", &self.0.to_string()[..8])
    }
}

/// Subscription identifier
///
/// Returned when joining a broadcast stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

static SUBSCRIPTION_COUNTER: AtomicU64 = AtomicU64::new(1);

impl SubscriptionId {
    /// Create a new unique subscription ID
    pub fn new() -> Self {
        Self(SUBSCRIPTION_COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub:{}", self.0)
    }
}

/// Transport endpoint an agent listens on
///
/// Always derived from the recipient's identity with [`Endpoint::of`];
/// there is no way to build one from an arbitrary alias.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint(String);

impl Endpoint {
    const PREFIX: &'static str = "agent/";

    /// The endpoint of the given agent
    pub fn of(agent: &AgentId) -> Self {
        Self(format!("{}{}", Self::PREFIX, agent))
    }

    /// Recover the identity this endpoint was derived from
    pub fn agent_id(&self) -> Option<AgentId> {
        self.0
            .strip_prefix(Self::PREFIX)
            .and_then(AgentId::parse)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Broadcast stream identity: `<channel>.<EventType>`
///
/// A channel name is a logical publisher name, independent of any agent's
/// address. Each event type published under it is a separate stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId {
    channel: String,
    event_type: String,
}

impl StreamId {
    pub fn new(channel: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            event_type: event_type.into(),
        }
    }

    /// The logical channel name
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// The event type carried on this stream
    pub fn event_type(&self) -> &str {
        &self.event_type
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.channel, self.event_type)
    }
}
