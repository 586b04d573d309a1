//! Error types for the troupe runtime
//!
//! Transient infrastructure failures (storage, delivery) are returned to the
//! immediate caller. Logical conditions such as an unrecognized event or a
//! duplicate envelope are absorbed where they occur and never show up here.

use std::time::Duration;

use thiserror::Error;

use crate::types::{AgentId, Endpoint, Version};

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Delivery to an agent failed
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Commit failed; retryable
    #[error("Commit error: {0}")]
    Commit(#[from] CommitError),

    /// Parent/child bookkeeping failed
    #[error("Hierarchy error: {0}")]
    Hierarchy(#[from] HierarchyError),

    /// Placement constraint cannot be satisfied
    #[error("Placement error: {0}")]
    Placement(#[from] PlacementError),

    /// Storage backend error outside of a commit
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The call did not complete in time; it may or may not have taken effect
    #[error("Call to {agent} timed out after {after:?}")]
    Timeout { agent: AgentId, after: Duration },

    /// The activation dropped the call without replying
    #[error("Call to {0} was abandoned by the activation")]
    Abandoned(AgentId),

    /// An agent type was registered twice
    #[error("Agent type {0} is already registered")]
    DuplicateAgentType(&'static str),

    /// An agent type name is empty or contains `/`
    #[error("Invalid agent type name {0:?}")]
    InvalidAgentType(&'static str),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Persistence errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// The stored version is not the one the writer expected
    #[error("Version conflict for {agent}: expected {expected}, found {found}")]
    VersionConflict {
        agent: AgentId,
        expected: Version,
        found: Version,
    },

    /// The backend could not be reached
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// The agent type name cannot be stored
    #[error("Invalid agent type name {0:?}")]
    InvalidAgentType(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Commit failures
///
/// Nothing becomes visible when a commit fails; the pending queue is kept so
/// the caller can retry.
#[derive(Debug, Error)]
pub enum CommitError {
    #[error("Failed to persist state: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Addressed and broadcast delivery failures
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// No agent type with this name is registered
    #[error("Unknown agent type {0}")]
    UnknownAgentType(String),

    /// The endpoint does not name an agent
    #[error("Endpoint {0} does not address an agent")]
    InvalidEndpoint(Endpoint),

    /// The recipient could not be activated
    #[error("Activation of {agent} failed: {reason}")]
    Activation { agent: AgentId, reason: String },

    /// The recipient kept closing its mailbox while we delivered
    #[error("Mailbox of {0} is closed")]
    Closed(AgentId),

    /// The activation behind an identity is not of the expected agent type
    #[error("Activation of {agent} is not a {expected}")]
    TypeMismatch {
        agent: AgentId,
        expected: &'static str,
    },

    #[error("Placement error: {0}")]
    Placement(#[from] PlacementError),

    #[error("Failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Parent/child registration failures
#[derive(Debug, Error)]
pub enum HierarchyError {
    /// An agent cannot be its own child
    #[error("Agent {0} cannot register itself as a child")]
    SelfRegistration(AgentId),

    #[error("Commit error: {0}")]
    Commit(#[from] CommitError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Placement violations
///
/// These are configuration errors: the activation fails and nothing falls
/// back to another group.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlacementError {
    /// The declared role pattern is empty
    #[error("Agent type {agent_type} declares a blank role pattern")]
    BlankPattern { agent_type: String },

    /// No execution group satisfies the declared pattern
    #[error("No execution group matches role {pattern:?} required by {agent_type}")]
    NoMatchingGroup { agent_type: String, pattern: String },
}

/// Errors returned from event handlers and lifecycle hooks
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The envelope payload does not decode as the handler's event type
    #[error("Failed to decode {event_type}: {source}")]
    Decode {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Commit error: {0}")]
    Commit(#[from] CommitError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Hierarchy error: {0}")]
    Hierarchy(#[from] HierarchyError),

    /// Handler-specific failure
    #[error("Handler failed: {0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(msg: impl std::fmt::Display) -> Self {
        Self::Failed(msg.to_string())
    }
}

/// Result type using RuntimeError
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Result type using HandlerError
pub type HandlerResult<T = ()> = std::result::Result<T, HandlerError>;
