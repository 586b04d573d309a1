//! Durable storage of agent records
//!
//! One [`StoredState`] per agent identity, keyed deterministically by
//! [`AgentId::storage_key`]. Saves carry the version the writer last saw so
//! a stale writer fails instead of overwriting.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::StorageError;
use crate::types::{AgentId, Version};

/// A persisted (record, version) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredState {
    pub agent: AgentId,
    pub version: Version,
    /// Identifies the commit attempt that wrote this record
    pub commit_id: Uuid,
    pub record: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl StoredState {
    pub fn new<T: Serialize>(
        agent: AgentId,
        version: Version,
        commit_id: Uuid,
        record: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            agent,
            version,
            commit_id,
            record: serde_json::to_value(record)?,
            updated_at: Utc::now(),
        })
    }
}

/// Storage backend for agent records
#[async_trait]
pub trait StateStorage: Send + Sync + 'static {
    /// Load the record for an agent, if one was ever saved
    async fn load(&self, agent: &AgentId) -> Result<Option<StoredState>, StorageError>;

    /// Save a record, provided the stored version still equals `expected`
    ///
    /// An agent with no record is at [`Version::genesis`]. The write is
    /// all-or-nothing.
    async fn save(
        &self,
        agent: &AgentId,
        state: StoredState,
        expected: Version,
    ) -> Result<(), StorageError>;

    /// All agents of a type that have a stored record
    async fn list(&self, agent_type: &str) -> Result<Vec<AgentId>, StorageError>;
}

/// Check the optimistic concurrency precondition of a save
pub(crate) fn check_version(
    agent: &AgentId,
    current: Option<&StoredState>,
    expected: Version,
) -> Result<(), StorageError> {
    let found = current.map(|s| s.version).unwrap_or_default();
    if found != expected {
        return Err(StorageError::VersionConflict {
            agent: agent.clone(),
            expected,
            found,
        });
    }
    Ok(())
}

/// In-memory storage
///
/// Records live as long as the storage value. Useful for tests and for
/// runtimes that do not need to survive a restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    records: RwLock<HashMap<Uuid, StoredState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl StateStorage for MemoryStorage {
    async fn load(&self, agent: &AgentId) -> Result<Option<StoredState>, StorageError> {
        Ok(self.records.read().get(&agent.storage_key()).cloned())
    }

    async fn save(
        &self,
        agent: &AgentId,
        state: StoredState,
        expected: Version,
    ) -> Result<(), StorageError> {
        let key = agent.storage_key();
        let mut records = self.records.write();
        check_version(agent, records.get(&key), expected)?;
        debug!(agent = %agent, version = %state.version, "Saved record");
        records.insert(key, state);
        Ok(())
    }

    async fn list(&self, agent_type: &str) -> Result<Vec<AgentId>, StorageError> {
        let mut agents: Vec<AgentId> = self
            .records
            .read()
            .values()
            .filter(|s| s.agent.agent_type() == agent_type)
            .map(|s| s.agent.clone())
            .collect();
        agents.sort();
        Ok(agents)
    }
}
