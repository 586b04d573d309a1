//! Event log and commit protocol
//!
//! `raise` queues an event for the current activation. `commit` folds the
//! whole queue in FIFO order, persists the result with the next version, and
//! publishes exactly one [`StateChanged`]. A commit whose queue is empty (or
//! holds only unrecognized events) persists nothing and notifies no one.
//!
//! A save may report failure after the write actually landed. Every commit
//! attempt therefore carries a fresh commit id; when a save fails, the stored
//! record is read back and adopted if it carries the id of one of our
//! unacknowledged attempts. Re-running a commit can never apply the same
//! queued events twice.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::storage::{StateStorage, StoredState};
use super::{AgentRecord, AgentState, LogEvent};
use crate::error::{CommitError, StorageError};
use crate::types::{AgentId, Version};

/// Notification published once per successful commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChanged {
    pub agent: AgentId,
    pub version: Version,
    /// Number of queued events folded by this commit
    pub events: usize,
}

/// A commit attempt whose outcome is not yet known
#[derive(Debug, Clone, Copy)]
struct Attempt {
    commit_id: Uuid,
    events: usize,
}

/// Pending events and committed record of one activation
pub struct EventLog<S: AgentState> {
    agent: AgentId,
    record: AgentRecord<S>,
    version: Version,
    pending: Vec<LogEvent<S::Event>>,
    unacked: Vec<Attempt>,
    storage: Arc<dyn StateStorage>,
    changes: broadcast::Sender<StateChanged>,
}

impl<S: AgentState> EventLog<S> {
    /// Restore the last committed record of `agent`
    pub async fn restore(
        agent: AgentId,
        storage: Arc<dyn StateStorage>,
        changes: broadcast::Sender<StateChanged>,
    ) -> Result<Self, StorageError> {
        let (record, version) = match storage.load(&agent).await? {
            Some(stored) => (serde_json::from_value(stored.record)?, stored.version),
            None => (AgentRecord::default(), Version::genesis()),
        };
        debug!(agent = %agent, version = %version, "Restored record");

        Ok(Self {
            agent,
            record,
            version,
            pending: Vec::new(),
            unacked: Vec::new(),
            storage,
            changes,
        })
    }

    pub fn agent(&self) -> &AgentId {
        &self.agent
    }

    /// Last committed record
    pub fn record(&self) -> &AgentRecord<S> {
        &self.record
    }

    /// Last committed version
    pub fn version(&self) -> Version {
        self.version
    }

    /// Number of raised but uncommitted events
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Queue an event; state is untouched until the next commit
    pub fn raise(&mut self, event: LogEvent<S::Event>) {
        self.pending.push(event);
    }

    /// Fold, persist and announce everything raised so far
    pub async fn commit(&mut self) -> Result<Option<StateChanged>, CommitError> {
        if self.pending.is_empty() {
            return Ok(None);
        }

        let mut next = self.record.clone();
        let mut applied = 0;
        for event in &self.pending {
            if let Some(folded) = next.apply(event) {
                next = folded;
                applied += 1;
            }
        }

        if applied == 0 {
            debug!(agent = %self.agent, discarded = self.pending.len(), "No recognized events to commit");
            self.pending.clear();
            return Ok(None);
        }

        let version = self.version.next();
        let attempt = Attempt {
            commit_id: Uuid::new_v4(),
            events: self.pending.len(),
        };
        let stored = StoredState::new(self.agent.clone(), version, attempt.commit_id, &next)?;
        self.unacked.push(attempt);

        if let Err(err) = self.storage.save(&self.agent, stored, self.version).await {
            return match self.reconcile().await {
                Some(changed) => Ok(Some(changed)),
                None => {
                    warn!(agent = %self.agent, version = %version, error = %err, "Commit failed");
                    Err(err.into())
                }
            };
        }

        Ok(Some(self.land(next, version, attempt.events)))
    }

    /// Adopt a stored record written by one of our unacknowledged attempts
    async fn reconcile(&mut self) -> Option<StateChanged> {
        let stored = match self.storage.load(&self.agent).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return None,
            Err(e) => {
                debug!(agent = %self.agent, error = %e, "Read-back after failed save also failed");
                return None;
            }
        };
        if stored.version != self.version.next() {
            return None;
        }
        let attempt = *self
            .unacked
            .iter()
            .find(|a| a.commit_id == stored.commit_id)?;
        let record = match serde_json::from_value(stored.record) {
            Ok(record) => record,
            Err(e) => {
                warn!(agent = %self.agent, error = %e, "Stored record does not decode");
                return None;
            }
        };

        info!(
            agent = %self.agent,
            version = %stored.version,
            commit_id = %attempt.commit_id,
            "Save reported failure but the write landed; adopting it"
        );
        Some(self.land(record, stored.version, attempt.events))
    }

    fn land(&mut self, record: AgentRecord<S>, version: Version, events: usize) -> StateChanged {
        self.record = record;
        self.version = version;
        self.pending.drain(..events.min(self.pending.len()));
        self.unacked.clear();

        let changed = StateChanged {
            agent: self.agent.clone(),
            version,
            events,
        };
        // No receivers is fine
        let _ = self.changes.send(changed.clone());
        debug!(agent = %self.agent, version = %version, events, "Committed");
        changed
    }
}

/// Consumer-side dedup of change notifications
///
/// Accepts a notification only if its version is newer than the last one
/// seen for the same agent.
#[derive(Debug, Default)]
pub struct VersionTracker {
    last: HashMap<AgentId, Version>,
}

impl VersionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `changed` has not been processed before
    pub fn observe(&mut self, changed: &StateChanged) -> bool {
        match self.last.get(&changed.agent) {
            Some(last) if *last >= changed.version => false,
            _ => {
                self.last.insert(changed.agent.clone(), changed.version);
                true
            }
        }
    }

    /// Last processed version of an agent
    pub fn last_seen(&self, agent: &AgentId) -> Option<Version> {
        self.last.get(agent).copied()
    }
}
