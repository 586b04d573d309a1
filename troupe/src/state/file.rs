//! File-backed storage
//!
//! Layout: `<root>/<agent type>/<storage key>.json`, one JSON document per
//! agent identity. Writes go to a temporary file in the same directory and
//! are renamed into place, so a reader sees either the old or the new record.
//! File I/O runs on tokio's blocking pool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::storage::{check_version, StateStorage, StoredState};
use crate::error::StorageError;
use crate::types::{AgentId, Version};

/// Storage that keeps one JSON file per agent
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
    // Serializes the read-check-write sequence of concurrent saves
    write_lock: Arc<Mutex<()>>,
}

impl FileStorage {
    /// Use `root` as the storage directory, creating it if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn type_dir(&self, agent_type: &str) -> Result<PathBuf, StorageError> {
        if !AgentId::is_valid_type_name(agent_type) {
            return Err(StorageError::InvalidAgentType(agent_type.to_string()));
        }
        Ok(self.root.join(agent_type))
    }

    fn path_for(&self, agent: &AgentId) -> Result<PathBuf, StorageError> {
        Ok(self
            .type_dir(agent.agent_type())?
            .join(format!("{}.json", agent.storage_key())))
    }

    /// Run blocking file work off the async workers
    async fn blocking<T, F>(work: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, StorageError> + Send + 'static,
    {
        tokio::task::spawn_blocking(work)
            .await
            .map_err(|e| StorageError::Unavailable(format!("file task failed: {e}")))?
    }

    fn read(path: &Path) -> Result<Option<StoredState>, StorageError> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list_dir(dir: &Path) -> Result<Vec<AgentId>, StorageError> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut agents = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path) {
                Ok(Some(stored)) => agents.push(stored.agent),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
            }
        }
        agents.sort();
        Ok(agents)
    }

    fn write_atomic(dir: &Path, path: &Path, state: &StoredState) -> Result<(), StorageError> {
        std::fs::create_dir_all(dir)?;
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut file, state)?;
        file.flush()?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|e| StorageError::Io(e.error))?;
        Ok(())
    }
}

#[async_trait]
impl StateStorage for FileStorage {
    async fn load(&self, agent: &AgentId) -> Result<Option<StoredState>, StorageError> {
        let path = self.path_for(agent)?;
        Self::blocking(move || Self::read(&path)).await
    }

    async fn save(
        &self,
        agent: &AgentId,
        state: StoredState,
        expected: Version,
    ) -> Result<(), StorageError> {
        let path = self.path_for(agent)?;
        let dir = self.type_dir(agent.agent_type())?;
        let lock = self.write_lock.clone();
        let owner = agent.clone();
        let version = state.version;

        let written = path.clone();
        Self::blocking(move || {
            let _guard = lock.lock();
            let current = Self::read(&written)?;
            check_version(&owner, current.as_ref(), expected)?;
            Self::write_atomic(&dir, &written, &state)
        })
        .await?;

        debug!(agent = %agent, version = %version, path = %path.display(), "Saved record");
        Ok(())
    }

    async fn list(&self, agent_type: &str) -> Result<Vec<AgentId>, StorageError> {
        let dir = self.type_dir(agent_type)?;
        Self::blocking(move || Self::list_dir(&dir)).await
    }
}
