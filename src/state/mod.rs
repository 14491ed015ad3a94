//! Per-user, per-direction sync checkpoints.
//!
//! Backends share one trait and are picked per user through [`StateBackend`]. Callers
//! hold the user's run lease around every get/set pair.

mod file;

pub use file::FileCheckpointStore;

use crate::profile::StateBackend;
use crate::types::{Checkpoint, Direction};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub trait CheckpointStore: Send + Sync {
    fn get(&self, user_id: &str, direction: Direction) -> Result<Option<Checkpoint>>;

    fn set(&self, user_id: &str, direction: Direction, checkpoint: Checkpoint) -> Result<()>;
}

/// Process-local checkpoints; lost on restart.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<(String, Direction), Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get(&self, user_id: &str, direction: Direction) -> Result<Option<Checkpoint>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("checkpoint map lock poisoned"))?;
        Ok(entries.get(&(user_id.to_string(), direction)).copied())
    }

    fn set(&self, user_id: &str, direction: Direction, checkpoint: Checkpoint) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("checkpoint map lock poisoned"))?;
        entries.insert((user_id.to_string(), direction), checkpoint);
        Ok(())
    }
}

/// The available backends, one instance each.
#[derive(Clone)]
pub struct CheckpointStores {
    memory: Arc<dyn CheckpointStore>,
    file: Arc<dyn CheckpointStore>,
    duckdb: Arc<dyn CheckpointStore>,
}

impl CheckpointStores {
    pub fn new(
        memory: Arc<dyn CheckpointStore>,
        file: Arc<dyn CheckpointStore>,
        duckdb: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            memory,
            file,
            duckdb,
        }
    }

    /// Every backend served by the same store, for tests and single-backend setups.
    pub fn single(store: Arc<dyn CheckpointStore>) -> Self {
        Self::new(store.clone(), store.clone(), store)
    }

    pub fn select(&self, backend: StateBackend) -> Arc<dyn CheckpointStore> {
        match backend {
            StateBackend::Memory => self.memory.clone(),
            StateBackend::File => self.file.clone(),
            StateBackend::Duckdb => self.duckdb.clone(),
        }
    }
}
