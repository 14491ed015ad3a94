use super::CheckpointStore;
use crate::types::{Checkpoint, Direction};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Default, Serialize, Deserialize)]
struct UserCheckpoints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    budget_to_expense: Option<Checkpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expense_to_budget: Option<Checkpoint>,
}

impl UserCheckpoints {
    fn slot(&mut self, direction: Direction) -> &mut Option<Checkpoint> {
        match direction {
            Direction::BudgetToExpense => &mut self.budget_to_expense,
            Direction::ExpenseToBudget => &mut self.expense_to_budget,
        }
    }
}

/// One JSON document per user under a state directory.
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create state directory {}", dir.display()))?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, user_id: &str) -> PathBuf {
        let safe: String = user_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    fn load(&self, user_id: &str) -> Result<UserCheckpoints> {
        let path = self.path_for(user_id);
        if !path.exists() {
            return Ok(UserCheckpoints::default());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read checkpoint file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Corrupt checkpoint file {}", path.display()))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn get(&self, user_id: &str, direction: Direction) -> Result<Option<Checkpoint>> {
        Ok(*self.load(user_id)?.slot(direction))
    }

    fn set(&self, user_id: &str, direction: Direction, checkpoint: Checkpoint) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("checkpoint file lock poisoned"))?;
        let mut doc = self.load(user_id)?;
        *doc.slot(direction) = Some(checkpoint);

        let path = self.path_for(user_id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(&doc)?;
        fs::write(&tmp, body)
            .with_context(|| format!("Failed to write checkpoint file {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace checkpoint file {}", path.display()))?;
        Ok(())
    }
}
