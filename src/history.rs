//! Sync run history.

use crate::types::{Direction, Milliunits};
use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Success,
    Partial,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::InProgress => "in_progress",
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::InProgress)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(RunStatus::InProgress),
            "success" => Ok(RunStatus::Success),
            "partial" => Ok(RunStatus::Partial),
            "error" => Ok(RunStatus::Error),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Manual,
    Scheduled,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Manual => "manual",
            RunTrigger::Scheduled => "scheduled",
        }
    }
}

impl FromStr for RunTrigger {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "manual" => Ok(RunTrigger::Manual),
            "scheduled" => Ok(RunTrigger::Scheduled),
            other => Err(format!("unknown trigger '{other}'")),
        }
    }
}

/// Kind of source record a synced item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Transaction,
    Expense,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Transaction => "transaction",
            ItemType::Expense => "expense",
        }
    }
}

impl FromStr for ItemType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "transaction" => Ok(ItemType::Transaction),
            "expense" => Ok(ItemType::Expense),
            other => Err(format!("unknown item type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Error => "error",
        }
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(Outcome::Success),
            "error" => Ok(Outcome::Error),
            other => Err(format!("unknown outcome '{other}'")),
        }
    }
}

/// One source record's outcome within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncedItem {
    pub item_type: ItemType,
    /// Id of the source record.
    pub external_id: String,
    /// Amount as written to the destination, in milliunits.
    pub amount: Milliunits,
    pub description: String,
    pub date: NaiveDate,
    pub direction: Direction,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_id: Option<String>,
}

impl SyncedItem {
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: String,
    pub user_id: String,
    pub trigger: RunTrigger,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub error: Option<String>,
    pub items: Vec<SyncedItem>,
}

impl SyncRun {
    /// A fresh in-progress run with a time-ordered id.
    pub fn start(user_id: impl Into<String>, trigger: RunTrigger) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            user_id: user_id.into(),
            trigger,
            started_at: Utc::now(),
            completed_at: None,
            status: RunStatus::InProgress,
            error: None,
            items: Vec::new(),
        }
    }

    pub fn items_for(&self, direction: Direction) -> impl Iterator<Item = &SyncedItem> {
        self.items.iter().filter(move |item| item.direction == direction)
    }
}

/// Durable record of runs and their items.
pub trait RunRecorder: Send + Sync {
    fn create_run(&self, run: &SyncRun) -> Result<()>;

    fn append_item(&self, run_id: &str, item: &SyncedItem) -> Result<()>;

    /// Move a run to a terminal status. Fails if the run is unknown or already finished.
    fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        completed_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<()>;

    fn get_run(&self, run_id: &str) -> Result<Option<SyncRun>>;

    /// Newest runs first.
    fn list_runs(&self, user_id: &str, limit: usize) -> Result<Vec<SyncRun>>;
}

#[derive(Debug, Default)]
pub struct MemoryRunRecorder {
    runs: Mutex<HashMap<String, SyncRun>>,
}

impl MemoryRunRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<String, SyncRun>> {
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RunRecorder for MemoryRunRecorder {
    fn create_run(&self, run: &SyncRun) -> Result<()> {
        let mut runs = self.runs();
        if runs.contains_key(&run.id) {
            bail!("run {} already exists", run.id);
        }
        runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    fn append_item(&self, run_id: &str, item: &SyncedItem) -> Result<()> {
        match self.runs().get_mut(run_id) {
            Some(run) if run.status.is_terminal() => {
                bail!("run {run_id} is already {}", run.status)
            }
            Some(run) => {
                run.items.push(item.clone());
                Ok(())
            }
            None => bail!("run {run_id} not found"),
        }
    }

    fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        completed_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<()> {
        if !status.is_terminal() {
            bail!("cannot finish run {run_id} as {status}");
        }
        match self.runs().get_mut(run_id) {
            Some(run) if run.status.is_terminal() => {
                bail!("run {run_id} is already {}", run.status)
            }
            Some(run) => {
                run.status = status;
                run.completed_at = Some(completed_at);
                run.error = error.map(str::to_string);
                Ok(())
            }
            None => bail!("run {run_id} not found"),
        }
    }

    fn get_run(&self, run_id: &str) -> Result<Option<SyncRun>> {
        Ok(self.runs().get(run_id).cloned())
    }

    fn list_runs(&self, user_id: &str, limit: usize) -> Result<Vec<SyncRun>> {
        let mut runs: Vec<SyncRun> = self
            .runs()
            .values()
            .filter(|run| run.user_id == user_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        runs.truncate(limit);
        Ok(runs)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn item(direction: Direction, outcome: Outcome) -> SyncedItem {
        SyncedItem {
            item_type: ItemType::Transaction,
            external_id: "t1".into(),
            amount: -150_000,
            description: "Grocer".into(),
            date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            direction,
            outcome,
            error: None,
            error_kind: None,
            created_id: Some("e1".into()),
        }
    }

    /// Shared contract checks run against every recorder implementation.
    pub(crate) fn exercise_recorder(recorder: &dyn RunRecorder) {
        let run = SyncRun::start("alice", RunTrigger::Manual);
        recorder.create_run(&run).unwrap();
        recorder
            .append_item(&run.id, &item(Direction::BudgetToExpense, Outcome::Success))
            .unwrap();
        let mut failed = item(Direction::ExpenseToBudget, Outcome::Error);
        failed.error = Some("Splitwise unavailable: down".into());
        failed.error_kind = Some("upstream_unavailable".into());
        failed.created_id = None;
        recorder.append_item(&run.id, &failed).unwrap();

        let completed = Utc::now();
        recorder
            .finish_run(&run.id, RunStatus::Partial, completed, Some("1 item failed"))
            .unwrap();

        let stored = recorder.get_run(&run.id).unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Partial);
        assert_eq!(stored.error.as_deref(), Some("1 item failed"));
        assert_eq!(stored.items.len(), 2);
        assert_eq!(stored.items[1], failed);
        assert!(stored.completed_at.is_some());

        assert!(recorder
            .finish_run(&run.id, RunStatus::Success, Utc::now(), None)
            .is_err());
        assert!(recorder
            .append_item(&run.id, &item(Direction::BudgetToExpense, Outcome::Success))
            .is_err());

        std::thread::sleep(std::time::Duration::from_millis(5));
        let newer = SyncRun::start("alice", RunTrigger::Scheduled);
        recorder.create_run(&newer).unwrap();
        recorder.create_run(&SyncRun::start("bob", RunTrigger::Manual)).unwrap();

        let listed = recorder.list_runs("alice", 10).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, newer.id);
        assert_eq!(listed[0].trigger, RunTrigger::Scheduled);
        assert_eq!(recorder.list_runs("alice", 1).unwrap().len(), 1);
        assert!(recorder.get_run("missing").unwrap().is_none());
    }

    #[test]
    fn memory_recorder_contract() {
        exercise_recorder(&MemoryRunRecorder::new());
    }

    #[test]
    fn run_ids_sort_by_creation_time() {
        let a = SyncRun::start("alice", RunTrigger::Manual);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = SyncRun::start("alice", RunTrigger::Manual);
        assert!(a.id < b.id);
        assert_eq!(a.status, RunStatus::InProgress);
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            RunStatus::InProgress,
            RunStatus::Success,
            RunStatus::Partial,
            RunStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!(!RunStatus::InProgress.is_terminal());
    }
}
