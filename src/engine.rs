//! Reconciliation engine: one direction of one user's sync.
//!
//! For each direction the engine reads the checkpoint, fetches unprocessed records,
//! and for every record translates, creates, marks processed and records an item.
//! Record failures are isolated. The checkpoint only moves when the whole batch went
//! through, so a rerun picks up exactly the records that are still unmarked.

use crate::codec::to_inflow_amount;
use crate::error::{Result, SyncError};
use crate::history::{ItemType, Outcome, RunRecorder, SyncedItem};
use crate::ledger::{BudgetLedger, ExpenseLedger};
use crate::profile::UserProfile;
use crate::state::CheckpointStore;
use crate::translate::{expense_to_transaction, mirror_inflow, outflow_to_expense};
use crate::types::{BudgetTransaction, Checkpoint, Direction, Expense, Milliunits};
use chrono::{NaiveDate, Utc};
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How far back the first expense fetch looks when no checkpoint exists yet.
pub const DEFAULT_INITIAL_LOOKBACK_DAYS: i64 = 30;

/// Outcome of one direction.
#[derive(Debug)]
pub struct DirectionReport {
    pub direction: Direction,
    pub fetched: usize,
    pub items: Vec<SyncedItem>,
    pub checkpoint_before: Option<Checkpoint>,
    pub checkpoint_after: Option<Checkpoint>,
    pub advanced: bool,
    /// The deadline passed before the batch was finished.
    pub interrupted: bool,
    /// The fetch itself failed; no records were processed.
    pub fetch_error: Option<SyncError>,
}

impl DirectionReport {
    fn new(direction: Direction, checkpoint_before: Option<Checkpoint>) -> Self {
        Self {
            direction,
            fetched: 0,
            items: Vec::new(),
            checkpoint_before,
            checkpoint_after: checkpoint_before,
            advanced: false,
            interrupted: false,
            fetch_error: None,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|item| item.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.items.len() - self.succeeded()
    }

    /// Finished with no failures of any kind.
    pub fn is_clean(&self) -> bool {
        self.fetch_error.is_none() && !self.interrupted && self.failed() == 0
    }
}

/// What one record turned into on the destination side.
struct Moved {
    amount: Milliunits,
    created_id: Option<String>,
}

pub struct ReconciliationEngine {
    profile: UserProfile,
    budget: Arc<dyn BudgetLedger>,
    expenses: Arc<dyn ExpenseLedger>,
    checkpoints: Arc<dyn CheckpointStore>,
    recorder: Arc<dyn RunRecorder>,
    deadline: Option<Instant>,
    initial_lookback: chrono::Duration,
}

impl ReconciliationEngine {
    pub fn new(
        profile: UserProfile,
        budget: Arc<dyn BudgetLedger>,
        expenses: Arc<dyn ExpenseLedger>,
        checkpoints: Arc<dyn CheckpointStore>,
        recorder: Arc<dyn RunRecorder>,
    ) -> Self {
        Self {
            profile,
            budget,
            expenses,
            checkpoints,
            recorder,
            deadline: None,
            initial_lookback: chrono::Duration::days(DEFAULT_INITIAL_LOOKBACK_DAYS),
        }
    }

    /// Stop starting new work once `deadline` has passed.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_initial_lookback(mut self, lookback: chrono::Duration) -> Self {
        self.initial_lookback = lookback;
        self
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    async fn bounded<F: Future>(&self, fut: F) -> Result<F::Output> {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| SyncError::DeadlineExceeded),
            None => Ok(fut.await),
        }
    }

    /// Run a blocking store call off the async workers, bounded by the deadline.
    async fn store_call<T, F>(&self, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let joined = self.bounded(tokio::task::spawn_blocking(call)).await?;
        let output = joined.map_err(|e| SyncError::persistence(format!("store task failed: {e}")))?;
        output.map_err(SyncError::from)
    }

    async fn record(&self, run_id: &str, item: SyncedItem) -> Result<SyncedItem> {
        let recorder = self.recorder.clone();
        let run_id = run_id.to_string();
        let stored = item.clone();
        self.store_call(move || recorder.append_item(&run_id, &stored))
            .await?;
        Ok(item)
    }

    /// Process one direction for this engine's user.
    ///
    /// `Err` is reserved for run-fatal failures (bookkeeping unavailable). Everything
    /// else ends up in the report.
    pub async fn run(&self, run_id: &str, direction: Direction) -> Result<DirectionReport> {
        let user_id = self.profile.user_id.clone();
        let store = self.checkpoints.clone();
        let key = user_id.clone();
        let before = match self
            .store_call(move || store.get(&key, direction))
            .await
        {
            Ok(checkpoint) => checkpoint,
            Err(SyncError::DeadlineExceeded) => {
                let mut report = DirectionReport::new(direction, None);
                report.interrupted = true;
                return Ok(report);
            }
            Err(err) => return Err(err),
        };

        let mut report = DirectionReport::new(direction, before);
        if self.deadline_passed() {
            report.interrupted = true;
            return Ok(report);
        }

        match direction {
            Direction::BudgetToExpense => self.run_budget_to_expense(run_id, &mut report).await?,
            Direction::ExpenseToBudget => self.run_expense_to_budget(run_id, &mut report).await?,
        }

        info!(
            "User {} {}: fetched {}, synced {}, failed {}{}",
            user_id,
            direction,
            report.fetched,
            report.succeeded(),
            report.failed(),
            if report.interrupted { " (deadline reached)" } else { "" }
        );
        Ok(report)
    }

    async fn run_budget_to_expense(&self, run_id: &str, report: &mut DirectionReport) -> Result<()> {
        let batch = match self
            .bounded(self.budget.fetch_unprocessed(report.checkpoint_before))
            .await
        {
            Ok(Ok(batch)) => batch,
            Ok(Err(err)) | Err(err) => return self.fetch_failed(report, err),
        };
        report.fetched = batch.records.len();

        for transaction in &batch.records {
            if self.deadline_passed() {
                report.interrupted = true;
                break;
            }
            let result = self.move_outflow(transaction).await;
            let item = match result {
                Err(SyncError::DeadlineExceeded) => {
                    report.interrupted = true;
                    break;
                }
                other => outflow_item(transaction, other),
            };
            if !self.push_item(run_id, report, item).await? {
                break;
            }
        }

        self.finish_batch(report, batch.checkpoint).await
    }

    async fn run_expense_to_budget(&self, run_id: &str, report: &mut DirectionReport) -> Result<()> {
        let since = report
            .checkpoint_before
            .or_else(|| Some(Checkpoint::Since(Utc::now() - self.initial_lookback)));
        let batch = match self.bounded(self.expenses.fetch_unprocessed(since)).await {
            Ok(Ok(batch)) => batch,
            Ok(Err(err)) | Err(err) => return self.fetch_failed(report, err),
        };
        report.fetched = batch.records.len();

        for expense in &batch.records {
            if self.deadline_passed() {
                report.interrupted = true;
                break;
            }
            let result = self.move_expense(expense).await;
            let item = match result {
                Err(SyncError::DeadlineExceeded) => {
                    report.interrupted = true;
                    break;
                }
                other => expense_item(expense, other),
            };
            if !self.push_item(run_id, report, item).await? {
                break;
            }
        }

        if report.fetched == 0 {
            return Ok(());
        }
        self.finish_batch(report, batch.checkpoint).await
    }

    fn fetch_failed(&self, report: &mut DirectionReport, err: SyncError) -> Result<()> {
        match err {
            SyncError::DeadlineExceeded => report.interrupted = true,
            err => {
                warn!(
                    "User {} {}: fetch failed: {}",
                    self.profile.user_id, report.direction, err
                );
                report.fetch_error = Some(err);
            }
        }
        Ok(())
    }

    /// Record an item. Returns `false` when the deadline cut the batch short.
    async fn push_item(
        &self,
        run_id: &str,
        report: &mut DirectionReport,
        item: SyncedItem,
    ) -> Result<bool> {
        match self.record(run_id, item).await {
            Ok(item) => {
                report.items.push(item);
                Ok(true)
            }
            Err(SyncError::DeadlineExceeded) => {
                report.interrupted = true;
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    async fn finish_batch(
        &self,
        report: &mut DirectionReport,
        fetched_checkpoint: Option<Checkpoint>,
    ) -> Result<()> {
        if report.interrupted || report.failed() > 0 {
            debug!(
                "User {} {}: checkpoint held at {:?}",
                self.profile.user_id, report.direction, report.checkpoint_before
            );
            return Ok(());
        }
        let Some(next) = fetched_checkpoint else {
            return Ok(());
        };
        if Some(next) == report.checkpoint_before {
            return Ok(());
        }

        let store = self.checkpoints.clone();
        let user_id = self.profile.user_id.clone();
        let direction = report.direction;
        match self
            .store_call(move || store.set(&user_id, direction, next))
            .await
        {
            Ok(()) => {
                report.checkpoint_after = Some(next);
                report.advanced = true;
                Ok(())
            }
            Err(SyncError::DeadlineExceeded) => {
                report.interrupted = true;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Ledger A outflow to Ledger B expense, plus the partner's share as a mirror inflow.
    async fn move_outflow(&self, transaction: &BudgetTransaction) -> Result<Moved> {
        let draft = outflow_to_expense(transaction)?;
        let amount = to_inflow_amount(&draft.cost)?;

        // the inflow's import id dedups retries; the expense has no such key
        let inflow = mirror_inflow(transaction, &draft, &self.profile.splitwise)?;
        if inflow.amount != 0 {
            self.bounded(self.budget.create(&inflow)).await??;
        }

        let created = self.bounded(self.expenses.create(&draft)).await??;
        debug!(
            "User {}: transaction {} became expense {}",
            self.profile.user_id, transaction.id, created.id
        );

        self.bounded(self.budget.mark_processed(transaction)).await??;
        Ok(Moved {
            amount,
            created_id: Some(created.id.to_string()),
        })
    }

    /// Ledger B expense to a Ledger A transaction on the mirror account.
    async fn move_expense(&self, expense: &Expense) -> Result<Moved> {
        let draft = expense_to_transaction(expense, &self.profile.splitwise)?;
        let created_id = if draft.amount == 0 {
            debug!(
                "User {}: expense {} has nothing owed either way",
                self.profile.user_id, expense.id
            );
            None
        } else {
            let created = self.bounded(self.budget.create(&draft)).await??;
            Some(created.id)
        };

        self.bounded(self.expenses.mark_processed(expense)).await??;
        Ok(Moved {
            amount: draft.amount,
            created_id,
        })
    }
}

fn item_from(
    item_type: ItemType,
    external_id: String,
    description: String,
    date: NaiveDate,
    direction: Direction,
    fallback_amount: Milliunits,
    result: Result<Moved>,
) -> SyncedItem {
    match result {
        Ok(moved) => SyncedItem {
            item_type,
            external_id,
            amount: moved.amount,
            description,
            date,
            direction,
            outcome: Outcome::Success,
            error: None,
            error_kind: None,
            created_id: moved.created_id,
        },
        Err(err) => {
            warn!("{} {} failed: {}", item_type.as_str(), external_id, err);
            SyncedItem {
                item_type,
                external_id,
                amount: fallback_amount,
                description,
                date,
                direction,
                outcome: Outcome::Error,
                error: Some(err.to_string()),
                error_kind: Some(err.kind().to_string()),
                created_id: None,
            }
        }
    }
}

fn outflow_item(transaction: &BudgetTransaction, result: Result<Moved>) -> SyncedItem {
    item_from(
        ItemType::Transaction,
        transaction.id.clone(),
        transaction
            .payee_name
            .clone()
            .or_else(|| transaction.memo.clone())
            .unwrap_or_default(),
        transaction.date,
        Direction::BudgetToExpense,
        transaction.amount.saturating_neg(),
        result,
    )
}

fn expense_item(expense: &Expense, result: Result<Moved>) -> SyncedItem {
    item_from(
        ItemType::Expense,
        expense.id.to_string(),
        expense.description.clone(),
        expense.date.date_naive(),
        Direction::ExpenseToBudget,
        0,
        result,
    )
}
