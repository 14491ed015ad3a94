//! Ledger clients.
//!
//! Each external ledger is reached through a trait with three capabilities: fetch the
//! records that still need syncing, create a record, and tag a source record as
//! processed. Live implementations talk to the vendor REST APIs; the fakes in
//! [`fake`] keep everything in memory.

pub mod fake;
mod http;
pub mod splitwise;
pub mod ynab;

use crate::codec::parse_milliunits;
use crate::error::Result;
use crate::profile::{SplitwiseSettings, UserProfile, YnabSettings};
use crate::types::{BudgetTransaction, Checkpoint, Expense, NewBudgetTransaction, NewExpense};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub use splitwise::SplitwiseClient;
pub use ynab::YnabClient;

/// Records returned by a fetch plus the checkpoint to persist once they are all processed.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchBatch<T> {
    pub records: Vec<T>,
    /// `None` only when the ledger has nothing to bookmark yet.
    pub checkpoint: Option<Checkpoint>,
}

/// Ledger A: the budgeting ledger.
#[async_trait]
pub trait BudgetLedger: Send + Sync {
    /// Pending outflows changed since `checkpoint`.
    async fn fetch_unprocessed(
        &self,
        checkpoint: Option<Checkpoint>,
    ) -> Result<FetchBatch<BudgetTransaction>>;

    /// Create a transaction on the mirror account.
    async fn create(&self, draft: &NewBudgetTransaction) -> Result<BudgetTransaction>;

    /// Swap the pending flag for the synced flag (or clear it).
    async fn mark_processed(&self, transaction: &BudgetTransaction) -> Result<()>;
}

/// Ledger B: the shared-expense ledger.
#[async_trait]
pub trait ExpenseLedger: Send + Sync {
    /// Expenses dated at or after `checkpoint` that have not been synced yet.
    async fn fetch_unprocessed(&self, checkpoint: Option<Checkpoint>) -> Result<FetchBatch<Expense>>;

    /// Create an expense paid by this user and split with the partner.
    async fn create(&self, draft: &NewExpense) -> Result<Expense>;

    /// Attach the idempotency marker comment.
    async fn mark_processed(&self, expense: &Expense) -> Result<()>;
}

/// An outflow in Ledger A that the user flagged for sharing.
pub fn is_pending_transaction(transaction: &BudgetTransaction, settings: &YnabSettings) -> bool {
    !transaction.deleted
        && transaction.amount < 0
        && transaction.flag_color == Some(settings.pending_flag)
        && transaction.account_id != settings.mirror_account_id
}

fn paid_something(paid_share: &str) -> bool {
    parse_milliunits(paid_share).is_ok_and(|amount| amount > 0)
}

/// An expense this system created from a Ledger A outflow: created by `self_id`, who is
/// also the only party that paid anything.
pub fn is_self_echo(expense: &Expense, self_id: i64) -> bool {
    if expense.created_by.id != self_id {
        return false;
    }
    let mut payers = expense
        .users
        .iter()
        .filter(|share| paid_something(&share.paid_share));
    matches!(payers.next(), Some(share) if share.user_id == self_id) && payers.next().is_none()
}

/// Whether a Ledger B expense still has to be brought over to Ledger A.
pub fn is_unprocessed_expense(expense: &Expense, settings: &SplitwiseSettings) -> bool {
    !expense.deleted
        && !expense
            .comments
            .iter()
            .any(|comment| comment.content.contains(&settings.marker))
        && !is_self_echo(expense, settings.user_id)
}

/// Builds the pair of ledger clients for a user.
pub trait LedgerFactory: Send + Sync {
    fn budget_ledger(&self, profile: &UserProfile) -> Result<Arc<dyn BudgetLedger>>;
    fn expense_ledger(&self, profile: &UserProfile) -> Result<Arc<dyn ExpenseLedger>>;
}

/// Factory for the live vendor clients.
#[derive(Debug, Clone)]
pub struct LiveLedgers {
    request_timeout: Duration,
}

impl LiveLedgers {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl Default for LiveLedgers {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl LedgerFactory for LiveLedgers {
    fn budget_ledger(&self, profile: &UserProfile) -> Result<Arc<dyn BudgetLedger>> {
        let client = YnabClient::new(profile.ynab.clone()).with_timeout(self.request_timeout)?;
        Ok(Arc::new(client))
    }

    fn expense_ledger(&self, profile: &UserProfile) -> Result<Arc<dyn ExpenseLedger>> {
        let client =
            SplitwiseClient::new(profile.splitwise.clone()).with_timeout(self.request_timeout)?;
        Ok(Arc::new(client))
    }
}
