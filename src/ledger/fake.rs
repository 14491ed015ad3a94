//! In-memory ledgers for tests and dry runs.
//!
//! Both fakes follow the vendor semantics the engine relies on: Ledger A issues a
//! monotonic server knowledge value and dedups creates by import id; Ledger B filters by
//! date and marker comment. Failures can be injected per record or for the whole ledger.

use super::{
    is_pending_transaction, is_unprocessed_expense, BudgetLedger, ExpenseLedger, FetchBatch,
    LedgerFactory,
};
use crate::codec::{format_cents, milliunits_to_cents, parse_milliunits};
use crate::error::{Result, Service, SyncError};
use crate::profile::{SplitwiseSettings, UserProfile, YnabSettings};
use crate::types::{
    BudgetTransaction, Checkpoint, Comment, Expense, ExpenseUser, NewBudgetTransaction,
    NewExpense, Share,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn simulate_latency(latency: Option<Duration>) {
    if let Some(latency) = latency {
        tokio::time::sleep(latency).await;
    }
}

#[derive(Debug, Default)]
struct BudgetState {
    knowledge: i64,
    /// Transactions with the knowledge value of their last change.
    transactions: Vec<(BudgetTransaction, i64)>,
    next_id: u64,
    fail_create: HashSet<String>,
    fail_mark: HashSet<String>,
    unavailable: bool,
    latency: Option<Duration>,
    create_calls: usize,
}

/// Fake YNAB budget.
#[derive(Debug)]
pub struct FakeBudgetLedger {
    settings: YnabSettings,
    state: Mutex<BudgetState>,
}

impl FakeBudgetLedger {
    pub fn new(settings: YnabSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(BudgetState::default()),
        }
    }

    /// Add a transaction the way the user would in the YNAB UI.
    pub fn add_transaction(&self, transaction: BudgetTransaction) {
        let mut state = lock(&self.state);
        state.knowledge += 1;
        let knowledge = state.knowledge;
        state.transactions.push((transaction, knowledge));
    }

    /// Add a flagged outflow on a regular account and return its id.
    pub fn add_pending_outflow(
        &self,
        date: NaiveDate,
        amount: i64,
        payee: &str,
        memo: Option<&str>,
    ) -> String {
        let id = {
            let mut state = lock(&self.state);
            state.next_id += 1;
            format!("user-txn-{}", state.next_id)
        };
        self.add_transaction(BudgetTransaction {
            id: id.clone(),
            date,
            amount,
            memo: memo.map(str::to_string),
            payee_name: Some(payee.to_string()),
            flag_color: Some(self.settings.pending_flag),
            account_id: "checking".to_string(),
            deleted: false,
            import_id: None,
        });
        id
    }

    pub fn fail_create_for(&self, import_id: impl Into<String>) {
        lock(&self.state).fail_create.insert(import_id.into());
    }

    pub fn fail_mark_for(&self, transaction_id: impl Into<String>) {
        lock(&self.state).fail_mark.insert(transaction_id.into());
    }

    pub fn clear_failures(&self) {
        let mut state = lock(&self.state);
        state.fail_create.clear();
        state.fail_mark.clear();
        state.unavailable = false;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.state).unavailable = unavailable;
    }

    pub fn set_latency(&self, latency: Duration) {
        lock(&self.state).latency = Some(latency);
    }

    pub fn transaction(&self, id: &str) -> Option<BudgetTransaction> {
        lock(&self.state)
            .transactions
            .iter()
            .find(|(txn, _)| txn.id == id)
            .map(|(txn, _)| txn.clone())
    }

    /// Transactions this system created on the mirror account.
    pub fn mirror_transactions(&self) -> Vec<BudgetTransaction> {
        lock(&self.state)
            .transactions
            .iter()
            .filter(|(txn, _)| txn.account_id == self.settings.mirror_account_id)
            .map(|(txn, _)| txn.clone())
            .collect()
    }

    /// Number of create calls that reached the ledger, including deduplicated ones.
    pub fn create_calls(&self) -> usize {
        lock(&self.state).create_calls
    }

    pub fn server_knowledge(&self) -> i64 {
        lock(&self.state).knowledge
    }

    fn check_available(&self) -> Result<Option<Duration>> {
        let state = lock(&self.state);
        if state.unavailable {
            return Err(SyncError::unavailable(Service::Ynab, "service is down"));
        }
        Ok(state.latency)
    }
}

#[async_trait]
impl BudgetLedger for FakeBudgetLedger {
    async fn fetch_unprocessed(
        &self,
        checkpoint: Option<Checkpoint>,
    ) -> Result<FetchBatch<BudgetTransaction>> {
        simulate_latency(self.check_available()?).await;
        let since = checkpoint.and_then(|c| c.server_knowledge()).unwrap_or(0);
        let state = lock(&self.state);
        let records = state
            .transactions
            .iter()
            .filter(|(_, changed)| *changed > since)
            .map(|(txn, _)| txn)
            .filter(|txn| is_pending_transaction(txn, &self.settings))
            .cloned()
            .collect();
        Ok(FetchBatch {
            records,
            checkpoint: Some(Checkpoint::ServerKnowledge(state.knowledge)),
        })
    }

    async fn create(&self, draft: &NewBudgetTransaction) -> Result<BudgetTransaction> {
        simulate_latency(self.check_available()?).await;
        let mut state = lock(&self.state);
        state.create_calls += 1;
        if state.fail_create.contains(&draft.import_id) {
            return Err(SyncError::rejected(
                Service::Ynab,
                Some(400),
                format!("import {} refused", draft.import_id),
            ));
        }
        if let Some((existing, _)) = state
            .transactions
            .iter()
            .find(|(txn, _)| txn.import_id.as_deref() == Some(draft.import_id.as_str()))
        {
            return Ok(existing.clone());
        }

        state.next_id += 1;
        state.knowledge += 1;
        let created = BudgetTransaction {
            id: format!("mirror-txn-{}", state.next_id),
            date: draft.date,
            amount: draft.amount,
            memo: draft.memo.clone(),
            payee_name: Some(draft.payee_name.clone()),
            flag_color: None,
            account_id: self.settings.mirror_account_id.clone(),
            deleted: false,
            import_id: Some(draft.import_id.clone()),
        };
        let knowledge = state.knowledge;
        state.transactions.push((created.clone(), knowledge));
        Ok(created)
    }

    async fn mark_processed(&self, transaction: &BudgetTransaction) -> Result<()> {
        simulate_latency(self.check_available()?).await;
        let mut state = lock(&self.state);
        if state.fail_mark.contains(&transaction.id) {
            return Err(SyncError::unavailable(
                Service::Ynab,
                format!("flag update for {} timed out", transaction.id),
            ));
        }
        state.knowledge += 1;
        let knowledge = state.knowledge;
        let entry = state
            .transactions
            .iter_mut()
            .find(|(txn, _)| txn.id == transaction.id)
            .ok_or_else(|| {
                SyncError::rejected(
                    Service::Ynab,
                    Some(404),
                    format!("transaction {} not found", transaction.id),
                )
            })?;
        entry.0.flag_color = self.settings.synced_flag;
        entry.1 = knowledge;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ExpenseState {
    expenses: Vec<Expense>,
    next_id: i64,
    fail_create: HashSet<String>,
    fail_mark: HashSet<i64>,
    unavailable: bool,
    latency: Option<Duration>,
}

/// Fake Splitwise group shared by this user and the partner.
#[derive(Debug)]
pub struct FakeExpenseLedger {
    settings: SplitwiseSettings,
    partner_name: String,
    state: Mutex<ExpenseState>,
}

fn subtract(a: &str, b: &str) -> Result<String> {
    let diff = parse_milliunits(a)? - parse_milliunits(b)?;
    Ok(format_cents(milliunits_to_cents(diff)))
}

impl FakeExpenseLedger {
    pub fn new(settings: SplitwiseSettings) -> Self {
        Self {
            settings,
            partner_name: "Sam".to_string(),
            state: Mutex::new(ExpenseState::default()),
        }
    }

    pub fn with_partner_name(mut self, name: impl Into<String>) -> Self {
        self.partner_name = name.into();
        self
    }

    fn next_id(state: &mut ExpenseState) -> i64 {
        state.next_id += 1;
        state.next_id
    }

    /// The partner pays `cost` and records that this user owes `user_owes`.
    pub fn add_partner_expense(
        &self,
        description: &str,
        cost: &str,
        user_owes: &str,
        date: DateTime<Utc>,
    ) -> Result<i64> {
        let partner_owes = subtract(cost, user_owes)?;
        let partner_net = subtract(cost, &partner_owes)?;
        let user_net = subtract("0", user_owes)?;
        let mut state = lock(&self.state);
        let id = Self::next_id(&mut state);
        state.expenses.push(Expense {
            id,
            date,
            description: description.to_string(),
            details: None,
            cost: cost.to_string(),
            currency_code: self.settings.currency_code.clone(),
            users: vec![
                Share {
                    user_id: self.settings.partner_id,
                    paid_share: cost.to_string(),
                    owed_share: partner_owes,
                    net_balance: partner_net,
                },
                Share {
                    user_id: self.settings.user_id,
                    paid_share: "0.00".to_string(),
                    owed_share: user_owes.to_string(),
                    net_balance: user_net,
                },
            ],
            created_by: ExpenseUser {
                id: self.settings.partner_id,
                first_name: Some(self.partner_name.clone()),
            },
            deleted: false,
            comments: Vec::new(),
        });
        Ok(id)
    }

    pub fn delete_expense(&self, id: i64) {
        if let Some(expense) = lock(&self.state).expenses.iter_mut().find(|e| e.id == id) {
            expense.deleted = true;
        }
    }

    pub fn fail_create_for(&self, description: impl Into<String>) {
        lock(&self.state).fail_create.insert(description.into());
    }

    pub fn fail_mark_for(&self, expense_id: i64) {
        lock(&self.state).fail_mark.insert(expense_id);
    }

    pub fn clear_failures(&self) {
        let mut state = lock(&self.state);
        state.fail_create.clear();
        state.fail_mark.clear();
        state.unavailable = false;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.state).unavailable = unavailable;
    }

    pub fn set_latency(&self, latency: Duration) {
        lock(&self.state).latency = Some(latency);
    }

    pub fn expense(&self, id: i64) -> Option<Expense> {
        lock(&self.state).expenses.iter().find(|e| e.id == id).cloned()
    }

    pub fn expenses(&self) -> Vec<Expense> {
        lock(&self.state).expenses.clone()
    }

    /// Expenses created through [`ExpenseLedger::create`].
    pub fn created_by_self(&self) -> Vec<Expense> {
        lock(&self.state)
            .expenses
            .iter()
            .filter(|e| e.created_by.id == self.settings.user_id)
            .cloned()
            .collect()
    }

    fn check_available(&self) -> Result<Option<Duration>> {
        let state = lock(&self.state);
        if state.unavailable {
            return Err(SyncError::unavailable(Service::Splitwise, "service is down"));
        }
        Ok(state.latency)
    }
}

#[async_trait]
impl ExpenseLedger for FakeExpenseLedger {
    async fn fetch_unprocessed(&self, checkpoint: Option<Checkpoint>) -> Result<FetchBatch<Expense>> {
        simulate_latency(self.check_available()?).await;
        let since = checkpoint.and_then(|c| c.since());
        let records: Vec<Expense> = lock(&self.state)
            .expenses
            .iter()
            .filter(|e| since.map_or(true, |since| e.date >= since))
            .filter(|e| is_unprocessed_expense(e, &self.settings))
            .cloned()
            .collect();
        let checkpoint = records
            .iter()
            .map(|e| e.date)
            .max()
            .map(Checkpoint::Since)
            .or(checkpoint);
        Ok(FetchBatch { records, checkpoint })
    }

    async fn create(&self, draft: &NewExpense) -> Result<Expense> {
        simulate_latency(self.check_available()?).await;
        let (user_share, partner_share) = self.settings.split_ratio.split_cost(&draft.cost)?;
        let user_net = subtract(&draft.cost, &user_share)?;
        let partner_net = subtract("0", &partner_share)?;

        let mut state = lock(&self.state);
        if state.fail_create.contains(&draft.description) {
            return Err(SyncError::rejected(
                Service::Splitwise,
                Some(400),
                format!("expense '{}' refused", draft.description),
            ));
        }
        let id = Self::next_id(&mut state);
        let expense = Expense {
            id,
            date: draft.date,
            description: draft.description.clone(),
            details: draft.details.clone(),
            cost: draft.cost.clone(),
            currency_code: self.settings.currency_code.clone(),
            users: vec![
                Share {
                    user_id: self.settings.user_id,
                    paid_share: draft.cost.clone(),
                    owed_share: user_share,
                    net_balance: user_net,
                },
                Share {
                    user_id: self.settings.partner_id,
                    paid_share: "0.00".to_string(),
                    owed_share: partner_share,
                    net_balance: partner_net,
                },
            ],
            created_by: ExpenseUser {
                id: self.settings.user_id,
                first_name: Some("Me".to_string()),
            },
            deleted: false,
            comments: Vec::new(),
        };
        state.expenses.push(expense.clone());
        Ok(expense)
    }

    async fn mark_processed(&self, expense: &Expense) -> Result<()> {
        simulate_latency(self.check_available()?).await;
        let mut state = lock(&self.state);
        if state.fail_mark.contains(&expense.id) {
            return Err(SyncError::unavailable(
                Service::Splitwise,
                format!("comment on {} timed out", expense.id),
            ));
        }
        let comment_id = Self::next_id(&mut state);
        let stored = state
            .expenses
            .iter_mut()
            .find(|e| e.id == expense.id)
            .ok_or_else(|| {
                SyncError::rejected(
                    Service::Splitwise,
                    Some(404),
                    format!("expense {} not found", expense.id),
                )
            })?;
        stored.comments.push(Comment {
            id: comment_id,
            content: self.settings.marker.clone(),
        });
        Ok(())
    }
}

/// Fake ledgers per user, created on first use.
#[derive(Debug, Default)]
pub struct FakeLedgers {
    users: Mutex<HashMap<String, (Arc<FakeBudgetLedger>, Arc<FakeExpenseLedger>)>>,
}

impl FakeLedgers {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pair of fakes backing `profile`, so tests can seed and inspect them.
    pub fn for_profile(
        &self,
        profile: &UserProfile,
    ) -> (Arc<FakeBudgetLedger>, Arc<FakeExpenseLedger>) {
        lock(&self.users)
            .entry(profile.user_id.clone())
            .or_insert_with(|| {
                (
                    Arc::new(FakeBudgetLedger::new(profile.ynab.clone())),
                    Arc::new(FakeExpenseLedger::new(profile.splitwise.clone())),
                )
            })
            .clone()
    }
}

impl LedgerFactory for FakeLedgers {
    fn budget_ledger(&self, profile: &UserProfile) -> Result<Arc<dyn BudgetLedger>> {
        Ok(self.for_profile(profile).0)
    }

    fn expense_ledger(&self, profile: &UserProfile) -> Result<Arc<dyn ExpenseLedger>> {
        Ok(self.for_profile(profile).1)
    }
}
