//! Record types shared by the ledger clients, the engine and the run history.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Amounts in Ledger A are integer thousandths of the currency unit.
pub type Milliunits = i64;

/// Flag colors offered by YNAB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagColor {
    Red,
    Orange,
    Yellow,
    Green,
    Blue,
    Purple,
}

impl FlagColor {
    pub const ALL: [FlagColor; 6] = [
        FlagColor::Red,
        FlagColor::Orange,
        FlagColor::Yellow,
        FlagColor::Green,
        FlagColor::Blue,
        FlagColor::Purple,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FlagColor::Red => "red",
            FlagColor::Orange => "orange",
            FlagColor::Yellow => "yellow",
            FlagColor::Green => "green",
            FlagColor::Blue => "blue",
            FlagColor::Purple => "purple",
        }
    }
}

impl fmt::Display for FlagColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlagColor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FlagColor::ALL
            .iter()
            .copied()
            .find(|color| color.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| format!("unknown flag color '{s}'"))
    }
}

/// A transaction in the budgeting ledger (Ledger A).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetTransaction {
    pub id: String,
    pub date: NaiveDate,
    pub amount: Milliunits,
    #[serde(default)]
    pub memo: Option<String>,
    #[serde(default)]
    pub payee_name: Option<String>,
    #[serde(default)]
    pub flag_color: Option<FlagColor>,
    pub account_id: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub import_id: Option<String>,
}

/// A transaction to be created on the mirror account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBudgetTransaction {
    pub date: NaiveDate,
    pub amount: Milliunits,
    pub payee_name: String,
    pub memo: Option<String>,
    /// Deterministic key; Ledger A refuses a second create with the same value.
    pub import_id: String,
}

/// A user as embedded in a Splitwise expense.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpenseUser {
    pub id: i64,
    #[serde(default)]
    pub first_name: Option<String>,
}

/// One party's part of an expense. All amounts are decimal strings as sent by Ledger B.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub user_id: i64,
    pub paid_share: String,
    pub owed_share: String,
    pub net_balance: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub content: String,
}

/// An expense in the shared-expense ledger (Ledger B).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expense {
    pub id: i64,
    pub date: DateTime<Utc>,
    pub description: String,
    #[serde(default)]
    pub details: Option<String>,
    pub cost: String,
    pub currency_code: String,
    pub users: Vec<Share>,
    pub created_by: ExpenseUser,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

impl Expense {
    pub fn share_of(&self, user_id: i64) -> Option<&Share> {
        self.users.iter().find(|share| share.user_id == user_id)
    }
}

/// An expense to be created in Ledger B, paid in full by this user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewExpense {
    pub date: DateTime<Utc>,
    pub description: String,
    pub details: Option<String>,
    /// Positive decimal cost with two fraction digits.
    pub cost: String,
}

/// Direction of a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Ledger A outflows become Ledger B expenses.
    BudgetToExpense,
    /// Ledger B expenses become Ledger A transactions.
    ExpenseToBudget,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::BudgetToExpense => "budget_to_expense",
            Direction::ExpenseToBudget => "expense_to_budget",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "budget_to_expense" => Ok(Direction::BudgetToExpense),
            "expense_to_budget" => Ok(Direction::ExpenseToBudget),
            other => Err(format!("unknown direction '{other}'")),
        }
    }
}

/// Bookmark of how far a ledger's history has been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Checkpoint {
    /// Opaque cursor issued by Ledger A.
    ServerKnowledge(i64),
    /// Date of the newest expense already processed from Ledger B.
    Since(DateTime<Utc>),
}

impl Checkpoint {
    pub fn server_knowledge(&self) -> Option<i64> {
        match self {
            Checkpoint::ServerKnowledge(k) => Some(*k),
            Checkpoint::Since(_) => None,
        }
    }

    pub fn since(&self) -> Option<DateTime<Utc>> {
        match self {
            Checkpoint::Since(ts) => Some(*ts),
            Checkpoint::ServerKnowledge(_) => None,
        }
    }
}
