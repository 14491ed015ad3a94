//! Response returned for every sync invocation.

use crate::error::{FieldError, SyncError};
use crate::history::{RunStatus, SyncRun, SyncedItem};
use crate::types::Direction;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectionSummary {
    /// Records moved successfully.
    pub count: usize,
    pub failed: usize,
    pub items: Vec<SyncedItem>,
}

impl DirectionSummary {
    fn from_items<'a>(items: impl Iterator<Item = &'a SyncedItem>) -> Self {
        let items: Vec<SyncedItem> = items.cloned().collect();
        let count = items.iter().filter(|item| item.is_success()).count();
        Self {
            count,
            failed: items.len() - count,
            items,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    pub budget_to_expense: DirectionSummary,
    pub expense_to_budget: DirectionSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FieldError>,
}

impl SyncResponse {
    pub fn from_run(run: &SyncRun) -> Self {
        Self {
            success: run.status != RunStatus::Error,
            user_id: Some(run.user_id.clone()),
            run_id: Some(run.id.clone()),
            status: Some(run.status),
            budget_to_expense: DirectionSummary::from_items(
                run.items_for(Direction::BudgetToExpense),
            ),
            expense_to_budget: DirectionSummary::from_items(
                run.items_for(Direction::ExpenseToBudget),
            ),
            error: run.error.clone(),
            errors: Vec::new(),
        }
    }

    /// A request that was refused before any run was created.
    pub fn from_error(user_id: Option<&str>, err: &SyncError) -> Self {
        let errors = match err {
            SyncError::Validation(errors) => errors.clone(),
            _ => Vec::new(),
        };
        Self {
            success: false,
            user_id: user_id.map(str::to_string),
            run_id: None,
            status: None,
            budget_to_expense: DirectionSummary::default(),
            expense_to_budget: DirectionSummary::default(),
            error: Some(err.to_string()),
            errors,
        }
    }
}
