//! Field mapping between the two ledgers.

use crate::codec::{to_expense_cost, to_inflow_amount, to_outflow_amount};
use crate::error::{Result, SyncError};
use crate::profile::SplitwiseSettings;
use crate::types::{BudgetTransaction, Expense, NewBudgetTransaction, NewExpense};
use chrono::{NaiveTime, TimeZone, Utc};
use uuid::Uuid;

/// Namespace for deterministic YNAB import ids.
const IMPORT_NAMESPACE: Uuid = Uuid::from_u128(0x6c65_6467_6572_2d73_796e_632d_696d_7074);

/// Deterministic import id for a source record key such as `splitwise:42`.
pub fn import_id_for(source_key: &str) -> String {
    Uuid::new_v5(&IMPORT_NAMESPACE, source_key.as_bytes()).to_string()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// A Ledger A outflow as a new Ledger B expense.
pub fn outflow_to_expense(transaction: &BudgetTransaction) -> Result<NewExpense> {
    if transaction.amount >= 0 {
        return Err(SyncError::Translation(format!(
            "transaction {} is not an outflow ({} milliunits)",
            transaction.id, transaction.amount
        )));
    }
    let description = non_empty(transaction.payee_name.as_deref())
        .or_else(|| non_empty(transaction.memo.as_deref()))
        .ok_or_else(|| {
            SyncError::Translation(format!("transaction {} has no payee or memo", transaction.id))
        })?;
    Ok(NewExpense {
        date: Utc.from_utc_datetime(&transaction.date.and_time(NaiveTime::MIN)),
        description: description.to_string(),
        details: non_empty(transaction.memo.as_deref()).map(str::to_string),
        cost: to_expense_cost(transaction.amount)?,
    })
}

/// A Ledger B expense as a Ledger A transaction on the mirror account.
///
/// Expenses created by the partner become an outflow of what this user owes. Expenses
/// created by this user become an inflow of what the partner owes back.
pub fn expense_to_transaction(
    expense: &Expense,
    settings: &SplitwiseSettings,
) -> Result<NewBudgetTransaction> {
    let date = expense.date.date_naive();
    let import_id = import_id_for(&format!("splitwise:{}", expense.id));
    let details = non_empty(expense.details.as_deref()).map(str::to_string);

    if expense.created_by.id == settings.user_id {
        let partner = expense.share_of(settings.partner_id).ok_or_else(|| {
            SyncError::Translation(format!(
                "expense {} has no share for partner {}",
                expense.id, settings.partner_id
            ))
        })?;
        return Ok(NewBudgetTransaction {
            date,
            amount: to_inflow_amount(&partner.owed_share)?,
            payee_name: expense.description.clone(),
            memo: details,
            import_id,
        });
    }

    let own = expense.share_of(settings.user_id).ok_or_else(|| {
        SyncError::Translation(format!(
            "expense {} has no share for user {}",
            expense.id, settings.user_id
        ))
    })?;
    let partner_name = non_empty(expense.created_by.first_name.as_deref()).unwrap_or("partner");
    Ok(NewBudgetTransaction {
        date,
        amount: to_outflow_amount(&own.owed_share)?,
        payee_name: format!("Splitwise from {partner_name}"),
        memo: details.or_else(|| non_empty(Some(&expense.description)).map(str::to_string)),
        import_id,
    })
}

/// Mirror inflow of the partner's share of `draft`, the expense about to be created from `source`.
pub fn mirror_inflow(
    source: &BudgetTransaction,
    draft: &NewExpense,
    settings: &SplitwiseSettings,
) -> Result<NewBudgetTransaction> {
    let (_, partner_share) = settings.split_ratio.split_cost(&draft.cost)?;
    Ok(NewBudgetTransaction {
        date: source.date,
        amount: to_inflow_amount(&partner_share)?,
        payee_name: draft.description.clone(),
        memo: draft.details.clone(),
        import_id: import_id_for(&format!("ynab:{}", source.id)),
    })
}
