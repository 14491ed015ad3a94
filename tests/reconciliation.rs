mod common;

use chrono::{Duration, NaiveDate, Utc};
use common::{profile, request, TestApp};
use ledger_sync::ledger::{BudgetLedger, ExpenseLedger};
use ledger_sync::lease::LeaseStore;
use ledger_sync::state::CheckpointStore;
use ledger_sync::types::{Checkpoint, FlagColor, NewExpense};
use ledger_sync::{Direction, RunStatus, RunTrigger, SyncResponse};

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
}

#[tokio::test]
async fn flagged_outflow_becomes_split_expense() {
    let t = TestApp::new();
    let alice = profile("alice");
    let (budget, expenses) = t.fakes(&alice);
    let id = budget.add_pending_outflow(day(), -150_000, "Hardware store", Some("shelves"));

    let run = t
        .app
        .orchestrator
        .sync_user(&alice, RunTrigger::Manual)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Success);

    let created = expenses.created_by_self();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].cost, "150.00");
    assert_eq!(created[0].description, "Hardware store");
    assert_eq!(created[0].share_of(100).unwrap().owed_share, "75.00");
    assert_eq!(created[0].share_of(200).unwrap().owed_share, "75.00");

    assert_eq!(budget.transaction(&id).unwrap().flag_color, Some(FlagColor::Green));
    let next = budget.fetch_unprocessed(None).await.unwrap();
    assert!(next.records.iter().all(|txn| txn.id != id));

    let mirror = budget.mirror_transactions();
    assert_eq!(mirror.len(), 1);
    assert_eq!(mirror[0].amount, 75_000);

    let response = SyncResponse::from_run(&run);
    assert_eq!(response.budget_to_expense.count, 1);
    assert_eq!(response.budget_to_expense.items[0].amount, 150_000);
}

#[tokio::test]
async fn partner_expense_becomes_mirror_outflow() {
    let t = TestApp::new();
    let alice = profile("alice");
    let (budget, expenses) = t.fakes(&alice);
    let expense_id = expenses
        .add_partner_expense("Dinner", "75.00", "37.50", Utc::now() - Duration::days(1))
        .unwrap();

    let run = t
        .app
        .orchestrator
        .sync_user(&alice, RunTrigger::Manual)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Success);

    let mirror = budget.mirror_transactions();
    assert_eq!(mirror.len(), 1);
    assert_eq!(mirror[0].amount, -37_500);
    assert_eq!(mirror[0].payee_name.as_deref(), Some("Splitwise from Sam"));
    assert!(mirror[0].import_id.is_some());

    let expense = expenses.expense(expense_id).unwrap();
    assert!(expense.comments.iter().any(|c| c.content == alice.splitwise.marker));
    let next = expenses.fetch_unprocessed(None).await.unwrap();
    assert!(next.records.is_empty());
}

#[tokio::test]
async fn expense_created_in_first_direction_is_not_echoed_back() {
    let t = TestApp::new();
    let alice = profile("alice");
    let (budget, expenses) = t.fakes(&alice);
    budget.add_pending_outflow(day(), -150_000, "Hardware store", None);

    let run = t
        .app
        .orchestrator
        .sync_user(&alice, RunTrigger::Manual)
        .await
        .unwrap();

    assert_eq!(run.items_for(Direction::BudgetToExpense).count(), 1);
    assert_eq!(run.items_for(Direction::ExpenseToBudget).count(), 0);
    assert_eq!(expenses.expenses().len(), 1);
    // only the partner-share inflow from the first direction
    assert_eq!(budget.mirror_transactions().len(), 1);
}

#[tokio::test]
async fn partial_failure_keeps_checkpoint_and_rerun_does_not_duplicate() {
    let t = TestApp::new();
    let alice = profile("alice");
    let (budget, expenses) = t.fakes(&alice);

    // an empty first run leaves a checkpoint to compare against
    t.app
        .orchestrator
        .sync_user(&alice, RunTrigger::Manual)
        .await
        .unwrap();
    let before = t.app.persistence.get("alice", Direction::BudgetToExpense).unwrap();
    assert_eq!(before, Some(Checkpoint::ServerKnowledge(0)));

    for payee in ["p1", "p2", "p3", "p4", "p5"] {
        budget.add_pending_outflow(day(), -10_000, payee, None);
    }
    for payee in ["p2", "p3", "p5"] {
        expenses.fail_create_for(payee);
    }

    let run = t
        .app
        .orchestrator
        .sync_user(&alice, RunTrigger::Manual)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.items.iter().filter(|i| !i.is_success()).count(), 3);
    assert_eq!(
        t.app.persistence.get("alice", Direction::BudgetToExpense).unwrap(),
        before
    );
    assert_eq!(expenses.created_by_self().len(), 2);

    expenses.clear_failures();
    let rerun = t
        .app
        .orchestrator
        .sync_user(&alice, RunTrigger::Manual)
        .await
        .unwrap();
    assert_eq!(rerun.status, RunStatus::Success);

    let mut descriptions: Vec<_> = expenses
        .created_by_self()
        .into_iter()
        .map(|e| e.description)
        .collect();
    descriptions.sort();
    assert_eq!(descriptions, vec!["p1", "p2", "p3", "p4", "p5"]);
    assert_ne!(
        t.app.persistence.get("alice", Direction::BudgetToExpense).unwrap(),
        before
    );
}

#[tokio::test]
async fn marking_twice_is_harmless() {
    let t = TestApp::new();
    let alice = profile("alice");
    let (budget, expenses) = t.fakes(&alice);

    let id = budget.add_pending_outflow(day(), -5_000, "Coffee", None);
    let txn = budget.transaction(&id).unwrap();
    budget.mark_processed(&txn).await.unwrap();
    budget.mark_processed(&txn).await.unwrap();
    let batch = budget.fetch_unprocessed(None).await.unwrap();
    assert!(batch.records.iter().all(|t| t.id != id));

    let expense_id = expenses
        .add_partner_expense("Taxi", "20.00", "10.00", Utc::now())
        .unwrap();
    let expense = expenses.expense(expense_id).unwrap();
    expenses.mark_processed(&expense).await.unwrap();
    expenses.mark_processed(&expense).await.unwrap();
    let batch = expenses.fetch_unprocessed(None).await.unwrap();
    assert!(batch.records.iter().all(|e| e.id != expense_id));
}

#[tokio::test]
async fn own_creates_are_filtered_from_reverse_fetch() {
    let t = TestApp::new();
    let alice = profile("alice");
    let (_, expenses) = t.fakes(&alice);

    let created = expenses
        .create(&NewExpense {
            date: Utc::now(),
            description: "Groceries".to_string(),
            details: None,
            cost: "42.10".to_string(),
        })
        .await
        .unwrap();
    let batch = expenses.fetch_unprocessed(None).await.unwrap();
    assert!(batch.records.iter().all(|e| e.id != created.id));
}

#[tokio::test]
async fn runs_and_leases_are_persisted() {
    let t = TestApp::new();
    let alice = profile("alice");
    let (budget, _) = t.fakes(&alice);
    budget.add_pending_outflow(day(), -12_340, "Books", None);

    let run = t
        .app
        .orchestrator
        .sync_user(&alice, RunTrigger::Scheduled)
        .await
        .unwrap();

    let stored = t.app.recorder().list_runs("alice", 5).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, run.id);
    assert_eq!(stored[0].trigger, RunTrigger::Scheduled);
    assert_eq!(stored[0].items.len(), 1);
    assert!(stored[0].completed_at.is_some());
    assert!(t.app.persistence.current("alice").unwrap().is_none());
}

#[tokio::test]
async fn backends_are_chosen_per_user() {
    let t = TestApp::new();
    let file_user = request("bob", "file").validate().unwrap();
    let (budget, _) = t.fakes(&file_user);
    budget.add_pending_outflow(day(), -1_000, "Stamps", None);

    t.app
        .orchestrator
        .sync_user(&file_user, RunTrigger::Manual)
        .await
        .unwrap();

    assert!(t
        .app
        .persistence
        .get("bob", Direction::BudgetToExpense)
        .unwrap()
        .is_none());
    assert!(t.dir.path().join("state").join("bob.json").exists());
}

#[tokio::test]
async fn failed_budget_mark_retries_the_outflow_and_keeps_one_inflow() {
    let t = TestApp::new();
    let alice = profile("alice");
    let (budget, expenses) = t.fakes(&alice);
    let id = budget.add_pending_outflow(day(), -60_000, "Plumber", None);
    budget.fail_mark_for(id.clone());

    let run = t
        .app
        .orchestrator
        .sync_user(&alice, RunTrigger::Manual)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Partial);
    assert!(t
        .app
        .persistence
        .get("alice", Direction::BudgetToExpense)
        .unwrap()
        .is_none());
    assert_eq!(budget.transaction(&id).unwrap().flag_color, Some(FlagColor::Purple));
    assert_eq!(expenses.created_by_self().len(), 1);
    assert_eq!(budget.mirror_transactions().len(), 1);

    budget.clear_failures();
    let rerun = t
        .app
        .orchestrator
        .sync_user(&alice, RunTrigger::Manual)
        .await
        .unwrap();
    assert_eq!(rerun.status, RunStatus::Success);
    assert_eq!(budget.transaction(&id).unwrap().flag_color, Some(FlagColor::Green));
    // the expense has no idempotency key, so the retry creates it again
    assert_eq!(expenses.created_by_self().len(), 2);
    assert_eq!(budget.mirror_transactions().len(), 1);
}

#[tokio::test]
async fn failed_expense_mark_does_not_duplicate_the_mirror_outflow() {
    let t = TestApp::new();
    let alice = profile("alice");
    let (budget, expenses) = t.fakes(&alice);
    let expense_id = expenses
        .add_partner_expense("Groceries", "80.00", "40.00", Utc::now() - Duration::days(2))
        .unwrap();
    expenses.fail_mark_for(expense_id);

    let run = t
        .app
        .orchestrator
        .sync_user(&alice, RunTrigger::Manual)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Partial);
    assert!(t
        .app
        .persistence
        .get("alice", Direction::ExpenseToBudget)
        .unwrap()
        .is_none());
    assert_eq!(budget.mirror_transactions().len(), 1);
    assert!(expenses.expense(expense_id).unwrap().comments.is_empty());

    expenses.clear_failures();
    let rerun = t
        .app
        .orchestrator
        .sync_user(&alice, RunTrigger::Manual)
        .await
        .unwrap();
    assert_eq!(rerun.status, RunStatus::Success);
    assert_eq!(rerun.items_for(Direction::ExpenseToBudget).count(), 1);
    let mirror = budget.mirror_transactions();
    assert_eq!(mirror.len(), 1);
    assert_eq!(mirror[0].amount, -40_000);
    assert_eq!(budget.create_calls(), 2);
    assert!(expenses
        .expense(expense_id)
        .unwrap()
        .comments
        .iter()
        .any(|c| c.content == alice.splitwise.marker));
}

#[tokio::test]
async fn deleted_partner_expense_is_never_mirrored() {
    let t = TestApp::new();
    let alice = profile("alice");
    let (budget, expenses) = t.fakes(&alice);
    let kept = expenses
        .add_partner_expense("Lunch", "30.00", "15.00", Utc::now() - Duration::days(1))
        .unwrap();
    let removed = expenses
        .add_partner_expense("Mistake", "99.00", "49.50", Utc::now() - Duration::days(1))
        .unwrap();
    expenses.delete_expense(removed);

    let run = t
        .app
        .orchestrator
        .sync_user(&alice, RunTrigger::Manual)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Success);
    let moved: Vec<_> = run
        .items_for(Direction::ExpenseToBudget)
        .map(|item| item.external_id.clone())
        .collect();
    assert_eq!(moved, vec![kept.to_string()]);
    let mirror = budget.mirror_transactions();
    assert_eq!(mirror.len(), 1);
    assert_eq!(mirror[0].amount, -15_000);
    assert!(expenses.expense(removed).unwrap().comments.is_empty());
}

#[tokio::test]
async fn flagged_refund_does_not_hold_the_checkpoint() {
    let t = TestApp::new();
    let alice = profile("alice");
    let (budget, expenses) = t.fakes(&alice);
    budget.add_pending_outflow(day(), 25_000, "Store refund", None);

    let run = t
        .app
        .orchestrator
        .sync_user(&alice, RunTrigger::Manual)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert!(run.items.is_empty());
    assert!(expenses.expenses().is_empty());
    assert_eq!(
        t.app.persistence.get("alice", Direction::BudgetToExpense).unwrap(),
        Some(Checkpoint::ServerKnowledge(budget.server_knowledge()))
    );
}
