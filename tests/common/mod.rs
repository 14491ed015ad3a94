#![allow(dead_code)]

use ledger_sync::config::AppConfig;
use ledger_sync::ledger::fake::{FakeBudgetLedger, FakeExpenseLedger, FakeLedgers};
use ledger_sync::{App, Persistence, SyncRequest, UserProfile};
use std::sync::Arc;
use tempfile::TempDir;

pub struct TestApp {
    pub app: App,
    pub ledgers: Arc<FakeLedgers>,
    pub dir: TempDir,
}

impl TestApp {
    /// App backed by a DuckDB file and a state directory under a fresh temp dir.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.database.path = Some(dir.path().join("sync.duckdb"));
        config.state.dir = Some(dir.path().join("state"));
        let persistence = Persistence::new(config.database_path()).unwrap();
        let ledgers = Arc::new(FakeLedgers::new());
        let app = App::with_parts(config, persistence, ledgers.clone()).unwrap();
        Self { app, ledgers, dir }
    }

    pub fn fakes(&self, profile: &UserProfile) -> (Arc<FakeBudgetLedger>, Arc<FakeExpenseLedger>) {
        self.ledgers.for_profile(profile)
    }
}

pub fn request(user_id: &str, backend: &str) -> SyncRequest {
    serde_json::from_value(serde_json::json!({
        "user_id": user_id,
        "state_backend": backend,
        "ynab": {
            "api_key": "ynab-key",
            "budget_id": "6f1c2a52-8a40-4d1b-9c1e-3a7b1e7d0001",
            "mirror_account_id": "6f1c2a52-8a40-4d1b-9c1e-3a7b1e7d0002",
            "pending_flag": "purple",
            "synced_flag": "green"
        },
        "splitwise": {
            "api_key": "sw-key",
            "user_id": 100,
            "partner_id": 200,
            "group_id": 300
        }
    }))
    .unwrap()
}

pub fn profile(user_id: &str) -> UserProfile {
    request(user_id, "duckdb").validate().unwrap()
}
