mod common;

use chrono::Utc;
use common::TestApp;
use ledger_sync::profile::QuotaTier;
use ledger_sync::SyncError;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_never_exceed_the_hourly_quota() {
    let t = TestApp::new();
    let limiter = t.app.rate_limiter.clone();
    let hourly = limiter.config().free.hourly as usize;

    let mut tasks = Vec::new();
    for _ in 0..(hourly + 7) {
        let limiter = limiter.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            limiter.check("alice", QuotaTier::Free, Utc::now())
        }));
    }

    let mut allowed = 0;
    let mut denied = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(()) => allowed += 1,
            Err(SyncError::RateLimited { .. }) => denied += 1,
            Err(other) => panic!("unexpected error {other}"),
        }
    }
    assert_eq!(allowed, hourly);
    assert_eq!(denied, 7);
}

#[tokio::test]
async fn unlimited_tier_uses_its_own_budget() {
    let t = TestApp::new();
    let limiter = t.app.rate_limiter.clone();
    for _ in 0..10 {
        limiter.check("bob", QuotaTier::Unlimited, Utc::now()).unwrap();
    }
}
