//! Sync orchestration: one user's run end to end, every user concurrently, and the
//! periodic scheduler.

use crate::config::SyncConfig;
use crate::engine::{DirectionReport, ReconciliationEngine};
use crate::error::{Result, SyncError};
use crate::history::{RunRecorder, RunStatus, RunTrigger, SyncRun};
use crate::lease::LeaseStore;
use crate::ledger::LedgerFactory;
use crate::profile::UserProfile;
use crate::report::SyncResponse;
use crate::state::CheckpointStores;
use crate::types::Direction;
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, Semaphore};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub deadline: Duration,
    pub max_concurrent_users: usize,
    pub interval: Duration,
    pub lease_ttl: Duration,
    pub initial_lookback: chrono::Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for OrchestratorConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            deadline: Duration::from_secs(config.deadline_secs),
            max_concurrent_users: config.max_concurrent_users.max(1),
            interval: Duration::from_secs(config.interval_secs.max(1)),
            lease_ttl: Duration::from_secs(config.lease_ttl_secs),
            initial_lookback: chrono::Duration::days(config.initial_lookback_days),
        }
    }
}

/// Called with every finished run.
pub trait RunListener: Send + Sync {
    fn run_finished(&self, run: &SyncRun);
}

impl<F> RunListener for F
where
    F: Fn(&SyncRun) + Send + Sync,
{
    fn run_finished(&self, run: &SyncRun) {
        self(run)
    }
}

/// Derive the terminal status from both directions.
pub fn aggregate_status(reports: &[DirectionReport]) -> RunStatus {
    let any_success = reports.iter().any(|r| r.succeeded() > 0);
    if reports.iter().any(|r| r.interrupted) {
        return if any_success {
            RunStatus::Partial
        } else {
            RunStatus::Error
        };
    }
    if reports.iter().all(DirectionReport::is_clean) {
        return RunStatus::Success;
    }
    if any_success || reports.iter().any(DirectionReport::is_clean) {
        RunStatus::Partial
    } else {
        RunStatus::Error
    }
}

fn summarize_failures(reports: &[DirectionReport]) -> Option<String> {
    let mut parts = Vec::new();
    for report in reports {
        if let Some(err) = &report.fetch_error {
            parts.push(format!("{}: {}", report.direction, err));
        }
        if report.failed() > 0 {
            parts.push(format!(
                "{}: {} of {} records failed",
                report.direction,
                report.failed(),
                report.items.len()
            ));
        }
        if report.interrupted {
            parts.push(format!("{}: {}", report.direction, SyncError::DeadlineExceeded));
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("; "))
    }
}

type UserLocks = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// In-process exclusion for one user; drops its map entry when nobody else holds it.
struct LocalSlot {
    guard: Option<OwnedMutexGuard<()>>,
    user_id: String,
    locks: UserLocks,
}

impl Drop for LocalSlot {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks
            .get(&self.user_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.user_id);
        }
    }
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    ledgers: Arc<dyn LedgerFactory>,
    checkpoints: CheckpointStores,
    recorder: Arc<dyn RunRecorder>,
    leases: Arc<dyn LeaseStore>,
    config: OrchestratorConfig,
    local_locks: UserLocks,
    listener: Option<Arc<dyn RunListener>>,
}

impl SyncOrchestrator {
    pub fn new(
        ledgers: Arc<dyn LedgerFactory>,
        checkpoints: CheckpointStores,
        recorder: Arc<dyn RunRecorder>,
        leases: Arc<dyn LeaseStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            ledgers,
            checkpoints,
            recorder,
            leases,
            config,
            local_locks: Arc::new(Mutex::new(HashMap::new())),
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn RunListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn recorder(&self) -> &Arc<dyn RunRecorder> {
        &self.recorder
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn local_guard(&self, user_id: &str) -> Result<LocalSlot> {
        let lock = {
            let mut locks = self
                .local_locks
                .lock()
                .map_err(|_| SyncError::persistence("user lock map poisoned"))?;
            locks
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = lock
            .try_lock_owned()
            .map_err(|_| SyncError::RunInProgress(user_id.to_string()))?;
        Ok(LocalSlot {
            guard: Some(guard),
            user_id: user_id.to_string(),
            locks: self.local_locks.clone(),
        })
    }

    async fn blocking<T, F>(&self, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        tokio::task::spawn_blocking(call)
            .await
            .map_err(|e| SyncError::persistence(format!("store task failed: {e}")))?
            .map_err(SyncError::from)
    }

    /// Run both directions for one user.
    ///
    /// Refusals (run already in progress, bookkeeping unavailable before the run
    /// exists) come back as `Err`. Once a run is created it is always finalized and
    /// returned, whatever its status.
    pub async fn sync_user(&self, profile: &UserProfile, trigger: RunTrigger) -> Result<SyncRun> {
        let user_id = profile.user_id.clone();
        let _local = self.local_guard(&user_id)?;

        let run = SyncRun::start(&user_id, trigger);
        let ttl = chrono::Duration::from_std(self.config.lease_ttl)
            .unwrap_or_else(|_| chrono::Duration::minutes(15));
        let leases = self.leases.clone();
        let (lease_user, owner) = (user_id.clone(), run.id.clone());
        let acquired = self
            .blocking(move || leases.try_acquire(&lease_user, &owner, ttl, Utc::now()))
            .await?;
        if !acquired {
            warn!("User {} already has a sync run in progress", user_id);
            return Err(SyncError::RunInProgress(user_id));
        }

        let run_id = run.id.clone();
        let result = self.run_with_lease(profile, run).await;

        let leases = self.leases.clone();
        let lease_user = user_id.clone();
        if let Err(err) = self
            .blocking(move || leases.release(&lease_user, &run_id))
            .await
        {
            warn!("Failed to release lease for user {}: {}", user_id, err);
        }

        let run = result?;
        if let Some(listener) = &self.listener {
            listener.run_finished(&run);
        }
        Ok(run)
    }

    async fn run_with_lease(&self, profile: &UserProfile, run: SyncRun) -> Result<SyncRun> {
        let recorder = self.recorder.clone();
        let created = run.clone();
        self.blocking(move || recorder.create_run(&created)).await?;
        info!(
            "Starting {} sync run {} for user {}",
            run.trigger.as_str(),
            run.id,
            run.user_id
        );

        let (status, error) = match self.run_directions(profile, &run.id).await {
            Ok(reports) => {
                let status = aggregate_status(&reports);
                (status, summarize_failures(&reports))
            }
            Err(err) => {
                error!("Sync run {} for user {} aborted: {}", run.id, run.user_id, err);
                (RunStatus::Error, Some(err.to_string()))
            }
        };

        let recorder = self.recorder.clone();
        let run_id = run.id.clone();
        let message = error.clone();
        self.blocking(move || {
            recorder.finish_run(&run_id, status, Utc::now(), message.as_deref())
        })
        .await?;

        let recorder = self.recorder.clone();
        let run_id = run.id.clone();
        let finished = self
            .blocking(move || recorder.get_run(&run_id))
            .await?
            .ok_or_else(|| SyncError::persistence(format!("run {} vanished", run.id)))?;
        info!(
            "Sync run {} for user {} finished: {}",
            finished.id, finished.user_id, finished.status
        );
        Ok(finished)
    }

    async fn run_directions(
        &self,
        profile: &UserProfile,
        run_id: &str,
    ) -> Result<Vec<DirectionReport>> {
        let engine = ReconciliationEngine::new(
            profile.clone(),
            self.ledgers.budget_ledger(profile)?,
            self.ledgers.expense_ledger(profile)?,
            self.checkpoints.select(profile.state_backend),
            self.recorder.clone(),
        )
        .with_deadline(Instant::now() + self.config.deadline)
        .with_initial_lookback(self.config.initial_lookback);

        let mut reports = Vec::with_capacity(2);
        for direction in [Direction::BudgetToExpense, Direction::ExpenseToBudget] {
            let report = engine.run(run_id, direction).await?;
            let stop = report.interrupted;
            reports.push(report);
            if stop {
                debug!("Skipping remaining directions for run {}", run_id);
                break;
            }
        }
        Ok(reports)
    }

    /// Run every profile, at most `max_concurrent_users` at a time.
    pub async fn sync_all(&self, profiles: &[UserProfile], trigger: RunTrigger) -> Vec<SyncResponse> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_users));
        let mut tasks = Vec::with_capacity(profiles.len());

        for profile in profiles {
            let semaphore = semaphore.clone();
            let orchestrator = self.clone();
            let profile = profile.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                match orchestrator.sync_user(&profile, trigger).await {
                    Ok(run) => SyncResponse::from_run(&run),
                    Err(err) => {
                        warn!("Sync for user {} refused: {}", profile.user_id, err);
                        SyncResponse::from_error(Some(&profile.user_id), &err)
                    }
                }
            }));
        }

        let mut responses = Vec::with_capacity(tasks.len());
        for (joined, profile) in join_all(tasks).await.into_iter().zip(profiles) {
            match joined {
                Ok(response) => responses.push(response),
                Err(err) => {
                    error!("Sync task for user {} panicked: {}", profile.user_id, err);
                    responses.push(SyncResponse::from_error(
                        Some(&profile.user_id),
                        &SyncError::persistence(format!("sync task failed: {err}")),
                    ));
                }
            }
        }
        responses
    }

    /// Sync every profile on a fixed interval, forever.
    pub async fn run_scheduler(self: Arc<Self>, profiles: Vec<UserProfile>) {
        info!(
            "Starting scheduler for {} users every {} seconds",
            profiles.len(),
            self.config.interval.as_secs()
        );
        let mut interval = time::interval(self.config.interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            let responses = self.sync_all(&profiles, RunTrigger::Scheduled).await;
            let failed = responses.iter().filter(|r| !r.success).count();
            if failed > 0 {
                warn!("Scheduled cycle finished with {} failed users", failed);
            } else {
                debug!("Scheduled cycle finished for {} users", responses.len());
            }
        }
    }
}
