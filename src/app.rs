//! Wiring of stores, ledgers and the orchestrator from an [`AppConfig`].

use crate::config::AppConfig;
use crate::history::RunRecorder;
use crate::ledger::{LedgerFactory, LiveLedgers};
use crate::orchestrator::{OrchestratorConfig, SyncOrchestrator};
use crate::persistence::Persistence;
use crate::ratelimit::RateLimiter;
use crate::state::{CheckpointStores, FileCheckpointStore, MemoryCheckpointStore};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

/// A fully wired sync service.
#[derive(Clone)]
pub struct App {
    pub config: AppConfig,
    pub persistence: Persistence,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub rate_limiter: RateLimiter,
}

impl App {
    /// Open the configured database and talk to the live vendor APIs.
    pub fn open(config: AppConfig) -> Result<Self> {
        let persistence = Persistence::new(config.database_path())?;
        let ledgers = Arc::new(LiveLedgers::new(Duration::from_secs(
            config.sync.request_timeout_secs,
        )));
        Self::with_parts(config, persistence, ledgers)
    }

    pub fn with_parts(
        config: AppConfig,
        persistence: Persistence,
        ledgers: Arc<dyn LedgerFactory>,
    ) -> Result<Self> {
        let durable = Arc::new(persistence.clone());
        let checkpoints = CheckpointStores::new(
            Arc::new(MemoryCheckpointStore::new()),
            Arc::new(FileCheckpointStore::new(config.state_dir())?),
            durable.clone(),
        );
        let orchestrator = SyncOrchestrator::new(
            ledgers,
            checkpoints,
            durable.clone(),
            durable.clone(),
            OrchestratorConfig::from(&config.sync),
        );
        let rate_limiter = RateLimiter::new(config.rate_limit.clone(), durable);

        Ok(Self {
            config,
            persistence,
            orchestrator: Arc::new(orchestrator),
            rate_limiter,
        })
    }

    pub fn recorder(&self) -> Arc<dyn RunRecorder> {
        self.orchestrator.recorder().clone()
    }
}
