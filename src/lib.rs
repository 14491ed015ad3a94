pub mod app;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod lease;
pub mod ledger;
pub mod orchestrator;
pub mod persistence;
pub mod profile;
pub mod ratelimit;
pub mod report;
pub mod request;
pub mod state;
pub mod translate;
pub mod types;

#[cfg(feature = "api")]
pub mod api;

pub use app::App;
pub use config::AppConfig;
pub use engine::{DirectionReport, ReconciliationEngine};
pub use error::{Result, Service, SyncError};
pub use history::{RunRecorder, RunStatus, RunTrigger, SyncRun, SyncedItem};
pub use orchestrator::{OrchestratorConfig, SyncOrchestrator};
pub use persistence::Persistence;
pub use profile::UserProfile;
pub use report::SyncResponse;
pub use request::SyncRequest;
pub use types::{Checkpoint, Direction};
