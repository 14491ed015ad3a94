//! Application configuration loaded from TOML.

use crate::error::{FieldError, SyncError};
use crate::profile::UserProfile;
use crate::ratelimit::RateLimitConfig;
use crate::request::SyncRequest;
use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "ledger-sync.toml";
const DATABASE_FILE: &str = "ledger-sync.duckdb";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Defaults to the platform data directory.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Directory for the file checkpoint backend.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Wall-clock budget for one user's run.
    pub deadline_secs: u64,
    pub max_concurrent_users: usize,
    /// Scheduler period.
    pub interval_secs: u64,
    pub lease_ttl_secs: u64,
    pub request_timeout_secs: u64,
    pub initial_lookback_days: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            deadline_secs: 300,
            max_concurrent_users: 4,
            interval_secs: 3600,
            lease_ttl_secs: 900,
            request_timeout_secs: 30,
            initial_lookback_days: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub enable_cors: bool,
    /// Required as a bearer token on `POST /sync/all` when set.
    pub api_key: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3030,
            enable_cors: true,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub state: StateConfig,
    pub sync: SyncConfig,
    pub rate_limit: RateLimitConfig,
    pub api: ApiConfig,
    /// Users the scheduler syncs.
    pub users: Vec<SyncRequest>,
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "ledger-sync")
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that break cross-process exclusion.
    pub fn validate(&self) -> Result<()> {
        let sync = &self.sync;
        if sync.deadline_secs == 0 {
            bail!("sync.deadline_secs must be greater than zero");
        }
        // a run must end before its lease can be taken over by another process
        if sync.deadline_secs >= sync.lease_ttl_secs {
            bail!(
                "sync.deadline_secs ({}) must be less than sync.lease_ttl_secs ({})",
                sync.deadline_secs,
                sync.lease_ttl_secs
            );
        }
        Ok(())
    }

    /// `ledger-sync.toml` in the working directory, else the platform config directory.
    pub fn default_path() -> PathBuf {
        let local = PathBuf::from(CONFIG_FILE);
        if local.exists() {
            return local;
        }
        project_dirs()
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
            .unwrap_or(local)
    }

    /// Load from `path`, or the default location; a missing default file yields defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::load(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.database.path.clone().unwrap_or_else(|| {
            project_dirs()
                .map(|dirs| dirs.data_dir().join(DATABASE_FILE))
                .unwrap_or_else(|| PathBuf::from(DATABASE_FILE))
        })
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state.dir.clone().unwrap_or_else(|| {
            project_dirs()
                .map(|dirs| dirs.data_dir().join("state"))
                .unwrap_or_else(|| PathBuf::from("state"))
        })
    }

    /// Validate every configured user, prefixing field errors with the entry index.
    pub fn user_profiles(&self) -> std::result::Result<Vec<UserProfile>, SyncError> {
        let mut profiles = Vec::with_capacity(self.users.len());
        let mut errors = Vec::new();
        for (idx, request) in self.users.iter().enumerate() {
            match request.validate() {
                Ok(profile) => profiles.push(profile),
                Err(SyncError::Validation(fields)) => errors.extend(fields.into_iter().map(|e| {
                    FieldError::new(format!("users[{idx}].{}", e.field), e.message)
                })),
                Err(other) => return Err(other),
            }
        }
        if errors.is_empty() {
            Ok(profiles)
        } else {
            Err(SyncError::Validation(errors))
        }
    }
}
