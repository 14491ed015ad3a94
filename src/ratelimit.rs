//! Tiered per-user quotas for manually triggered runs.
//!
//! Each request consumes one unit from an hourly and a daily window. Both windows are
//! checked and bumped in one atomic step so concurrent requests cannot overshoot.

use crate::error::SyncError;
use crate::profile::QuotaTier;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Default hourly budget for the free tier.
pub const FREE_HOURLY_LIMIT: u32 = 5;
/// Default daily budget for the free tier.
pub const FREE_DAILY_LIMIT: u32 = 20;
pub const UNLIMITED_HOURLY_LIMIT: u32 = 60;
pub const UNLIMITED_DAILY_LIMIT: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub hourly: u32,
    pub daily: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub free: QuotaLimits,
    pub unlimited: QuotaLimits,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            free: QuotaLimits {
                hourly: FREE_HOURLY_LIMIT,
                daily: FREE_DAILY_LIMIT,
            },
            unlimited: QuotaLimits {
                hourly: UNLIMITED_HOURLY_LIMIT,
                daily: UNLIMITED_DAILY_LIMIT,
            },
        }
    }
}

impl RateLimitConfig {
    pub fn limits_for(&self, tier: QuotaTier) -> QuotaLimits {
        match tier {
            QuotaTier::Free => self.free,
            QuotaTier::Unlimited => self.unlimited,
        }
    }
}

/// A counter bucket such as `hour:2024-03-01T13`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaWindow {
    pub name: &'static str,
    pub key: String,
    pub limit: u32,
}

impl QuotaWindow {
    pub fn for_limits(limits: QuotaLimits, now: DateTime<Utc>) -> Vec<QuotaWindow> {
        vec![
            QuotaWindow {
                name: "hourly",
                key: format!("hour:{}", now.format("%Y-%m-%dT%H")),
                limit: limits.hourly,
            },
            QuotaWindow {
                name: "daily",
                key: format!("day:{}", now.format("%Y-%m-%d")),
                limit: limits.daily,
            },
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    Allowed,
    /// Nothing was consumed; `window` names the first exhausted window.
    Denied { window: &'static str },
}

pub trait QuotaStore: Send + Sync {
    /// Consume one unit from every window, or from none if any is exhausted.
    fn try_consume(&self, user_id: &str, windows: &[QuotaWindow]) -> Result<QuotaDecision>;
}

#[derive(Debug, Default)]
pub struct MemoryQuotaStore {
    counters: Mutex<HashMap<(String, String), u32>>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QuotaStore for MemoryQuotaStore {
    fn try_consume(&self, user_id: &str, windows: &[QuotaWindow]) -> Result<QuotaDecision> {
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| anyhow::anyhow!("quota map lock poisoned"))?;
        for window in windows {
            let used = counters
                .get(&(user_id.to_string(), window.key.clone()))
                .copied()
                .unwrap_or(0);
            if used >= window.limit {
                return Ok(QuotaDecision::Denied {
                    window: window.name,
                });
            }
        }
        for window in windows {
            *counters
                .entry((user_id.to_string(), window.key.clone()))
                .or_insert(0) += 1;
        }
        Ok(QuotaDecision::Allowed)
    }
}

/// Applies the configured tier limits on top of a [`QuotaStore`].
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn QuotaStore>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, store: Arc<dyn QuotaStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn check(
        &self,
        user_id: &str,
        tier: QuotaTier,
        now: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let windows = QuotaWindow::for_limits(self.config.limits_for(tier), now);
        match self.store.try_consume(user_id, &windows)? {
            QuotaDecision::Allowed => {
                debug!("Quota consumed for user {}", user_id);
                Ok(())
            }
            QuotaDecision::Denied { window } => {
                warn!("User {} exceeded the {} sync quota", user_id, window);
                Err(SyncError::RateLimited {
                    user_id: user_id.to_string(),
                    window: window.to_string(),
                })
            }
        }
    }
}
