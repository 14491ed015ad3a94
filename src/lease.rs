//! Per-user run leases.
//!
//! A lease row marks a user as having a run in flight. Rows expire so that a crashed
//! process does not lock a user out forever.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub user_id: String,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

pub trait LeaseStore: Send + Sync {
    /// Take the lease unless another owner holds an unexpired one.
    fn try_acquire(
        &self,
        user_id: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Drop the lease if `owner` still holds it.
    fn release(&self, user_id: &str, owner: &str) -> Result<()>;

    fn current(&self, user_id: &str) -> Result<Option<Lease>>;
}

#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LeaseStore for MemoryLeaseStore {
    fn try_acquire(
        &self,
        user_id: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut leases = self
            .leases
            .lock()
            .map_err(|_| anyhow::anyhow!("lease map lock poisoned"))?;
        if let Some(existing) = leases.get(user_id) {
            if existing.owner != owner && existing.expires_at > now {
                return Ok(false);
            }
        }
        leases.insert(
            user_id.to_string(),
            Lease {
                user_id: user_id.to_string(),
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    fn release(&self, user_id: &str, owner: &str) -> Result<()> {
        let mut leases = self
            .leases
            .lock()
            .map_err(|_| anyhow::anyhow!("lease map lock poisoned"))?;
        if leases.get(user_id).is_some_and(|lease| lease.owner == owner) {
            leases.remove(user_id);
        }
        Ok(())
    }

    fn current(&self, user_id: &str) -> Result<Option<Lease>> {
        let leases = self
            .leases
            .lock()
            .map_err(|_| anyhow::anyhow!("lease map lock poisoned"))?;
        Ok(leases.get(user_id).cloned())
    }
}
