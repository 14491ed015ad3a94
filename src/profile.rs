//! Validated per-user integration settings.
//!
//! A [`UserProfile`] is only ever produced by validating a
//! [`SyncRequest`](crate::request::SyncRequest), so every field here is known good.

use crate::codec::SplitRatio;
use crate::types::FlagColor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which checkpoint store a user's sync state lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    Memory,
    File,
    #[default]
    Duckdb,
}

impl FromStr for StateBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StateBackend::Memory),
            "file" => Ok(StateBackend::File),
            "duckdb" => Ok(StateBackend::Duckdb),
            other => Err(format!(
                "unknown state backend '{other}' (expected memory, file or duckdb)"
            )),
        }
    }
}

impl fmt::Display for StateBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateBackend::Memory => f.write_str("memory"),
            StateBackend::File => f.write_str("file"),
            StateBackend::Duckdb => f.write_str("duckdb"),
        }
    }
}

/// Quota tier for manually triggered runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaTier {
    #[default]
    Free,
    Unlimited,
}

impl FromStr for QuotaTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(QuotaTier::Free),
            "unlimited" => Ok(QuotaTier::Unlimited),
            other => Err(format!("unknown tier '{other}' (expected free or unlimited)")),
        }
    }
}

/// Ledger A (YNAB) settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YnabSettings {
    pub api_key: String,
    pub budget_id: String,
    /// Account that only records the partner's share.
    pub mirror_account_id: String,
    /// Flag the user sets on outflows that should be shared.
    pub pending_flag: FlagColor,
    /// Flag written once a transaction is synced. `None` clears the flag instead.
    pub synced_flag: Option<FlagColor>,
}

impl fmt::Debug for YnabSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("YnabSettings")
            .field("api_key", &"<redacted>")
            .field("budget_id", &self.budget_id)
            .field("mirror_account_id", &self.mirror_account_id)
            .field("pending_flag", &self.pending_flag)
            .field("synced_flag", &self.synced_flag)
            .finish()
    }
}

/// Ledger B (Splitwise) settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitwiseSettings {
    pub api_key: String,
    /// This user's Splitwise id.
    pub user_id: i64,
    pub partner_id: i64,
    pub group_id: i64,
    /// Comment text that tags an expense as already synced.
    pub marker: String,
    pub currency_code: String,
    pub split_ratio: SplitRatio,
}

impl fmt::Debug for SplitwiseSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitwiseSettings")
            .field("api_key", &"<redacted>")
            .field("user_id", &self.user_id)
            .field("partner_id", &self.partner_id)
            .field("group_id", &self.group_id)
            .field("marker", &self.marker)
            .field("currency_code", &self.currency_code)
            .field("split_ratio", &self.split_ratio)
            .finish()
    }
}

/// Everything needed to run a sync for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub tier: QuotaTier,
    pub state_backend: StateBackend,
    pub ynab: YnabSettings,
    pub splitwise: SplitwiseSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_and_tier_parse() {
        assert_eq!("DuckDB".parse::<StateBackend>().unwrap(), StateBackend::Duckdb);
        assert_eq!("file".parse::<StateBackend>().unwrap(), StateBackend::File);
        assert!("redis".parse::<StateBackend>().is_err());
        assert_eq!("unlimited".parse::<QuotaTier>().unwrap(), QuotaTier::Unlimited);
        assert!("gold".parse::<QuotaTier>().is_err());
    }

    #[test]
    fn debug_output_hides_api_keys() {
        let settings = YnabSettings {
            api_key: "secret-token".into(),
            budget_id: "b".into(),
            mirror_account_id: "m".into(),
            pending_flag: FlagColor::Purple,
            synced_flag: Some(FlagColor::Green),
        };
        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("<redacted>"));
    }
}
