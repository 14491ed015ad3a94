//! Inbound sync trigger payload and its validation.

use crate::codec::SplitRatio;
use crate::error::{FieldError, SyncError};
use crate::profile::{QuotaTier, SplitwiseSettings, StateBackend, UserProfile, YnabSettings};
use crate::types::FlagColor;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use uuid::Uuid;

fn pattern_matches(cell: &'static OnceLock<Option<Regex>>, pattern: &str, value: &str) -> bool {
    cell.get_or_init(|| Regex::new(pattern).ok())
        .as_ref()
        .is_some_and(|re| re.is_match(value))
}

fn is_valid_user_id(value: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    pattern_matches(&PATTERN, r"^[A-Za-z0-9][A-Za-z0-9_.@-]{0,127}$", value)
}

fn is_valid_currency(value: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    pattern_matches(&PATTERN, r"^[A-Z]{3}$", value)
}

/// Splitwise ids arrive as JSON numbers from some callers and strings from others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Number(i64),
    Text(String),
}

impl Default for RawId {
    fn default() -> Self {
        RawId::Text(String::new())
    }
}

impl RawId {
    fn parse_positive(&self) -> Result<i64, String> {
        let value = match self {
            RawId::Number(n) => *n,
            RawId::Text(s) if s.trim().is_empty() => return Err("is required".into()),
            RawId::Text(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| format!("'{s}' is not a numeric id"))?,
        };
        if value <= 0 {
            return Err(format!("{value} is not a valid id"));
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct YnabRequest {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub budget_id: String,
    #[serde(default)]
    pub mirror_account_id: String,
    #[serde(default = "default_pending_flag")]
    pub pending_flag: String,
    #[serde(default)]
    pub synced_flag: Option<String>,
}

fn default_pending_flag() -> String {
    FlagColor::Purple.as_str().to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitwiseRequest {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub user_id: RawId,
    #[serde(default)]
    pub partner_id: RawId,
    #[serde(default)]
    pub group_id: RawId,
    #[serde(default = "default_marker")]
    pub marker: String,
    #[serde(default = "default_currency")]
    pub currency_code: String,
    #[serde(default = "default_split_ratio")]
    pub split_ratio: String,
}

fn default_marker() -> String {
    "[ledger-sync]".to_string()
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_split_ratio() -> String {
    "1:1".to_string()
}

/// Manual sync trigger, also the shape of each `[[users]]` entry in the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub state_backend: Option<String>,
    #[serde(default)]
    pub ynab: YnabRequest,
    #[serde(default)]
    pub splitwise: SplitwiseRequest,
}

struct Collector {
    errors: Vec<FieldError>,
}

impl Collector {
    fn push(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(FieldError::new(field, message));
    }

    fn required(&mut self, field: &str, value: &str) -> String {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            self.push(field, "is required");
        }
        trimmed.to_string()
    }

    fn uuid(&mut self, field: &str, value: &str) -> String {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            self.push(field, "is required");
        } else if Uuid::parse_str(trimmed).is_err() {
            self.push(field, format!("'{trimmed}' is not a valid UUID"));
        }
        trimmed.to_string()
    }

    fn id(&mut self, field: &str, value: &RawId) -> i64 {
        value.parse_positive().unwrap_or_else(|message| {
            self.push(field, message);
            0
        })
    }

    fn flag(&mut self, field: &str, value: &str) -> Option<FlagColor> {
        match value.parse::<FlagColor>() {
            Ok(color) => Some(color),
            Err(message) => {
                self.push(field, message);
                None
            }
        }
    }
}

impl SyncRequest {
    /// Check every field and build a [`UserProfile`], or report all problems at once.
    pub fn validate(&self) -> Result<UserProfile, SyncError> {
        let mut c = Collector { errors: Vec::new() };

        let user_id = self.user_id.trim().to_string();
        if user_id.is_empty() {
            c.push("user_id", "is required");
        } else if !is_valid_user_id(&user_id) {
            c.push(
                "user_id",
                "may only contain letters, digits, '.', '_', '@' and '-'",
            );
        }

        let tier = match self.tier.as_deref() {
            None => QuotaTier::default(),
            Some(raw) => raw.parse().unwrap_or_else(|message: String| {
                c.push("tier", message);
                QuotaTier::default()
            }),
        };

        let state_backend = match self.state_backend.as_deref() {
            None => StateBackend::default(),
            Some(raw) => raw.parse().unwrap_or_else(|message: String| {
                c.push("state_backend", message);
                StateBackend::default()
            }),
        };

        let ynab_key = c.required("ynab.api_key", &self.ynab.api_key);
        let budget_id = c.uuid("ynab.budget_id", &self.ynab.budget_id);
        let mirror_account_id = c.uuid("ynab.mirror_account_id", &self.ynab.mirror_account_id);
        let pending_flag = c.flag("ynab.pending_flag", &self.ynab.pending_flag);
        let synced_flag = self
            .ynab
            .synced_flag
            .as_deref()
            .filter(|raw| !raw.trim().is_empty())
            .and_then(|raw| c.flag("ynab.synced_flag", raw));
        if pending_flag.is_some() && pending_flag == synced_flag {
            c.push(
                "ynab.synced_flag",
                "must differ from the pending flag, or synced transactions would be re-read",
            );
        }

        let sw_key = c.required("splitwise.api_key", &self.splitwise.api_key);
        let sw_user = c.id("splitwise.user_id", &self.splitwise.user_id);
        let partner_id = c.id("splitwise.partner_id", &self.splitwise.partner_id);
        let group_id = c.id("splitwise.group_id", &self.splitwise.group_id);
        if sw_user != 0 && sw_user == partner_id {
            c.push("splitwise.partner_id", "must differ from splitwise.user_id");
        }
        let marker = c.required("splitwise.marker", &self.splitwise.marker);

        let currency_code = self.splitwise.currency_code.trim().to_string();
        if !is_valid_currency(&currency_code) {
            c.push(
                "splitwise.currency_code",
                format!("'{currency_code}' must be a three-letter uppercase code"),
            );
        }

        let split_ratio = self
            .splitwise
            .split_ratio
            .parse::<SplitRatio>()
            .unwrap_or_else(|message| {
                c.push("splitwise.split_ratio", message);
                SplitRatio::EQUAL
            });

        if !c.errors.is_empty() {
            return Err(SyncError::Validation(c.errors));
        }

        Ok(UserProfile {
            user_id,
            tier,
            state_backend,
            ynab: YnabSettings {
                api_key: ynab_key,
                budget_id,
                mirror_account_id,
                pending_flag: pending_flag.unwrap_or(FlagColor::Purple),
                synced_flag,
            },
            splitwise: SplitwiseSettings {
                api_key: sw_key,
                user_id: sw_user,
                partner_id,
                group_id,
                marker,
                currency_code,
                split_ratio,
            },
        })
    }
}
