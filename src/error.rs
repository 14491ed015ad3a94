//! Error taxonomy for the reconciliation core.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which external ledger an upstream error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Service {
    Ynab,
    Splitwise,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Service::Ynab => write!(f, "YNAB"),
            Service::Splitwise => write!(f, "Splitwise"),
        }
    }
}

/// A single field-level validation failure on an inbound sync request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn join_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

/// Errors raised by the reconciliation core.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Invalid sync request: {}", join_field_errors(.0))]
    Validation(Vec<FieldError>),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Cannot translate record: {0}")]
    Translation(String),

    #[error("{service} unavailable: {message}")]
    UpstreamUnavailable { service: Service, message: String },

    #[error("{service} rejected the request{}: {message}", status_suffix(.status))]
    UpstreamRejected {
        service: Service,
        status: Option<u16>,
        message: String,
    },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("A sync run is already in progress for user {0}")]
    RunInProgress(String),

    #[error("Rate limit exceeded for user {user_id} ({window} window)")]
    RateLimited { user_id: String, window: String },

    #[error("Sync deadline exceeded")]
    DeadlineExceeded,
}

impl SyncError {
    pub fn persistence(err: impl fmt::Display) -> Self {
        SyncError::Persistence(err.to_string())
    }

    pub fn unavailable(service: Service, message: impl Into<String>) -> Self {
        SyncError::UpstreamUnavailable {
            service,
            message: message.into(),
        }
    }

    pub fn rejected(service: Service, status: Option<u16>, message: impl Into<String>) -> Self {
        SyncError::UpstreamRejected {
            service,
            status,
            message: message.into(),
        }
    }

    /// Stable machine-readable class, stored on failed synced items.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Validation(_) => "validation",
            SyncError::InvalidAmount(_) => "invalid_amount",
            SyncError::Translation(_) => "translation",
            SyncError::UpstreamUnavailable { .. } => "upstream_unavailable",
            SyncError::UpstreamRejected { .. } => "upstream_rejected",
            SyncError::Persistence(_) => "persistence",
            SyncError::RunInProgress(_) => "run_in_progress",
            SyncError::RateLimited { .. } => "rate_limited",
            SyncError::DeadlineExceeded => "deadline_exceeded",
        }
    }

    /// Errors that abort a whole run rather than a single record.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Persistence(_) | SyncError::DeadlineExceeded
        )
    }
}

impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        SyncError::Persistence(format!("{err:#}"))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
