/// API request handlers
use crate::error::SyncError;
use crate::history::{RunRecorder, RunTrigger, SyncRun};
use crate::orchestrator::SyncOrchestrator;
use crate::profile::{QuotaTier, UserProfile};
use crate::ratelimit::RateLimiter;
use crate::report::SyncResponse;
use crate::request::SyncRequest;
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

const DEFAULT_RUN_LIMIT: usize = 20;
const MAX_RUN_LIMIT: usize = 100;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub rate_limiter: RateLimiter,
    /// Users run by `POST /sync/all`.
    pub profiles: Arc<Vec<UserProfile>>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        rate_limiter: RateLimiter,
        profiles: Vec<UserProfile>,
    ) -> Self {
        Self {
            orchestrator,
            rate_limiter,
            profiles: Arc::new(profiles),
            start_time: Instant::now(),
        }
    }

    fn recorder(&self) -> Arc<dyn RunRecorder> {
        self.orchestrator.recorder().clone()
    }

    /// Quota tier from the server's own user list; unknown users get the default tier.
    pub fn tier_for(&self, user_id: &str) -> QuotaTier {
        self.profiles
            .iter()
            .find(|profile| profile.user_id == user_id)
            .map(|profile| profile.tier)
            .unwrap_or_default()
    }

    async fn charge_quota(&self, profile: &UserProfile) -> Result<(), SyncError> {
        let limiter = self.rate_limiter.clone();
        let (user_id, tier) = (profile.user_id.clone(), profile.tier);
        tokio::task::spawn_blocking(move || limiter.check(&user_id, tier, Utc::now()))
            .await
            .map_err(|e| SyncError::persistence(format!("quota task failed: {e}")))?
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub configured_users: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RunsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunsResponse {
    pub user_id: String,
    pub runs: Vec<SyncRun>,
}

/// HTTP status for a refused sync request.
pub fn status_for(err: &SyncError) -> StatusCode {
    match err {
        SyncError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SyncError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        SyncError::RunInProgress(_) => StatusCode::CONFLICT,
        SyncError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn refused(user_id: Option<&str>, err: SyncError) -> Response {
    (status_for(&err), Json(SyncResponse::from_error(user_id, &err))).into_response()
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        configured_users: state.profiles.len(),
    })
}

/// Manual sync for the user described in the body
pub async fn sync(State(state): State<AppState>, Json(request): Json<SyncRequest>) -> Response {
    let mut profile = match request.validate() {
        Ok(profile) => profile,
        Err(err) => {
            tracing::info!("Rejected sync request for '{}': {}", request.user_id, err);
            let user_id = (!request.user_id.is_empty()).then_some(request.user_id.as_str());
            return refused(user_id, err);
        }
    };

    let tier = state.tier_for(&profile.user_id);
    if profile.tier != tier {
        tracing::debug!(
            "Ignoring requested tier {:?} for user {}; using {:?}",
            profile.tier,
            profile.user_id,
            tier
        );
        profile.tier = tier;
    }
    if let Err(err) = state.charge_quota(&profile).await {
        return refused(Some(&profile.user_id), err);
    }

    match state
        .orchestrator
        .sync_user(&profile, RunTrigger::Manual)
        .await
    {
        Ok(run) => (StatusCode::OK, Json(SyncResponse::from_run(&run))).into_response(),
        Err(err) => {
            tracing::warn!("Sync for user {} refused: {}", profile.user_id, err);
            refused(Some(&profile.user_id), err)
        }
    }
}

/// Sync every configured user that still has quota left
pub async fn sync_all(State(state): State<AppState>) -> impl IntoResponse {
    let mut allowed = Vec::with_capacity(state.profiles.len());
    let mut refusals = Vec::new();
    for profile in state.profiles.iter() {
        match state.charge_quota(profile).await {
            Ok(()) => allowed.push(profile.clone()),
            Err(err) => {
                tracing::info!("Skipping user {} in bulk sync: {}", profile.user_id, err);
                refusals.push(SyncResponse::from_error(Some(&profile.user_id), &err));
            }
        }
    }

    let mut responses = state
        .orchestrator
        .sync_all(&allowed, RunTrigger::Manual)
        .await;
    responses.extend(refusals);
    Json(responses)
}

/// Recent runs for one user, newest first
pub async fn list_runs(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<RunsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_RUN_LIMIT).clamp(1, MAX_RUN_LIMIT);
    let recorder = state.recorder();
    let lookup = user_id.clone();
    match tokio::task::spawn_blocking(move || recorder.list_runs(&lookup, limit)).await {
        Ok(Ok(runs)) => Json(RunsResponse { user_id, runs }).into_response(),
        Ok(Err(e)) => {
            tracing::error!("Failed to list runs for user {}: {}", user_id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("persistence_error", e.to_string())),
            )
                .into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new("task_error", e.to_string())),
        )
            .into_response(),
    }
}
