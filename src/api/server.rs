/// HTTP server wiring
use crate::api::handlers::{health_check, list_runs, sync, sync_all, AppState};
use crate::api::middleware::{require_api_key, ApiKeyAuth};
use crate::config::ApiConfig;
use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub struct ApiServer {
    config: ApiConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: ApiConfig, state: AppState) -> Self {
        Self { config, state }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let auth = ApiKeyAuth::new(self.config.api_key.clone());
        let bulk_routes = Router::new()
            .route("/sync/all", post(sync_all))
            .route_layer(middleware::from_fn_with_state(auth, require_api_key));

        let mut router = Router::new()
            .route("/health", get(health_check))
            .route("/sync", post(sync))
            .route("/users/:user_id/runs", get(list_runs))
            .merge(bulk_routes)
            .with_state(self.state.clone());

        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
            router = router.layer(cors);
        }

        router.layer(TraceLayer::new_for_http())
    }

    pub async fn run(self) -> Result<()> {
        let app = self.build_router();
        let bind_addr: SocketAddr = self
            .bind_address()
            .parse()
            .context("Invalid bind address")?;

        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", bind_addr))?;
        tracing::info!("API server listening on http://{}", bind_addr);
        if self.config.api_key.is_none() && !bind_addr.ip().is_loopback() {
            tracing::warn!(
                "POST /sync/all is reachable on {} without an API key; set api.api_key",
                bind_addr
            );
        }

        axum::serve(listener, app)
            .await
            .context("API server failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{MemoryRunRecorder, RunTrigger};
    use crate::lease::{LeaseStore, MemoryLeaseStore};
    use crate::ledger::fake::FakeLedgers;
    use crate::orchestrator::{OrchestratorConfig, SyncOrchestrator};
    use crate::profile::{QuotaTier, UserProfile};
    use crate::ratelimit::{MemoryQuotaStore, QuotaLimits, RateLimitConfig, RateLimiter};
    use crate::report::SyncResponse;
    use crate::request::tests::valid_request;
    use crate::state::{CheckpointStores, MemoryCheckpointStore};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use chrono::{NaiveDate, Utc};
    use std::sync::Arc;
    use tower::ServiceExt;

    struct Fixture {
        ledgers: Arc<FakeLedgers>,
        leases: Arc<MemoryLeaseStore>,
        router: Router,
    }

    fn fixture(limits: QuotaLimits) -> Fixture {
        fixture_with(limits, ApiConfig::default(), vec![valid_request().validate().unwrap()])
    }

    fn fixture_with(limits: QuotaLimits, api: ApiConfig, profiles: Vec<UserProfile>) -> Fixture {
        let ledgers = Arc::new(FakeLedgers::new());
        let leases = Arc::new(MemoryLeaseStore::new());
        let orchestrator = SyncOrchestrator::new(
            ledgers.clone(),
            CheckpointStores::single(Arc::new(MemoryCheckpointStore::new())),
            Arc::new(MemoryRunRecorder::new()),
            leases.clone(),
            OrchestratorConfig::default(),
        );
        let limiter = RateLimiter::new(
            RateLimitConfig {
                free: limits,
                ..RateLimitConfig::default()
            },
            Arc::new(MemoryQuotaStore::new()),
        );
        let state = AppState::new(Arc::new(orchestrator), limiter, profiles);
        let router = ApiServer::new(api, state).build_router();
        Fixture {
            ledgers,
            leases,
            router,
        }
    }

    fn post_json(uri: &str, body: &serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn request_json() -> serde_json::Value {
        serde_json::to_value(valid_request()).unwrap()
    }

    #[tokio::test]
    async fn health_reports_configured_users() {
        let f = fixture(QuotaLimits { hourly: 5, daily: 20 });
        let response = f
            .router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["configured_users"], 1);
    }

    #[tokio::test]
    async fn sync_returns_moved_records() {
        let f = fixture(QuotaLimits { hourly: 5, daily: 20 });
        let profile = valid_request().validate().unwrap();
        let (budget, _) = f.ledgers.for_profile(&profile);
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        budget.add_pending_outflow(day, -42_500, "Groceries", None);

        let response = f
            .router
            .oneshot(post_json("/sync", &request_json()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: SyncResponse = serde_json::from_value(json_body(response).await).unwrap();
        assert!(body.success);
        assert_eq!(body.budget_to_expense.count, 1);
        assert_eq!(body.budget_to_expense.items[0].description, "Groceries");
    }

    #[tokio::test]
    async fn invalid_request_is_422_with_every_field() {
        let f = fixture(QuotaLimits { hourly: 5, daily: 20 });
        let mut request = request_json();
        request["user_id"] = "".into();
        request["splitwise"]["currency_code"] = "usd".into();

        let response = f.router.oneshot(post_json("/sync", &request)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        let fields: Vec<_> = body["errors"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["field"].as_str().unwrap().to_string())
            .collect();
        assert!(fields.contains(&"user_id".to_string()));
        assert!(fields.contains(&"splitwise.currency_code".to_string()));
    }

    #[tokio::test]
    async fn quota_exhaustion_is_429() {
        let f = fixture(QuotaLimits { hourly: 1, daily: 20 });
        let first = f
            .router
            .clone()
            .oneshot(post_json("/sync", &request_json()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = f
            .router
            .oneshot(post_json("/sync", &request_json()))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(json_body(second).await["error"]
            .as_str()
            .unwrap()
            .contains("hourly"));
    }

    #[tokio::test]
    async fn requested_tier_does_not_lift_the_quota() {
        let f = fixture(QuotaLimits { hourly: 1, daily: 20 });
        let mut request = request_json();
        request["tier"] = "unlimited".into();

        let first = f
            .router
            .clone()
            .oneshot(post_json("/sync", &request))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = f.router.oneshot(post_json("/sync", &request)).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn configured_tier_applies_to_manual_sync() {
        let mut configured = valid_request().validate().unwrap();
        configured.tier = QuotaTier::Unlimited;
        let f = fixture_with(
            QuotaLimits { hourly: 1, daily: 1 },
            ApiConfig::default(),
            vec![configured],
        );
        for _ in 0..3 {
            let response = f
                .router
                .clone()
                .oneshot(post_json("/sync", &request_json()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn bulk_sync_requires_the_configured_key() {
        let api = ApiConfig {
            api_key: Some("bulk-secret".to_string()),
            ..ApiConfig::default()
        };
        let f = fixture_with(
            QuotaLimits { hourly: 5, daily: 20 },
            api,
            vec![valid_request().validate().unwrap()],
        );

        let anonymous = f
            .router
            .clone()
            .oneshot(post_json("/sync/all", &serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

        let mut wrong = post_json("/sync/all", &serde_json::json!({}));
        wrong
            .headers_mut()
            .insert("authorization", "Bearer nope".parse().unwrap());
        let wrong = f.router.clone().oneshot(wrong).await.unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let mut authorized = post_json("/sync/all", &serde_json::json!({}));
        authorized
            .headers_mut()
            .insert("authorization", "Bearer bulk-secret".parse().unwrap());
        let authorized = f.router.clone().oneshot(authorized).await.unwrap();
        assert_eq!(authorized.status(), StatusCode::OK);

        let health = f
            .router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn bulk_sync_spends_each_users_quota() {
        let f = fixture(QuotaLimits { hourly: 1, daily: 20 });
        let first = f
            .router
            .clone()
            .oneshot(post_json("/sync/all", &serde_json::json!({})))
            .await
            .unwrap();
        let body = json_body(first).await;
        assert_eq!(body[0]["success"], true);

        let second = f
            .router
            .oneshot(post_json("/sync/all", &serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        let body = json_body(second).await;
        let responses = body.as_array().unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["success"], false);
        assert!(responses[0]["error"].as_str().unwrap().contains("hourly"));
    }

    #[tokio::test]
    async fn held_lease_is_409() {
        let f = fixture(QuotaLimits { hourly: 5, daily: 20 });
        f.leases
            .try_acquire("alice", "elsewhere", chrono::Duration::minutes(5), Utc::now())
            .unwrap();
        let response = f
            .router
            .oneshot(post_json("/sync", &request_json()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn runs_are_listed_newest_first() {
        let f = fixture(QuotaLimits { hourly: 5, daily: 20 });
        for _ in 0..2 {
            let response = f
                .router
                .clone()
                .oneshot(post_json("/sync", &request_json()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let all = f
            .router
            .clone()
            .oneshot(post_json("/sync/all", &serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(json_body(all).await.as_array().unwrap().len(), 1);

        let response = f
            .router
            .oneshot(
                Request::get("/users/alice/runs?limit=2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        let runs = body["runs"].as_array().unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0]["trigger"], RunTrigger::Manual.as_str());
        assert!(runs[0]["id"].as_str().unwrap() > runs[1]["id"].as_str().unwrap());
    }
}
