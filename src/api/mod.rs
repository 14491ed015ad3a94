/// HTTP surface for manual and bulk sync triggers
///
/// This module provides:
/// - `POST /sync` for a single user's manual run
/// - `POST /sync/all` for every configured user, behind `api.api_key` when set
/// - run history and health endpoints

pub mod handlers;
pub mod middleware;
pub mod server;

pub use handlers::{AppState, ErrorResponse, HealthResponse, RunsQuery};
pub use server::ApiServer;
