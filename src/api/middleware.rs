/// API key check for the bulk trigger
use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

/// Shared secret guarding routes that act on every configured user
#[derive(Debug, Clone, Default)]
pub struct ApiKeyAuth {
    api_key: Option<Arc<str>>,
}

impl ApiKeyAuth {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.is_empty()).map(Arc::from),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    /// Accepts anything when no key is configured.
    pub fn validate(&self, key: &str) -> bool {
        match &self.api_key {
            Some(expected) => expected.as_ref() == key,
            None => true,
        }
    }
}

/// `Authorization: Bearer <key>` or the bare key.
fn presented_key(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    Some(raw.strip_prefix("Bearer ").unwrap_or(raw).trim())
}

pub async fn require_api_key(
    State(auth): State<ApiKeyAuth>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if !auth.is_enabled() {
        return Ok(next.run(request).await);
    }
    match presented_key(request.headers()) {
        Some(key) if auth.validate(key) => Ok(next.run(request).await),
        _ => {
            tracing::warn!("Rejected {} without a valid API key", request.uri().path());
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
