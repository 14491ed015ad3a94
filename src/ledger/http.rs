use crate::error::{Result, Service, SyncError};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

pub(crate) fn build_client(service: Service, timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| SyncError::unavailable(service, format!("failed to build HTTP client: {e}")))
}

/// Map a transport failure. Everything that never produced a response is retryable.
pub(crate) fn transport_error(service: Service, err: reqwest::Error) -> SyncError {
    let message = if err.is_timeout() {
        format!("request timed out: {err}")
    } else {
        format!("request failed: {err}")
    };
    SyncError::unavailable(service, message)
}

/// Statuses that will likely clear up on their own.
pub(crate) fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

pub(crate) fn status_error(service: Service, status: StatusCode, body: &str) -> SyncError {
    let body = body.trim();
    let message = if body.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("no response body")
            .to_string()
    } else {
        body.chars().take(500).collect()
    };
    if is_retryable(status) {
        SyncError::unavailable(service, format!("HTTP {}: {message}", status.as_u16()))
    } else {
        SyncError::rejected(service, Some(status.as_u16()), message)
    }
}

/// Check the status and decode a JSON body.
pub(crate) async fn decode<T: DeserializeOwned>(service: Service, response: Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(status_error(service, status, &body));
    }
    let body = response
        .text()
        .await
        .map_err(|e| transport_error(service, e))?;
    serde_json::from_str(&body).map_err(|e| {
        SyncError::rejected(
            service,
            Some(status.as_u16()),
            format!("failed to parse response: {e}"),
        )
    })
}
