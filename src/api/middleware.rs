/// Credential extraction and request instrumentation
use crate::metrics;
use axum::{
    extract::{MatchedPath, Request},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use std::time::Instant;

pub const ACCESS_KEY_HEADER: &str = "x-access-key";
pub const BOT_TOKEN_HEADER: &str = "x-bot-token";

/// Extract bearer token from Authorization header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Account access key from `X-Access-Key`, falling back to a bearer token
pub fn extract_access_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ACCESS_KEY_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| extract_bearer_token(headers))
}

pub fn extract_bot_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(BOT_TOKEN_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Whether the request presents any credential
pub fn has_credentials(headers: &HeaderMap) -> bool {
    extract_access_key(headers).is_some() || extract_bot_token(headers).is_some()
}

/// Record request count and latency by route template
pub async fn track_requests(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;

    metrics::record_http_request(
        &method,
        &path,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );

    response
}
