//! WebAPI - REST API Endpoints
//!
//! ## Responsibilities
//!
//! - HTTP API routes
//! - API key enforcement
//! - Long-lived stream responses (MJPEG, SSE)

mod routes;

pub use routes::create_router;

use axum::extract::{Query, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint (unauthenticated)
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_sec: state.started_at.elapsed().as_secs(),
    })
}

/// API key middleware.
///
/// Accepts the key as an `X-API-Key` header or `api_key` query parameter
/// (browser `<img>`/`EventSource` elements cannot set custom headers).
/// Disabled entirely when no token is configured.
pub async fn require_api_key(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| params.get("api_key").cloned());

    match check_api_key(state.config.api_token.as_deref(), provided.as_deref()) {
        Ok(()) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}

fn check_api_key(expected: Option<&str>, provided: Option<&str>) -> Result<()> {
    let Some(expected) = expected else {
        return Ok(());
    };
    match provided {
        None => Err(Error::Unauthorized("API key required".to_string())),
        Some(key) if key == expected => Ok(()),
        Some(_) => Err(Error::Forbidden("invalid API key".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_token_disables_check() {
        assert!(check_api_key(None, None).is_ok());
        assert!(check_api_key(None, Some("anything")).is_ok());
    }

    #[test]
    fn test_missing_key_unauthorized() {
        assert!(matches!(
            check_api_key(Some("secret"), None),
            Err(Error::Unauthorized(_))
        ));
    }

    #[test]
    fn test_wrong_key_forbidden() {
        assert!(matches!(
            check_api_key(Some("secret"), Some("nope")),
            Err(Error::Forbidden(_))
        ));
    }

    #[test]
    fn test_matching_key_accepted() {
        assert!(check_api_key(Some("secret"), Some("secret")).is_ok());
    }
}
