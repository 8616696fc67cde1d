//! Unified API router for memproxy
//!
//! Merges the proxy and admin routers into a single axum `Router` with CORS,
//! request tracing and consistent error bodies.
//!
//! ## Endpoint Map
//!
//! | Prefix                     | Module  | Description                       |
//! |----------------------------|---------|-----------------------------------|
//! | `/health`                  | api     | Liveness probe                    |
//! | `/api/v1/status`           | gateway | Gateway state and counters        |
//! | `/v1/chat/completions`     | gateway | OpenAI-compatible proxy           |
//! | `/api/v1/conversations/*`  | memory  | Inspection, search, edit, delete  |

use crate::error::Error;
use crate::gateway::{proxy_router, Gateway, CONVERSATION_HEADER};
use crate::memory::memory_router;
use axum::{
    extract::State,
    http::{header, HeaderName, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the complete memproxy HTTP application
///
/// Returns a single `Router` ready to be served by `axum::serve`.
pub fn build_app(gateway: Arc<Gateway>, cors_origins: &[String]) -> Router {
    let cors = build_cors(cors_origins);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/status", get(gateway_status))
        .with_state(gateway.clone())
        .merge(proxy_router(gateway.proxy_state()))
        .merge(memory_router(gateway.memory_state()))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

// =============================================================================
// Root handlers
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn gateway_status(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    Json(gateway.status().await)
}

// =============================================================================
// Errors
// =============================================================================

/// API error body: `{"error": {"code", "message"}}`
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    pub error: ApiErrorDetail,
}

/// API error detail
#[derive(Debug, Serialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            error: ApiErrorDetail {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR", message)
    }

    /// Map a crate error onto a status and code.
    pub fn from_error(err: &Error) -> Self {
        let status = match err {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Config(_) | Error::DimensionMismatch { .. } => StatusCode::BAD_REQUEST,
            Error::Degradable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Upstream(_) | Error::Http(_) => StatusCode::BAD_GATEWAY,
            Error::InvariantViolation(_)
            | Error::Persistence(_)
            | Error::Io(_)
            | Error::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(code = err.code(), "Request failed: {}", err);
        }
        Self::new(status, err.code(), err.to_string())
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

// =============================================================================
// CORS
// =============================================================================

fn build_cors(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            HeaderName::from_static(CONVERSATION_HEADER),
        ]);

    if origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        let parsed: Vec<_> = origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        cors.allow_origin(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_check() {
        let resp = health_check().await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn test_build_cors_empty_origins() {
        let _cors = build_cors(&[]);
    }

    #[test]
    fn test_build_cors_with_origins() {
        let _cors = build_cors(&[
            "http://localhost:1420".to_string(),
            "https://app.example.com".to_string(),
        ]);
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            ApiError::from_error(&Error::NotFound("x".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from_error(&Error::Degradable("x".into())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        let err = ApiError::from_error(&Error::Persistence("disk full".into()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.error.code, "PERSISTENCE_ERROR");
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let resp = ApiError::bad_request("nope").into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["code"], "BAD_REQUEST");
        assert_eq!(json["error"]["message"], "nope");
        assert!(json.get("status").is_none());
    }
}
