//! OpenAI-compatible chat completions endpoint
//!
//! - POST /v1/chat/completions: augment, forward, relay, then ingest

use crate::api::ApiError;
use crate::gateway::orchestrator::{Orchestrator, CONVERSATION_HEADER};
use crate::gateway::stream::{
    completion_text, deliver, relay, trailing_comment, SseAccumulator,
};
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use serde_json::Value;
use std::sync::Arc;

/// Response header carrying the number of injected memories
pub const MEMORIES_HEADER: &str = "x-memproxy-memories";

/// Shared state for the proxy endpoint
#[derive(Clone)]
pub struct ProxyState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Create the proxy router
pub fn proxy_router(state: ProxyState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(state)
}

fn header_str<'a>(headers: &'a HeaderMap, name: impl header::AsHeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// POST /v1/chat/completions
async fn chat_completions(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let body: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return ApiError::bad_request(format!("Invalid JSON body: {}", e)).into_response();
        }
    };
    if !body.get("messages").map(Value::is_array).unwrap_or(false) {
        return ApiError::bad_request("`messages` must be an array").into_response();
    }

    let orchestrator = state.orchestrator;
    let mut req = orchestrator
        .prepare(header_str(&headers, CONVERSATION_HEADER), body)
        .await;

    let upstream = match orchestrator
        .forward(&mut req, header_str(&headers, header::AUTHORIZATION))
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            tracing::warn!(conversation_id = %req.conversation_id, "Upstream request failed: {}", e);
            return ApiError::bad_gateway(e.to_string()).into_response();
        }
    };

    let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut out_headers = HeaderMap::new();
    if let Some(ct) = upstream
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
    {
        out_headers.insert(header::CONTENT_TYPE, ct);
    }

    // Upstream errors pass through untouched and are never ingested.
    if !status.is_success() {
        return match upstream.collect().await {
            Ok(bytes) => (status, out_headers, Body::from(bytes)).into_response(),
            Err(e) => ApiError::bad_gateway(e.to_string()).into_response(),
        };
    }

    let memories = req.memories.len();
    out_headers.insert(MEMORIES_HEADER, HeaderValue::from(memories));
    if let Ok(id) = HeaderValue::from_str(&req.conversation_id) {
        out_headers.insert(CONVERSATION_HEADER, id);
    }

    req.begin_response();
    if req.stream {
        out_headers
            .entry(header::CONTENT_TYPE)
            .or_insert(HeaderValue::from_static("text/event-stream"));
        let trailer = orchestrator
            .trailing_metadata()
            .then(|| trailing_comment(memories));
        let on_complete = move |acc: SseAccumulator| {
            let turn_ref = acc.response_id().map(str::to_string);
            orchestrator.ingest(&mut req, acc.content().to_string(), turn_ref);
        };
        let stream = relay(upstream.body, trailer, on_complete);
        return (status, out_headers, Body::from_stream(stream)).into_response();
    }

    let bytes = match upstream.collect().await {
        Ok(bytes) => bytes,
        Err(e) => return ApiError::bad_gateway(e.to_string()).into_response(),
    };
    out_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(bytes.len()));
    let completion = completion_text(&bytes);
    if completion.is_none() {
        tracing::debug!(
            conversation_id = %req.conversation_id,
            "No assistant message in response, skipping ingestion"
        );
    }
    let on_delivered = move || {
        if let Some((text, turn_ref)) = completion {
            orchestrator.ingest(&mut req, text, turn_ref);
        }
    };
    let stream = deliver(bytes, on_delivered);
    (status, out_headers, Body::from_stream(stream)).into_response()
}
