//! HTTP handlers for memory inspection and administration
//!
//! - GET    /api/v1/conversations: ids with entry counts
//! - GET    /api/v1/conversations/:id: conversation detail
//! - DELETE /api/v1/conversations/:id: delete conversation
//! - GET    /api/v1/conversations/:id/entries: entries (no embeddings)
//! - PUT    /api/v1/conversations/:id/entries/:entryId: replace entry text
//! - GET    /api/v1/conversations/:id/revisions: revision chain
//! - GET    /api/v1/conversations/:id/revisions/:revisionId/state: replayed state
//! - POST   /api/v1/conversations/:id/search: scored retrieval

use crate::api::ApiError;
use crate::error::Error;
use crate::memory::entry::MemoryEntry;
use crate::memory::retrieval::{RetrievalEngine, RetrievalParams};
use crate::memory::store::EntryStore;
use crate::memory::versioning::{replay, Mutation, Revision};
use crate::memory::writer::MemoryWriter;
use crate::providers::{with_timeout, Embedder};
use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Shared state for memory handlers
#[derive(Clone)]
pub struct MemoryState {
    pub store: Arc<EntryStore>,
    pub writer: Arc<MemoryWriter>,
    pub retrieval: Arc<RetrievalEngine>,
    pub embedder: Arc<dyn Embedder>,
    pub embed_timeout: Duration,
}

/// Create the memory admin router
pub fn memory_router(state: MemoryState) -> Router {
    Router::new()
        .route("/api/v1/conversations", get(list_conversations))
        .route(
            "/api/v1/conversations/:id",
            get(get_conversation).delete(delete_conversation),
        )
        .route("/api/v1/conversations/:id/entries", get(list_entries))
        .route(
            "/api/v1/conversations/:id/entries/:entry_id",
            put(update_entry),
        )
        .route("/api/v1/conversations/:id/revisions", get(list_revisions))
        .route(
            "/api/v1/conversations/:id/revisions/:revision_id/state",
            get(revision_state),
        )
        .route("/api/v1/conversations/:id/search", post(search))
        .with_state(state)
}

// =============================================================================
// Views
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConversationSummary {
    id: String,
    entry_count: usize,
    updated_at: DateTime<Utc>,
}

/// Entry without its embedding
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EntryView {
    id: Uuid,
    text: String,
    created_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
    access_count: u32,
    source_turn_ref: Option<String>,
    revision_id: Option<Uuid>,
}

impl From<MemoryEntry> for EntryView {
    fn from(e: MemoryEntry) -> Self {
        Self {
            id: e.id,
            text: e.text,
            created_at: e.created_at,
            last_accessed: e.last_accessed,
            access_count: e.access_count,
            source_turn_ref: e.source_turn_ref,
            revision_id: e.revision_id,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RevisionView {
    id: Uuid,
    parent: Option<Uuid>,
    timestamp: DateTime<Utc>,
    kind: &'static str,
    entry_id: Option<Uuid>,
    /// Entry text after the mutation (before, for removals), or the summary
    text: Option<String>,
}

impl From<Revision> for RevisionView {
    fn from(rev: Revision) -> Self {
        let kind = rev.mutation.kind();
        let (entry_id, text) = match rev.mutation {
            Mutation::Insert { after } | Mutation::Update { after, .. } => {
                (Some(after.id), Some(after.text))
            }
            Mutation::Evict { before } | Mutation::Delete { before } => {
                (Some(before.id), Some(before.text))
            }
            Mutation::Summary { after, .. } => (None, after),
        };
        Self {
            id: rev.id,
            parent: rev.parent,
            timestamp: rev.timestamp,
            kind,
            entry_id,
            text,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReplayView {
    revision_id: Uuid,
    summary: Option<String>,
    entries: Vec<EntryView>,
}

// =============================================================================
// Request types
// =============================================================================

#[derive(Debug, Deserialize)]
struct UpdateEntryRequest {
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest {
    query: String,
    top_k: Option<usize>,
    mmr_lambda: Option<f32>,
    recency_weight: Option<f32>,
    score_threshold: Option<f32>,
}

fn parse_uuid(raw: &str, what: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::bad_request(format!("Invalid {} id: {}", what, raw)))
}

// =============================================================================
// Handlers
// =============================================================================

/// GET /api/v1/conversations
async fn list_conversations(State(state): State<MemoryState>) -> impl IntoResponse {
    let list: Vec<ConversationSummary> = state
        .store
        .conversations()
        .await
        .into_iter()
        .map(|c| ConversationSummary {
            id: c.id,
            entry_count: c.entry_count,
            updated_at: c.updated_at,
        })
        .collect();
    Json(list)
}

/// GET /api/v1/conversations/:id
async fn get_conversation(State(state): State<MemoryState>, Path(id): Path<String>) -> Response {
    match state.store.conversation(&id).await {
        Some(conversation) => Json(conversation).into_response(),
        None => ApiError::not_found(format!("Conversation {} not found", id)).into_response(),
    }
}

/// DELETE /api/v1/conversations/:id
async fn delete_conversation(
    State(state): State<MemoryState>,
    Path(id): Path<String>,
) -> Response {
    match state.writer.delete_conversation(&id).await {
        Ok(removed) => Json(serde_json::json!({
            "id": id,
            "deletedEntries": removed.len(),
        }))
        .into_response(),
        Err(e) => ApiError::from_error(&e).into_response(),
    }
}

/// GET /api/v1/conversations/:id/entries
async fn list_entries(State(state): State<MemoryState>, Path(id): Path<String>) -> Response {
    if state.store.meta(&id).await.is_none() {
        return ApiError::not_found(format!("Conversation {} not found", id)).into_response();
    }
    let entries: Vec<EntryView> = state
        .store
        .list(&id)
        .await
        .into_iter()
        .map(EntryView::from)
        .collect();
    Json(entries).into_response()
}

/// PUT /api/v1/conversations/:id/entries/:entryId
async fn update_entry(
    State(state): State<MemoryState>,
    Path((id, entry_id)): Path<(String, String)>,
    Json(request): Json<UpdateEntryRequest>,
) -> Response {
    let entry_id = match parse_uuid(&entry_id, "entry") {
        Ok(u) => u,
        Err(e) => return e.into_response(),
    };
    let text = request.text.trim().to_string();
    if text.is_empty() {
        return ApiError::bad_request("Entry text must not be empty").into_response();
    }

    let embedding = with_timeout("entry embedding", state.embed_timeout, async {
        let v = state.embedder.embed(&text).await?;
        state.store.check_dimension(&v)?;
        Ok(v)
    })
    .await;
    let embedding = match embedding {
        Ok(v) => v,
        Err(e) => return ApiError::from_error(&e).into_response(),
    };

    match state.writer.update_entry(&id, entry_id, text, embedding).await {
        Ok(entry) => Json(EntryView::from(entry)).into_response(),
        Err(e) => ApiError::from_error(&e).into_response(),
    }
}

/// GET /api/v1/conversations/:id/revisions
async fn list_revisions(State(state): State<MemoryState>, Path(id): Path<String>) -> Response {
    match state.writer.revisions().history(&id).await {
        Ok(history) => {
            let views: Vec<RevisionView> = history.into_iter().map(RevisionView::from).collect();
            Json(views).into_response()
        }
        Err(e) => ApiError::from_error(&e).into_response(),
    }
}

/// GET /api/v1/conversations/:id/revisions/:revisionId/state
async fn revision_state(
    State(state): State<MemoryState>,
    Path((id, revision_id)): Path<(String, String)>,
) -> Response {
    let revision_id = match parse_uuid(&revision_id, "revision") {
        Ok(u) => u,
        Err(e) => return e.into_response(),
    };
    let replayed = match state.writer.revisions().history(&id).await {
        Ok(history) => replay(&history, Some(revision_id)),
        Err(e) => Err(e),
    };
    match replayed {
        Ok(replayed) => Json(ReplayView {
            revision_id,
            summary: replayed.summary,
            entries: replayed.entries.into_iter().map(EntryView::from).collect(),
        })
        .into_response(),
        Err(e) => ApiError::from_error(&e).into_response(),
    }
}

/// POST /api/v1/conversations/:id/search
async fn search(
    State(state): State<MemoryState>,
    Path(id): Path<String>,
    Json(request): Json<SearchRequest>,
) -> Response {
    let defaults = state.retrieval.defaults();
    let params = RetrievalParams {
        top_k: request.top_k.unwrap_or(defaults.top_k),
        mmr_lambda: request.mmr_lambda.unwrap_or(defaults.mmr_lambda),
        recency_weight: request.recency_weight.unwrap_or(defaults.recency_weight),
        score_threshold: request.score_threshold.unwrap_or(defaults.score_threshold),
    };

    match state
        .retrieval
        .retrieve_with(&id, &request.query, &params)
        .await
    {
        Ok(hits) => Json(hits).into_response(),
        // Invalid knobs from the request body are a client error here
        Err(Error::Config(msg)) => ApiError::bad_request(msg).into_response(),
        Err(e) => ApiError::from_error(&e).into_response(),
    }
}
