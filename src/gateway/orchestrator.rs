//! Proxy orchestration
//!
//! Each chat request walks a fixed sequence of stages:
//!
//! ```text
//! ReceiveRequest → RetrieveContext → AugmentPrompt → ForwardUpstream
//!                → StreamResponse → IngestExchange
//! ```
//!
//! Retrieval is best-effort: any failure moves straight to `AugmentPrompt`
//! with no context, and the request is forwarded unaugmented.

use crate::error::Result;
use crate::ingest::{Exchange, IngestQueue};
use crate::memory::entry::RetrievedMemory;
use crate::memory::retrieval::RetrievalEngine;
use crate::memory::store::EntryStore;
use crate::providers::{ChatUpstream, UpstreamResponse};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Header carrying an explicit conversation id
pub const CONVERSATION_HEADER: &str = "x-conversation-id";

/// Stage of a proxied request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyStage {
    ReceiveRequest,
    RetrieveContext,
    AugmentPrompt,
    ForwardUpstream,
    StreamResponse,
    IngestExchange,
}

/// A request in flight through the proxy.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    stage: ProxyStage,
    pub conversation_id: String,
    /// Text of the last user message
    pub query: Option<String>,
    /// Memories injected into the prompt
    pub memories: Vec<RetrievedMemory>,
    /// Request body to forward
    pub body: Value,
    pub stream: bool,
}

impl ProxyRequest {
    pub fn stage(&self) -> ProxyStage {
        self.stage
    }

    fn advance(&mut self, next: ProxyStage) {
        debug_assert!(next > self.stage, "stage must move forward");
        tracing::debug!(
            conversation_id = %self.conversation_id,
            from = ?self.stage,
            to = ?next,
            "Proxy stage"
        );
        self.stage = next;
    }

    /// Mark the response as streaming back to the client.
    pub fn begin_response(&mut self) {
        self.advance(ProxyStage::StreamResponse);
    }
}

/// Drives requests through retrieval, augmentation, forwarding and ingestion.
pub struct Orchestrator {
    retrieval: Arc<RetrievalEngine>,
    store: Arc<EntryStore>,
    upstream: Arc<dyn ChatUpstream>,
    ingest: Option<IngestQueue>,
    trailing_metadata: bool,
}

impl Orchestrator {
    pub fn new(
        retrieval: Arc<RetrievalEngine>,
        store: Arc<EntryStore>,
        upstream: Arc<dyn ChatUpstream>,
        ingest: Option<IngestQueue>,
        trailing_metadata: bool,
    ) -> Self {
        Self {
            retrieval,
            store,
            upstream,
            ingest,
            trailing_metadata,
        }
    }

    pub fn trailing_metadata(&self) -> bool {
        self.trailing_metadata
    }

    /// Receive, retrieve and augment.
    pub async fn prepare(&self, conversation_header: Option<&str>, body: Value) -> ProxyRequest {
        let conversation_id = resolve_conversation_id(conversation_header, &body);
        let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
        let mut req = ProxyRequest {
            stage: ProxyStage::ReceiveRequest,
            conversation_id,
            query: last_user_message(&body),
            memories: Vec::new(),
            body,
            stream,
        };

        req.advance(ProxyStage::RetrieveContext);
        if let Some(query) = req.query.as_deref() {
            match self.retrieval.retrieve(&req.conversation_id, query).await {
                Ok(memories) => req.memories = memories,
                Err(e) => {
                    tracing::warn!(
                        conversation_id = %req.conversation_id,
                        "Retrieval skipped: {}",
                        e
                    );
                }
            }
        }

        req.advance(ProxyStage::AugmentPrompt);
        let summary = self
            .store
            .meta(&req.conversation_id)
            .await
            .and_then(|m| m.summary);
        augment(&mut req.body, &req.memories, summary.as_deref());
        req
    }

    /// Forward the (augmented) body upstream.
    pub async fn forward(
        &self,
        req: &mut ProxyRequest,
        authorization: Option<&str>,
    ) -> Result<UpstreamResponse> {
        req.advance(ProxyStage::ForwardUpstream);
        self.upstream.chat_completions(&req.body, authorization).await
    }

    /// Queue the completed exchange for ingestion.
    ///
    /// Returns false if there is nothing to ingest or the queue refused it.
    pub fn ingest(&self, req: &mut ProxyRequest, assistant_message: String, turn_ref: Option<String>) -> bool {
        req.advance(ProxyStage::IngestExchange);
        let (Some(queue), Some(user_message)) = (&self.ingest, req.query.clone()) else {
            return false;
        };
        if assistant_message.trim().is_empty() {
            return false;
        }
        queue.submit(Exchange {
            conversation_id: req.conversation_id.clone(),
            user_message,
            assistant_message,
            turn_ref,
        })
    }
}

// =============================================================================
// Request inspection
// =============================================================================

/// Conversation id: header, then the body's `user` field, then a hash of
/// the opening system and user messages.
pub fn resolve_conversation_id(header: Option<&str>, body: &Value) -> String {
    if let Some(id) = header.map(str::trim).filter(|s| !s.is_empty()) {
        return id.to_string();
    }
    if let Some(user) = body
        .get("user")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return user.to_string();
    }

    let messages = messages(body);
    let first_of = |role: &str| {
        messages
            .iter()
            .find(|m| m.get("role").and_then(Value::as_str) == Some(role))
            .map(message_text)
            .unwrap_or_default()
    };

    let mut hasher = Sha256::new();
    hasher.update(first_of("system").as_bytes());
    hasher.update([0u8]);
    hasher.update(first_of("user").as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest[..16].iter().map(|b| format!("{:02x}", b)).collect();
    format!("conv-{}", hex)
}

/// Content of the last `user` message.
pub fn last_user_message(body: &Value) -> Option<String> {
    messages(body)
        .iter()
        .rev()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
        .map(message_text)
        .filter(|t| !t.trim().is_empty())
}

fn messages(body: &Value) -> &[Value] {
    body.get("messages")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Text of a message whose content is a string or an array of parts.
fn message_text(message: &Value) -> String {
    match message.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Insert a memory system message after the leading system messages.
///
/// Leaves the body untouched when there is nothing to inject.
pub fn augment(body: &mut Value, memories: &[RetrievedMemory], summary: Option<&str>) {
    let summary = summary.map(str::trim).filter(|s| !s.is_empty());
    if memories.is_empty() && summary.is_none() {
        return;
    }
    let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) else {
        return;
    };

    let mut content = String::new();
    if !memories.is_empty() {
        content.push_str("Relevant memories from earlier in this conversation:\n");
        for m in memories {
            content.push_str("- ");
            content.push_str(&m.text);
            content.push('\n');
        }
    }
    if let Some(summary) = summary {
        if !content.is_empty() {
            content.push('\n');
        }
        content.push_str("Conversation summary: ");
        content.push_str(summary);
        content.push('\n');
    }

    let at = messages
        .iter()
        .take_while(|m| m.get("role").and_then(Value::as_str) == Some("system"))
        .count();
    messages.insert(
        at,
        serde_json::json!({ "role": "system", "content": content.trim_end() }),
    );
}
