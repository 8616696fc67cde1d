//! Retrieval engine: hybrid scoring plus MMR selection
//!
//! ```text
//! semantic = clamp(similarity(query, entry), 0, 1)
//! recency  = decay(now - created_at)
//! combined = (1 - w) * semantic + w * recency
//! ```
//!
//! Candidates below `score_threshold` are dropped, then Maximal Marginal
//! Relevance picks up to `top_k`:
//!
//! ```text
//! mmr(d) = λ * combined(d) - (1 - λ) * max_sim(d, selected)
//! ```
//!
//! Ties are broken by combined score, then earliest creation, then id.

use crate::config::MemoryConfig;
use crate::error::{Error, Result};
use crate::memory::entry::{MemoryEntry, RetrievedMemory};
use crate::memory::similarity::{RecencyDecay, SimilarityMetric};
use crate::memory::store::EntryStore;
use crate::providers::{with_timeout, Embedder};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Per-query retrieval knobs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrievalParams {
    pub top_k: usize,
    pub mmr_lambda: f32,
    pub recency_weight: f32,
    pub score_threshold: f32,
}

impl From<&MemoryConfig> for RetrievalParams {
    fn from(config: &MemoryConfig) -> Self {
        Self {
            top_k: config.top_k,
            mmr_lambda: config.mmr_lambda,
            recency_weight: config.recency_weight,
            score_threshold: config.score_threshold,
        }
    }
}

impl RetrievalParams {
    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(Error::Config("top_k must be >= 1".into()));
        }
        for (name, v) in [
            ("mmr_lambda", self.mmr_lambda),
            ("recency_weight", self.recency_weight),
            ("score_threshold", self.score_threshold),
        ] {
            if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                return Err(Error::Config(format!("{} must be within [0, 1]", name)));
            }
        }
        Ok(())
    }
}

/// An entry with its scores for one query. Never persisted.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub entry: MemoryEntry,
    pub semantic_score: f32,
    pub recency_score: f32,
    pub combined_score: f32,
}

impl From<ScoredCandidate> for RetrievedMemory {
    fn from(c: ScoredCandidate) -> Self {
        Self {
            id: c.entry.id,
            text: c.entry.text,
            semantic_score: c.semantic_score,
            recency_score: c.recency_score,
            combined_score: c.combined_score,
            created_at: c.entry.created_at,
        }
    }
}

// =============================================================================
// Scoring and selection
// =============================================================================

/// Score every entry against the query vector.
pub fn score_entries(
    entries: Vec<MemoryEntry>,
    query: &[f32],
    params: &RetrievalParams,
    similarity: SimilarityMetric,
    decay: RecencyDecay,
    now: DateTime<Utc>,
) -> Vec<ScoredCandidate> {
    let w = params.recency_weight;
    entries
        .into_iter()
        .map(|entry| {
            let semantic_score = similarity.score(query, &entry.embedding);
            let recency_score = decay.score(entry.age_secs(now));
            let combined_score = (1.0 - w) * semantic_score + w * recency_score;
            ScoredCandidate {
                entry,
                semantic_score,
                recency_score,
                combined_score,
            }
        })
        .collect()
}

/// Iterative MMR selection of up to `top_k` candidates, in pick order.
pub fn mmr_select(
    mut remaining: Vec<ScoredCandidate>,
    top_k: usize,
    lambda: f32,
    similarity: SimilarityMetric,
) -> Vec<ScoredCandidate> {
    let mut selected: Vec<ScoredCandidate> = Vec::with_capacity(top_k.min(remaining.len()));
    // max similarity of each remaining candidate to anything selected so far
    let mut max_sim = vec![0.0_f32; remaining.len()];

    while selected.len() < top_k && !remaining.is_empty() {
        let mmr = |i: usize| lambda * remaining[i].combined_score - (1.0 - lambda) * max_sim[i];

        let mut best = 0;
        for i in 1..remaining.len() {
            let ord = mmr(i)
                .total_cmp(&mmr(best))
                .then_with(|| tie_break(&remaining[i], &remaining[best]));
            if ord == Ordering::Greater {
                best = i;
            }
        }

        let picked = remaining.swap_remove(best);
        max_sim.swap_remove(best);
        for (i, c) in remaining.iter().enumerate() {
            let s = similarity.score(&c.entry.embedding, &picked.entry.embedding);
            if s > max_sim[i] {
                max_sim[i] = s;
            }
        }
        selected.push(picked);
    }
    selected
}

/// `Greater` means `a` should be picked before `b`.
fn tie_break(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    a.combined_score
        .total_cmp(&b.combined_score)
        .then_with(|| b.entry.created_at.cmp(&a.entry.created_at))
        .then_with(|| b.entry.id.cmp(&a.entry.id))
}

/// Threshold filter plus MMR over already-embedded entries.
pub fn rank(
    entries: Vec<MemoryEntry>,
    query: &[f32],
    params: &RetrievalParams,
    similarity: SimilarityMetric,
    decay: RecencyDecay,
    now: DateTime<Utc>,
) -> Vec<ScoredCandidate> {
    let candidates: Vec<ScoredCandidate> =
        score_entries(entries, query, params, similarity, decay, now)
            .into_iter()
            .filter(|c| c.combined_score >= params.score_threshold)
            .collect();
    mmr_select(candidates, params.top_k, params.mmr_lambda, similarity)
}

// =============================================================================
// Access tracking
// =============================================================================

/// Bounded, lossy queue of access-stat updates.
#[derive(Clone)]
pub struct AccessTracker {
    tx: mpsc::Sender<Uuid>,
}

impl AccessTracker {
    /// Spawn the drain task. Must be called inside a Tokio runtime.
    pub fn spawn(store: Arc<EntryStore>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Uuid>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(id) = rx.recv().await {
                store.update_access(id).await;
            }
        });
        Self { tx }
    }

    /// Enqueue bumps; drops them when the queue is full.
    pub fn record(&self, ids: impl IntoIterator<Item = Uuid>) {
        for id in ids {
            if let Err(e) = self.tx.try_send(id) {
                tracing::debug!(entry_id = %id, "Dropping access update: {}", e);
            }
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Read path: embeds the query and ranks a conversation's entries.
pub struct RetrievalEngine {
    store: Arc<EntryStore>,
    embedder: Arc<dyn Embedder>,
    embed_timeout: Duration,
    similarity: SimilarityMetric,
    decay: RecencyDecay,
    defaults: RetrievalParams,
    access: Option<AccessTracker>,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<EntryStore>,
        embedder: Arc<dyn Embedder>,
        config: &MemoryConfig,
        embed_timeout: Duration,
    ) -> Self {
        Self {
            store,
            embedder,
            embed_timeout,
            similarity: config.similarity,
            decay: config.recency_decay,
            defaults: RetrievalParams::from(config),
            access: None,
        }
    }

    /// Bump access stats of returned entries through `tracker`.
    pub fn with_access_tracker(mut self, tracker: AccessTracker) -> Self {
        self.access = Some(tracker);
        self
    }

    pub fn defaults(&self) -> RetrievalParams {
        self.defaults
    }

    /// Retrieve with the configured defaults.
    pub async fn retrieve(
        &self,
        conversation_id: &str,
        query: &str,
    ) -> Result<Vec<RetrievedMemory>> {
        self.retrieve_with(conversation_id, query, &self.defaults).await
    }

    /// Retrieve with explicit parameters.
    ///
    /// Embedding failures come back as `Error::Degradable`.
    pub async fn retrieve_with(
        &self,
        conversation_id: &str,
        query: &str,
        params: &RetrievalParams,
    ) -> Result<Vec<RetrievedMemory>> {
        params.validate()?;
        let entries = self.store.list(conversation_id).await;
        if entries.is_empty() || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let query_vec = with_timeout("query embedding", self.embed_timeout, async {
            let v = self.embedder.embed(query).await?;
            self.store.check_dimension(&v)?;
            Ok(v)
        })
        .await?;

        let picked = rank(
            entries,
            &query_vec,
            params,
            self.similarity,
            self.decay,
            Utc::now(),
        );

        if let Some(tracker) = &self.access {
            tracker.record(picked.iter().map(|c| c.entry.id));
        }

        tracing::debug!(
            conversation_id = %conversation_id,
            returned = picked.len(),
            "Retrieved memories"
        );
        Ok(picked.into_iter().map(RetrievedMemory::from).collect())
    }
}
