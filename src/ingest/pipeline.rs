//! Ingestion pipeline
//!
//! Turns one completed exchange into stored memories:
//!
//! ```text
//! extract → normalize → embed (per candidate) → dedup → insert (writer)
//!                                                      ↘ optional summary
//! ```
//!
//! Collaborator failures are degradable. A failed extraction skips the
//! exchange; a failed embedding or insert drops only that candidate.

use crate::config::ProxyConfig;
use crate::error::Result;
use crate::memory::entry::MemoryEntryBuilder;
use crate::memory::similarity::SimilarityMetric;
use crate::memory::writer::MemoryWriter;
use crate::providers::{with_timeout, Embedder, FactExtractor};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// One completed user/assistant turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    pub conversation_id: String,
    pub user_message: String,
    pub assistant_message: String,
    pub turn_ref: Option<String>,
}

/// Outcome counters for one exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Distinct non-empty candidates after normalization
    pub extracted: usize,
    pub stored: usize,
    /// Dropped as too similar to a stored or accepted fact
    pub duplicates: usize,
    /// Dropped by an embedding or persistence failure
    pub failed: usize,
    /// Entries evicted to make room
    pub evicted: usize,
    pub summarized: bool,
}

pub struct IngestPipeline {
    writer: Arc<MemoryWriter>,
    embedder: Arc<dyn Embedder>,
    extractor: Arc<dyn FactExtractor>,
    similarity: SimilarityMetric,
    dedup_threshold: f32,
    summarization: bool,
    embed_timeout: Duration,
    extract_timeout: Duration,
}

impl IngestPipeline {
    pub fn new(
        writer: Arc<MemoryWriter>,
        embedder: Arc<dyn Embedder>,
        extractor: Arc<dyn FactExtractor>,
        config: &ProxyConfig,
    ) -> Self {
        Self {
            writer,
            embedder,
            extractor,
            similarity: config.memory.similarity,
            dedup_threshold: config.memory.dedup_threshold,
            summarization: config.memory.summarization,
            embed_timeout: Duration::from_millis(config.embedding.timeout_ms),
            extract_timeout: Duration::from_millis(config.extraction.timeout_ms),
        }
    }

    /// Process one exchange.
    ///
    /// Returns `Error::Degradable` only when extraction itself fails.
    pub async fn ingest(&self, exchange: &Exchange) -> Result<IngestReport> {
        let conversation_id = exchange.conversation_id.as_str();
        let raw = with_timeout(
            "fact extraction",
            self.extract_timeout,
            self.extractor
                .extract(&exchange.user_message, &exchange.assistant_message),
        )
        .await?;

        let candidates = normalize(raw);
        let mut report = IngestReport {
            extracted: candidates.len(),
            ..Default::default()
        };
        if candidates.is_empty() {
            return Ok(report);
        }

        let embeddings = futures::future::join_all(candidates.iter().map(|text| {
            with_timeout("fact embedding", self.embed_timeout, async move {
                let v = self.embedder.embed(text).await?;
                self.writer.store().check_dimension(&v)?;
                Ok(v)
            })
        }))
        .await;

        let mut accepted: Vec<Vec<f32>> = Vec::new();
        let mut stored_texts = Vec::new();

        for (text, embedding) in candidates.into_iter().zip(embeddings) {
            let embedding = match embedding {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(
                        conversation_id = %conversation_id,
                        "Dropping candidate fact: {}",
                        e
                    );
                    report.failed += 1;
                    continue;
                }
            };

            // Accepted facts may already have been evicted again, so the
            // batch is checked here and the live store inside the writer.
            let duplicate = accepted
                .iter()
                .any(|other| self.similarity.score(&embedding, other) > self.dedup_threshold);
            if duplicate {
                report.duplicates += 1;
                continue;
            }

            let mut builder =
                MemoryEntryBuilder::new(conversation_id, text.clone()).embedding(embedding.clone());
            if let Some(turn) = &exchange.turn_ref {
                builder = builder.source_turn(turn.clone());
            }
            let entry = match builder.build() {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Rejected candidate fact: {}", e);
                    report.failed += 1;
                    continue;
                }
            };

            match self
                .writer
                .insert_if_novel(entry, self.dedup_threshold, self.similarity)
                .await
            {
                Ok(None) => report.duplicates += 1,
                Ok(Some(outcome)) => {
                    report.stored += 1;
                    report.evicted += outcome.evicted.len();
                    accepted.push(embedding);
                    stored_texts.push(text);
                }
                Err(e) => {
                    tracing::warn!(
                        conversation_id = %conversation_id,
                        "Failed to store fact: {}",
                        e
                    );
                    report.failed += 1;
                }
            }
        }

        if self.summarization && !stored_texts.is_empty() {
            report.summarized = self.update_summary(conversation_id, &stored_texts).await;
        }

        tracing::info!(
            conversation_id = %conversation_id,
            extracted = report.extracted,
            stored = report.stored,
            duplicates = report.duplicates,
            failed = report.failed,
            evicted = report.evicted,
            "Exchange ingested"
        );
        Ok(report)
    }

    async fn update_summary(&self, conversation_id: &str, new_facts: &[String]) -> bool {
        let previous = self
            .writer
            .store()
            .meta(conversation_id)
            .await
            .and_then(|m| m.summary);
        let summary = with_timeout(
            "summarization",
            self.extract_timeout,
            self.extractor.summarize(previous.as_deref(), new_facts),
        )
        .await;

        let result = match summary {
            Ok(s) if !s.trim().is_empty() => {
                self.writer
                    .set_summary(conversation_id, Some(s.trim().to_string()))
                    .await
            }
            Ok(_) => return false,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    "Summary not updated: {}",
                    e
                );
                false
            }
        }
    }
}

/// Trim, drop empties and exact duplicates; keeps first-seen order.
pub fn normalize(raw: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.clone()))
        .collect()
}
