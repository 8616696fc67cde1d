//! Memory entry and conversation data types
//!
//! A `MemoryEntry` is one stored fact: its text, the embedding computed for
//! it, and the bookkeeping the retrieval and eviction policies read. Every
//! entry belongs to exactly one conversation.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stored fact scoped to a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Unique entry identifier
    pub id: Uuid,
    /// Owning conversation
    pub conversation_id: String,
    /// Fact text
    pub text: String,
    /// Embedding of `text`; dimension fixed by the store
    pub embedding: Vec<f32>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last time retrieval returned this entry (creation time until then)
    pub last_accessed: DateTime<Utc>,
    /// Number of times retrieval returned this entry
    pub access_count: u32,
    /// Turn the fact was extracted from
    #[serde(default)]
    pub source_turn_ref: Option<String>,
    /// Revision that produced the current state of this entry
    #[serde(default)]
    pub revision_id: Option<Uuid>,
}

impl MemoryEntry {
    /// Record an access, incrementing the counter and updating the timestamp.
    pub fn record_access(&mut self) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_accessed = Utc::now();
    }

    /// Age in seconds relative to `now`.
    pub fn age_secs(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_milliseconds() as f64 / 1000.0
    }
}

/// Builder for constructing `MemoryEntry` instances
pub struct MemoryEntryBuilder {
    conversation_id: String,
    text: String,
    embedding: Vec<f32>,
    created_at: Option<DateTime<Utc>>,
    source_turn_ref: Option<String>,
}

impl MemoryEntryBuilder {
    pub fn new(conversation_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            text: text.into(),
            embedding: Vec::new(),
            created_at: None,
            source_turn_ref: None,
        }
    }

    pub fn embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }

    /// Override the creation time (defaults to now)
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    pub fn source_turn(mut self, turn_ref: impl Into<String>) -> Self {
        self.source_turn_ref = Some(turn_ref.into());
        self
    }

    /// Build the entry.
    ///
    /// Returns an error if the text is blank or the embedding is empty.
    pub fn build(self) -> Result<MemoryEntry> {
        if self.text.trim().is_empty() {
            return Err(Error::Config("Memory entry text must not be empty".into()));
        }
        if self.embedding.is_empty() {
            return Err(Error::DimensionMismatch {
                expected: 1,
                actual: 0,
            });
        }
        let created_at = self.created_at.unwrap_or_else(Utc::now);
        Ok(MemoryEntry {
            id: Uuid::new_v4(),
            conversation_id: self.conversation_id,
            text: self.text,
            embedding: self.embedding,
            created_at,
            last_accessed: created_at,
            access_count: 0,
            source_turn_ref: self.source_turn_ref,
            revision_id: None,
        })
    }
}

/// Persisted per-conversation metadata.
///
/// Entry membership is not stored here; it is always derived from the
/// entries themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMeta {
    pub id: String,
    /// Rolling summary, when summarization is enabled
    #[serde(default)]
    pub summary: Option<String>,
    /// Latest revision in this conversation's chain
    #[serde(default)]
    pub head_revision: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationMeta {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            summary: None,
            head_revision: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Read-only view of a conversation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    /// Entry ids in insertion order
    pub entry_ids: Vec<Uuid>,
    /// Always `entry_ids.len()`
    pub entry_count: usize,
    pub summary: Option<String>,
    pub head_revision: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub(crate) fn from_parts(meta: &ConversationMeta, entries: &[MemoryEntry]) -> Self {
        let entry_ids: Vec<Uuid> = entries.iter().map(|e| e.id).collect();
        Self {
            id: meta.id.clone(),
            entry_count: entry_ids.len(),
            entry_ids,
            summary: meta.summary.clone(),
            head_revision: meta.head_revision,
            created_at: meta.created_at,
            updated_at: meta.updated_at,
        }
    }
}

/// A retrieval hit with the scores that selected it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievedMemory {
    pub id: Uuid,
    pub text: String,
    pub semantic_score: f32,
    pub recency_score: f32,
    pub combined_score: f32,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let entry = MemoryEntryBuilder::new("conv-1", "User prefers Rust")
            .embedding(vec![0.1, 0.2])
            .source_turn("turn-3")
            .build()
            .unwrap();
        assert_eq!(entry.conversation_id, "conv-1");
        assert_eq!(entry.access_count, 0);
        assert_eq!(entry.last_accessed, entry.created_at);
        assert_eq!(entry.source_turn_ref.as_deref(), Some("turn-3"));
        assert!(entry.revision_id.is_none());
    }

    #[test]
    fn test_builder_rejects_blank_text_and_empty_embedding() {
        assert!(MemoryEntryBuilder::new("c", "   ")
            .embedding(vec![1.0])
            .build()
            .is_err());
        assert!(matches!(
            MemoryEntryBuilder::new("c", "fact").build(),
            Err(Error::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_record_access() {
        let mut entry = MemoryEntryBuilder::new("c", "fact")
            .embedding(vec![1.0])
            .created_at(Utc::now() - chrono::Duration::hours(1))
            .build()
            .unwrap();
        let before = entry.last_accessed;
        entry.record_access();
        entry.record_access();
        assert_eq!(entry.access_count, 2);
        assert!(entry.last_accessed > before);
    }

    #[test]
    fn test_entry_serde_tolerates_missing_optionals() {
        let json = serde_json::json!({
            "id": Uuid::new_v4(),
            "conversation_id": "c",
            "text": "fact",
            "embedding": [1.0, 0.0],
            "created_at": "2026-01-01T00:00:00Z",
            "last_accessed": "2026-01-01T00:00:00Z",
            "access_count": 4
        });
        let entry: MemoryEntry = serde_json::from_value(json).unwrap();
        assert_eq!(entry.access_count, 4);
        assert!(entry.source_turn_ref.is_none());
    }

    #[test]
    fn test_conversation_count_is_derived() {
        let meta = ConversationMeta::new("c");
        let entries: Vec<MemoryEntry> = (0..3)
            .map(|i| {
                MemoryEntryBuilder::new("c", format!("fact {}", i))
                    .embedding(vec![1.0])
                    .build()
                    .unwrap()
            })
            .collect();
        let conv = Conversation::from_parts(&meta, &entries);
        assert_eq!(conv.entry_count, 3);
        assert_eq!(conv.entry_ids[0], entries[0].id);
        let json = serde_json::to_value(&conv).unwrap();
        assert_eq!(json["entryCount"], 3);
    }
}
