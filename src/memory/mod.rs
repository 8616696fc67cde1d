//! Per-conversation memory
//!
//! - `store`: entries and conversation metadata, persisted per conversation
//! - `retrieval`: hybrid semantic/recency scoring with MMR selection
//! - `eviction`: keeps each conversation within `max_entries`
//! - `versioning`: append-only revision chain and replay
//! - `writer`: the single mutation path tying the three together

pub mod entry;
pub mod eviction;
pub mod handler;
pub mod retrieval;
pub mod similarity;
pub mod store;
pub mod versioning;
pub mod writer;

pub use entry::{Conversation, ConversationMeta, MemoryEntry, MemoryEntryBuilder, RetrievedMemory};
pub use eviction::EvictionManager;
pub use handler::{memory_router, MemoryState};
pub use retrieval::{AccessTracker, RetrievalEngine, RetrievalParams};
pub use similarity::{RecencyDecay, SimilarityMetric};
pub use store::{EntryPersistence, EntryStore, JsonFilePersistence, MemoryPersistence};
pub use versioning::{
    replay, JsonlRevisionLog, MemoryRevisionLog, Mutation, Revision, RevisionLog,
};
pub use writer::{InsertOutcome, MemoryWriter};
