//! Entry store with pluggable persistence
//!
//! Directory layout of the file backend:
//! ```text
//! <base>/conversations/
//! ├── <conversation>/
//! │   ├── conversation.json
//! │   └── entries/
//! │       ├── <entry-id>.json
//! │       └── ...
//! └── ...
//! ```
//!
//! Mutations are grouped into a [`StoreBatch`]. A batch is first written to
//! the persistence backend and only then published to the in-memory index,
//! so readers never observe a change that failed to persist. A written batch
//! can be reverted on disk if a later step of the same transaction fails.

use crate::error::{Error, Result};
use crate::memory::entry::{Conversation, ConversationMeta, MemoryEntry};
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

// =============================================================================
// Persistence backends
// =============================================================================

/// Durable storage for entries and conversation metadata.
#[async_trait]
pub trait EntryPersistence: Send + Sync {
    /// Load every conversation with its entries.
    async fn load_all(&self) -> Result<Vec<(ConversationMeta, Vec<MemoryEntry>)>>;

    /// Create or replace one entry.
    async fn write_entry(&self, entry: &MemoryEntry) -> Result<()>;

    /// Remove one entry. Removing a missing entry succeeds.
    async fn remove_entry(&self, conversation_id: &str, id: Uuid) -> Result<()>;

    /// Create or replace conversation metadata.
    async fn write_conversation(&self, meta: &ConversationMeta) -> Result<()>;

    /// Remove a conversation and anything left under it.
    async fn remove_conversation(&self, conversation_id: &str) -> Result<()>;
}

/// No-op backend; state lives only in process memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryPersistence;

#[async_trait]
impl EntryPersistence for MemoryPersistence {
    async fn load_all(&self) -> Result<Vec<(ConversationMeta, Vec<MemoryEntry>)>> {
        Ok(Vec::new())
    }

    async fn write_entry(&self, _entry: &MemoryEntry) -> Result<()> {
        Ok(())
    }

    async fn remove_entry(&self, _conversation_id: &str, _id: Uuid) -> Result<()> {
        Ok(())
    }

    async fn write_conversation(&self, _meta: &ConversationMeta) -> Result<()> {
        Ok(())
    }

    async fn remove_conversation(&self, _conversation_id: &str) -> Result<()> {
        Ok(())
    }
}

/// JSON-file backend: one file per entry, written via temp file + rename.
pub struct JsonFilePersistence {
    conversations_dir: PathBuf,
}

impl JsonFilePersistence {
    pub async fn new(base_dir: &Path) -> Result<Self> {
        let conversations_dir = base_dir.join("conversations");
        tokio::fs::create_dir_all(&conversations_dir)
            .await
            .map_err(|e| {
                Error::Persistence(format!(
                    "Failed to create {}: {}",
                    conversations_dir.display(),
                    e
                ))
            })?;
        Ok(Self { conversations_dir })
    }

    fn conversation_dir(&self, conversation_id: &str) -> PathBuf {
        self.conversations_dir.join(storage_name(conversation_id))
    }

    fn entry_path(&self, conversation_id: &str, id: Uuid) -> PathBuf {
        self.conversation_dir(conversation_id)
            .join("entries")
            .join(format!("{}.json", id))
    }

    /// Load all JSON files from a directory into a Vec
    fn load_json_files<T: serde::de::DeserializeOwned>(dir: &Path) -> Vec<T> {
        let mut items = Vec::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to read directory {}: {}", dir.display(), e);
                }
                return items;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(data) => match serde_json::from_str(&data) {
                    Ok(item) => items.push(item),
                    Err(e) => {
                        tracing::warn!("Failed to parse {}: {}", path.display(), e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read {}: {}", path.display(), e);
                }
            }
        }

        items
    }
}

#[async_trait]
impl EntryPersistence for JsonFilePersistence {
    async fn load_all(&self) -> Result<Vec<(ConversationMeta, Vec<MemoryEntry>)>> {
        let dirs = match std::fs::read_dir(&self.conversations_dir) {
            Ok(dirs) => dirs,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut loaded = Vec::new();
        for dir in dirs.flatten() {
            let path = dir.path();
            if !path.is_dir() {
                continue;
            }
            let entries: Vec<MemoryEntry> = Self::load_json_files(&path.join("entries"));
            let meta_path = path.join("conversation.json");
            let meta = std::fs::read_to_string(&meta_path)
                .ok()
                .and_then(|data| match serde_json::from_str::<ConversationMeta>(&data) {
                    Ok(meta) => Some(meta),
                    Err(e) => {
                        tracing::warn!("Failed to parse {}: {}", meta_path.display(), e);
                        None
                    }
                })
                .or_else(|| {
                    entries
                        .first()
                        .map(|e| ConversationMeta::new(e.conversation_id.clone()))
                });
            match meta {
                Some(meta) => loaded.push((meta, entries)),
                None => tracing::warn!("Skipping empty conversation dir {}", path.display()),
            }
        }
        Ok(loaded)
    }

    async fn write_entry(&self, entry: &MemoryEntry) -> Result<()> {
        let path = self.entry_path(&entry.conversation_id, entry.id);
        write_json_atomic(&path, entry).await
    }

    async fn remove_entry(&self, conversation_id: &str, id: Uuid) -> Result<()> {
        let path = self.entry_path(conversation_id, id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Persistence(format!(
                "Failed to remove {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn write_conversation(&self, meta: &ConversationMeta) -> Result<()> {
        let path = self.conversation_dir(&meta.id).join("conversation.json");
        write_json_atomic(&path, meta).await
    }

    async fn remove_conversation(&self, conversation_id: &str) -> Result<()> {
        let dir = self.conversation_dir(conversation_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Persistence(format!(
                "Failed to remove {}: {}",
                dir.display(),
                e
            ))),
        }
    }
}

/// Directory/file stem for a conversation id.
///
/// Ids that are not plain filenames are replaced by their SHA-256.
pub fn storage_name(conversation_id: &str) -> String {
    let plain = !conversation_id.is_empty()
        && conversation_id.len() <= 128
        && conversation_id != "."
        && conversation_id != ".."
        && conversation_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if plain {
        conversation_id.to_string()
    } else {
        let digest = Sha256::digest(conversation_id.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        format!("h-{}", hex)
    }
}

async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let persist_err =
        |e: std::io::Error| Error::Persistence(format!("Failed to write {}: {}", path.display(), e));
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(persist_err)?;
    }
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4()));
    tokio::fs::write(&tmp, json).await.map_err(persist_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(persist_err)
}

// =============================================================================
// Batches
// =============================================================================

/// Before/after states of a single entry.
///
/// `before: None` is an insert, `after: None` a removal.
#[derive(Debug, Clone)]
pub struct EntryChange {
    pub before: Option<MemoryEntry>,
    pub after: Option<MemoryEntry>,
}

/// Changes to one conversation committed as a unit.
#[derive(Debug, Clone)]
pub struct StoreBatch {
    pub conversation_id: String,
    pub changes: Vec<EntryChange>,
    pub meta_before: Option<ConversationMeta>,
    /// `None` removes the conversation
    pub meta_after: Option<ConversationMeta>,
}

#[derive(Clone, Copy)]
enum Step {
    Meta,
    Entry(usize),
}

impl StoreBatch {
    /// Disk steps in forward order. Metadata is written before entries of a
    /// live conversation and removed after the entries of a deleted one.
    fn steps(&self) -> Vec<Step> {
        let entries = (0..self.changes.len()).map(Step::Entry);
        if self.meta_after.is_some() {
            std::iter::once(Step::Meta).chain(entries).collect()
        } else {
            entries.chain(std::iter::once(Step::Meta)).collect()
        }
    }
}

// =============================================================================
// Entry store
// =============================================================================

struct ConversationState {
    meta: ConversationMeta,
    /// Insertion order
    entries: Vec<MemoryEntry>,
}

#[derive(Default)]
struct StoreInner {
    conversations: HashMap<String, ConversationState>,
    /// entry id -> conversation id
    index: HashMap<Uuid, String>,
}

/// Per-conversation memory store.
pub struct EntryStore {
    dimension: usize,
    persistence: Arc<dyn EntryPersistence>,
    inner: Arc<RwLock<StoreInner>>,
    writer_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EntryStore {
    /// Open a store, loading any persisted state.
    ///
    /// Entries whose embedding does not match `dimension` are skipped.
    pub async fn open(dimension: usize, persistence: Arc<dyn EntryPersistence>) -> Result<Self> {
        let mut inner = StoreInner::default();
        for (meta, mut entries) in persistence.load_all().await? {
            entries.retain(|e| {
                let ok = e.embedding.len() == dimension && e.conversation_id == meta.id;
                if !ok {
                    tracing::warn!(
                        entry_id = %e.id,
                        conversation_id = %meta.id,
                        "Skipping stored entry with mismatched dimension or owner"
                    );
                }
                ok
            });
            entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            for e in &entries {
                inner.index.insert(e.id, meta.id.clone());
            }
            inner
                .conversations
                .insert(meta.id.clone(), ConversationState { meta, entries });
        }

        tracing::debug!(
            conversations = inner.conversations.len(),
            entries = inner.index.len(),
            "Entry store loaded"
        );

        Ok(Self {
            dimension,
            persistence,
            inner: Arc::new(RwLock::new(inner)),
            writer_locks: Mutex::new(HashMap::new()),
        })
    }

    /// In-memory store with no durability
    pub async fn in_memory(dimension: usize) -> Self {
        Self {
            dimension,
            persistence: Arc::new(MemoryPersistence),
            inner: Arc::new(RwLock::new(StoreInner::default())),
            writer_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Reject embeddings of the wrong dimension.
    pub fn check_dimension(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.len(),
            });
        }
        Ok(())
    }

    /// Acquire the single-writer lock for a conversation.
    pub async fn writer_lock(&self, conversation_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.writer_locks.lock().await;
            locks
                .entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn get(&self, id: Uuid) -> Option<MemoryEntry> {
        let inner = self.inner.read().await;
        let conv = inner.index.get(&id)?;
        inner
            .conversations
            .get(conv)?
            .entries
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    /// Entries of a conversation in insertion order
    pub async fn list(&self, conversation_id: &str) -> Vec<MemoryEntry> {
        let inner = self.inner.read().await;
        inner
            .conversations
            .get(conversation_id)
            .map(|c| c.entries.clone())
            .unwrap_or_default()
    }

    pub async fn count(&self, conversation_id: &str) -> usize {
        let inner = self.inner.read().await;
        inner
            .conversations
            .get(conversation_id)
            .map(|c| c.entries.len())
            .unwrap_or(0)
    }

    pub async fn meta(&self, conversation_id: &str) -> Option<ConversationMeta> {
        let inner = self.inner.read().await;
        inner.conversations.get(conversation_id).map(|c| c.meta.clone())
    }

    pub async fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        let inner = self.inner.read().await;
        inner
            .conversations
            .get(conversation_id)
            .map(|c| Conversation::from_parts(&c.meta, &c.entries))
    }

    /// All conversations, sorted by id
    pub async fn conversations(&self) -> Vec<Conversation> {
        let inner = self.inner.read().await;
        let mut all: Vec<Conversation> = inner
            .conversations
            .values()
            .map(|c| Conversation::from_parts(&c.meta, &c.entries))
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub async fn conversation_ids(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut ids: Vec<String> = inner.conversations.keys().cloned().collect();
        ids.sort();
        ids
    }

    // =========================================================================
    // Direct mutations (no eviction, no revisions)
    // =========================================================================

    /// Insert or replace an entry.
    pub async fn put(&self, entry: MemoryEntry) -> Result<()> {
        self.check_dimension(&entry.embedding)?;
        let _guard = self.writer_lock(&entry.conversation_id).await;
        let before = self.get(entry.id).await;
        let batch = self.batch_for(&entry.conversation_id, vec![EntryChange {
            before,
            after: Some(entry.clone()),
        }]).await;
        self.write_batch(&batch).await?;
        self.publish(batch).await;
        Ok(())
    }

    /// Remove an entry, returning it if it existed.
    pub async fn delete(&self, id: Uuid) -> Result<Option<MemoryEntry>> {
        let Some(existing) = self.get(id).await else {
            return Ok(None);
        };
        let _guard = self.writer_lock(&existing.conversation_id).await;
        let Some(existing) = self.get(id).await else {
            return Ok(None);
        };
        let batch = self.batch_for(&existing.conversation_id, vec![EntryChange {
            before: Some(existing.clone()),
            after: None,
        }]).await;
        self.write_batch(&batch).await?;
        self.publish(batch).await;
        Ok(Some(existing))
    }

    /// Bump access stats for one entry.
    ///
    /// Runs under the conversation's writer lock so a bump can never
    /// resurrect an entry that was evicted or deleted. Returns false if the
    /// entry no longer exists. A failed write is logged and the in-memory
    /// stats are kept.
    pub async fn update_access(&self, id: Uuid) -> bool {
        let Some(conversation_id) = self.inner.read().await.index.get(&id).cloned() else {
            return false;
        };
        let _guard = self.writer_lock(&conversation_id).await;

        let updated = {
            let mut inner = self.inner.write().await;
            if inner.index.get(&id) != Some(&conversation_id) {
                return false;
            }
            let entry = inner
                .conversations
                .get_mut(&conversation_id)
                .and_then(|c| c.entries.iter_mut().find(|e| e.id == id));
            match entry {
                Some(entry) => {
                    entry.record_access();
                    entry.clone()
                }
                None => return false,
            }
        };

        if let Err(e) = self.persistence.write_entry(&updated).await {
            tracing::warn!("Failed to persist access stats for {}: {}", updated.id, e);
        }
        true
    }

    // =========================================================================
    // Transaction plumbing
    // =========================================================================

    /// Batch touching the given entries with a refreshed `updated_at`.
    pub(crate) async fn batch_for(&self, conversation_id: &str, changes: Vec<EntryChange>) -> StoreBatch {
        let meta_before = self.meta(conversation_id).await;
        let mut meta_after = meta_before
            .clone()
            .unwrap_or_else(|| ConversationMeta::new(conversation_id));
        meta_after.updated_at = Utc::now();
        StoreBatch {
            conversation_id: conversation_id.to_string(),
            changes,
            meta_before,
            meta_after: Some(meta_after),
        }
    }

    /// Write a batch to the persistence backend.
    ///
    /// On failure, steps already written are undone and the error is
    /// returned as `Error::Persistence`. Nothing is published.
    pub(crate) async fn write_batch(&self, batch: &StoreBatch) -> Result<()> {
        let steps = batch.steps();
        for (i, step) in steps.iter().enumerate() {
            if let Err(e) = self.apply_step(batch, *step, false).await {
                for done in steps[..i].iter().rev() {
                    if let Err(undo) = self.apply_step(batch, *done, true).await {
                        tracing::error!(
                            conversation_id = %batch.conversation_id,
                            "Failed to undo partial write: {}",
                            undo
                        );
                    }
                }
                return Err(match e {
                    Error::Persistence(msg) => Error::Persistence(msg),
                    other => Error::Persistence(other.to_string()),
                });
            }
        }
        Ok(())
    }

    /// Undo a batch previously written with [`write_batch`](Self::write_batch).
    pub(crate) async fn revert_batch(&self, batch: &StoreBatch) -> Result<()> {
        let mut first_err = None;
        for step in batch.steps().iter().rev() {
            if let Err(e) = self.apply_step(batch, *step, true).await {
                tracing::error!(
                    conversation_id = %batch.conversation_id,
                    "Failed to revert store write: {}",
                    e
                );
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn apply_step(&self, batch: &StoreBatch, step: Step, inverse: bool) -> Result<()> {
        match step {
            Step::Meta => {
                let (from, to) = if inverse {
                    (batch.meta_after.as_ref(), batch.meta_before.as_ref())
                } else {
                    (batch.meta_before.as_ref(), batch.meta_after.as_ref())
                };
                match (from, to) {
                    (_, Some(meta)) => self.persistence.write_conversation(meta).await,
                    (Some(_), None) => {
                        self.persistence
                            .remove_conversation(&batch.conversation_id)
                            .await
                    }
                    (None, None) => Ok(()),
                }
            }
            Step::Entry(i) => {
                let change = &batch.changes[i];
                let (from, to) = if inverse {
                    (change.after.as_ref(), change.before.as_ref())
                } else {
                    (change.before.as_ref(), change.after.as_ref())
                };
                match (from, to) {
                    (_, Some(entry)) => self.persistence.write_entry(entry).await,
                    (Some(entry), None) => {
                        self.persistence
                            .remove_entry(&entry.conversation_id, entry.id)
                            .await
                    }
                    (None, None) => Ok(()),
                }
            }
        }
    }

    /// Make a written batch visible to readers.
    pub(crate) async fn publish(&self, batch: StoreBatch) {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;

        let Some(meta) = batch.meta_after else {
            if let Some(state) = inner.conversations.remove(&batch.conversation_id) {
                for e in state.entries {
                    inner.index.remove(&e.id);
                }
            }
            return;
        };

        let state = inner
            .conversations
            .entry(batch.conversation_id.clone())
            .or_insert_with(|| ConversationState {
                meta: meta.clone(),
                entries: Vec::new(),
            });
        state.meta = meta;

        for change in batch.changes {
            match (change.before, change.after) {
                (_, Some(after)) => {
                    inner.index.insert(after.id, batch.conversation_id.clone());
                    match state.entries.iter_mut().find(|e| e.id == after.id) {
                        Some(slot) => *slot = after,
                        None => state.entries.push(after),
                    }
                }
                (Some(before), None) => {
                    inner.index.remove(&before.id);
                    state.entries.retain(|e| e.id != before.id);
                }
                (None, None) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::entry::MemoryEntryBuilder;
    use tempfile::TempDir;

    fn entry(conv: &str, text: &str) -> MemoryEntry {
        MemoryEntryBuilder::new(conv, text)
            .embedding(vec![1.0, 0.0, 0.0])
            .build()
            .unwrap()
    }

    async fn file_store(dir: &TempDir) -> EntryStore {
        let persistence = JsonFilePersistence::new(dir.path()).await.unwrap();
        EntryStore::open(3, Arc::new(persistence)).await.unwrap()
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let store = EntryStore::in_memory(3).await;
        let e = entry("c1", "User lives in Lisbon");
        store.put(e.clone()).await.unwrap();

        let fetched = store.get(e.id).await.unwrap();
        assert_eq!(fetched.text, e.text);
        assert_eq!(fetched.embedding, e.embedding);
        assert_eq!(store.count("c1").await, 1);
    }

    #[tokio::test]
    async fn test_put_rejects_wrong_dimension() {
        let store = EntryStore::in_memory(4).await;
        let err = store.put(entry("c1", "fact")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 4,
                actual: 3
            }
        ));
        assert!(store.conversation("c1").await.is_none());
    }

    #[tokio::test]
    async fn test_list_keeps_insertion_order() {
        let store = EntryStore::in_memory(3).await;
        let a = entry("c1", "a");
        let b = entry("c1", "b");
        let other = entry("c2", "other");
        store.put(a.clone()).await.unwrap();
        store.put(b.clone()).await.unwrap();
        store.put(other).await.unwrap();

        let ids: Vec<Uuid> = store.list("c1").await.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
        assert_eq!(store.conversation_ids().await, vec!["c1", "c2"]);
        let conv = store.conversation("c1").await.unwrap();
        assert_eq!(conv.entry_count, 2);
        assert_eq!(conv.entry_ids, vec![a.id, b.id]);
    }

    #[tokio::test]
    async fn test_delete_entry() {
        let store = EntryStore::in_memory(3).await;
        let e = entry("c1", "fact");
        store.put(e.clone()).await.unwrap();
        assert!(store.delete(e.id).await.unwrap().is_some());
        assert!(store.get(e.id).await.is_none());
        assert!(store.delete(e.id).await.unwrap().is_none());
        assert_eq!(store.count("c1").await, 0);
    }

    #[tokio::test]
    async fn test_update_access() {
        let store = EntryStore::in_memory(3).await;
        let e = entry("c1", "fact");
        store.put(e.clone()).await.unwrap();
        assert!(store.update_access(e.id).await);
        assert!(store.update_access(e.id).await);
        assert_eq!(store.get(e.id).await.unwrap().access_count, 2);
        assert!(!store.update_access(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn test_file_store_reload() {
        let dir = TempDir::new().unwrap();
        let e = entry("c1", "User prefers tea");
        {
            let store = file_store(&dir).await;
            store.put(e.clone()).await.unwrap();
            assert!(store.update_access(e.id).await);
        }

        let store = file_store(&dir).await;
        let reloaded = store.get(e.id).await.unwrap();
        assert_eq!(reloaded.text, "User prefers tea");
        assert_eq!(reloaded.access_count, 1);
        assert!(store.meta("c1").await.is_some());
    }

    #[tokio::test]
    async fn test_file_store_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(file_store(&dir).await);
        let e = entry("c1", "fact");
        store.put(e.clone()).await.unwrap();
        let id = e.id;

        let bumps: Vec<_> = (0..8)
            .map(|_| {
                let s = store.clone();
                tokio::spawn(async move { s.update_access(id).await })
            })
            .collect();
        for b in bumps {
            assert!(b.await.unwrap());
        }

        let files: Vec<String> = std::fs::read_dir(dir.path().join("conversations/c1/entries"))
            .unwrap()
            .map(|f| f.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(files, vec![format!("{}.json", e.id)]);
        let reloaded = file_store(&dir).await;
        assert_eq!(reloaded.get(e.id).await.unwrap().access_count, 8);
    }

    #[tokio::test]
    async fn test_file_store_skips_corrupt_files() {
        let dir = TempDir::new().unwrap();
        let e = entry("c1", "fact");
        {
            let store = file_store(&dir).await;
            store.put(e.clone()).await.unwrap();
        }
        let entries_dir = dir.path().join("conversations/c1/entries");
        std::fs::write(entries_dir.join("garbage.json"), "{not json").unwrap();

        let store = file_store(&dir).await;
        assert_eq!(store.count("c1").await, 1);
    }

    #[tokio::test]
    async fn test_revert_batch_restores_disk_state() {
        let dir = TempDir::new().unwrap();
        let store = file_store(&dir).await;
        let kept = entry("c1", "kept");
        store.put(kept.clone()).await.unwrap();

        let added = entry("c1", "added");
        let batch = store
            .batch_for(
                "c1",
                vec![
                    EntryChange {
                        before: None,
                        after: Some(added.clone()),
                    },
                    EntryChange {
                        before: Some(kept.clone()),
                        after: None,
                    },
                ],
            )
            .await;
        store.write_batch(&batch).await.unwrap();
        store.revert_batch(&batch).await.unwrap();

        let reloaded = file_store(&dir).await;
        let ids: Vec<Uuid> = reloaded.list("c1").await.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![kept.id]);
    }

    #[tokio::test]
    async fn test_writer_lock_serializes() {
        let store = Arc::new(EntryStore::in_memory(3).await);
        let guard = store.writer_lock("c1").await;

        let s = store.clone();
        let handle = tokio::spawn(async move {
            let _g = s.writer_lock("c1").await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        // Other conversations are not blocked
        let _other = store.writer_lock("c2").await;

        drop(guard);
        handle.await.unwrap();
    }

    #[test]
    fn test_storage_name() {
        assert_eq!(storage_name("conv-abc_1"), "conv-abc_1");
        assert!(storage_name("../etc").starts_with("h-"));
        assert!(storage_name("a/b").starts_with("h-"));
        assert!(storage_name("..").starts_with("h-"));
        assert_eq!(storage_name("x y"), storage_name("x y"));
    }
}
