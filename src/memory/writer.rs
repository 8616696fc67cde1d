//! Single-writer commit path
//!
//! All mutations of a conversation run through [`MemoryWriter`] while holding
//! that conversation's writer lock. A commit proceeds as:
//!
//! 1. plan (eviction victims, revision chain, store batch)
//! 2. write the store batch to persistence
//! 3. append the revision chain
//! 4. publish the batch to the in-memory index
//!
//! If step 3 fails, step 2 is reverted on disk and nothing is published, so
//! the store is left exactly as it was.

use crate::error::{Error, Result};
use crate::memory::entry::MemoryEntry;
use crate::memory::eviction::EvictionManager;
use crate::memory::similarity::SimilarityMetric;
use crate::memory::store::{EntryChange, EntryStore, StoreBatch};
use crate::memory::versioning::{Mutation, RevisionChain, RevisionLog};
use std::sync::Arc;
use uuid::Uuid;

/// Result of a committed insert
#[derive(Debug, Clone)]
pub struct InsertOutcome {
    pub entry: MemoryEntry,
    pub evicted: Vec<MemoryEntry>,
    /// Revision recording the insert, when versioning is on
    pub revision: Option<Uuid>,
}

/// Commits store mutations together with eviction and revisions.
pub struct MemoryWriter {
    store: Arc<EntryStore>,
    revisions: Arc<dyn RevisionLog>,
    eviction: EvictionManager,
    versioning: bool,
}

impl MemoryWriter {
    pub fn new(
        store: Arc<EntryStore>,
        revisions: Arc<dyn RevisionLog>,
        eviction: EvictionManager,
        versioning: bool,
    ) -> Self {
        Self {
            store,
            revisions,
            eviction,
            versioning,
        }
    }

    pub fn store(&self) -> &Arc<EntryStore> {
        &self.store
    }

    pub fn revisions(&self) -> &Arc<dyn RevisionLog> {
        &self.revisions
    }

    pub fn versioning(&self) -> bool {
        self.versioning
    }

    /// Insert an entry, evicting as needed to respect `max_entries`.
    pub async fn insert(&self, entry: MemoryEntry) -> Result<InsertOutcome> {
        self.store.check_dimension(&entry.embedding)?;
        let _guard = self.store.writer_lock(&entry.conversation_id).await;
        self.insert_locked(entry).await
    }

    /// Insert unless a stored entry of the conversation scores above
    /// `threshold` against it.
    ///
    /// The check and the insert share one writer-lock section, so concurrent
    /// ingestions cannot both store the same fact. Returns `None` for a
    /// duplicate.
    pub async fn insert_if_novel(
        &self,
        entry: MemoryEntry,
        threshold: f32,
        metric: SimilarityMetric,
    ) -> Result<Option<InsertOutcome>> {
        self.store.check_dimension(&entry.embedding)?;
        let _guard = self.store.writer_lock(&entry.conversation_id).await;

        let duplicate = self
            .store
            .list(&entry.conversation_id)
            .await
            .iter()
            .filter(|e| e.id != entry.id)
            .any(|e| metric.score(&entry.embedding, &e.embedding) > threshold);
        if duplicate {
            return Ok(None);
        }
        self.insert_locked(entry).await.map(Some)
    }

    /// Insert body; the caller holds the writer lock.
    async fn insert_locked(&self, mut entry: MemoryEntry) -> Result<InsertOutcome> {
        let conversation_id = entry.conversation_id.clone();
        let existing = self.store.list(&conversation_id).await;
        let victims = self.eviction.plan(&existing, entry.id);
        let replaced = existing.iter().find(|e| e.id == entry.id).cloned();
        let final_count = existing.len() - victims.len() + usize::from(replaced.is_none());
        self.eviction.check(final_count)?;

        let mut chain = self.chain_for(&conversation_id).await?;
        let mut changes = Vec::with_capacity(victims.len() + 1);
        for victim in &victims {
            if let Some(chain) = chain.as_mut() {
                chain.push(Uuid::new_v4(), Mutation::Evict {
                    before: victim.clone(),
                });
            }
            changes.push(EntryChange {
                before: Some(victim.clone()),
                after: None,
            });
        }

        let revision = chain.as_mut().map(|chain| {
            let id = Uuid::new_v4();
            entry.revision_id = Some(id);
            let mutation = match &replaced {
                Some(before) => Mutation::Update {
                    before: before.clone(),
                    after: entry.clone(),
                },
                None => Mutation::Insert {
                    after: entry.clone(),
                },
            };
            chain.push(id, mutation);
            id
        });
        changes.push(EntryChange {
            before: replaced,
            after: Some(entry.clone()),
        });

        let batch = self.finish_batch(&conversation_id, changes, chain.as_ref()).await;
        self.commit(batch, chain).await?;
        self.eviction.check(self.store.count(&conversation_id).await)?;

        if !victims.is_empty() {
            tracing::debug!(
                conversation_id = %conversation_id,
                evicted = victims.len(),
                "Evicted entries to make room"
            );
        }

        Ok(InsertOutcome {
            entry,
            evicted: victims,
            revision,
        })
    }

    /// Replace the text and embedding of an existing entry.
    pub async fn update_entry(
        &self,
        conversation_id: &str,
        id: Uuid,
        text: String,
        embedding: Vec<f32>,
    ) -> Result<MemoryEntry> {
        self.store.check_dimension(&embedding)?;
        let _guard = self.store.writer_lock(conversation_id).await;

        let before = self
            .store
            .get(id)
            .await
            .filter(|e| e.conversation_id == conversation_id)
            .ok_or_else(|| Error::NotFound(format!("Entry {} in {}", id, conversation_id)))?;

        let mut after = before.clone();
        after.text = text;
        after.embedding = embedding;

        let mut chain = self.chain_for(conversation_id).await?;
        if let Some(chain) = chain.as_mut() {
            let rev = Uuid::new_v4();
            after.revision_id = Some(rev);
            chain.push(rev, Mutation::Update {
                before: before.clone(),
                after: after.clone(),
            });
        }

        let changes = vec![EntryChange {
            before: Some(before),
            after: Some(after.clone()),
        }];
        let batch = self.finish_batch(conversation_id, changes, chain.as_ref()).await;
        self.commit(batch, chain).await?;
        Ok(after)
    }

    /// Replace the rolling summary of a conversation.
    pub async fn set_summary(&self, conversation_id: &str, summary: Option<String>) -> Result<()> {
        let _guard = self.store.writer_lock(conversation_id).await;
        let before = self
            .store
            .meta(conversation_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("Conversation {}", conversation_id)))?
            .summary;
        if before == summary {
            return Ok(());
        }

        let mut chain = self.chain_for(conversation_id).await?;
        if let Some(chain) = chain.as_mut() {
            chain.push(Uuid::new_v4(), Mutation::Summary {
                before,
                after: summary.clone(),
            });
        }

        let mut batch = self
            .finish_batch(conversation_id, Vec::new(), chain.as_ref())
            .await;
        if let Some(meta) = batch.meta_after.as_mut() {
            meta.summary = summary;
        }
        self.commit(batch, chain).await
    }

    /// Delete a conversation and all of its entries.
    ///
    /// The revision chain is kept and records one `Delete` per entry.
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<Vec<MemoryEntry>> {
        let _guard = self.store.writer_lock(conversation_id).await;
        let Some(meta) = self.store.meta(conversation_id).await else {
            return Err(Error::NotFound(format!("Conversation {}", conversation_id)));
        };
        let entries = self.store.list(conversation_id).await;

        let mut chain = self.chain_for(conversation_id).await?;
        if let Some(chain) = chain.as_mut() {
            for e in &entries {
                chain.push(Uuid::new_v4(), Mutation::Delete { before: e.clone() });
            }
        }

        let batch = StoreBatch {
            conversation_id: conversation_id.to_string(),
            changes: entries
                .iter()
                .map(|e| EntryChange {
                    before: Some(e.clone()),
                    after: None,
                })
                .collect(),
            meta_before: Some(meta),
            meta_after: None,
        };
        self.commit(batch, chain).await?;

        tracing::info!(
            conversation_id = %conversation_id,
            entries = entries.len(),
            "Conversation deleted"
        );
        Ok(entries)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn chain_for(&self, conversation_id: &str) -> Result<Option<RevisionChain>> {
        if !self.versioning {
            return Ok(None);
        }
        let head = self
            .revisions
            .head(conversation_id)
            .await
            .map_err(into_persistence)?;
        Ok(Some(RevisionChain::new(conversation_id, head)))
    }

    async fn finish_batch(
        &self,
        conversation_id: &str,
        changes: Vec<EntryChange>,
        chain: Option<&RevisionChain>,
    ) -> StoreBatch {
        let mut batch = self.store.batch_for(conversation_id, changes).await;
        if let (Some(meta), Some(chain)) = (batch.meta_after.as_mut(), chain) {
            if chain.head().is_some() {
                meta.head_revision = chain.head();
            }
        }
        batch
    }

    async fn commit(&self, batch: StoreBatch, chain: Option<RevisionChain>) -> Result<()> {
        self.store.write_batch(&batch).await?;

        if let Some(chain) = chain.filter(|c| !c.is_empty()) {
            if let Err(e) = self
                .revisions
                .append(&batch.conversation_id, chain.revisions())
                .await
            {
                tracing::warn!(
                    conversation_id = %batch.conversation_id,
                    "Revision append failed, rolling back store write: {}",
                    e
                );
                if let Err(revert) = self.store.revert_batch(&batch).await {
                    tracing::error!(
                        conversation_id = %batch.conversation_id,
                        "Store rollback incomplete: {}",
                        revert
                    );
                }
                return Err(into_persistence(e));
            }
        }

        self.store.publish(batch).await;
        Ok(())
    }
}

fn into_persistence(e: Error) -> Error {
    match e {
        Error::Persistence(_) | Error::InvariantViolation(_) => e,
        other => Error::Persistence(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::entry::{ConversationMeta, MemoryEntryBuilder};
    use crate::memory::store::{EntryPersistence, JsonFilePersistence};
    use crate::memory::versioning::{MemoryRevisionLog, Revision};
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// File persistence with injectable latency and failures.
    struct FlakyPersistence {
        inner: JsonFilePersistence,
        slow_access_writes: bool,
        fail_write_for: Mutex<Option<Uuid>>,
        fail_removes: AtomicBool,
    }

    impl FlakyPersistence {
        async fn new(dir: &TempDir, slow_access_writes: bool) -> Arc<Self> {
            Arc::new(Self {
                inner: JsonFilePersistence::new(dir.path()).await.unwrap(),
                slow_access_writes,
                fail_write_for: Mutex::new(None),
                fail_removes: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl EntryPersistence for FlakyPersistence {
        async fn load_all(&self) -> Result<Vec<(ConversationMeta, Vec<MemoryEntry>)>> {
            self.inner.load_all().await
        }

        async fn write_entry(&self, entry: &MemoryEntry) -> Result<()> {
            if *self.fail_write_for.lock().unwrap() == Some(entry.id) {
                return Err(Error::Persistence("disk full".into()));
            }
            if self.slow_access_writes && entry.access_count > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
            self.inner.write_entry(entry).await
        }

        async fn remove_entry(&self, conversation_id: &str, id: Uuid) -> Result<()> {
            if self.fail_removes.load(Ordering::SeqCst) {
                return Err(Error::Persistence("read-only filesystem".into()));
            }
            self.inner.remove_entry(conversation_id, id).await
        }

        async fn write_conversation(&self, meta: &ConversationMeta) -> Result<()> {
            self.inner.write_conversation(meta).await
        }

        async fn remove_conversation(&self, conversation_id: &str) -> Result<()> {
            self.inner.remove_conversation(conversation_id).await
        }
    }

    async fn file_writer(
        persistence: Arc<FlakyPersistence>,
        max_entries: usize,
    ) -> (MemoryWriter, Arc<MemoryRevisionLog>) {
        let store = Arc::new(EntryStore::open(2, persistence).await.unwrap());
        let log = Arc::new(MemoryRevisionLog::new());
        let eviction = EvictionManager::new(max_entries).unwrap();
        (MemoryWriter::new(store, log.clone(), eviction, true), log)
    }

    fn ids(entries: &[MemoryEntry]) -> Vec<Uuid> {
        entries.iter().map(|e| e.id).collect()
    }

    struct FailingRevisionLog;

    #[async_trait]
    impl RevisionLog for FailingRevisionLog {
        async fn append(&self, _conversation_id: &str, _revisions: &[Revision]) -> Result<()> {
            Err(Error::Persistence("revision log offline".into()))
        }

        async fn history(&self, _conversation_id: &str) -> Result<Vec<Revision>> {
            Ok(Vec::new())
        }
    }

    fn entry(conv: &str, text: &str, minutes_ago: i64) -> MemoryEntry {
        MemoryEntryBuilder::new(conv, text)
            .embedding(vec![1.0, 0.0])
            .created_at(Utc::now() - Duration::minutes(minutes_ago))
            .build()
            .unwrap()
    }

    async fn writer(max_entries: usize) -> (MemoryWriter, Arc<MemoryRevisionLog>) {
        let store = Arc::new(EntryStore::in_memory(2).await);
        let log = Arc::new(MemoryRevisionLog::new());
        let eviction = EvictionManager::new(max_entries).unwrap();
        let writer = MemoryWriter::new(store, log.clone(), eviction, true);
        (writer, log)
    }

    #[tokio::test]
    async fn test_insert_records_revision() {
        let (writer, log) = writer(5).await;
        let outcome = writer.insert(entry("c1", "fact", 0)).await.unwrap();

        let history = log.history("c1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(Some(history[0].id), outcome.revision);
        assert_eq!(outcome.entry.revision_id, outcome.revision);

        let meta = writer.store().meta("c1").await.unwrap();
        assert_eq!(meta.head_revision, outcome.revision);
    }

    #[tokio::test]
    async fn test_fourth_insert_evicts_lowest_utility() {
        let (writer, log) = writer(3).await;
        let oldest = entry("c1", "oldest", 30);
        writer.insert(oldest.clone()).await.unwrap();
        writer.insert(entry("c1", "middle", 20)).await.unwrap();
        writer.insert(entry("c1", "newer", 10)).await.unwrap();

        let outcome = writer.insert(entry("c1", "newest", 0)).await.unwrap();
        assert_eq!(outcome.evicted.len(), 1);
        assert_eq!(outcome.evicted[0].id, oldest.id);

        let remaining = writer.store().list("c1").await;
        assert_eq!(remaining.len(), 3);
        assert!(remaining.iter().all(|e| e.id != oldest.id));

        let history = log.history("c1").await.unwrap();
        assert_eq!(history.len(), 5);
        assert_eq!(history[3].mutation.kind(), "evict");
        assert_eq!(history[4].mutation.kind(), "insert");
    }

    #[tokio::test]
    async fn test_revision_failure_leaves_store_untouched() {
        let dir = TempDir::new().unwrap();
        let persistence = Arc::new(JsonFilePersistence::new(dir.path()).await.unwrap());
        let store = Arc::new(EntryStore::open(2, persistence.clone()).await.unwrap());
        let seed = entry("c1", "seed", 5);
        store.put(seed.clone()).await.unwrap();

        let writer = MemoryWriter::new(
            store.clone(),
            Arc::new(FailingRevisionLog),
            EvictionManager::new(1).unwrap(),
            true,
        );
        let incoming = entry("c1", "incoming", 0);
        let err = writer.insert(incoming.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));

        // In memory
        let ids: Vec<Uuid> = store.list("c1").await.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![seed.id]);
        assert!(store.get(incoming.id).await.is_none());

        // On disk
        let reopened = EntryStore::open(2, persistence).await.unwrap();
        let ids: Vec<Uuid> = reopened.list("c1").await.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![seed.id]);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_respect_bound() {
        let (writer, log) = writer(4).await;
        let writer = Arc::new(writer);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let w = writer.clone();
                tokio::spawn(async move { w.insert(entry("c1", &format!("fact {}", i), 0)).await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(writer.store().count("c1").await, 4);
        let history = log.history("c1").await.unwrap();
        assert_eq!(history.len(), 16 + 12);
        for pair in history.windows(2) {
            assert_eq!(pair[1].parent, Some(pair[0].id));
        }
    }

    #[tokio::test]
    async fn test_update_entry() {
        let (writer, log) = writer(5).await;
        let inserted = writer.insert(entry("c1", "old", 0)).await.unwrap().entry;

        let updated = writer
            .update_entry("c1", inserted.id, "new".into(), vec![0.0, 1.0])
            .await
            .unwrap();
        assert_eq!(updated.text, "new");
        assert_eq!(writer.store().get(inserted.id).await.unwrap().text, "new");
        assert_eq!(log.history("c1").await.unwrap()[1].mutation.kind(), "update");

        let wrong_conv = writer
            .update_entry("c2", inserted.id, "x".into(), vec![0.0, 1.0])
            .await;
        assert!(matches!(wrong_conv, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_summary_and_delete() {
        let (writer, log) = writer(5).await;
        writer.insert(entry("c1", "a", 1)).await.unwrap();
        writer.insert(entry("c1", "b", 0)).await.unwrap();
        writer.set_summary("c1", Some("likes a and b".into())).await.unwrap();
        assert_eq!(
            writer.store().meta("c1").await.unwrap().summary.as_deref(),
            Some("likes a and b")
        );

        let removed = writer.delete_conversation("c1").await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(writer.store().conversation("c1").await.is_none());

        let kinds: Vec<&str> = log
            .history("c1")
            .await
            .unwrap()
            .iter()
            .map(|r| r.mutation.kind())
            .collect();
        assert_eq!(kinds, vec!["insert", "insert", "summary", "delete", "delete"]);
        assert!(matches!(
            writer.delete_conversation("c1").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_versioning_off() {
        let store = Arc::new(EntryStore::in_memory(2).await);
        let log = Arc::new(MemoryRevisionLog::new());
        let eviction = EvictionManager::new(2).unwrap();
        let writer = MemoryWriter::new(store, log.clone(), eviction, false);
        let outcome = writer.insert(entry("c1", "fact", 0)).await.unwrap();
        assert!(outcome.revision.is_none());
        assert!(log.history("c1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insert_if_novel() {
        let (writer, _log) = writer(5).await;
        let first = writer
            .insert_if_novel(entry("c1", "tea", 1), 0.9, SimilarityMetric::Cosine)
            .await
            .unwrap();
        assert!(first.is_some());

        let again = writer
            .insert_if_novel(entry("c1", "tea again", 0), 0.9, SimilarityMetric::Cosine)
            .await
            .unwrap();
        assert!(again.is_none());

        let mut other = entry("c1", "oslo", 0);
        other.embedding = vec![0.0, 1.0];
        let other = writer
            .insert_if_novel(other, 0.9, SimilarityMetric::Cosine)
            .await
            .unwrap();
        assert!(other.is_some());
        assert_eq!(writer.store().count("c1").await, 2);
    }

    #[tokio::test]
    async fn test_summary_survives_reload() {
        let dir = TempDir::new().unwrap();
        let persistence = FlakyPersistence::new(&dir, false).await;
        let (writer, _log) = file_writer(persistence.clone(), 5).await;
        let e = writer.insert(entry("c1", "User prefers tea", 0)).await.unwrap().entry;
        writer.set_summary("c1", Some("Tea drinker".into())).await.unwrap();

        let reopened = EntryStore::open(2, persistence).await.unwrap();
        assert_eq!(reopened.get(e.id).await.unwrap().text, "User prefers tea");
        let meta = reopened.meta("c1").await.unwrap();
        assert_eq!(meta.summary.as_deref(), Some("Tea drinker"));
        assert_eq!(meta.head_revision, writer.store().meta("c1").await.unwrap().head_revision);
    }

    #[tokio::test]
    async fn test_delete_conversation_removes_files() {
        let dir = TempDir::new().unwrap();
        let persistence = FlakyPersistence::new(&dir, false).await;
        let (writer, _log) = file_writer(persistence, 5).await;
        writer.insert(entry("c1", "a", 1)).await.unwrap();
        writer.insert(entry("c1", "b", 0)).await.unwrap();

        writer.delete_conversation("c1").await.unwrap();
        assert!(!dir.path().join("conversations/c1").exists());
    }

    #[tokio::test]
    async fn test_late_access_write_does_not_resurrect_evicted_entry() {
        let dir = TempDir::new().unwrap();
        let persistence = FlakyPersistence::new(&dir, true).await;
        let (writer, _log) = file_writer(persistence.clone(), 1).await;
        let first = writer.insert(entry("c1", "first", 5)).await.unwrap().entry;

        let store = writer.store().clone();
        let id = first.id;
        let bump = tokio::spawn(async move { store.update_access(id).await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let outcome = writer.insert(entry("c1", "second", 0)).await.unwrap();
        assert_eq!(ids(&outcome.evicted), vec![first.id]);
        bump.await.unwrap();

        let reopened = EntryStore::open(2, persistence).await.unwrap();
        assert_eq!(ids(&reopened.list("c1").await), vec![outcome.entry.id]);
    }

    #[tokio::test]
    async fn test_late_access_write_does_not_resurrect_deleted_conversation() {
        let dir = TempDir::new().unwrap();
        let persistence = FlakyPersistence::new(&dir, true).await;
        let (writer, _log) = file_writer(persistence.clone(), 5).await;
        let first = writer.insert(entry("c1", "first", 5)).await.unwrap().entry;

        let store = writer.store().clone();
        let id = first.id;
        let bump = tokio::spawn(async move { store.update_access(id).await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        writer.delete_conversation("c1").await.unwrap();
        bump.await.unwrap();

        let reopened = EntryStore::open(2, persistence).await.unwrap();
        assert!(reopened.conversation_ids().await.is_empty());
        assert!(!writer.store().update_access(id).await);
    }

    #[tokio::test]
    async fn test_failed_entry_write_restores_evicted_victim() {
        let dir = TempDir::new().unwrap();
        let persistence = FlakyPersistence::new(&dir, false).await;
        let (writer, log) = file_writer(persistence.clone(), 1).await;
        let seed = writer.insert(entry("c1", "seed", 5)).await.unwrap().entry;
        let meta_before = writer.store().meta("c1").await.unwrap();

        // Eviction of the seed succeeds on disk, then the incoming write fails.
        let incoming = entry("c1", "incoming", 0);
        *persistence.fail_write_for.lock().unwrap() = Some(incoming.id);
        let err = writer.insert(incoming.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
        *persistence.fail_write_for.lock().unwrap() = None;

        assert_eq!(ids(&writer.store().list("c1").await), vec![seed.id]);
        assert_eq!(log.history("c1").await.unwrap().len(), 1);

        let reopened = EntryStore::open(2, persistence).await.unwrap();
        assert_eq!(ids(&reopened.list("c1").await), vec![seed.id]);
        let meta = reopened.meta("c1").await.unwrap();
        assert_eq!(meta.head_revision, meta_before.head_revision);
    }

    #[tokio::test]
    async fn test_failed_victim_removal_leaves_store_untouched() {
        let dir = TempDir::new().unwrap();
        let persistence = FlakyPersistence::new(&dir, false).await;
        let (writer, log) = file_writer(persistence.clone(), 1).await;
        let seed = writer.insert(entry("c1", "seed", 5)).await.unwrap().entry;

        persistence.fail_removes.store(true, Ordering::SeqCst);
        let incoming = entry("c1", "incoming", 0);
        let err = writer.insert(incoming.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
        persistence.fail_removes.store(false, Ordering::SeqCst);

        assert_eq!(ids(&writer.store().list("c1").await), vec![seed.id]);
        assert!(writer.store().get(incoming.id).await.is_none());
        assert_eq!(log.history("c1").await.unwrap().len(), 1);

        let reopened = EntryStore::open(2, persistence).await.unwrap();
        assert_eq!(ids(&reopened.list("c1").await), vec![seed.id]);
    }
}
