//! Append-only revision chain
//!
//! Every committed mutation of a conversation is recorded as one
//! [`Revision`] whose `parent` is the previous head, giving a linear,
//! auditable history. The JSONL backend keeps one file per conversation:
//!
//! ```text
//! <base>/revisions/<conversation>.jsonl
//! ```
//!
//! A batch of revisions is appended with a single write. If the write fails
//! the file is truncated back to its previous length, so a batch is either
//! fully present or absent.

use crate::error::{Error, Result};
use crate::memory::entry::MemoryEntry;
use crate::memory::store::storage_name;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// What a revision changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mutation {
    Insert {
        after: MemoryEntry,
    },
    Evict {
        before: MemoryEntry,
    },
    Update {
        before: MemoryEntry,
        after: MemoryEntry,
    },
    /// Removal by explicit conversation deletion
    Delete {
        before: MemoryEntry,
    },
    Summary {
        before: Option<String>,
        after: Option<String>,
    },
}

impl Mutation {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Evict { .. } => "evict",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
            Self::Summary { .. } => "summary",
        }
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub conversation_id: String,
    pub parent: Option<Uuid>,
    pub mutation: Mutation,
}

/// Builds a run of linked revisions on top of a known head.
#[derive(Debug)]
pub struct RevisionChain {
    conversation_id: String,
    head: Option<Uuid>,
    revisions: Vec<Revision>,
}

impl RevisionChain {
    pub fn new(conversation_id: impl Into<String>, head: Option<Uuid>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            head,
            revisions: Vec::new(),
        }
    }

    /// Append a revision with a caller-chosen id; it becomes the new head.
    pub fn push(&mut self, id: Uuid, mutation: Mutation) {
        self.revisions.push(Revision {
            id,
            timestamp: Utc::now(),
            conversation_id: self.conversation_id.clone(),
            parent: self.head,
            mutation,
        });
        self.head = Some(id);
    }

    pub fn head(&self) -> Option<Uuid> {
        self.head
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    pub fn revisions(&self) -> &[Revision] {
        &self.revisions
    }

    pub fn into_revisions(self) -> Vec<Revision> {
        self.revisions
    }
}

/// Verify that a batch is linked and rooted at `head`.
fn check_linkage(conversation_id: &str, head: Option<Uuid>, revisions: &[Revision]) -> Result<()> {
    let mut expected_parent = head;
    for rev in revisions {
        if rev.conversation_id != conversation_id {
            return Err(Error::InvariantViolation(format!(
                "revision {} belongs to {}, not {}",
                rev.id, rev.conversation_id, conversation_id
            )));
        }
        if rev.parent != expected_parent {
            return Err(Error::InvariantViolation(format!(
                "revision {} does not extend head {:?}",
                rev.id, expected_parent
            )));
        }
        expected_parent = Some(rev.id);
    }
    Ok(())
}

// =============================================================================
// Revision log backends
// =============================================================================

/// Append-only store of revision chains.
#[async_trait]
pub trait RevisionLog: Send + Sync {
    /// Append a linked batch atomically. The first revision must extend the
    /// current head.
    async fn append(&self, conversation_id: &str, revisions: &[Revision]) -> Result<()>;

    /// Full chain, oldest first.
    async fn history(&self, conversation_id: &str) -> Result<Vec<Revision>>;

    /// Latest revision id.
    async fn head(&self, conversation_id: &str) -> Result<Option<Uuid>> {
        Ok(self.history(conversation_id).await?.last().map(|r| r.id))
    }
}

/// In-process revision log
#[derive(Default)]
pub struct MemoryRevisionLog {
    chains: RwLock<HashMap<String, Vec<Revision>>>,
}

impl MemoryRevisionLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RevisionLog for MemoryRevisionLog {
    async fn append(&self, conversation_id: &str, revisions: &[Revision]) -> Result<()> {
        let mut chains = self.chains.write().await;
        let chain = chains.entry(conversation_id.to_string()).or_default();
        check_linkage(conversation_id, chain.last().map(|r| r.id), revisions)?;
        chain.extend_from_slice(revisions);
        Ok(())
    }

    async fn history(&self, conversation_id: &str) -> Result<Vec<Revision>> {
        let chains = self.chains.read().await;
        Ok(chains.get(conversation_id).cloned().unwrap_or_default())
    }
}

/// JSON-lines revision log, one file per conversation.
pub struct JsonlRevisionLog {
    dir: PathBuf,
    /// Cached heads; populated lazily from disk
    heads: Mutex<HashMap<String, Option<Uuid>>>,
}

impl JsonlRevisionLog {
    pub async fn new(base_dir: &Path) -> Result<Self> {
        let dir = base_dir.join("revisions");
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            Error::Persistence(format!("Failed to create {}: {}", dir.display(), e))
        })?;
        Ok(Self {
            dir,
            heads: Mutex::new(HashMap::new()),
        })
    }

    fn path(&self, conversation_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", storage_name(conversation_id)))
    }

    async fn read_chain(&self, conversation_id: &str) -> Result<Vec<Revision>> {
        let path = self.path(conversation_id);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut revisions = Vec::new();
        for (lineno, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Revision>(line) {
                Ok(rev) => revisions.push(rev),
                Err(e) => {
                    tracing::warn!(
                        "Skipping unreadable revision at {}:{}: {}",
                        path.display(),
                        lineno + 1,
                        e
                    );
                }
            }
        }
        Ok(revisions)
    }
}

#[async_trait]
impl RevisionLog for JsonlRevisionLog {
    async fn append(&self, conversation_id: &str, revisions: &[Revision]) -> Result<()> {
        if revisions.is_empty() {
            return Ok(());
        }

        let mut heads = self.heads.lock().await;
        let head = match heads.get(conversation_id) {
            Some(head) => *head,
            None => self.read_chain(conversation_id).await?.last().map(|r| r.id),
        };
        check_linkage(conversation_id, head, revisions)?;

        let mut buf = Vec::new();
        for rev in revisions {
            serde_json::to_writer(&mut buf, rev)?;
            buf.push(b'\n');
        }

        let path = self.path(conversation_id);
        let persist_err =
            |e: std::io::Error| Error::Persistence(format!("Failed to append {}: {}", path.display(), e));
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(persist_err)?;
        let prev_len = file.metadata().await.map_err(persist_err)?.len();

        let written = async {
            file.write_all(&buf).await?;
            file.flush().await?;
            file.sync_data().await
        }
        .await;

        if let Err(e) = written {
            if let Err(trunc) = file.set_len(prev_len).await {
                tracing::error!(
                    "Failed to truncate {} after partial append: {}",
                    path.display(),
                    trunc
                );
            }
            return Err(persist_err(e));
        }

        heads.insert(
            conversation_id.to_string(),
            revisions.last().map(|r| r.id),
        );
        Ok(())
    }

    async fn history(&self, conversation_id: &str) -> Result<Vec<Revision>> {
        self.read_chain(conversation_id).await
    }

    async fn head(&self, conversation_id: &str) -> Result<Option<Uuid>> {
        let mut heads = self.heads.lock().await;
        if let Some(head) = heads.get(conversation_id) {
            return Ok(*head);
        }
        let head = self.read_chain(conversation_id).await?.last().map(|r| r.id);
        heads.insert(conversation_id.to_string(), head);
        Ok(head)
    }
}

// =============================================================================
// Replay
// =============================================================================

/// Conversation state reconstructed from its history.
#[derive(Debug, Clone, Default)]
pub struct ReplayedState {
    /// Entries in insertion order
    pub entries: Vec<MemoryEntry>,
    pub summary: Option<String>,
    /// Last revision applied
    pub head: Option<Uuid>,
}

/// Rebuild the entry set as of `until` (inclusive), or of the full history.
pub fn replay(history: &[Revision], until: Option<Uuid>) -> Result<ReplayedState> {
    if let Some(target) = until {
        if !history.iter().any(|r| r.id == target) {
            return Err(Error::NotFound(format!("Revision {}", target)));
        }
    }

    let mut state = ReplayedState::default();
    for rev in history {
        match &rev.mutation {
            Mutation::Insert { after } => state.entries.push(after.clone()),
            Mutation::Update { after, .. } => {
                match state.entries.iter_mut().find(|e| e.id == after.id) {
                    Some(slot) => *slot = after.clone(),
                    None => state.entries.push(after.clone()),
                }
            }
            Mutation::Evict { before } | Mutation::Delete { before } => {
                state.entries.retain(|e| e.id != before.id);
            }
            Mutation::Summary { after, .. } => state.summary = after.clone(),
        }
        state.head = Some(rev.id);
        if Some(rev.id) == until {
            break;
        }
    }
    Ok(state)
}
