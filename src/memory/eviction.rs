//! Eviction manager
//!
//! Owns the per-conversation capacity bound. Victims are chosen by lowest
//! utility: least recently accessed first, then least accessed, then oldest,
//! with the entry id as a final tie-break so plans are deterministic.

use crate::error::{Error, Result};
use crate::memory::entry::MemoryEntry;
use std::cmp::Ordering;
use uuid::Uuid;

/// Plans evictions that keep a conversation within `max_entries`.
#[derive(Debug, Clone, Copy)]
pub struct EvictionManager {
    max_entries: usize,
}

impl EvictionManager {
    /// Fails with `Error::Config` when `max_entries` is zero.
    pub fn new(max_entries: usize) -> Result<Self> {
        if max_entries == 0 {
            return Err(Error::Config("max_entries must be at least 1".into()));
        }
        Ok(Self { max_entries })
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Entries to evict so that `existing` plus `incoming_id` fits.
    ///
    /// The incoming entry is never a victim. If `incoming_id` is already
    /// present (a replacement), it does not count twice.
    pub fn plan(&self, existing: &[MemoryEntry], incoming_id: Uuid) -> Vec<MemoryEntry> {
        let mut candidates: Vec<&MemoryEntry> =
            existing.iter().filter(|e| e.id != incoming_id).collect();
        let needed = (candidates.len() + 1).saturating_sub(self.max_entries);
        if needed == 0 {
            return Vec::new();
        }

        candidates.sort_by(|a, b| utility_order(a, b));
        let victims: Vec<MemoryEntry> = candidates.into_iter().take(needed).cloned().collect();

        tracing::debug!(
            incoming = %incoming_id,
            evicting = victims.len(),
            max_entries = self.max_entries,
            "Planned eviction"
        );
        victims
    }

    /// Fail if a conversation holds more entries than allowed.
    pub fn check(&self, count: usize) -> Result<()> {
        if count > self.max_entries {
            return Err(Error::InvariantViolation(format!(
                "conversation holds {} entries, max is {}",
                count, self.max_entries
            )));
        }
        Ok(())
    }
}

/// Lowest-utility-first ordering.
pub fn utility_order(a: &MemoryEntry, b: &MemoryEntry) -> Ordering {
    a.last_accessed
        .cmp(&b.last_accessed)
        .then(a.access_count.cmp(&b.access_count))
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::entry::MemoryEntryBuilder;
    use chrono::{Duration, Utc};

    fn entry_aged(minutes_ago: i64, accesses: u32) -> MemoryEntry {
        let at = Utc::now() - Duration::minutes(minutes_ago);
        let mut e = MemoryEntryBuilder::new("c", format!("fact {}", minutes_ago))
            .embedding(vec![1.0])
            .created_at(at)
            .build()
            .unwrap();
        e.access_count = accesses;
        e
    }

    #[test]
    fn test_no_eviction_below_capacity() {
        let mgr = EvictionManager::new(3).unwrap();
        let existing = vec![entry_aged(10, 0), entry_aged(5, 0)];
        assert!(mgr.plan(&existing, Uuid::new_v4()).is_empty());
    }

    #[test]
    fn test_evicts_least_recently_accessed() {
        let mgr = EvictionManager::new(3).unwrap();
        let oldest = entry_aged(30, 0);
        let mut touched = entry_aged(40, 0);
        touched.last_accessed = Utc::now();
        let existing = vec![touched.clone(), oldest.clone(), entry_aged(20, 0)];

        let victims = mgr.plan(&existing, Uuid::new_v4());
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].id, oldest.id);
    }

    #[test]
    fn test_access_count_breaks_recency_tie() {
        let mgr = EvictionManager::new(1).unwrap();
        let at = Utc::now() - Duration::minutes(5);
        let mut busy = entry_aged(5, 9);
        let mut idle = entry_aged(5, 1);
        busy.last_accessed = at;
        idle.last_accessed = at;

        let victims = mgr.plan(&[busy.clone(), idle.clone()], Uuid::new_v4());
        assert_eq!(victims.len(), 2);
        assert_eq!(victims[0].id, idle.id);
    }

    #[test]
    fn test_incoming_never_victim() {
        let mgr = EvictionManager::new(1).unwrap();
        let incoming = entry_aged(100, 0);
        let other = entry_aged(1, 5);
        let victims = mgr.plan(&[incoming.clone(), other.clone()], incoming.id);
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].id, other.id);
    }

    #[test]
    fn test_replacement_counts_once() {
        let mgr = EvictionManager::new(2).unwrap();
        let a = entry_aged(10, 0);
        let b = entry_aged(5, 0);
        assert!(mgr.plan(&[a.clone(), b], a.id).is_empty());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(EvictionManager::new(0), Err(Error::Config(_))));
    }

    #[test]
    fn test_check() {
        let mgr = EvictionManager::new(2).unwrap();
        assert!(mgr.check(2).is_ok());
        assert!(matches!(mgr.check(3), Err(Error::InvariantViolation(_))));
    }
}
