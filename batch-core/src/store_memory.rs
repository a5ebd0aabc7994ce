//! In-memory `PersistenceBridge`, grounded in the teacher's `MemoryStore`:
//! a single `RwLock<Inner>` guarding plain `HashMap`s, used for tests and
//! for running without a configured database URL.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::events::AccountingRecord;
use crate::store::{AttrRowEntry, CounterStore, EntityRow, LoadOutcome, PersistenceBridge, SaveOutcome, ServerCounters};
use crate::types::{EntityKind, SaveFlags};

struct StoredRow {
    row: EntityRow,
    hash: [u8; 32],
}

#[derive(Default)]
struct Inner {
    rows: HashMap<(EntityKind, String), StoredRow>,
    accounting: HashMap<String, Vec<(u64, AccountingRecord)>>,
    accounting_seq: u64,
    counters: ServerCounters,
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
    liveness_path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            inner: RwLock::new(Inner::default()),
            liveness_path: None,
        }
    }

    /// Configure the liveness file path (spec §4.7). Left unset in tests.
    pub fn with_liveness_path(mut self, path: PathBuf) -> Self {
        self.liveness_path = Some(path);
        self
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistenceBridge for MemoryStore {
    async fn save(&self, row: EntityRow, flags: SaveFlags, removed_attrs: &[String]) -> Result<SaveOutcome> {
        let key = (row.kind, row.qs.identity.clone());
        let mut guard = self.inner.write().await;
        let existed = guard.rows.contains_key(&key);

        let outcome = if flags.has(SaveFlags::NEW) || !existed {
            SaveOutcome::Inserted
        } else {
            SaveOutcome::Updated
        };

        let merged = if flags.has(SaveFlags::ATTRS) && existed && !flags.has(SaveFlags::NEW) {
            // ATTRS-only: merge new/changed entries into the existing row,
            // then apply the removal list (spec §4.7).
            let mut existing = guard.rows.remove(&key).unwrap().row;
            existing.qs = row.qs;
            for incoming in row.attrs {
                existing.attrs.retain(|e| !(e.name == incoming.name && e.resource_name == incoming.resource_name));
                existing.attrs.push(incoming);
            }
            existing.attrs.retain(|e| !removed_attrs.contains(&e.name));
            existing
        } else {
            row
        };

        let hash = merged.content_hash();
        guard.rows.insert(key, StoredRow { row: merged, hash });
        drop(guard);
        self.touch_liveness().await?;
        Ok(outcome)
    }

    async fn load(&self, kind: EntityKind, identity: &str, known_hash: Option<[u8; 32]>) -> Result<LoadOutcome> {
        let guard = self.inner.read().await;
        let Some(stored) = guard.rows.get(&(kind, identity.to_string())) else {
            return Ok(LoadOutcome::NotFound);
        };
        if known_hash == Some(stored.hash) {
            return Ok(LoadOutcome::Unchanged);
        }
        Ok(LoadOutcome::Loaded(stored.row.clone()))
    }

    async fn load_all_identities(&self, kind: EntityKind) -> Result<Vec<String>> {
        let guard = self.inner.read().await;
        Ok(guard
            .rows
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, id)| id.clone())
            .collect())
    }

    async fn delete_attrs(&self, kind: EntityKind, identity: &str, names: &[String]) -> Result<()> {
        let mut guard = self.inner.write().await;
        if let Some(stored) = guard.rows.get_mut(&(kind, identity.to_string())) {
            stored.row.attrs.retain(|e: &AttrRowEntry| !names.contains(&e.name));
            stored.hash = stored.row.content_hash();
        }
        Ok(())
    }

    async fn delete_entity(&self, kind: EntityKind, identity: &str) -> Result<()> {
        let mut guard = self.inner.write().await;
        guard.rows.remove(&(kind, identity.to_string()));
        Ok(())
    }

    async fn append_accounting(&self, record: &AccountingRecord) -> Result<u64> {
        let mut guard = self.inner.write().await;
        guard.accounting_seq += 1;
        let seq = guard.accounting_seq;
        guard
            .accounting
            .entry(record.subject().to_string())
            .or_default()
            .push((seq, record.clone()));
        Ok(seq)
    }

    async fn read_accounting(&self, identity: &str, from_seq: u64) -> Result<Vec<(u64, AccountingRecord)>> {
        let guard = self.inner.read().await;
        Ok(guard
            .accounting
            .get(identity)
            .map(|v| v.iter().filter(|(seq, _)| *seq >= from_seq).cloned().collect())
            .unwrap_or_default())
    }

    async fn touch_liveness(&self) -> Result<()> {
        if let Some(path) = &self.liveness_path {
            tokio::fs::write(path, []).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn load_counters(&self) -> Result<ServerCounters> {
        let guard = self.inner.read().await;
        Ok(guard.counters.clone())
    }

    async fn save_counters(&self, counters: &ServerCounters) -> Result<()> {
        let mut guard = self.inner.write().await;
        guard.counters = counters.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QuickSave;

    fn sample_row(identity: &str) -> EntityRow {
        EntityRow {
            kind: EntityKind::Job,
            qs: QuickSave::new(identity),
            attrs: vec![AttrRowEntry {
                name: "job_name".into(),
                resource_name: None,
                encoded_value: "hello".into(),
                flags: 1,
            }],
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = MemoryStore::new();
        store.save(sample_row("1.server"), SaveFlags::new().with(SaveFlags::NEW), &[]).await.unwrap();
        let loaded = store.load(EntityKind::Job, "1.server", None).await.unwrap();
        assert!(matches!(loaded, LoadOutcome::Loaded(_)));
    }

    #[tokio::test]
    async fn load_with_matching_hash_reports_unchanged() {
        let store = MemoryStore::new();
        store.save(sample_row("1.server"), SaveFlags::new().with(SaveFlags::NEW), &[]).await.unwrap();
        let LoadOutcome::Loaded(row) = store.load(EntityKind::Job, "1.server", None).await.unwrap() else {
            panic!("expected Loaded");
        };
        let hash = row.content_hash();
        let second = store.load(EntityKind::Job, "1.server", Some(hash)).await.unwrap();
        assert!(matches!(second, LoadOutcome::Unchanged));
    }

    #[tokio::test]
    async fn attrs_only_save_merges_without_dropping_other_slots() {
        let store = MemoryStore::new();
        store.save(sample_row("1.server"), SaveFlags::new().with(SaveFlags::NEW), &[]).await.unwrap();
        let extra = EntityRow {
            kind: EntityKind::Job,
            qs: QuickSave::new("1.server"),
            attrs: vec![AttrRowEntry {
                name: "job_owner".into(),
                resource_name: None,
                encoded_value: "alice".into(),
                flags: 1,
            }],
        };
        store.save(extra, SaveFlags::new().with(SaveFlags::ATTRS), &[]).await.unwrap();
        let LoadOutcome::Loaded(row) = store.load(EntityKind::Job, "1.server", None).await.unwrap() else {
            panic!("expected Loaded");
        };
        assert_eq!(row.attrs.len(), 2);
    }

    #[tokio::test]
    async fn accounting_log_preserves_insertion_order() {
        let store = MemoryStore::new();
        store.append_accounting(&AccountingRecord::JobQueued { job_id: "1.server".into(), queue: "batch".into() }).await.unwrap();
        store.append_accounting(&AccountingRecord::JobStarted { job_id: "1.server".into(), exec_vnode: "n1".into() }).await.unwrap();
        let records = store.read_accounting("1.server", 0).await.unwrap();
        let kinds: Vec<char> = records.iter().map(|(_, r)| r.record_kind()).collect();
        assert_eq!(kinds, vec!['Q', 'S']);
    }
}
