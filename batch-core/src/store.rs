//! The Persistence Bridge (spec §4.7): converts entity+attribute vectors
//! to/from an abstract key/value row, and provides atomic save, selective
//! attribute delete, and recovery.
//!
//! Grounded in the teacher's `ProcessStore` trait: an `async_trait` with
//! pluggable backends (`store_memory`/`store_postgres`), `anyhow::Result`
//! throughout, content-hash-based change detection on load.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::events::AccountingRecord;
use crate::types::{EntityKind, QuickSave, SaveFlags};

/// One `(name, resource_name_or_empty, encoded_value_string, flags)` tuple
/// from spec §4.7 — the wire shape of a single attribute in the row's
/// variable attribute map.
#[derive(Debug, Clone, PartialEq)]
pub struct AttrRowEntry {
    pub name: String,
    pub resource_name: Option<String>,
    pub encoded_value: String,
    pub flags: u16,
}

/// The full marshalled row for one entity: quick-save prefix plus the
/// variable attribute map (spec §4.7, §6 "Persistence row shapes").
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRow {
    pub kind: EntityKind,
    pub qs: QuickSave,
    pub attrs: Vec<AttrRowEntry>,
}

impl EntityRow {
    /// A stable content hash used by `load` to distinguish "no change" from
    /// "row differs" (spec §4.7): sorted attribute entries folded through
    /// SHA-256 alongside the quick-save fields.
    pub fn content_hash(&self) -> [u8; 32] {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.qs.identity.as_bytes());
        hasher.update([self.qs.state]);
        hasher.update(self.qs.substate.to_le_bytes());
        hasher.update(self.qs.flags.bits().to_le_bytes());
        let mut sorted = self.attrs.clone();
        sorted.sort_by(|a, b| (a.name.as_str(), a.resource_name.as_deref()).cmp(&(b.name.as_str(), b.resource_name.as_deref())));
        for entry in &sorted {
            hasher.update(entry.name.as_bytes());
            hasher.update(entry.resource_name.as_deref().unwrap_or("").as_bytes());
            hasher.update(entry.encoded_value.as_bytes());
            hasher.update(entry.flags.to_le_bytes());
        }
        hasher.finalize().into()
    }
}

/// Outcome of a `save` call (spec §4.7's save-type → backing-store command
/// translation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted,
    Updated,
}

/// Outcome of a `load` call. `Unchanged` is distinguished from `Loaded` so
/// recovery can skip replacing the in-memory copy when the stored row is
/// byte-identical by content hash (spec §4.7).
#[derive(Debug, Clone)]
pub enum LoadOutcome {
    NotFound,
    /// The row differs (or the caller passed no prior hash); here is the
    /// full row to replace the in-memory copy with.
    Loaded(EntityRow),
    /// The stored row's content hash matches what the caller already has —
    /// no replacement necessary.
    Unchanged,
}

/// The persistence bridge every server-side component saves/loads entities
/// through (spec §4.7). A single connection backs all saves (spec §5:
/// "the backing store is treated as an externally-serialised resource").
#[async_trait]
pub trait PersistenceBridge: Send + Sync {
    /// Save `row` under `flags` (spec §4.7's SaveFlags bitset):
    /// - `NEW` with no prior row: cold-start truncate-and-reinsert.
    /// - `NEW` otherwise: insert + full attribute upsert.
    /// - `QS`: quick-save fields changed, row already exists.
    /// - `ATTRS`-only: merge `removed`-free entries, then delete
    ///   `removed_attrs` by name.
    ///
    /// On failure the caller (per spec §4.7/§7) logs and panic-stops the
    /// store; this trait only returns the error, it does not itself panic.
    async fn save(
        &self,
        row: EntityRow,
        flags: SaveFlags,
        removed_attrs: &[String],
    ) -> Result<SaveOutcome>;

    /// Load the current row for `(kind, identity)`. If `known_hash` is
    /// `Some` and matches the stored row's content hash, returns
    /// `Unchanged` instead of re-marshalling the whole row.
    async fn load(
        &self,
        kind: EntityKind,
        identity: &str,
        known_hash: Option<[u8; 32]>,
    ) -> Result<LoadOutcome>;

    /// All persisted identities of a kind, for server-start recovery scans.
    async fn load_all_identities(&self, kind: EntityKind) -> Result<Vec<String>>;

    /// Remove a set of attribute names from a row without touching the
    /// rest (spec §4.7 "Selective remove uses a separate statement keyed
    /// by the set of removed attribute names").
    async fn delete_attrs(&self, kind: EntityKind, identity: &str, names: &[String]) -> Result<()>;

    /// Delete the whole entity row (job deletion after terminal substate
    /// and accounting flush; standing-reservation purge).
    async fn delete_entity(&self, kind: EntityKind, identity: &str) -> Result<()>;

    /// Append one accounting record to the durable per-entity log.
    async fn append_accounting(&self, record: &AccountingRecord) -> Result<u64>;

    /// Read the accounting log for one entity from `from_seq` onward.
    async fn read_accounting(&self, identity: &str, from_seq: u64) -> Result<Vec<(u64, AccountingRecord)>>;

    /// Touch the zero-byte liveness file (spec §4.7: "used by a peer
    /// failover process to detect silent hangs"). Called on every save.
    async fn touch_liveness(&self) -> Result<()>;
}

/// Counters the server quick-save header needs across entities (spec §6:
/// `Server: (jobid_counter BIGINT, attributes map)`), kept out of the
/// generic `EntityRow` since only the server ever carries one.
#[derive(Debug, Clone, Default)]
pub struct ServerCounters {
    pub jobid_counter: i64,
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn load_counters(&self) -> Result<ServerCounters>;
    async fn save_counters(&self, counters: &ServerCounters) -> Result<()>;
}

/// Helper used by both backends to fold an entity's attribute vector into
/// `AttrRowEntry` tuples via the attribute framework's `encode` (spec
/// §4.7: "the same produced by `encode`").
pub fn encode_attrs(defs: &[crate::attribute::AttributeDef], attrs: &[crate::types::Attribute]) -> Vec<AttrRowEntry> {
    let mut out = Vec::new();
    for (def, attr) in defs.iter().zip(attrs.iter()) {
        if !attr.is_set() {
            continue;
        }
        match &attr.payload {
            Some(crate::types::Payload::ResourceList(map)) => {
                for (rname, rv) in map {
                    let wrapped = crate::types::Attribute {
                        flags: crate::types::AttrFlags::SET,
                        payload: Some(rv.payload.clone()),
                    };
                    for v in crate::attribute::encode(&wrapped) {
                        out.push(AttrRowEntry {
                            name: def.name.to_string(),
                            resource_name: Some(rname.clone()),
                            encoded_value: v,
                            flags: attr.flags.bits(),
                        });
                    }
                }
            }
            _ => {
                for v in crate::attribute::encode(attr) {
                    out.push(AttrRowEntry {
                        name: def.name.to_string(),
                        resource_name: None,
                        encoded_value: v,
                        flags: attr.flags.bits(),
                    });
                }
            }
        }
    }
    out
}

/// Rebuild an attribute vector from row entries against a catalog (spec
/// §4.7's from-row direction), grouping resource-list members back into
/// a single `ResourceList` payload per top-level attribute.
pub fn decode_attrs(
    defs: &[crate::attribute::AttributeDef],
    entries: &[AttrRowEntry],
) -> Vec<crate::types::Attribute> {
    use crate::types::{Attribute, AttrFlags, Payload};
    let mut attrs = vec![Attribute::unset(); defs.len()];
    let mut resource_lists: BTreeMap<usize, BTreeMap<String, crate::types::ResourceValue>> = BTreeMap::new();

    for entry in entries {
        let Some(idx) = defs.iter().position(|d| d.name.eq_ignore_ascii_case(&entry.name)) else {
            continue;
        };
        let def = &defs[idx];
        if let Some(rname) = &entry.resource_name {
            let rtype = crate::resource::ResourceCatalog::resources()
                .find(rname)
                .map(|d| d.atype)
                .unwrap_or(crate::types::AttrType::Str);
            if let Ok(payload) = crate::attribute::decode(rtype, &entry.encoded_value) {
                resource_lists.entry(idx).or_default().insert(
                    rname.clone(),
                    crate::types::ResourceValue { rtype, payload },
                );
            }
            continue;
        }
        if let Ok(payload) = crate::attribute::decode(def.atype, &entry.encoded_value) {
            attrs[idx] = Attribute {
                flags: AttrFlags::from_bits_truncate(entry.flags) | AttrFlags::SET,
                payload: Some(payload),
            };
        }
    }
    for (idx, map) in resource_lists {
        attrs[idx] = Attribute {
            flags: AttrFlags::SET,
            payload: Some(Payload::ResourceList(map)),
        };
    }
    attrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{QsFlags, QuickSave};

    fn row(priority: &str) -> EntityRow {
        EntityRow {
            kind: EntityKind::Job,
            qs: QuickSave {
                identity: "1.server".into(),
                state: b'Q',
                substate: 10,
                flags: QsFlags::empty(),
            },
            attrs: vec![
                AttrRowEntry { name: "priority".into(), resource_name: None, encoded_value: priority.into(), flags: 1 },
                AttrRowEntry { name: "job_name".into(), resource_name: None, encoded_value: "demo".into(), flags: 1 },
            ],
        }
    }

    #[test]
    fn content_hash_stable_under_attribute_reorder() {
        let mut a = row("5");
        a.attrs.reverse();
        let b = row("5");
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn content_hash_changes_with_value() {
        assert_ne!(row("5").content_hash(), row("6").content_hash());
    }
}
