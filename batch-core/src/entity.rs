//! Per-`EntityKind` attribute catalogs (spec §3 Entity, §9: "a sealed
//! trait/interface ... plus a small registry indexed by entity-kind and
//! attribute id").
//!
//! Unlike `resource::ResourceCatalog` (nested resources inside a
//! `resource_list` attribute), this catalog describes the top-level
//! attribute slots an `Entity` of a given kind carries directly. Both share
//! the same `AttributeDef`/action machinery from `attribute.rs`.

use crate::attribute::{ActionCtx, ActionFn, AttributeDef};
use crate::error::BatchError;
use crate::types::*;

/// Attribute defs for one `EntityKind`, in declaration order — the order
/// is the `AttrId` numbering for that kind.
#[derive(Debug, Clone)]
pub struct AttrCatalog {
    pub kind: EntityKind,
    defs: Vec<AttributeDef>,
}

impl AttrCatalog {
    pub fn defs(&self) -> &[AttributeDef] {
        &self.defs
    }

    pub fn find(&self, name: &str) -> Option<&AttributeDef> {
        self.defs.iter().find(|d| d.name.eq_ignore_ascii_case(name))
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.defs.iter().position(|d| d.name.eq_ignore_ascii_case(name))
    }

    /// A freshly unset attribute vector sized to this catalog.
    pub fn blank_attrs(&self) -> Vec<Attribute> {
        vec![Attribute::unset(); self.defs.len()]
    }

    fn for_kind(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Server => server_catalog(),
            EntityKind::Scheduler => scheduler_catalog(),
            EntityKind::Queue => queue_catalog(),
            EntityKind::Node => node_catalog(),
            EntityKind::Job => job_catalog(),
            EntityKind::Reservation => reservation_catalog(),
        }
    }
}

/// The full registry: one catalog per `EntityKind`, built once and shared.
#[derive(Debug, Clone)]
pub struct EntityCatalogs {
    server: AttrCatalog,
    scheduler: AttrCatalog,
    queue: AttrCatalog,
    node: AttrCatalog,
    job: AttrCatalog,
    reservation: AttrCatalog,
}

impl EntityCatalogs {
    pub fn build() -> Self {
        EntityCatalogs {
            server: AttrCatalog::for_kind(EntityKind::Server),
            scheduler: AttrCatalog::for_kind(EntityKind::Scheduler),
            queue: AttrCatalog::for_kind(EntityKind::Queue),
            node: AttrCatalog::for_kind(EntityKind::Node),
            job: AttrCatalog::for_kind(EntityKind::Job),
            reservation: AttrCatalog::for_kind(EntityKind::Reservation),
        }
    }

    pub fn for_kind(&self, kind: EntityKind) -> &AttrCatalog {
        match kind {
            EntityKind::Server => &self.server,
            EntityKind::Scheduler => &self.scheduler,
            EntityKind::Queue => &self.queue,
            EntityKind::Node => &self.node,
            EntityKind::Job => &self.job,
            EntityKind::Reservation => &self.reservation,
        }
    }

    /// A brand-new, never-persisted entity of `kind` with `identity`, every
    /// slot unset (spec §3: new-object flag starts true).
    pub fn new_entity(&self, kind: EntityKind, identity: impl Into<String>) -> Entity {
        Entity {
            kind,
            qs: QuickSave::new(identity),
            attrs: self.for_kind(kind).blank_attrs(),
            new_object: true,
            links: EntityLinks::default(),
        }
    }
}

impl Default for EntityCatalogs {
    fn default() -> Self {
        Self::build()
    }
}

fn def(
    defs: &mut Vec<AttributeDef>,
    name: &'static str,
    atype: AttrType,
    access: AccessFlags,
    action: Option<ActionFn>,
) {
    let id = AttrId(defs.len() as u16);
    defs.push(AttributeDef { id, name, atype, access, action });
}

fn server_catalog() -> AttrCatalog {
    let mut defs = Vec::new();
    def(&mut defs, "scheduling", AttrType::Boolean, AccessFlags::READWRITE_MGR, None);
    def(&mut defs, "default_queue", AttrType::Str, AccessFlags::READWRITE_MGR, None);
    def(&mut defs, "managers", AttrType::StrArray, AccessFlags::READWRITE_MGR, None);
    def(&mut defs, "operators", AttrType::StrArray, AccessFlags::READWRITE_MGR, None);
    def(&mut defs, "comment", AttrType::Str, AccessFlags::READWRITE_ALL, None);
    def(&mut defs, "jobid_counter", AttrType::Long, AccessFlags::READONLY_MGR | AccessFlags::DAEMON_WR, None);
    AttrCatalog { kind: EntityKind::Server, defs }
}

fn scheduler_catalog() -> AttrCatalog {
    let mut defs = Vec::new();
    def(&mut defs, "scheduling", AttrType::Boolean, AccessFlags::READWRITE_MGR, None);
    def(&mut defs, "sched_cycle_length", AttrType::Duration, AccessFlags::READWRITE_MGR, None);
    def(&mut defs, "iteration", AttrType::Long, AccessFlags::READONLY_MGR | AccessFlags::DAEMON_WR, None);
    AttrCatalog { kind: EntityKind::Scheduler, defs }
}

fn queue_catalog() -> AttrCatalog {
    let mut defs = Vec::new();
    def(&mut defs, "queue_type", AttrType::Str, AccessFlags::READWRITE_MGR, None);
    def(&mut defs, "enabled", AttrType::Boolean, AccessFlags::READWRITE_MGR, None);
    def(&mut defs, "started", AttrType::Boolean, AccessFlags::READWRITE_MGR, None);
    def(&mut defs, "max_running", AttrType::Long, AccessFlags::READWRITE_MGR, Some(resource_actions::action_non_negative_long_entity));
    def(&mut defs, "priority", AttrType::Long, AccessFlags::READWRITE_MGR, None);
    def(&mut defs, "resources_default", AttrType::ResourceList, AccessFlags::READWRITE_MGR, None);
    def(&mut defs, "resources_max", AttrType::ResourceList, AccessFlags::READWRITE_MGR, None);
    def(&mut defs, "resources_min", AttrType::ResourceList, AccessFlags::READWRITE_MGR, None);
    AttrCatalog { kind: EntityKind::Queue, defs }
}

fn node_catalog() -> AttrCatalog {
    let mut defs = Vec::new();
    def(&mut defs, "state", AttrType::Str, AccessFlags::READONLY_MGR | AccessFlags::DAEMON_WR, None);
    def(&mut defs, "ntype", AttrType::Str, AccessFlags::READONLY_MGR, None);
    def(&mut defs, "resources_available", AttrType::ResourceList, AccessFlags::READWRITE_MGR, None);
    def(&mut defs, "jobs", AttrType::StrArray, AccessFlags::READONLY_MGR | AccessFlags::DAEMON_WR, None);
    AttrCatalog { kind: EntityKind::Node, defs }
}

fn job_catalog() -> AttrCatalog {
    let mut defs = Vec::new();
    def(&mut defs, "job_name", AttrType::Str, AccessFlags::READWRITE_ALL, None);
    def(&mut defs, "job_owner", AttrType::Str, AccessFlags::READONLY_MGR, None);
    def(&mut defs, "queue", AttrType::Str, AccessFlags::READWRITE_MGR, None);
    def(&mut defs, "resource_list", AttrType::ResourceList, AccessFlags::READWRITE_ALL, None);
    def(&mut defs, "exec_vnode", AttrType::Str, AccessFlags::READONLY_MGR | AccessFlags::DAEMON_WR, None);
    def(&mut defs, "exec_host", AttrType::Str, AccessFlags::READONLY_MGR | AccessFlags::DAEMON_WR, None);
    def(&mut defs, "depend", AttrType::StrArray, AccessFlags::READWRITE_ALL, None);
    def(&mut defs, "rerunable", AttrType::Boolean, AccessFlags::READWRITE_ALL, None);
    def(&mut defs, "checkpoint", AttrType::Str, AccessFlags::READWRITE_ALL, None);
    def(&mut defs, "priority", AttrType::Long, AccessFlags::READWRITE_ALL, None);
    def(&mut defs, "execution_time", AttrType::Time, AccessFlags::READWRITE_ALL, None);
    def(&mut defs, "array_id", AttrType::Str, AccessFlags::READONLY_MGR, None);
    def(&mut defs, "comment", AttrType::Str, AccessFlags::READWRITE_MGR, None);
    AttrCatalog { kind: EntityKind::Job, defs }
}

fn reservation_catalog() -> AttrCatalog {
    let mut defs = Vec::new();
    def(&mut defs, "reserve_name", AttrType::Str, AccessFlags::READWRITE_ALL, None);
    def(&mut defs, "reserve_owner", AttrType::Str, AccessFlags::READONLY_MGR, None);
    def(&mut defs, "reserve_start", AttrType::Time, AccessFlags::READWRITE_ALL, None);
    def(&mut defs, "reserve_end", AttrType::Time, AccessFlags::READONLY_MGR | AccessFlags::DAEMON_WR, None);
    def(&mut defs, "reserve_duration", AttrType::Duration, AccessFlags::READWRITE_ALL, None);
    def(&mut defs, "resource_list", AttrType::ResourceList, AccessFlags::READWRITE_ALL, None);
    def(&mut defs, "rrule", AttrType::Str, AccessFlags::READWRITE_ALL, None);
    def(&mut defs, "reserve_tz", AttrType::Str, AccessFlags::READWRITE_ALL, None);
    def(&mut defs, "authorized_users", AttrType::StrArray, AccessFlags::READWRITE_ALL, None);
    AttrCatalog { kind: EntityKind::Reservation, defs }
}

/// Shared action bodies referenced by more than one catalog live under
/// `resource_actions` so `entity.rs` and `resource.rs` don't duplicate them.
pub mod resource_actions {
    use super::*;

    pub fn action_non_negative_long_entity(ctx: &mut ActionCtx) -> Result<(), BatchError> {
        if let Some(Payload::Long(n)) = &ctx.new[ctx_index(ctx)].payload {
            if *n < 0 {
                return Err(BatchError::BadValue {
                    attr: "max_running".into(),
                    detail: "must be non-negative".into(),
                });
            }
        }
        Ok(())
    }

    fn ctx_index(ctx: &ActionCtx) -> usize {
        // The action only ever fires for the slot that changed; its index
        // equals `changed.0` because catalogs assign `AttrId` in
        // declaration order with no gaps.
        ctx.changed.0 as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogs_have_distinct_ids_per_kind() {
        let catalogs = EntityCatalogs::build();
        for kind in [
            EntityKind::Server,
            EntityKind::Scheduler,
            EntityKind::Queue,
            EntityKind::Node,
            EntityKind::Job,
            EntityKind::Reservation,
        ] {
            let cat = catalogs.for_kind(kind);
            let ids: std::collections::BTreeSet<_> = cat.defs().iter().map(|d| d.id).collect();
            assert_eq!(ids.len(), cat.defs().len());
        }
    }

    #[test]
    fn new_entity_starts_with_every_slot_unset() {
        let catalogs = EntityCatalogs::build();
        let e = catalogs.new_entity(EntityKind::Job, "1.server");
        assert!(e.new_object);
        assert!(e.attrs.iter().all(|a| !a.is_set()));
    }
}
