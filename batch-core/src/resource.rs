//! Resource Catalog & Select/Place validation (spec §4.2).
//!
//! The catalog is a static table of built-in resources plus dynamic entries
//! learned from the server (`server_dyn_res` in the original); this core
//! models the static half, since the dynamic half is populated at runtime
//! by the out-of-scope scheduler interface.

use std::collections::BTreeMap;

use crate::attribute::{ActionCtx, ActionFn, AttributeDef};
use crate::error::BatchError;
use crate::types::*;

/// One `key=value` unit of a `select` chunk, possibly repeated (`count:`).
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub count: u32,
    pub keys: BTreeMap<String, String>,
}

/// A fully parsed `select` string: `+`-joined chunks.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectSpec {
    pub chunks: Vec<Chunk>,
}

impl SelectSpec {
    pub fn total_chunks(&self) -> u32 {
        self.chunks.iter().map(|c| c.count.max(1)).sum()
    }
}

/// Parse a `select` string: `[count:]key=value[:key=value...][+...]`.
pub fn parse_select(text: &str) -> Result<SelectSpec, BatchError> {
    let mut chunks = Vec::new();
    for part in text.split('+') {
        if part.is_empty() {
            return Err(BatchError::BadValue {
                attr: "select".into(),
                detail: "empty chunk".into(),
            });
        }
        let mut segs = part.split(':');
        let first = segs.next().unwrap();
        let (count, first_kv) = match first.split_once('=') {
            Some(_) => (1, Some(first)),
            None => (
                first.parse::<u32>().map_err(|_| BatchError::BadValue {
                    attr: "select".into(),
                    detail: format!("bad chunk count '{first}'"),
                })?,
                None,
            ),
        };
        let mut keys = BTreeMap::new();
        if let Some(kv) = first_kv {
            insert_kv(&mut keys, kv)?;
        }
        for seg in segs {
            insert_kv(&mut keys, seg)?;
        }
        if keys.is_empty() {
            return Err(BatchError::BadValue {
                attr: "select".into(),
                detail: "chunk has no key=value pairs".into(),
            });
        }
        chunks.push(Chunk { count, keys });
    }
    if chunks.is_empty() {
        return Err(BatchError::BadValue {
            attr: "select".into(),
            detail: "empty select".into(),
        });
    }
    Ok(SelectSpec { chunks })
}

fn insert_kv(keys: &mut BTreeMap<String, String>, seg: &str) -> Result<(), BatchError> {
    let (k, v) = seg.split_once('=').ok_or_else(|| BatchError::BadValue {
        attr: "select".into(),
        detail: format!("expected key=value in '{seg}'"),
    })?;
    keys.insert(k.to_string(), v.to_string());
    Ok(())
}

/// Placement arrangement keyword (mutually exclusive group 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrangement {
    Free,
    Pack,
    Scatter,
    VScatter,
}

/// Placement sharing keyword (mutually exclusive group 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sharing {
    Excl,
    ExclHost,
    Shared,
}

/// A fully parsed `place` string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaceSpec {
    pub arrangement: Option<Arrangement>,
    pub sharing: Option<Sharing>,
    pub group: Option<String>,
}

/// Parse `place`: colon-separated keywords, case-insensitive, partitioned
/// into mutually exclusive groups, plus `group=resource`.
pub fn parse_place(text: &str, catalog: &ResourceCatalog) -> Result<PlaceSpec, BatchError> {
    let mut spec = PlaceSpec::default();
    for kw in text.split(':') {
        let lower = kw.to_ascii_lowercase();
        if let Some(res) = lower.strip_prefix("group=") {
            if spec.group.is_some() {
                return Err(BatchError::BadValue {
                    attr: "place".into(),
                    detail: "duplicate group= clause".into(),
                });
            }
            let def = catalog
                .find(res)
                .ok_or_else(|| BatchError::UnknownResource(res.to_string()))?;
            if !matches!(def.atype, AttrType::Str | AttrType::StrArray) {
                return Err(BatchError::BadValue {
                    attr: "place".into(),
                    detail: format!("group resource '{res}' is not string-typed"),
                });
            }
            spec.group = Some(res.to_string());
            continue;
        }
        let arrangement = match lower.as_str() {
            "free" => Some(Arrangement::Free),
            "pack" => Some(Arrangement::Pack),
            "scatter" => Some(Arrangement::Scatter),
            "vscatter" => Some(Arrangement::VScatter),
            _ => None,
        };
        if let Some(a) = arrangement {
            if spec.arrangement.is_some() {
                return Err(BatchError::BadValue {
                    attr: "place".into(),
                    detail: "conflicting arrangement keywords".into(),
                });
            }
            spec.arrangement = Some(a);
            continue;
        }
        let sharing = match lower.as_str() {
            "excl" => Some(Sharing::Excl),
            "exclhost" => Some(Sharing::ExclHost),
            "shared" => Some(Sharing::Shared),
            _ => None,
        };
        if let Some(s) = sharing {
            if spec.sharing.is_some() {
                return Err(BatchError::BadValue {
                    attr: "place".into(),
                    detail: "conflicting sharing keywords".into(),
                });
            }
            spec.sharing = Some(s);
            continue;
        }
        return Err(BatchError::BadValue {
            attr: "place".into(),
            detail: format!("unknown place keyword '{kw}'"),
        });
    }
    Ok(spec)
}

/// Parses a "size" string with suffixes `{k,m,g,t,p}{b,w}`, one `w` = 8
/// bytes, into kilobytes (spec §3).
pub fn parse_size_kb(text: &str) -> Result<u64, BatchError> {
    let text = text.trim();
    let bad = || BatchError::BadValue {
        attr: "size".into(),
        detail: format!("bad size spec '{text}'"),
    };
    if text.is_empty() {
        return Err(bad());
    }
    let lower = text.to_ascii_lowercase();
    let (num_part, suffix) = match lower.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) => (&lower[..idx], &lower[idx..]),
        None => (lower.as_str(), ""),
    };
    let value: f64 = num_part.parse().map_err(|_| bad())?;
    if value < 0.0 {
        return Err(bad());
    }
    let (scale, word_bytes) = match suffix {
        "" | "b" => (1u64, 1u64),
        "w" => (1, 8),
        "kb" => (1, 1),
        "kw" => (1, 8),
        "mb" => (1024, 1),
        "mw" => (1024, 8),
        "gb" => (1024 * 1024, 1),
        "gw" => (1024 * 1024, 8),
        "tb" => (1024 * 1024 * 1024, 1),
        "tw" => (1024 * 1024 * 1024, 8),
        "pb" => (1024 * 1024 * 1024 * 1024, 1),
        "pw" => (1024 * 1024 * 1024 * 1024, 8),
        _ => return Err(bad()),
    };
    // num_part is expressed directly in the suffix's unit (kb/mb/...); "b"/"w"
    // with no unit prefix means the literal count of bytes/words.
    let base_kb = if suffix.is_empty() || suffix == "b" || suffix == "w" {
        (value * word_bytes as f64) / 1024.0
    } else {
        value * scale as f64 * word_bytes as f64
    };
    Ok(base_kb.round() as u64)
}

/// Renders kilobytes back to a canonical size string (round-trips through
/// `parse_size_kb`, spec §8).
pub fn format_size_kb(kb: u64) -> String {
    const TB: u64 = 1024 * 1024 * 1024;
    const GB: u64 = 1024 * 1024;
    const MB: u64 = 1024;
    if kb == 0 {
        return "0kb".to_string();
    }
    if kb % TB == 0 {
        format!("{}tb", kb / TB)
    } else if kb % GB == 0 {
        format!("{}gb", kb / GB)
    } else if kb % MB == 0 {
        format!("{}mb", kb / MB)
    } else {
        format!("{kb}kb")
    }
}

/// Static registry: attribute defs for a given `EntityKind`, indexed by
/// `AttrId` in declaration order, with a name lookup for the decoder.
#[derive(Debug, Clone)]
pub struct ResourceCatalog {
    defs: Vec<AttributeDef>,
}

impl ResourceCatalog {
    pub fn defs(&self) -> &[AttributeDef] {
        &self.defs
    }

    pub fn find(&self, name: &str) -> Option<&AttributeDef> {
        self.defs.iter().find(|d| d.name.eq_ignore_ascii_case(name))
    }

    fn builder() -> CatalogBuilder {
        CatalogBuilder { defs: Vec::new() }
    }

    /// Built-in resources nested in a job/reservation/queue's `resource_list`
    /// attribute (ncpus, mem, walltime, select, place, ...).
    pub fn resources() -> Self {
        Self::builder()
            .def("ncpus", AttrType::Long, AccessFlags::READWRITE_ALL, Some(action_non_negative_long))
            .def("mem", AttrType::Size, AccessFlags::READWRITE_ALL, Some(action_non_negative_long))
            .def("walltime", AttrType::Duration, AccessFlags::READWRITE_ALL, Some(action_walltime))
            .def("soft_walltime", AttrType::Duration, AccessFlags::READWRITE_ALL, Some(action_soft_walltime))
            .def("min_walltime", AttrType::Duration, AccessFlags::READWRITE_ALL, Some(action_min_walltime))
            .def("max_walltime", AttrType::Duration, AccessFlags::READWRITE_ALL, None)
            .def("nodect", AttrType::Long, AccessFlags::READONLY_MGR, None)
            .def("select", AttrType::Str, AccessFlags::READWRITE_ALL, Some(action_select))
            .def("place", AttrType::Str, AccessFlags::READWRITE_ALL, None)
            .def("aoe", AttrType::Str, AccessFlags::READWRITE_ALL, Some(action_aoe))
            .def("eoe", AttrType::Str, AccessFlags::READWRITE_ALL, Some(action_aoe))
            .def("preempt_targets", AttrType::StrArray, AccessFlags::READWRITE_MGR, None)
            .def("group_list", AttrType::StrArray, AccessFlags::READWRITE_ALL, None)
            .def("host_list", AttrType::StrArray, AccessFlags::READONLY_MGR, None)
            .build()
    }
}

struct CatalogBuilder {
    defs: Vec<AttributeDef>,
}

impl CatalogBuilder {
    fn def(
        mut self,
        name: &'static str,
        atype: AttrType,
        access: AccessFlags,
        action: Option<crate::attribute::ActionFn>,
    ) -> Self {
        let id = AttrId(self.defs.len() as u16);
        self.defs.push(AttributeDef {
            id,
            name,
            atype,
            access,
            action,
        });
        self
    }

    fn build(self) -> ResourceCatalog {
        ResourceCatalog { defs: self.defs }
    }
}

fn find_slot<'a>(ctx: &'a mut ActionCtx, name: &str) -> Option<(usize, &'a mut Attribute)> {
    let idx = ctx.catalog.defs().iter().position(|d| d.name == name)?;
    Some((idx, &mut ctx.new[idx]))
}

fn long_value(attr: &Attribute) -> Option<i64> {
    match &attr.payload {
        Some(Payload::Long(n)) => Some(*n),
        _ => None,
    }
}

fn duration_value(attr: &Attribute) -> Option<u64> {
    match &attr.payload {
        Some(Payload::DurationSecs(s)) => Some(*s),
        _ => None,
    }
}

fn str_value(attr: &Attribute) -> Option<String> {
    match &attr.payload {
        Some(Payload::Str(s)) => Some(s.clone()),
        _ => None,
    }
}

/// Non-negative guard shared by long-typed built-in resources.
fn action_non_negative_long(ctx: &mut ActionCtx) -> Result<(), BatchError> {
    let idx = ctx.catalog.defs().iter().position(|d| d.id == ctx.changed);
    if let Some(idx) = idx {
        if let Some(n) = long_value(&ctx.new[idx]) {
            if n < 0 {
                return Err(BatchError::BadValue {
                    attr: ctx.catalog.defs()[idx].name.to_string(),
                    detail: "must be non-negative".into(),
                });
            }
        }
    }
    Ok(())
}

/// `walltime ≥ soft_walltime` whenever both are set (spec §3 invariant).
fn action_walltime(ctx: &mut ActionCtx) -> Result<(), BatchError> {
    action_non_negative_long(ctx)?;
    check_walltime_ordering(ctx)
}

fn action_soft_walltime(ctx: &mut ActionCtx) -> Result<(), BatchError> {
    check_walltime_ordering(ctx)
}

fn check_walltime_ordering(ctx: &mut ActionCtx) -> Result<(), BatchError> {
    let walltime = find_slot(ctx, "walltime").and_then(|(_, a)| duration_value(a));
    let soft = find_slot(ctx, "soft_walltime").and_then(|(_, a)| duration_value(a));
    if let (Some(w), Some(s)) = (walltime, soft) {
        if w < s {
            return Err(BatchError::BadValue {
                attr: "soft_walltime".into(),
                detail: "soft_walltime must not exceed walltime".into(),
            });
        }
    }
    Ok(())
}

/// `min_walltime ≤ max_walltime` whenever both are set (spec §3 invariant).
fn action_min_walltime(ctx: &mut ActionCtx) -> Result<(), BatchError> {
    let min = find_slot(ctx, "min_walltime").and_then(|(_, a)| duration_value(a));
    let max = find_slot(ctx, "max_walltime").and_then(|(_, a)| duration_value(a));
    if let (Some(mn), Some(mx)) = (min, max) {
        if mn > mx {
            return Err(BatchError::BadValue {
                attr: "min_walltime".into(),
                detail: "min_walltime must not exceed max_walltime".into(),
            });
        }
    }
    Ok(())
}

/// `select` chunk invariants: derives `nodect`, cross-checks `ncpus`, and
/// validates `aoe=` single-valuedness across chunks (spec §4.2).
fn action_select(ctx: &mut ActionCtx) -> Result<(), BatchError> {
    let text = find_slot(ctx, "select")
        .and_then(|(_, a)| str_value(a))
        .unwrap_or_default();
    let spec = parse_select(&text)?;

    check_aoe_consistency(&spec, "aoe")?;
    check_aoe_consistency(&spec, "eoe")?;

    let nodect = spec.total_chunks();
    if let Some((_, attr)) = find_slot(ctx, "nodect") {
        attr.payload = Some(Payload::Long(nodect as i64));
        attr.flags.insert(AttrFlags::SET | AttrFlags::DEFAULT);
    }

    // ncpus follows unless explicitly set and non-default; if an explicit
    // per-chunk cpu count ("ncpus=") is present it must agree.
    let chunk_cpus: Vec<i64> = spec
        .chunks
        .iter()
        .filter_map(|c| c.keys.get("ncpus").and_then(|v| v.parse::<i64>().ok()))
        .collect();
    if let Some((idx, attr)) = find_slot(ctx, "ncpus") {
        let explicit_non_default = attr.is_set() && !attr.flags.contains(AttrFlags::DEFAULT);
        if !chunk_cpus.is_empty() {
            let total: i64 = spec
                .chunks
                .iter()
                .map(|c| {
                    c.count.max(1) as i64
                        * c.keys
                            .get("ncpus")
                            .and_then(|v| v.parse::<i64>().ok())
                            .unwrap_or(0)
                })
                .sum();
            if explicit_non_default {
                if long_value(&ctx.new[idx]) != Some(total) {
                    return Err(BatchError::BadValue {
                        attr: "ncpus".into(),
                        detail: "explicit ncpus disagrees with per-chunk cpu count in select".into(),
                    });
                }
            } else {
                ctx.new[idx].payload = Some(Payload::Long(total));
                ctx.new[idx].flags.insert(AttrFlags::SET | AttrFlags::DEFAULT);
            }
        } else if !explicit_non_default {
            ctx.new[idx].payload = Some(Payload::Long(nodect as i64));
            ctx.new[idx].flags.insert(AttrFlags::SET | AttrFlags::DEFAULT);
        } else if let Some(n) = long_value(&ctx.new[idx]) {
            if nodect != 0 && n % nodect as i64 != 0 {
                return Err(BatchError::BadValue {
                    attr: "ncpus".into(),
                    detail: "ncpus must be a multiple of the chunk count".into(),
                });
            }
        }
    }
    Ok(())
}

/// Runs resource `changed_name`'s action against its full sibling map,
/// wiring the per-resource actions (`nodect`/`ncpus` derivation, walltime
/// ordering, aoe consistency) into the request pipeline (spec §4.2):
/// materializes the map into a catalog-ordered slot vector so the action
/// can see and mutate siblings the same way entity-level actions see
/// `ctx.new`, then writes every touched slot back into the map.
pub fn apply_resource_action(
    catalog: &ResourceCatalog,
    map: &mut BTreeMap<String, ResourceValue>,
    changed_name: &str,
    changed_id: AttrId,
    action: ActionFn,
    kind: EntityKind,
    mode: ActionMode,
) -> Result<(), BatchError> {
    let mut slots: Vec<Attribute> = catalog
        .defs()
        .iter()
        .map(|d| match map.get(d.name) {
            Some(rv) => Attribute { flags: AttrFlags::SET, payload: Some(rv.payload.clone()) },
            None => Attribute::unset(),
        })
        .collect();

    let mut ctx = ActionCtx {
        kind,
        catalog,
        new: &mut slots,
        changed: changed_id,
        resource_name: Some(changed_name),
        mode,
    };
    action(&mut ctx)?;

    for (d, attr) in catalog.defs().iter().zip(slots.iter()) {
        if attr.is_set() {
            map.insert(d.name.to_string(), ResourceValue { rtype: d.atype, payload: attr.payload.clone().unwrap() });
        } else {
            map.remove(d.name);
        }
    }
    Ok(())
}

fn check_aoe_consistency(spec: &SelectSpec, key: &str) -> Result<(), BatchError> {
    let mut seen: Option<&str> = None;
    for chunk in &spec.chunks {
        if let Some(v) = chunk.keys.get(key) {
            match seen {
                None => seen = Some(v.as_str()),
                Some(prev) if prev != v => {
                    return Err(BatchError::AoeChunkMismatch(format!(
                        "{key}={prev} vs {key}={v}"
                    )))
                }
                _ => {}
            }
        }
    }
    let any_set = spec.chunks.iter().any(|c| c.keys.contains_key(key));
    let all_set = spec.chunks.iter().all(|c| c.keys.contains_key(key));
    if any_set && !all_set {
        return Err(BatchError::AoeChunkMismatch(format!(
            "{key}= must be present on every chunk or none"
        )));
    }
    Ok(())
}

/// `aoe=`/`eoe=` top-level job attribute: single-valued, consistent with
/// any per-chunk tag in `select` (spec §4.2/§3).
fn action_aoe(ctx: &mut ActionCtx) -> Result<(), BatchError> {
    let select_text = find_slot(ctx, "select")
        .and_then(|(_, a)| str_value(a))
        .unwrap_or_default();
    if select_text.is_empty() {
        return Ok(());
    }
    let spec = parse_select(&select_text)?;
    let name = ctx
        .catalog
        .defs()
        .iter()
        .find(|d| d.id == ctx.changed)
        .map(|d| d.name)
        .unwrap_or("aoe");
    let job_value = find_slot(ctx, name).and_then(|(_, a)| str_value(a));
    if let Some(jv) = job_value {
        for chunk in &spec.chunks {
            if let Some(cv) = chunk.keys.get(name) {
                if cv != &jv {
                    return Err(BatchError::AoeChunkMismatch(format!(
                        "job {name}={jv} vs chunk {name}={cv}"
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_round_trips() {
        for kb in [0u64, 1, 1023, 1024, 1024 * 1024, 1024 * 1024 * 1024] {
            let s = format_size_kb(kb);
            assert_eq!(parse_size_kb(&s).unwrap(), kb, "round trip for {kb}kb via '{s}'");
        }
    }

    #[test]
    fn select_derives_nodect() {
        let spec = parse_select("2:ncpus=4+1:ncpus=2").unwrap();
        assert_eq!(spec.total_chunks(), 3);
    }

    #[test]
    fn aoe_mismatch_across_chunks_rejected() {
        let spec = parse_select("1:ncpus=2:aoe=x+1:ncpus=2:aoe=y").unwrap();
        assert!(check_aoe_consistency(&spec, "aoe").is_err());
    }

    #[test]
    fn place_parses_mutually_exclusive_groups() {
        let catalog = ResourceCatalog::resources();
        let spec = parse_place("pack:excl", &catalog).unwrap();
        assert_eq!(spec.arrangement, Some(Arrangement::Pack));
        assert_eq!(spec.sharing, Some(Sharing::Excl));
    }

    #[test]
    fn place_rejects_conflicting_arrangement() {
        let catalog = ResourceCatalog::resources();
        assert!(parse_place("pack:scatter", &catalog).is_err());
    }
}
