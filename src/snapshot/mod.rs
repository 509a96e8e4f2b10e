//! Compile-time projections of inline cache sites
//!
//! [`build_snapshot`] turns the live contents of an [`InlineCacheSite`] into
//! an immutable [`TypeSpecializationSnapshot`] the optimizing compiler can
//! read from any thread. Every assumption the snapshot makes is backed by a
//! guard registered in the compile's [`GuardSession`]:
//!
//! - a type guard per shape the code will test for
//! - the shared property guard when a fixed value is assumed, the access
//!   goes through a prototype, or the site adds the property
//! - a constructor cache when the fixed value is a constructor

use std::sync::Arc;

use crate::config::JitConfig;
use crate::guard::{ConstructorCache, Guard, GuardSession, PropertyGuard};
use crate::inline_cache::{CacheEntry, CacheEntryKind, InlineCacheSite};
use crate::shape::{FixedValue, FunctionId, PropertyId, ShapeId, ShapeRef};

/// Knobs that shape snapshot construction
#[derive(Debug, Clone)]
pub struct SnapshotOptions {
    /// Allow fixed-value specialization at all
    pub fixed_fields: bool,
    /// Treat eligible monomorphic sites as single-shape equivalent sets
    pub stress_equivalence: bool,
    /// Max shapes for fixed-function polymorphic inlining
    pub polymorphic_inline_limit: usize,
    /// Well-known built-ins whose observed values may be assumed fixed
    pub builtin_properties: Vec<PropertyId>,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self::from(&JitConfig::default())
    }
}

impl From<&JitConfig> for SnapshotOptions {
    fn from(config: &JitConfig) -> Self {
        Self {
            fixed_fields: config.fixed_fields,
            stress_equivalence: config.stress_equivalence,
            polymorphic_inline_limit: config.polymorphic_inline_limit,
            builtin_properties: config.builtin_properties.clone(),
        }
    }
}

impl SnapshotOptions {
    fn is_builtin(&self, property: PropertyId) -> bool {
        self.builtin_properties.contains(&property)
    }
}

/// Shapes specialized code treats as interchangeable, ordered by identity
#[derive(Debug, Clone)]
pub struct EquivalentTypeSet {
    shapes: Vec<ShapeRef>,
}

impl EquivalentTypeSet {
    pub fn new(shapes: impl IntoIterator<Item = ShapeRef>) -> Self {
        let mut shapes: Vec<ShapeRef> = shapes.into_iter().collect();
        shapes.sort_by_key(|shape| shape.id());
        shapes.dedup_by_key(|shape| shape.id());
        Self { shapes }
    }

    pub fn contains(&self, shape: ShapeId) -> bool {
        self.shapes.binary_search_by_key(&shape, |s| s.id()).is_ok()
    }

    pub fn ids(&self) -> Vec<ShapeId> {
        self.shapes.iter().map(|s| s.id()).collect()
    }

    pub fn shapes(&self) -> &[ShapeRef] {
        &self.shapes
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }
}

/// The shape(s) a snapshot specializes on
#[derive(Debug, Clone)]
pub enum SnapshotShapes {
    Monomorphic(ShapeRef),
    Equivalent(EquivalentTypeSet),
}

/// A value assumed constant, with the shapes whose lock state backs it
#[derive(Debug, Clone)]
pub struct FixedFieldInfo {
    value: FixedValue,
    backing: Vec<ShapeRef>,
}

impl FixedFieldInfo {
    pub fn value(&self) -> FixedValue {
        self.value
    }

    pub fn function(&self) -> Option<FunctionId> {
        self.value.as_function()
    }

    /// Whether the assumption can still be trusted under current lock state
    pub fn is_still_fixed(&self) -> bool {
        self.backing.iter().all(|shape| shape.is_locked() && shape.is_intact())
    }
}

/// Immutable, compile-time view of one inline cache site
#[derive(Debug, Clone)]
pub struct TypeSpecializationSnapshot {
    site: usize,
    property: PropertyId,
    shapes: SnapshotShapes,
    slot_index: u16,
    uses_aux_slot: bool,
    kind: CacheEntryKind,
    fixed: Option<FixedFieldInfo>,
    property_guard: Option<Arc<PropertyGuard>>,
    type_guards: Vec<Arc<Guard>>,
    constructor_cache: Option<Arc<ConstructorCache>>,
}

impl TypeSpecializationSnapshot {
    /// Index of the cache site within its unit
    pub fn site(&self) -> usize {
        self.site
    }

    pub fn property(&self) -> PropertyId {
        self.property
    }

    pub fn shapes(&self) -> &SnapshotShapes {
        &self.shapes
    }

    pub fn is_monomorphic(&self) -> bool {
        matches!(self.shapes, SnapshotShapes::Monomorphic(_))
    }

    pub fn equivalent_set(&self) -> Option<&EquivalentTypeSet> {
        match &self.shapes {
            SnapshotShapes::Equivalent(set) => Some(set),
            SnapshotShapes::Monomorphic(_) => None,
        }
    }

    /// Every shape the snapshot references
    pub fn shape_refs(&self) -> &[ShapeRef] {
        match &self.shapes {
            SnapshotShapes::Monomorphic(shape) => std::slice::from_ref(shape),
            SnapshotShapes::Equivalent(set) => set.shapes(),
        }
    }

    pub fn slot_index(&self) -> u16 {
        self.slot_index
    }

    pub fn uses_aux_slot(&self) -> bool {
        self.uses_aux_slot
    }

    pub fn kind(&self) -> CacheEntryKind {
        self.kind
    }

    pub fn fixed(&self) -> Option<&FixedFieldInfo> {
        self.fixed.as_ref()
    }

    pub fn property_guard(&self) -> Option<&Arc<PropertyGuard>> {
        self.property_guard.as_ref()
    }

    pub fn type_guards(&self) -> &[Arc<Guard>] {
        &self.type_guards
    }

    pub fn constructor_cache(&self) -> Option<&Arc<ConstructorCache>> {
        self.constructor_cache.as_ref()
    }

    /// First assumption that no longer holds, if any
    pub fn violation(&self) -> Option<String> {
        if let Some(guard) = &self.property_guard {
            if !guard.is_valid() {
                return Some(format!("property guard for {} invalidated", self.property));
            }
        }
        if let Some(shape) = self.shape_refs().iter().find(|s| !s.is_intact()) {
            return Some(format!("shape {} changed in place", shape.id()));
        }
        if let Some(fixed) = &self.fixed {
            if !fixed.is_still_fixed() {
                return Some(format!("fixed value of {} no longer locked", self.property));
            }
        }
        if let Some(cache) = &self.constructor_cache {
            if !cache.revalidate() {
                return Some(format!("constructor cache for {} invalidated", cache.constructor()));
            }
        }
        None
    }
}

/// Build the snapshot for one site, registering the guards it needs.
///
/// Returns `None` when there is nothing to specialize on: an empty site, a
/// megamorphic site, or a polymorphic site whose entries disagree on layout
/// (which is then marked so later builds skip the comparison).
pub fn build_snapshot(
    site_index: usize,
    site: &mut InlineCacheSite,
    options: &SnapshotOptions,
    session: &mut GuardSession<'_>,
) -> Option<TypeSpecializationSnapshot> {
    let property = site.property();

    if site.is_empty() || site.is_disabled() {
        return None;
    }

    if site.is_monomorphic() {
        let entry = site.entries().first()?.clone();
        if entry.slot.kind.is_missing() {
            site.mark_ignore_for_equivalence();
        }
        return Some(build_monomorphic(site_index, property, &entry, options, session));
    }

    if site.ignore_for_equivalence() {
        return None;
    }

    if let Err(reason) = check_equivalence(site.entries()) {
        tracing::debug!(%property, site = site_index, reason, "polymorphic site is not equivalent");
        site.mark_ignore_for_equivalence();
        return None;
    }

    Some(build_equivalent(site_index, property, site.entries(), options, session))
}

fn build_monomorphic(
    site_index: usize,
    property: PropertyId,
    entry: &CacheEntry,
    options: &SnapshotOptions,
    session: &mut GuardSession<'_>,
) -> TypeSpecializationSnapshot {
    let kind = entry.slot.kind;
    let fixed = if options.fixed_fields && !kind.is_add() && !kind.is_missing() {
        proven_fixed_value(property, entry, options).map(|value| FixedFieldInfo {
            value,
            backing: vec![Arc::clone(&entry.shape)],
        })
    } else {
        None
    };

    let stress_eligible = options.stress_equivalence
        && !kind.is_add()
        && !kind.is_missing()
        && (fixed.is_none() || kind.is_proto());
    let shapes = if stress_eligible {
        SnapshotShapes::Equivalent(EquivalentTypeSet::new([Arc::clone(&entry.shape)]))
    } else {
        SnapshotShapes::Monomorphic(Arc::clone(&entry.shape))
    };

    let type_guards = vec![session.register_type(&entry.shape)];
    let property_guard = if fixed.is_some() || kind.is_proto() || kind.is_add() {
        Some(session.register_shared(property))
    } else {
        None
    };
    let constructor_cache = fixed
        .as_ref()
        .and_then(FixedFieldInfo::function)
        .and_then(|function| session.manager().constructor_cache(function));
    if let Some(cache) = &constructor_cache {
        session.register_constructor_cache(cache);
    }

    TypeSpecializationSnapshot {
        site: site_index,
        property,
        shapes,
        slot_index: entry.slot.slot_index,
        uses_aux_slot: entry.slot.uses_aux_slot,
        kind,
        fixed,
        property_guard,
        type_guards,
        constructor_cache,
    }
}

fn build_equivalent(
    site_index: usize,
    property: PropertyId,
    entries: &[CacheEntry],
    options: &SnapshotOptions,
    session: &mut GuardSession<'_>,
) -> TypeSpecializationSnapshot {
    let first = &entries[0];
    let kind = first.slot.kind;
    let set = EquivalentTypeSet::new(entries.iter().map(|e| Arc::clone(&e.shape)));

    let fixed = if options.fixed_fields && entries.len() <= options.polymorphic_inline_limit {
        common_fixed_function(property, entries, options).map(|function| FixedFieldInfo {
            value: FixedValue::Function(function),
            backing: set.shapes().to_vec(),
        })
    } else {
        None
    };

    let type_guards = set.shapes().iter().map(|shape| session.register_type(shape)).collect();
    let property_guard = if fixed.is_some() || kind.is_proto() {
        Some(session.register_shared(property))
    } else {
        None
    };

    TypeSpecializationSnapshot {
        site: site_index,
        property,
        shapes: SnapshotShapes::Equivalent(set),
        slot_index: first.slot.slot_index,
        uses_aux_slot: first.slot.uses_aux_slot,
        kind,
        fixed,
        property_guard,
        type_guards,
        constructor_cache: None,
    }
}

/// A fixed value requires a locked shape plus either a built-in property
/// with an observed value or a proof from the shape's property table.
fn proven_fixed_value(property: PropertyId, entry: &CacheEntry, options: &SnapshotOptions) -> Option<FixedValue> {
    if !entry.shape.is_locked() {
        return None;
    }
    if let Some(value) = entry.shape.fixed_value(property) {
        return Some(value);
    }
    if options.is_builtin(property) {
        return entry.slot.value;
    }
    None
}

fn common_fixed_function(property: PropertyId, entries: &[CacheEntry], options: &SnapshotOptions) -> Option<FunctionId> {
    let mut common = None;
    for entry in entries {
        let function = proven_fixed_value(property, entry, options)?.as_function()?;
        match common {
            None => common = Some(function),
            Some(existing) if existing == function => {}
            Some(_) => return None,
        }
    }
    common
}

/// Check that every entry agrees on the layout specialized code relies on
fn check_equivalence(entries: &[CacheEntry]) -> Result<(), &'static str> {
    let first = entries.first().ok_or("no entries")?;
    for entry in entries {
        if entry.slot.kind.is_add() {
            return Err("site adds the property");
        }
        if entry.slot.kind.is_missing() {
            return Err("property observed as missing");
        }
        if entry.slot.slot_index != first.slot.slot_index {
            return Err("slot index differs");
        }
        if entry.slot.uses_aux_slot != first.slot.uses_aux_slot {
            return Err("aux slot usage differs");
        }
        if entry.type_id != first.type_id {
            return Err("type id differs");
        }
        match (first.slot.kind, entry.slot.kind) {
            (CacheEntryKind::Local { .. }, CacheEntryKind::Local { .. }) => {}
            (CacheEntryKind::Proto { prototype: a, .. }, CacheEntryKind::Proto { prototype: b, .. }) => {
                if a != b {
                    return Err("prototype differs");
                }
            }
            (
                CacheEntryKind::Accessor { owner: a, is_getter: ga, on_proto: pa },
                CacheEntryKind::Accessor { owner: b, is_getter: gb, on_proto: pb },
            ) => {
                if a != b || ga != gb {
                    return Err("accessor differs");
                }
                if !pa || !pb {
                    return Err("accessor not on prototype");
                }
            }
            _ => return Err("access kind differs"),
        }
    }
    Ok(())
}
