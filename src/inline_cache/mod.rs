//! Per-site inline caches
//!
//! An [`InlineCacheSite`] remembers the shapes observed at one property
//! access site. The interpreter consults it on every access and records into
//! it on every miss; the optimizing compiler only reads it, through
//! [`crate::snapshot::build_snapshot`].
//!
//! State progression:
//!
//! ```text
//! Empty -> Monomorphic -> Polymorphic -> Polymorphic { disabled }
//! ```
//!
//! A disabled (megamorphic) site never re-enables.

use serde::Serialize;
use std::sync::Arc;

use crate::shape::{FixedValue, ObjectId, PropertyId, ShapeId, ShapeRef, TypeId};

/// Smallest polymorphic capacity a site accepts
pub const MIN_POLYMORPHIC_CAPACITY: usize = 4;

/// Largest polymorphic capacity a site accepts
pub const MAX_POLYMORPHIC_CAPACITY: usize = 16;

/// How the observed access was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheEntryKind {
    /// Own property. `Some` means the access added the property, moving
    /// objects off the given shape.
    Local { type_without_property: Option<ShapeId> },
    /// Found on (or, if `is_missing`, absent from the whole chain up to) a prototype
    Proto { prototype: ObjectId, is_missing: bool },
    /// Getter or setter call
    Accessor { owner: ObjectId, is_getter: bool, on_proto: bool },
}

impl CacheEntryKind {
    pub const fn local() -> Self {
        CacheEntryKind::Local { type_without_property: None }
    }

    pub fn is_add(&self) -> bool {
        matches!(self, CacheEntryKind::Local { type_without_property: Some(_) })
    }

    pub fn is_proto(&self) -> bool {
        matches!(self, CacheEntryKind::Proto { .. })
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, CacheEntryKind::Proto { is_missing: true, .. })
    }

    pub fn is_accessor(&self) -> bool {
        matches!(self, CacheEntryKind::Accessor { .. })
    }
}

/// Where the property lives for one observed shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    pub slot_index: u16,
    pub uses_aux_slot: bool,
    pub kind: CacheEntryKind,
    /// Value seen at the access, a candidate for fixed-value speculation
    pub value: Option<FixedValue>,
}

impl SlotInfo {
    pub fn local(slot_index: u16) -> Self {
        Self { slot_index, uses_aux_slot: false, kind: CacheEntryKind::local(), value: None }
    }

    pub fn aux(slot_index: u16) -> Self {
        Self { slot_index, uses_aux_slot: true, kind: CacheEntryKind::local(), value: None }
    }

    pub fn with_kind(mut self, kind: CacheEntryKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_value(mut self, value: FixedValue) -> Self {
        self.value = Some(value);
        self
    }
}

/// One observed (shape, slot) pair
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub shape: ShapeRef,
    pub type_id: TypeId,
    pub slot: SlotInfo,
}

impl CacheEntry {
    fn new(shape: &ShapeRef, slot: SlotInfo) -> Self {
        Self { shape: Arc::clone(shape), type_id: shape.type_id(), slot }
    }

    pub fn shape_id(&self) -> ShapeId {
        self.shape.id()
    }

    /// Merge a repeat observation of the same shape. A changed value means
    /// the value is not constant.
    fn merge(&mut self, slot: SlotInfo) {
        let value = if self.slot.value == slot.value { slot.value } else { None };
        self.slot = SlotInfo { value, ..slot };
    }
}

/// Cache contents of a site
#[derive(Debug, Clone, Default)]
pub enum CacheState {
    #[default]
    Empty,
    Monomorphic(CacheEntry),
    Polymorphic { entries: Vec<CacheEntry>, disabled: bool },
}

/// Result of consulting a site on the fast path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitKind {
    /// The shape is not cached here
    None,
    /// Read or write the slot directly
    ExactSlot { slot_index: u16, uses_aux_slot: bool },
    /// Cached, but the access still has to go through the generic path
    NeedsSlowPath,
}

/// Short name of a site state, for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStateKind {
    Empty,
    Monomorphic,
    Polymorphic,
    Megamorphic,
}

/// Per-site counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheSiteStats {
    pub hits: u64,
    pub misses: u64,
    pub records: u64,
}

impl CacheSiteStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 * 100.0 }
    }
}

/// Inline cache for a single property access site
#[derive(Debug, Clone)]
pub struct InlineCacheSite {
    property: PropertyId,
    state: CacheState,
    capacity: usize,
    ignore_for_equivalence: bool,
    stats: CacheSiteStats,
}

impl InlineCacheSite {
    /// Create an empty site. `capacity` is clamped to the supported range.
    pub fn new(property: PropertyId, capacity: usize) -> Self {
        Self {
            property,
            state: CacheState::Empty,
            capacity: capacity.clamp(MIN_POLYMORPHIC_CAPACITY, MAX_POLYMORPHIC_CAPACITY),
            ignore_for_equivalence: false,
            stats: CacheSiteStats::default(),
        }
    }

    pub fn property(&self) -> PropertyId {
        self.property
    }

    pub fn state(&self) -> &CacheState {
        &self.state
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheSiteStats {
        self.stats
    }

    /// Consult the cache for the shape of the receiver
    pub fn lookup(&mut self, shape: ShapeId) -> HitKind {
        let hit = match &self.state {
            CacheState::Empty => HitKind::None,
            CacheState::Monomorphic(entry) => {
                if entry.shape_id() == shape {
                    fast_path_for(&entry.slot)
                } else {
                    HitKind::None
                }
            }
            CacheState::Polymorphic { disabled: true, .. } => HitKind::NeedsSlowPath,
            CacheState::Polymorphic { entries, .. } => entries
                .iter()
                .find(|entry| entry.shape_id() == shape)
                .map_or(HitKind::None, |entry| fast_path_for(&entry.slot)),
        };

        match hit {
            HitKind::None => self.stats.misses += 1,
            _ => self.stats.hits += 1,
        }
        hit
    }

    /// Record an observation after a miss
    pub fn record(&mut self, shape: &ShapeRef, slot: SlotInfo) {
        self.stats.records += 1;

        match &mut self.state {
            CacheState::Empty => {
                self.state = CacheState::Monomorphic(CacheEntry::new(shape, slot));
            }
            CacheState::Monomorphic(entry) => {
                if entry.shape_id() == shape.id() {
                    entry.merge(slot);
                } else {
                    let first = entry.clone();
                    let mut entries = Vec::with_capacity(self.capacity);
                    entries.push(first);
                    entries.push(CacheEntry::new(shape, slot));
                    self.state = CacheState::Polymorphic { entries, disabled: false };
                }
            }
            CacheState::Polymorphic { disabled: true, .. } => {}
            CacheState::Polymorphic { entries, disabled } => {
                if let Some(existing) = entries.iter_mut().find(|e| e.shape_id() == shape.id()) {
                    existing.merge(slot);
                } else if entries.len() >= self.capacity {
                    *disabled = true;
                    tracing::debug!(
                        property = %self.property,
                        capacity = self.capacity,
                        "inline cache site went megamorphic"
                    );
                } else {
                    entries.push(CacheEntry::new(shape, slot));
                }
            }
        }
    }

    /// Observed entries, in observation order
    pub fn entries(&self) -> &[CacheEntry] {
        match &self.state {
            CacheState::Empty => &[],
            CacheState::Monomorphic(entry) => std::slice::from_ref(entry),
            CacheState::Polymorphic { entries, .. } => entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.state, CacheState::Empty)
    }

    pub fn is_monomorphic(&self) -> bool {
        matches!(self.state, CacheState::Monomorphic(_))
    }

    pub fn is_polymorphic(&self) -> bool {
        matches!(self.state, CacheState::Polymorphic { .. })
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self.state, CacheState::Polymorphic { disabled: true, .. })
    }

    pub fn kind(&self) -> CacheStateKind {
        match &self.state {
            CacheState::Empty => CacheStateKind::Empty,
            CacheState::Monomorphic(_) => CacheStateKind::Monomorphic,
            CacheState::Polymorphic { disabled: true, .. } => CacheStateKind::Megamorphic,
            CacheState::Polymorphic { .. } => CacheStateKind::Polymorphic,
        }
    }

    /// Set once a snapshot build found the entries incompatible; later
    /// builds skip the comparison.
    pub fn ignore_for_equivalence(&self) -> bool {
        self.ignore_for_equivalence
    }

    pub fn mark_ignore_for_equivalence(&mut self) {
        if !self.ignore_for_equivalence {
            tracing::trace!(property = %self.property, "site excluded from equivalence");
        }
        self.ignore_for_equivalence = true;
    }

    /// Forget everything, including the sticky flags
    pub fn clear(&mut self) {
        self.state = CacheState::Empty;
        self.ignore_for_equivalence = false;
        self.stats = CacheSiteStats::default();
    }
}

fn fast_path_for(slot: &SlotInfo) -> HitKind {
    match slot.kind {
        CacheEntryKind::Local { type_without_property: None }
        | CacheEntryKind::Proto { is_missing: false, .. } => HitKind::ExactSlot {
            slot_index: slot.slot_index,
            uses_aux_slot: slot.uses_aux_slot,
        },
        _ => HitKind::NeedsSlowPath,
    }
}
