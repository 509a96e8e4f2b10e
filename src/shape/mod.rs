//! Object layout collaborator interface
//!
//! The object/property storage layout itself lives outside the tiering core.
//! This module is the narrow surface the core relies on:
//!
//! - stable identities ([`ShapeId`], [`TypeId`], [`PropertyId`], [`ObjectId`], [`FunctionId`])
//! - a [`Shape`] that can be locked, queried for fixed properties, pinned, and
//!   mutated in place (which invalidates its guard)
//! - a [`ShapeTable`] that hands out shapes

use parking_lot::RwLock;
use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::guard::Guard;

/// Identity of an object layout ("hidden class")
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShapeId(pub u64);

/// Coarse object kind; equivalent shapes must share it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeId(pub u16);

/// Interned property name
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyId(pub u32);

/// Identity of a heap object (prototype or accessor owner)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub u64);

/// Stable identity of a function or loop body
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionId(pub u32);

impl fmt::Display for ShapeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A property value that compiled code may assume constant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FixedValue {
    /// A function object, identified by its body
    Function(FunctionId),
    /// Raw bits of a data value
    Data(u64),
}

impl FixedValue {
    pub fn as_function(&self) -> Option<FunctionId> {
        match self {
            FixedValue::Function(id) => Some(*id),
            FixedValue::Data(_) => None,
        }
    }
}

/// Where a property lives inside objects of one shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertySlot {
    pub slot_index: u16,
    pub uses_aux_slot: bool,
    /// Set when the layout can prove the value never changes
    pub fixed: Option<FixedValue>,
}

impl PropertySlot {
    pub fn inline(slot_index: u16) -> Self {
        Self { slot_index, uses_aux_slot: false, fixed: None }
    }

    pub fn aux(slot_index: u16) -> Self {
        Self { slot_index, uses_aux_slot: true, fixed: None }
    }

    pub fn with_fixed(mut self, value: FixedValue) -> Self {
        self.fixed = Some(value);
        self
    }
}

/// An object layout as seen by the tiering core
#[derive(Debug)]
pub struct Shape {
    id: ShapeId,
    type_id: TypeId,
    locked: AtomicBool,
    guard: Arc<Guard>,
    properties: RwLock<HashMap<PropertyId, PropertySlot>>,
    pins: AtomicUsize,
}

/// Shared handle to a shape
pub type ShapeRef = Arc<Shape>;

impl Shape {
    fn new(id: ShapeId, type_id: TypeId) -> Self {
        Self {
            id,
            type_id,
            locked: AtomicBool::new(false),
            guard: Arc::new(Guard::new(shape_guard_value(id))),
            properties: RwLock::new(HashMap::default()),
            pins: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> ShapeId {
        self.id
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// A locked shape promises not to evolve in place.
    pub fn lock(&self) {
        self.locked.store(true, Ordering::Release);
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Guard holding this shape's identity while its layout is unchanged
    pub fn guard(&self) -> &Arc<Guard> {
        &self.guard
    }

    /// Whether the layout is still the one compiled code saw
    pub fn is_intact(&self) -> bool {
        self.guard.is_valid()
    }

    pub fn define_property(&self, property: PropertyId, slot: PropertySlot) {
        self.properties.write().insert(property, slot);
    }

    pub fn property(&self, property: PropertyId) -> Option<PropertySlot> {
        self.properties.read().get(&property).copied()
    }

    /// Query the property table for a value proven constant.
    pub fn fixed_value(&self, property: PropertyId) -> Option<FixedValue> {
        self.property(property).and_then(|slot| slot.fixed)
    }

    /// Mutate the layout in place (e.g. a property was added without a
    /// transition). Every assumption made about this shape is void.
    pub fn add_property_in_place(&self, property: PropertyId, slot: PropertySlot) {
        self.properties.write().insert(property, slot);
        self.guard.invalidate();
    }

    /// Drop the fixed-ness of a property (it was written to).
    pub fn clear_fixed(&self, property: PropertyId) {
        if let Some(slot) = self.properties.write().get_mut(&property) {
            slot.fixed = None;
        }
    }

    pub fn pin_count(&self) -> usize {
        self.pins.load(Ordering::Acquire)
    }
}

pub(crate) fn shape_guard_value(id: ShapeId) -> NonZeroUsize {
    NonZeroUsize::new((id.0 as usize).wrapping_add(1)).unwrap_or(NonZeroUsize::MIN)
}

/// Keeps a shape alive (and un-collectable) until an entry point is installed
/// or cleaned up. Dropping the pin releases it exactly once.
#[derive(Debug)]
pub struct PinnedType {
    shape: ShapeRef,
}

impl PinnedType {
    pub fn new(shape: &ShapeRef) -> Self {
        shape.pins.fetch_add(1, Ordering::AcqRel);
        Self { shape: Arc::clone(shape) }
    }

    pub fn shape(&self) -> &ShapeRef {
        &self.shape
    }
}

impl Drop for PinnedType {
    fn drop(&mut self) {
        let previous = self.shape.pins.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            crate::invariant_violation!("pin count of {} went negative", self.shape.id);
        }
    }
}

/// Allocator and registry of shapes
#[derive(Debug, Default)]
pub struct ShapeTable {
    next_id: AtomicU64,
    shapes: RwLock<HashMap<ShapeId, Weak<Shape>>>,
}

impl ShapeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, type_id: TypeId) -> ShapeRef {
        let id = ShapeId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let shape = Arc::new(Shape::new(id, type_id));
        self.shapes.write().insert(id, Arc::downgrade(&shape));
        shape
    }

    /// Create a shape with the given properties already defined
    pub fn create_with(&self, type_id: TypeId, properties: &[(PropertyId, PropertySlot)]) -> ShapeRef {
        let shape = self.create(type_id);
        for (property, slot) in properties {
            shape.define_property(*property, *slot);
        }
        shape
    }

    pub fn get(&self, id: ShapeId) -> Option<ShapeRef> {
        self.shapes.read().get(&id).and_then(Weak::upgrade)
    }

    /// Forget shapes nobody references any more
    pub fn purge(&self) -> usize {
        let mut shapes = self.shapes.write();
        let before = shapes.len();
        shapes.retain(|_, shape| shape.strong_count() > 0);
        before - shapes.len()
    }

    pub fn len(&self) -> usize {
        self.shapes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
