//! Speculation guards
//!
//! A [`Guard`] is one machine word that compiled code reads before trusting
//! an assumption. It holds either a live non-zero value or the
//! [`INVALID_GUARD_VALUE`] sentinel, and only ever moves from live to
//! invalid. Readers do a single atomic load and writers a single atomic
//! store, so any thread mutating an object layout can invalidate a guard
//! without touching JIT bookkeeping.
//!
//! [`PropertyGuard`]s are shared per property id: one invalidation reaches
//! every entry point that speculated on the property. [`ConstructorCache`]s
//! guard the shape a constructor produces.
//!
//! The [`GuardManager`] publishes its tables as immutable snapshots.
//! Registration clones, edits, and republishes them under the runtime's
//! function-body lock. Invalidation only loads the current snapshot and
//! stores into the guard, so it never waits for registration.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap as HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::shape::{shape_guard_value, FunctionId, PropertyId, ShapeId, ShapeRef};

/// Sentinel stored in an invalidated guard
pub const INVALID_GUARD_VALUE: usize = 0;

const PROPERTY_GUARD_LIVE: NonZeroUsize = NonZeroUsize::MIN;

/// A single-word speculative assumption cell
#[derive(Debug)]
pub struct Guard {
    value: AtomicUsize,
}

impl Guard {
    pub fn new(value: NonZeroUsize) -> Self {
        Self {
            value: AtomicUsize::new(value.get()),
        }
    }

    /// Current value; `None` once invalidated
    #[inline]
    pub fn value(&self) -> Option<NonZeroUsize> {
        NonZeroUsize::new(self.value.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.value.load(Ordering::Acquire) != INVALID_GUARD_VALUE
    }

    /// The check compiled code performs against the value it baked in
    #[inline]
    pub fn check(&self, expected: NonZeroUsize) -> bool {
        self.value.load(Ordering::Acquire) == expected.get()
    }

    /// One-way; idempotent.
    #[inline]
    pub fn invalidate(&self) {
        self.value.store(INVALID_GUARD_VALUE, Ordering::Release);
    }
}

/// A guard shared by every speculation on one property
#[derive(Debug)]
pub struct PropertyGuard {
    property: PropertyId,
    guard: Guard,
}

impl PropertyGuard {
    fn new(property: PropertyId) -> Self {
        Self {
            property,
            guard: Guard::new(PROPERTY_GUARD_LIVE),
        }
    }

    pub fn property(&self) -> PropertyId {
        self.property
    }

    pub fn guard(&self) -> &Guard {
        &self.guard
    }

    pub fn is_valid(&self) -> bool {
        self.guard.is_valid()
    }

    pub fn invalidate(&self) {
        self.guard.invalidate();
    }
}

/// Records the shape a constructor produces, so `new F()` can allocate the
/// object directly in compiled code.
#[derive(Debug)]
pub struct ConstructorCache {
    constructor: FunctionId,
    shape: ShapeRef,
    slot_count: u16,
    inline_slot_count: u16,
    guard: Guard,
}

impl ConstructorCache {
    pub fn constructor(&self) -> FunctionId {
        self.constructor
    }

    pub fn shape(&self) -> &ShapeRef {
        &self.shape
    }

    pub fn slot_count(&self) -> u16 {
        self.slot_count
    }

    pub fn inline_slot_count(&self) -> u16 {
        self.inline_slot_count
    }

    pub fn guard(&self) -> &Guard {
        &self.guard
    }

    pub fn is_valid(&self) -> bool {
        self.guard.is_valid()
    }

    /// The produced shape is locked and shareable, and nothing invalidated the cache
    pub fn is_set_up_for_jit(&self) -> bool {
        self.is_valid() && self.shape.is_locked() && self.shape.is_intact()
    }

    /// Re-check lazily before reuse: a produced shape that was unlocked or
    /// mutated in place invalidates the cache for good.
    pub fn revalidate(&self) -> bool {
        if self.is_valid() && !(self.shape.is_locked() && self.shape.is_intact()) {
            tracing::debug!(constructor = %self.constructor, "constructor cache no longer holds a locked shape");
            self.guard.invalidate();
        }
        self.is_valid()
    }

    pub fn invalidate(&self) {
        self.guard.invalidate();
    }
}

#[derive(Debug, Default, Clone)]
struct GuardTables {
    property_guards: HashMap<PropertyId, Arc<PropertyGuard>>,
    constructor_caches: HashMap<FunctionId, Arc<ConstructorCache>>,
}

/// Counters exposed through diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardStats {
    pub property_guards_created: u64,
    pub property_invalidations: u64,
    pub constructor_invalidations: u64,
}

/// Runtime-wide owner of shared guards
#[derive(Debug)]
pub struct GuardManager {
    tables: ArcSwap<GuardTables>,
    /// The function-body lock; held by writers only
    registration: Mutex<()>,
    property_guards_created: AtomicU64,
    property_invalidations: AtomicU64,
    constructor_invalidations: AtomicU64,
}

impl Default for GuardManager {
    fn default() -> Self {
        Self::new()
    }
}

impl GuardManager {
    pub fn new() -> Self {
        Self {
            tables: ArcSwap::from_pointee(GuardTables::default()),
            registration: Mutex::new(()),
            property_guards_created: AtomicU64::new(0),
            property_invalidations: AtomicU64::new(0),
            constructor_invalidations: AtomicU64::new(0),
        }
    }

    /// Apply one edit to a private copy of the tables and publish it.
    /// The caller must hold `registration`.
    fn republish(&self, edit: impl FnOnce(&mut GuardTables)) {
        let mut next = GuardTables::clone(&self.tables.load());
        edit(&mut next);
        self.tables.store(Arc::new(next));
    }

    /// The live guard for a property, creating a fresh one if the previous
    /// guard was invalidated.
    pub fn property_guard(&self, property: PropertyId) -> Arc<PropertyGuard> {
        if let Some(existing) = live_property_guard(&self.tables.load(), property) {
            return existing;
        }

        let _registration = self.registration.lock();
        if let Some(existing) = live_property_guard(&self.tables.load(), property) {
            return existing;
        }
        let guard = Arc::new(PropertyGuard::new(property));
        self.republish(|tables| {
            tables.property_guards.insert(property, Arc::clone(&guard));
        });
        self.property_guards_created.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(%property, "created shared property guard");
        guard
    }

    /// Invalidate the property's shared guard. Returns whether a live guard was hit.
    ///
    /// Safe to call from any thread at any time; it takes no lock.
    pub fn invalidate_property(&self, property: PropertyId) -> bool {
        let tables = self.tables.load();
        match tables.property_guards.get(&property) {
            Some(guard) if guard.is_valid() => {
                guard.invalidate();
                self.property_invalidations.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%property, "property guard invalidated");
                true
            }
            _ => false,
        }
    }

    /// Record the shape a constructor produced. Replaces (and invalidates)
    /// a cache holding a different shape.
    pub fn update_constructor_cache(
        &self,
        constructor: FunctionId,
        shape: &ShapeRef,
        slot_count: u16,
        inline_slot_count: u16,
    ) -> Arc<ConstructorCache> {
        let _registration = self.registration.lock();
        if let Some(existing) = self.tables.load().constructor_caches.get(&constructor) {
            if existing.is_valid() && existing.shape.id() == shape.id() {
                return Arc::clone(existing);
            }
            existing.invalidate();
        }
        let cache = Arc::new(ConstructorCache {
            constructor,
            shape: Arc::clone(shape),
            slot_count,
            inline_slot_count,
            guard: Guard::new(shape_guard_value(shape.id())),
        });
        self.republish(|tables| {
            tables.constructor_caches.insert(constructor, Arc::clone(&cache));
        });
        cache
    }

    /// A constructor cache usable by compiled code, if any
    pub fn constructor_cache(&self, constructor: FunctionId) -> Option<Arc<ConstructorCache>> {
        let cache = self.tables.load().constructor_caches.get(&constructor).cloned()?;
        if cache.revalidate() && cache.is_set_up_for_jit() {
            Some(cache)
        } else {
            None
        }
    }

    /// Lock-free, like [`GuardManager::invalidate_property`]
    pub fn invalidate_constructor(&self, constructor: FunctionId) -> bool {
        let tables = self.tables.load();
        match tables.constructor_caches.get(&constructor) {
            Some(cache) if cache.is_valid() => {
                cache.invalidate();
                self.constructor_invalidations.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%constructor, "constructor cache invalidated");
                true
            }
            _ => false,
        }
    }

    /// Drop table entries whose guards are dead and unreferenced elsewhere
    pub fn purge(&self) {
        let _registration = self.registration.lock();
        let current = self.tables.load_full();
        // counts are taken against the published tables, the only map holding them
        let dead_guards = current
            .property_guards
            .values()
            .any(|guard| !guard.is_valid() && Arc::strong_count(guard) == 1);
        let dead_caches = current
            .constructor_caches
            .values()
            .any(|cache| !cache.is_valid() && Arc::strong_count(cache) == 1);
        if !dead_guards && !dead_caches {
            return;
        }
        let next = GuardTables {
            property_guards: current
                .property_guards
                .iter()
                .filter(|(_, guard)| guard.is_valid() || Arc::strong_count(guard) > 1)
                .map(|(&property, guard)| (property, Arc::clone(guard)))
                .collect(),
            constructor_caches: current
                .constructor_caches
                .iter()
                .filter(|(_, cache)| cache.is_valid() || Arc::strong_count(cache) > 1)
                .map(|(&constructor, cache)| (constructor, Arc::clone(cache)))
                .collect(),
        };
        self.tables.store(Arc::new(next));
    }

    pub fn stats(&self) -> GuardStats {
        GuardStats {
            property_guards_created: self.property_guards_created.load(Ordering::Relaxed),
            property_invalidations: self.property_invalidations.load(Ordering::Relaxed),
            constructor_invalidations: self.constructor_invalidations.load(Ordering::Relaxed),
        }
    }

    /// Start collecting guards for one compile request
    pub fn session(&self) -> GuardSession<'_> {
        GuardSession {
            manager: self,
            property_guards: Vec::new(),
            type_guards: Vec::new(),
            constructor_caches: Vec::new(),
        }
    }
}

fn live_property_guard(tables: &GuardTables, property: PropertyId) -> Option<Arc<PropertyGuard>> {
    tables.property_guards.get(&property).filter(|guard| guard.is_valid()).cloned()
}

/// Guards gathered while building one work item. Registration is idempotent
/// per property within a session, so every snapshot of the work item shares
/// the same guard.
#[derive(Debug)]
pub struct GuardSession<'a> {
    manager: &'a GuardManager,
    property_guards: Vec<Arc<PropertyGuard>>,
    type_guards: Vec<(ShapeId, Arc<Guard>)>,
    constructor_caches: Vec<Arc<ConstructorCache>>,
}

impl GuardSession<'_> {
    pub fn register_shared(&mut self, property: PropertyId) -> Arc<PropertyGuard> {
        if let Some(existing) = self.property_guards.iter().find(|g| g.property() == property) {
            return Arc::clone(existing);
        }
        let guard = self.manager.property_guard(property);
        self.property_guards.push(Arc::clone(&guard));
        guard
    }

    /// Register the layout guard of a shape the code will assume
    pub fn register_type(&mut self, shape: &ShapeRef) -> Arc<Guard> {
        if let Some((_, existing)) = self.type_guards.iter().find(|(id, _)| *id == shape.id()) {
            if !Arc::ptr_eq(existing, shape.guard()) {
                crate::invariant_violation!("shape {} registered with two different guards", shape.id());
            }
            return Arc::clone(existing);
        }
        let guard = Arc::clone(shape.guard());
        self.type_guards.push((shape.id(), Arc::clone(&guard)));
        guard
    }

    pub fn register_constructor_cache(&mut self, cache: &Arc<ConstructorCache>) {
        if !self.constructor_caches.iter().any(|c| Arc::ptr_eq(c, cache)) {
            self.constructor_caches.push(Arc::clone(cache));
        }
    }

    pub fn manager(&self) -> &GuardManager {
        self.manager
    }

    pub fn finish(self) -> SessionGuards {
        SessionGuards {
            property_guards: self.property_guards,
            type_guards: self.type_guards.into_iter().map(|(_, guard)| guard).collect(),
            constructor_caches: self.constructor_caches,
        }
    }
}

/// Everything a session registered, handed to the entry point
#[derive(Debug, Default, Clone)]
pub struct SessionGuards {
    pub property_guards: Vec<Arc<PropertyGuard>>,
    pub type_guards: Vec<Arc<Guard>>,
    pub constructor_caches: Vec<Arc<ConstructorCache>>,
}

impl SessionGuards {
    /// First reason the captured assumptions no longer hold, if any
    pub fn first_violation(&self) -> Option<String> {
        if let Some(guard) = self.property_guards.iter().find(|g| !g.is_valid()) {
            return Some(format!("property guard for {} invalidated", guard.property()));
        }
        if self.type_guards.iter().any(|g| !g.is_valid()) {
            return Some("type guard invalidated".to_string());
        }
        if let Some(cache) = self.constructor_caches.iter().find(|c| !c.revalidate()) {
            return Some(format!("constructor cache for {} invalidated", cache.constructor()));
        }
        None
    }

    pub fn all_valid(&self) -> bool {
        self.first_violation().is_none()
    }

    /// Flat list of every guard word the code may check
    pub fn guard_words(&self) -> Vec<&Guard> {
        self.property_guards
            .iter()
            .map(|g| g.guard())
            .chain(self.type_guards.iter().map(|g| g.as_ref()))
            .chain(self.constructor_caches.iter().map(|c| c.guard()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.property_guards.len() + self.type_guards.len() + self.constructor_caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::{ShapeTable, TypeId};
    use std::thread;

    #[test]
    fn test_guard_invalidation_is_one_way() {
        let guard = Guard::new(NonZeroUsize::new(42).unwrap());
        assert!(guard.is_valid());
        assert!(guard.check(NonZeroUsize::new(42).unwrap()));
        guard.invalidate();
        assert!(!guard.is_valid());
        assert_eq!(guard.value(), None);
        guard.invalidate();
        assert!(!guard.is_valid());
    }

    #[test]
    fn test_concurrent_reads_never_see_torn_values() {
        let value = NonZeroUsize::new(0xDEAD_BEEF).unwrap();
        let guard = Arc::new(Guard::new(value));
        let reader = {
            let guard = Arc::clone(&guard);
            thread::spawn(move || {
                for _ in 0..10_000 {
                    match guard.value() {
                        None => {}
                        Some(v) => assert_eq!(v, value),
                    }
                }
            })
        };
        let writer = {
            let guard = Arc::clone(&guard);
            thread::spawn(move || guard.invalidate())
        };
        writer.join().unwrap();
        reader.join().unwrap();
        assert!(!guard.is_valid());
    }

    #[test]
    fn test_property_guard_is_shared_until_invalidated() {
        let manager = GuardManager::new();
        let a = manager.property_guard(PropertyId(1));
        let b = manager.property_guard(PropertyId(1));
        assert!(Arc::ptr_eq(&a, &b));

        assert!(manager.invalidate_property(PropertyId(1)));
        assert!(!a.is_valid());
        assert!(!manager.invalidate_property(PropertyId(1)));

        let c = manager.property_guard(PropertyId(1));
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(c.is_valid());
        assert_eq!(manager.stats().property_guards_created, 2);
    }

    #[test]
    fn test_session_registration_is_idempotent() {
        let manager = GuardManager::new();
        let mut session = manager.session();
        let a = session.register_shared(PropertyId(5));
        let b = session.register_shared(PropertyId(5));
        assert!(Arc::ptr_eq(&a, &b));
        let guards = session.finish();
        assert_eq!(guards.property_guards.len(), 1);
    }

    #[test]
    fn test_session_keeps_its_guard_after_invalidation() {
        let manager = GuardManager::new();
        let mut session = manager.session();
        let a = session.register_shared(PropertyId(5));
        manager.invalidate_property(PropertyId(5));
        let b = session.register_shared(PropertyId(5));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(session.finish().first_violation().is_some());
    }

    #[test]
    fn test_constructor_cache_revalidates_lazily() {
        let shapes = ShapeTable::new();
        let manager = GuardManager::new();
        let shape = shapes.create(TypeId(1));
        shape.lock();

        let cache = manager.update_constructor_cache(FunctionId(3), &shape, 4, 2);
        assert!(cache.is_set_up_for_jit());
        assert!(manager.constructor_cache(FunctionId(3)).is_some());

        shape.unlock();
        assert!(manager.constructor_cache(FunctionId(3)).is_none());
        assert!(!cache.is_valid());
    }

    #[test]
    fn test_constructor_cache_replaced_on_new_shape() {
        let shapes = ShapeTable::new();
        let manager = GuardManager::new();
        let first = shapes.create(TypeId(1));
        let second = shapes.create(TypeId(1));
        first.lock();
        second.lock();

        let old = manager.update_constructor_cache(FunctionId(3), &first, 2, 2);
        let new = manager.update_constructor_cache(FunctionId(3), &second, 2, 2);
        assert!(!old.is_valid());
        assert!(new.is_valid());
        assert_eq!(new.shape().id(), second.id());
    }

    #[test]
    fn test_session_guards_report_type_violation() {
        let shapes = ShapeTable::new();
        let manager = GuardManager::new();
        let shape = shapes.create(TypeId(1));
        let mut session = manager.session();
        session.register_type(&shape);
        let guards = session.finish();
        assert!(guards.all_valid());
        shape.add_property_in_place(PropertyId(1), crate::shape::PropertySlot::inline(0));
        assert_eq!(guards.first_violation().as_deref(), Some("type guard invalidated"));
    }

    #[test]
    fn test_invalidation_does_not_wait_for_registration() {
        use std::sync::mpsc;
        use std::time::Duration;

        let shapes = ShapeTable::new();
        let manager = Arc::new(GuardManager::new());
        let guard = manager.property_guard(PropertyId(1));
        manager.update_constructor_cache(FunctionId(2), &shapes.create(TypeId(1)), 1, 1);

        let registration = manager.registration.lock();
        let (done_tx, done_rx) = mpsc::channel();
        let mutator = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                let hit = manager.invalidate_property(PropertyId(1)) && manager.invalidate_constructor(FunctionId(2));
                done_tx.send(hit).unwrap();
            })
        };
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)), Ok(true));
        assert!(!guard.is_valid());
        drop(registration);
        mutator.join().unwrap();

        // registration resumes and hands out a fresh guard
        assert!(manager.property_guard(PropertyId(1)).is_valid());
    }

    #[test]
    fn test_purge_keeps_referenced_guards() {
        let manager = GuardManager::new();
        let held = manager.property_guard(PropertyId(1));
        manager.property_guard(PropertyId(2));
        manager.invalidate_property(PropertyId(1));
        manager.invalidate_property(PropertyId(2));
        manager.purge();
        // p1 is still referenced by `held`, so a new lookup must not resurrect it
        let fresh = manager.property_guard(PropertyId(1));
        assert!(!Arc::ptr_eq(&held, &fresh));
    }
}
