//! Entry points and their registry
//!
//! Every compile of a unit produces one [`EntryPoint`]. The registry keeps
//! them in an append-only list and designates exactly one as the default,
//! the target of new calls.
//!
//! ```text
//! NotScheduled -> CodeGenPending -> CodeGenQueued -> CodeGenRecorded -> CodeGenDone
//!                       |                 |                 |               |
//!                       +---- Discarded --+-----------------+     Invalidated / Expired
//!                                                                           |
//!                                                                       CleanedUp
//! ```
//!
//! Invalidated and expired entries are never freed on the spot; they are
//! queued and released by [`EntryPointRegistry::drain_deferred_cleanup`].

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::coordinator::WorkItemId;
use crate::error::{Error, Result};
use crate::guard::SessionGuards;
use crate::scheduler::ExecutionMode;
use crate::shape::{PinnedType, ShapeId};
use crate::snapshot::TypeSpecializationSnapshot;

/// Lifecycle of an entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EntryPointState {
    NotScheduled,
    CodeGenPending,
    CodeGenQueued,
    CodeGenRecorded,
    CodeGenDone,
    /// Never installed: cancelled, rejected at the validation gate, or failed
    Discarded,
    Invalidated,
    Expired,
    CleanedUp,
}

impl EntryPointState {
    /// A compile for this entry is outstanding
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            EntryPointState::CodeGenPending | EntryPointState::CodeGenQueued | EntryPointState::CodeGenRecorded
        )
    }
}

/// Opaque handle to machine code produced by a compiler
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NativeCode {
    handle: u64,
    size: usize,
}

impl NativeCode {
    pub fn new(handle: u64, size: usize) -> Self {
        Self { handle, size }
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Assumptions an entry point depends on, and the pins that keep their
/// shapes alive. Dropping it releases every pin exactly once.
#[derive(Debug, Default)]
pub struct JitTransferData {
    snapshots: Vec<Arc<TypeSpecializationSnapshot>>,
    guards: SessionGuards,
    pins: Vec<PinnedType>,
}

impl JitTransferData {
    /// Pin every shape the snapshots and constructor caches reference
    pub fn new(snapshots: Vec<Arc<TypeSpecializationSnapshot>>, guards: SessionGuards) -> Result<Self> {
        let mut pinned: Vec<ShapeId> = Vec::new();
        let mut pins = Vec::new();
        let shapes = snapshots
            .iter()
            .flat_map(|s| s.shape_refs().iter())
            .chain(guards.constructor_caches.iter().map(|c| c.shape()));
        for shape in shapes {
            if pinned.contains(&shape.id()) {
                continue;
            }
            pinned.try_reserve(1)?;
            pins.try_reserve(1)?;
            pinned.push(shape.id());
            pins.push(PinnedType::new(shape));
        }
        Ok(Self { snapshots, guards, pins })
    }

    pub fn snapshots(&self) -> &[Arc<TypeSpecializationSnapshot>] {
        &self.snapshots
    }

    pub fn guards(&self) -> &SessionGuards {
        &self.guards
    }

    pub fn pin_count(&self) -> usize {
        self.pins.len()
    }

    /// First captured assumption that no longer holds
    pub fn violation(&self) -> Option<String> {
        self.guards
            .first_violation()
            .or_else(|| self.snapshots.iter().find_map(|s| s.violation()))
    }
}

#[derive(Debug, Default)]
struct Liveness {
    expired: AtomicBool,
}

/// Held by a dispatch site that cached an entry point. While any token is
/// held the entry point counts as reachable; once the entry expires the
/// token reports it and the site re-resolves on its next call.
#[derive(Debug, Clone)]
pub struct DispatchToken {
    index: usize,
    liveness: Arc<Liveness>,
}

impl DispatchToken {
    pub fn entry_index(&self) -> usize {
        self.index
    }

    pub fn is_expired(&self) -> bool {
        self.liveness.expired.load(Ordering::Acquire)
    }
}

/// One compiled (or interpreter) artifact of a unit
#[derive(Debug)]
pub struct EntryPoint {
    index: usize,
    mode: ExecutionMode,
    state: EntryPointState,
    code: Option<NativeCode>,
    transfer: Option<JitTransferData>,
    work_item: Option<WorkItemId>,
    liveness: Arc<Liveness>,
    called_since_sweep: bool,
}

impl EntryPoint {
    fn new(index: usize, mode: ExecutionMode, state: EntryPointState) -> Self {
        Self {
            index,
            mode,
            state,
            code: None,
            transfer: None,
            work_item: None,
            liveness: Arc::new(Liveness::default()),
            called_since_sweep: false,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn state(&self) -> EntryPointState {
        self.state
    }

    pub fn code(&self) -> Option<&NativeCode> {
        self.code.as_ref()
    }

    pub fn transfer(&self) -> Option<&JitTransferData> {
        self.transfer.as_ref()
    }

    pub fn work_item(&self) -> Option<WorkItemId> {
        self.work_item
    }

    pub fn is_installed(&self) -> bool {
        self.state == EntryPointState::CodeGenDone
    }

    fn has_dispatch_sites(&self) -> bool {
        Arc::strong_count(&self.liveness) > 1
    }

    fn violation(&self) -> Option<String> {
        self.transfer.as_ref().and_then(JitTransferData::violation)
    }

    fn release(&mut self) {
        self.transfer = None;
        self.code = None;
        self.work_item = None;
    }
}

/// What a call should run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryTarget {
    Native { index: usize, mode: ExecutionMode, code: NativeCode },
    Interpreter { index: usize },
}

impl EntryTarget {
    pub fn index(&self) -> usize {
        match self {
            EntryTarget::Native { index, .. } | EntryTarget::Interpreter { index } => *index,
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, EntryTarget::Native { .. })
    }
}

/// Registry counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub installs: u64,
    pub discards: u64,
    pub invalidations: u64,
    pub expirations: u64,
    pub cleanups: u64,
}

/// Versioned entry points of one unit
#[derive(Debug)]
pub struct EntryPointRegistry {
    entries: Vec<EntryPoint>,
    default: usize,
    deferred_cleanup: Vec<usize>,
    stats: RegistryStats,
    #[cfg(test)]
    fail_next_install: bool,
}

impl Default for EntryPointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryPointRegistry {
    pub fn new() -> Self {
        Self {
            entries: vec![EntryPoint::new(0, ExecutionMode::Interpreter, EntryPointState::NotScheduled)],
            default: 0,
            deferred_cleanup: Vec::new(),
            stats: RegistryStats::default(),
            #[cfg(test)]
            fail_next_install: false,
        }
    }

    pub fn default_index(&self) -> usize {
        self.default
    }

    pub fn default_entry(&self) -> &EntryPoint {
        &self.entries[self.default]
    }

    pub fn get(&self, index: usize) -> Option<&EntryPoint> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntryPoint> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        self.stats
    }

    pub fn pending_cleanup(&self) -> usize {
        self.deferred_cleanup.len()
    }

    /// What a new call runs. A default whose guards broke is still
    /// reported until [`EntryPointRegistry::retire_stale_default`] runs.
    pub fn current(&self) -> EntryTarget {
        target_of(self.default_entry())
    }

    /// Note a call through the default entry point
    pub fn record_call(&mut self) {
        let default = self.default;
        self.entries[default].called_since_sweep = true;
    }

    /// Hand out a token for a dispatch site caching the default entry point
    pub fn register_dispatch_site(&self) -> DispatchToken {
        let entry = self.default_entry();
        DispatchToken { index: entry.index, liveness: Arc::clone(&entry.liveness) }
    }

    /// Re-resolve a dispatch site's cached entry point. A cached entry
    /// whose guards broke is retired here rather than run.
    pub fn resolve(&mut self, token: &DispatchToken) -> EntryTarget {
        if !token.is_expired() {
            if self.is_stale(token.index) {
                self.invalidate(token.index);
            } else if let Some(entry) = self.entries.get(token.index).filter(|e| e.is_installed()) {
                return target_of(entry);
            }
        }
        self.retire_stale_default();
        self.current()
    }

    fn push(&mut self, mode: ExecutionMode, state: EntryPointState) -> Result<usize> {
        self.entries
            .try_reserve(1)
            .map_err(|_| Error::out_of_memory("growing the entry point list"))?;
        let index = self.entries.len();
        self.entries.push(EntryPoint::new(index, mode, state));
        Ok(index)
    }

    /// Add an entry point for a compile that is about to be requested
    pub fn add_pending(&mut self, mode: ExecutionMode, work_item: WorkItemId, transfer: JitTransferData) -> Result<usize> {
        let index = self.push(mode, EntryPointState::CodeGenPending)?;
        let entry = &mut self.entries[index];
        entry.work_item = Some(work_item);
        entry.transfer = Some(transfer);
        Ok(index)
    }

    /// Track compiler-driven progress; out-of-order updates are ignored
    pub fn mark_state(&mut self, index: usize, to: EntryPointState) -> bool {
        let Some(entry) = self.entries.get_mut(index) else {
            return false;
        };
        let allowed = matches!(
            (entry.state, to),
            (EntryPointState::CodeGenPending, EntryPointState::CodeGenQueued)
                | (EntryPointState::CodeGenPending, EntryPointState::CodeGenRecorded)
                | (EntryPointState::CodeGenQueued, EntryPointState::CodeGenRecorded)
        );
        if allowed {
            entry.state = to;
        }
        allowed
    }

    /// Whether an installed entry point depends on a broken assumption
    pub fn is_stale(&self, index: usize) -> bool {
        self.entries
            .get(index)
            .is_some_and(|entry| entry.is_installed() && entry.violation().is_some())
    }

    /// Re-check the captured assumptions of a recorded entry point
    pub fn recorded_violation(&self, index: usize) -> Option<String> {
        self.entries.get(index).and_then(EntryPoint::violation)
    }

    /// Make a recorded entry point the default. Nothing changes on failure.
    pub fn install(&mut self, index: usize, code: NativeCode) -> Result<()> {
        match self.entries.get(index).map(EntryPoint::state) {
            Some(EntryPointState::CodeGenRecorded) => {}
            Some(state) => crate::invariant_violation!("installing entry point {} in state {:?}", index, state),
            None => crate::invariant_violation!("installing unknown entry point {}", index),
        }

        // room to retire every installed entry, this one included, without allocating
        let installed = self.entries.iter().filter(|e| e.is_installed()).count();
        self.deferred_cleanup
            .try_reserve(installed + 1)
            .map_err(|_| Error::out_of_memory("reserving the cleanup queue"))?;
        self.injected_install_failure()?;

        let entry = &mut self.entries[index];
        entry.code = Some(code);
        entry.state = EntryPointState::CodeGenDone;
        entry.called_since_sweep = true;
        let previous = std::mem::replace(&mut self.default, index);
        self.stats.installs += 1;
        tracing::debug!(entry = index, previous, mode = ?entry.mode, "entry point installed");
        Ok(())
    }

    /// Drop an entry point that was never installed
    pub fn discard(&mut self, index: usize, reason: &str) {
        let Some(entry) = self.entries.get_mut(index) else {
            return;
        };
        if !entry.state.is_pending() && entry.state != EntryPointState::NotScheduled {
            return;
        }
        entry.state = EntryPointState::Discarded;
        entry.release();
        self.stats.discards += 1;
        tracing::debug!(entry = index, reason, "entry point discarded");
    }

    /// Outstanding compiles, for cancellation
    pub fn pending_work(&self) -> Vec<(usize, WorkItemId)> {
        self.entries
            .iter()
            .filter(|e| e.state.is_pending())
            .filter_map(|e| e.work_item.map(|id| (e.index, id)))
            .collect()
    }

    /// Retire the default entry point if one of its guards was invalidated.
    /// Returns the retired index.
    pub fn retire_stale_default(&mut self) -> Option<usize> {
        let index = self.default;
        if !self.is_stale(index) {
            return None;
        }
        self.invalidate(index);
        Some(index)
    }

    /// Retire every installed entry point whose assumptions broke
    pub fn retire_stale(&mut self) -> usize {
        let stale: Vec<usize> = (0..self.entries.len()).filter(|&i| self.is_stale(i)).collect();
        for &index in &stale {
            self.invalidate(index);
        }
        stale.len()
    }

    /// Mark an installed entry point invalid; a default one is replaced by
    /// a fresh interpreter entry point.
    pub fn invalidate(&mut self, index: usize) -> bool {
        match self.entries.get_mut(index) {
            Some(entry) if entry.is_installed() => {
                entry.state = EntryPointState::Invalidated;
                entry.liveness.expired.store(true, Ordering::Release);
            }
            _ => return false,
        }
        self.deferred_cleanup.push(index);
        self.stats.invalidations += 1;
        if self.default == index {
            self.default = self.fresh_interpreter_entry();
        }
        tracing::debug!(entry = index, default = self.default, "entry point invalidated");
        true
    }

    fn fresh_interpreter_entry(&mut self) -> usize {
        // fall back to the first interpreter entry if the list can't grow
        self.push(ExecutionMode::Interpreter, EntryPointState::NotScheduled)
            .unwrap_or(0)
    }

    /// Expire an installed entry point. A second expiry is a no-op.
    pub fn expire(&mut self, index: usize) -> bool {
        let mode = match self.entries.get_mut(index) {
            Some(entry) if entry.is_installed() => {
                entry.state = EntryPointState::Expired;
                entry.liveness.expired.store(true, Ordering::Release);
                entry.mode
            }
            _ => return false,
        };
        self.deferred_cleanup.push(index);
        self.stats.expirations += 1;

        if self.default == index {
            let fallback = self
                .entries
                .iter()
                .rev()
                .filter(|e| e.is_installed() && e.mode < mode && e.violation().is_none())
                .map(|e| e.index)
                .next();
            self.default = match fallback {
                Some(fallback) => fallback,
                None => self.fresh_interpreter_entry(),
            };
        }
        tracing::debug!(entry = index, default = self.default, "entry point expired");
        true
    }

    /// Expire installed entry points nothing can reach any more: not the
    /// recently called default, and no dispatch site holding a token.
    pub fn sweep_expired(&mut self) -> usize {
        let unreachable: Vec<usize> = self
            .entries
            .iter()
            .filter(|e| e.is_installed())
            .filter(|e| !(e.index == self.default && e.called_since_sweep) && !e.has_dispatch_sites())
            .map(|e| e.index)
            .collect();
        for entry in &mut self.entries {
            entry.called_since_sweep = false;
        }
        unreachable.iter().filter(|&&index| self.expire(index)).count()
    }

    /// Release code, guards, and pins of retired entry points
    pub fn drain_deferred_cleanup(&mut self) -> usize {
        let mut cleaned = 0;
        for index in self.deferred_cleanup.drain(..) {
            let Some(entry) = self.entries.get_mut(index) else {
                continue;
            };
            if matches!(entry.state, EntryPointState::Invalidated | EntryPointState::Expired) {
                entry.release();
                entry.state = EntryPointState::CleanedUp;
                cleaned += 1;
            }
        }
        self.stats.cleanups += cleaned as u64;
        if cleaned > 0 {
            tracing::trace!(cleaned, "deferred entry point cleanup");
        }
        cleaned
    }

    /// Retire everything and start over on the interpreter
    pub fn reset_to_interpreter(&mut self) {
        let before = self.default;
        for index in 0..self.entries.len() {
            if self.entries[index].state.is_pending() {
                self.discard(index, "byte code regenerated");
            } else {
                self.invalidate(index);
            }
        }
        if self.default == before {
            self.default = self.fresh_interpreter_entry();
        }
    }

    #[cfg(test)]
    pub(crate) fn fail_next_install(&mut self) {
        self.fail_next_install = true;
    }

    #[cfg(test)]
    fn injected_install_failure(&mut self) -> Result<()> {
        if std::mem::take(&mut self.fail_next_install) {
            return Err(Error::out_of_memory("installing entry point"));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn injected_install_failure(&mut self) -> Result<()> {
        Ok(())
    }
}

fn target_of(entry: &EntryPoint) -> EntryTarget {
    match (&entry.code, entry.state) {
        (Some(code), EntryPointState::CodeGenDone) => EntryTarget::Native {
            index: entry.index,
            mode: entry.mode,
            code: code.clone(),
        },
        _ => EntryTarget::Interpreter { index: entry.index },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::GuardManager;
    use crate::shape::{PropertyId, ShapeTable, TypeId};

    fn installed(registry: &mut EntryPointRegistry, mode: ExecutionMode, transfer: JitTransferData) -> usize {
        let index = registry.add_pending(mode, WorkItemId(index_seed(registry)), transfer).unwrap();
        assert!(registry.mark_state(index, EntryPointState::CodeGenRecorded));
        registry.install(index, NativeCode::new(index as u64, 64)).unwrap();
        index
    }

    fn index_seed(registry: &EntryPointRegistry) -> u64 {
        registry.len() as u64
    }

    #[test]
    fn test_starts_on_interpreter() {
        let registry = EntryPointRegistry::new();
        assert_eq!(registry.current(), EntryTarget::Interpreter { index: 0 });
        assert_eq!(registry.default_entry().state(), EntryPointState::NotScheduled);
    }

    #[test]
    fn test_install_flips_default() {
        let mut registry = EntryPointRegistry::new();
        let index = installed(&mut registry, ExecutionMode::BaselineJit, JitTransferData::default());
        assert_eq!(registry.default_index(), index);
        assert!(registry.current().is_native());
    }

    #[test]
    fn test_out_of_order_state_updates_ignored() {
        let mut registry = EntryPointRegistry::new();
        let index = registry
            .add_pending(ExecutionMode::BaselineJit, WorkItemId(1), JitTransferData::default())
            .unwrap();
        assert!(registry.mark_state(index, EntryPointState::CodeGenQueued));
        assert!(!registry.mark_state(index, EntryPointState::CodeGenQueued));
        assert!(registry.mark_state(index, EntryPointState::CodeGenRecorded));
        assert!(!registry.mark_state(index, EntryPointState::CodeGenPending));
    }

    #[test]
    fn test_failed_install_changes_nothing() {
        let mut registry = EntryPointRegistry::new();
        let index = registry
            .add_pending(ExecutionMode::BaselineJit, WorkItemId(1), JitTransferData::default())
            .unwrap();
        registry.mark_state(index, EntryPointState::CodeGenRecorded);
        registry.fail_next_install();
        assert!(registry.install(index, NativeCode::new(1, 8)).is_err());
        assert_eq!(registry.default_index(), 0);
        assert_eq!(registry.get(index).unwrap().state(), EntryPointState::CodeGenRecorded);
    }

    #[test]
    fn test_stale_default_is_retired_to_fresh_interpreter() {
        let shapes = ShapeTable::new();
        let manager = GuardManager::new();
        let mut session = manager.session();
        session.register_shared(PropertyId(1));
        let shape = shapes.create(TypeId(1));
        session.register_type(&shape);
        let transfer = JitTransferData::new(Vec::new(), session.finish()).unwrap();

        let mut registry = EntryPointRegistry::new();
        let index = installed(&mut registry, ExecutionMode::BaselineJit, transfer);
        assert!(registry.retire_stale_default().is_none());

        manager.invalidate_property(PropertyId(1));
        assert_eq!(registry.retire_stale_default(), Some(index));
        assert_eq!(registry.get(index).unwrap().state(), EntryPointState::Invalidated);
        let default = registry.default_entry();
        assert_eq!(default.state(), EntryPointState::NotScheduled);
        assert_ne!(default.index(), 0);
        assert_eq!(registry.pending_cleanup(), 1);
    }

    #[test]
    fn test_expire_twice_is_noop() {
        let shapes = ShapeTable::new();
        let manager = GuardManager::new();
        let shape = shapes.create(TypeId(1));
        let mut site = crate::inline_cache::InlineCacheSite::new(PropertyId(1), 4);
        site.record(&shape, crate::inline_cache::SlotInfo::local(0));
        let mut session = manager.session();
        let snapshot = crate::snapshot::build_snapshot(
            0,
            &mut site,
            &crate::snapshot::SnapshotOptions::default(),
            &mut session,
        )
        .unwrap();
        let transfer = JitTransferData::new(vec![Arc::new(snapshot)], session.finish()).unwrap();
        assert_eq!(shape.pin_count(), 1);

        let mut registry = EntryPointRegistry::new();
        let index = installed(&mut registry, ExecutionMode::BaselineJit, transfer);
        assert!(registry.expire(index));
        assert!(!registry.expire(index));
        assert_eq!(registry.drain_deferred_cleanup(), 1);
        assert_eq!(registry.drain_deferred_cleanup(), 0);
        assert_eq!(shape.pin_count(), 0);
        assert_eq!(registry.get(index).unwrap().state(), EntryPointState::CleanedUp);
        assert_eq!(registry.stats().expirations, 1);
    }

    #[test]
    fn test_expiring_default_reverts_to_lower_tier() {
        let mut registry = EntryPointRegistry::new();
        let baseline = installed(&mut registry, ExecutionMode::BaselineJit, JitTransferData::default());
        let optimized = installed(&mut registry, ExecutionMode::OptimizingJit, JitTransferData::default());
        assert_eq!(registry.default_index(), optimized);

        registry.expire(optimized);
        assert_eq!(registry.default_index(), baseline);

        registry.expire(baseline);
        assert!(!registry.current().is_native());
    }

    #[test]
    fn test_sweep_keeps_reachable_entries() {
        let mut registry = EntryPointRegistry::new();
        let held = installed(&mut registry, ExecutionMode::BaselineJit, JitTransferData::default());
        let token = registry.register_dispatch_site();
        let called = installed(&mut registry, ExecutionMode::OptimizingJit, JitTransferData::default());

        // both are reachable: one through a token, one recently called
        assert_eq!(registry.sweep_expired(), 0);
        // the default was not called since the last sweep
        assert_eq!(registry.sweep_expired(), 1);
        assert_eq!(registry.get(called).unwrap().state(), EntryPointState::Expired);
        assert_eq!(registry.default_index(), held);

        drop(token);
        assert_eq!(registry.sweep_expired(), 1);
        assert!(!registry.current().is_native());
    }

    #[test]
    fn test_token_reports_expiry_and_resolves_to_default() {
        let mut registry = EntryPointRegistry::new();
        let index = installed(&mut registry, ExecutionMode::BaselineJit, JitTransferData::default());
        let token = registry.register_dispatch_site();
        assert_eq!(registry.resolve(&token).index(), index);

        registry.expire(index);
        assert!(token.is_expired());
        let resolved = registry.resolve(&token);
        assert_eq!(resolved, registry.current());
    }

    #[test]
    fn test_token_to_stale_entry_is_retired_on_resolve() {
        let manager = GuardManager::new();
        let mut session = manager.session();
        session.register_shared(PropertyId(4));
        let transfer = JitTransferData::new(Vec::new(), session.finish()).unwrap();

        let mut registry = EntryPointRegistry::new();
        let index = installed(&mut registry, ExecutionMode::BaselineJit, transfer);
        let token = registry.register_dispatch_site();

        manager.invalidate_property(PropertyId(4));
        assert!(!registry.resolve(&token).is_native());
        assert!(token.is_expired());
        assert_eq!(registry.get(index).unwrap().state(), EntryPointState::Invalidated);
        assert_eq!(registry.stats().invalidations, 1);
    }

    #[test]
    fn test_cleanup_queue_keeps_its_reservation() {
        let mut registry = EntryPointRegistry::new();
        let baseline = installed(&mut registry, ExecutionMode::BaselineJit, JitTransferData::default());
        let optimized = installed(&mut registry, ExecutionMode::OptimizingJit, JitTransferData::default());
        let reserved = registry.deferred_cleanup.capacity();
        assert!(reserved >= 2);

        assert!(registry.expire(optimized));
        assert_eq!(registry.drain_deferred_cleanup(), 1);
        assert_eq!(registry.deferred_cleanup.capacity(), reserved);

        assert!(registry.expire(baseline));
        assert_eq!(registry.deferred_cleanup.capacity(), reserved);
    }

    #[test]
    fn test_reset_discards_pending_and_invalidates_installed() {
        let mut registry = EntryPointRegistry::new();
        let done = installed(&mut registry, ExecutionMode::BaselineJit, JitTransferData::default());
        let pending = registry
            .add_pending(ExecutionMode::OptimizingJit, WorkItemId(9), JitTransferData::default())
            .unwrap();
        assert_eq!(registry.pending_work(), vec![(pending, WorkItemId(9))]);

        registry.reset_to_interpreter();
        assert_eq!(registry.get(done).unwrap().state(), EntryPointState::Invalidated);
        assert_eq!(registry.get(pending).unwrap().state(), EntryPointState::Discarded);
        assert!(registry.pending_work().is_empty());
        assert!(!registry.current().is_native());
    }
}
