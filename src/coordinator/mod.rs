//! Compilation coordination
//!
//! The owning thread packages everything a compile needs into an immutable
//! [`WorkItem`] and hands it off; nothing is shared mutably after that. The
//! compiler answers with a [`CompiledCodeBlob`], which the owning thread
//! only installs after the validation gate re-checks every assumption the
//! work item captured.
//!
//! Two backends run the [`Compiler`]:
//!
//! - a background thread fed through a channel
//! - a deferred queue compiled on the owning thread at safe points

use rustc_hash::FxHashMap as HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::JitConfig;
use crate::entry_point::{EntryPointState, JitTransferData, NativeCode};
use crate::error::{CompileError, Result};
use crate::guard::GuardManager;
use crate::scheduler::ExecutionMode;
use crate::shape::{FunctionId, PropertyId, ShapeId};
use crate::snapshot::{SnapshotOptions, TypeSpecializationSnapshot};
use crate::unit::{BytecodeHandle, FunctionExecutionUnit};

/// Identity of one compile request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkItemId(pub u64);

impl fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// An assumption compiled code may check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardKey {
    Property(PropertyId),
    Type(ShapeId),
    Constructor(FunctionId),
}

/// Everything a compiler may read for one compile. Immutable after handoff.
#[derive(Debug)]
pub struct WorkItem {
    id: WorkItemId,
    function: FunctionId,
    entry: usize,
    mode: ExecutionMode,
    bytecode: BytecodeHandle,
    snapshots: Vec<Arc<TypeSpecializationSnapshot>>,
    offered: Vec<GuardKey>,
    cancelled: Arc<AtomicBool>,
}

impl WorkItem {
    pub fn id(&self) -> WorkItemId {
        self.id
    }

    pub fn function(&self) -> FunctionId {
        self.function
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn bytecode(&self) -> &BytecodeHandle {
        &self.bytecode
    }

    pub fn snapshots(&self) -> &[Arc<TypeSpecializationSnapshot>] {
        &self.snapshots
    }

    /// Guards the compiled code is allowed to rely on
    pub fn offered_guards(&self) -> &[GuardKey] {
        &self.offered
    }

    /// Best-effort cancellation flag; compilers may poll it
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// What a compiler produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledCodeBlob {
    pub code: NativeCode,
    /// Guards the code actually checks; must be a subset of the offered ones
    pub baked_guards: Vec<GuardKey>,
}

/// The machine-code generator, seen from the core
pub trait Compiler: Send + 'static {
    fn compile(&mut self, item: &WorkItem) -> std::result::Result<CompiledCodeBlob, CompileError>;
}

/// Compiler that emits a placeholder code handle relying on every offered guard
#[derive(Debug, Default)]
pub struct ThunkCompiler {
    next_handle: u64,
}

impl ThunkCompiler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Compiler for ThunkCompiler {
    fn compile(&mut self, item: &WorkItem) -> std::result::Result<CompiledCodeBlob, CompileError> {
        if item.is_cancelled() {
            return Err(CompileError::Cancelled);
        }
        self.next_handle += 1;
        let size = 64 + 16 * item.snapshots().len() + item.bytecode().len();
        Ok(CompiledCodeBlob {
            code: NativeCode::new(self.next_handle, size),
            baked_guards: item.offered_guards().to_vec(),
        })
    }
}

/// A finished compile waiting for the validation gate
#[derive(Debug)]
pub struct CompileOutcome {
    pub id: WorkItemId,
    pub function: FunctionId,
    pub entry: usize,
    pub mode: ExecutionMode,
    pub result: std::result::Result<CompiledCodeBlob, CompileError>,
}

impl CompileOutcome {
    fn of(item: &WorkItem, result: std::result::Result<CompiledCodeBlob, CompileError>) -> Self {
        Self { id: item.id, function: item.function, entry: item.entry, mode: item.mode, result }
    }
}

/// What the validation gate did with an outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Installed { entry: usize },
    /// Compiled, but an assumption broke or installation ran out of memory
    Discarded { entry: usize, reason: String },
    Failed { entry: usize, error: CompileError },
    /// The entry point was cancelled or reset before the result arrived
    Ignored { entry: usize },
}

/// Coordinator counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub requests: u64,
    pub completed: u64,
    pub installs: u64,
    pub validation_discards: u64,
    pub install_failures: u64,
    pub compile_failures: u64,
    pub cancellations: u64,
}

enum Backend {
    Background {
        requests: Option<Sender<WorkItem>>,
        results: Receiver<CompileOutcome>,
        worker: Option<JoinHandle<()>>,
    },
    Deferred {
        compiler: Box<dyn Compiler>,
        queue: VecDeque<WorkItem>,
    },
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Background { .. } => f.write_str("Background"),
            Backend::Deferred { queue, .. } => write!(f, "Deferred({} queued)", queue.len()),
        }
    }
}

struct InFlight {
    cancelled: Arc<AtomicBool>,
    offered: Vec<GuardKey>,
}

/// Hands work to the compiler and installs what comes back
#[derive(Debug)]
pub struct CompilationCoordinator {
    backend: Backend,
    options: SnapshotOptions,
    next_id: u64,
    in_flight: HashMap<WorkItemId, InFlight>,
    finished: Vec<CompileOutcome>,
    stats: CoordinatorStats,
}

impl fmt::Debug for InFlight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlight")
            .field("cancelled", &self.cancelled.load(Ordering::Relaxed))
            .field("offered", &self.offered.len())
            .finish()
    }
}

impl CompilationCoordinator {
    pub fn new(config: &JitConfig, compiler: Box<dyn Compiler>) -> Result<Self> {
        let backend = if config.background_compilation {
            spawn_background(compiler)?
        } else {
            Backend::Deferred { compiler, queue: VecDeque::new() }
        };
        Ok(Self {
            backend,
            options: SnapshotOptions::from(config),
            next_id: 0,
            in_flight: HashMap::default(),
            finished: Vec::new(),
            stats: CoordinatorStats::default(),
        })
    }

    pub fn is_background(&self) -> bool {
        matches!(self.backend, Backend::Background { .. })
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.stats
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Snapshot the unit's caches, pin what they reference, add a pending
    /// entry point, and hand the work item off.
    pub fn request(
        &mut self,
        unit: &mut FunctionExecutionUnit,
        mode: ExecutionMode,
        guards: &GuardManager,
    ) -> Result<WorkItemId> {
        let mut session = guards.session();
        let snapshots = unit.build_snapshots(&self.options, &mut session);
        let offered = offered_guards(&snapshots);
        let transfer = JitTransferData::new(snapshots.clone(), session.finish())?;

        let id = WorkItemId(self.next_id);
        self.next_id += 1;
        let entry = unit.registry_mut().add_pending(mode, id, transfer)?;

        let cancelled = Arc::new(AtomicBool::new(false));
        let item = WorkItem {
            id,
            function: unit.id(),
            entry,
            mode,
            bytecode: unit.bytecode().clone(),
            snapshots,
            offered: offered.clone(),
            cancelled: Arc::clone(&cancelled),
        };

        let sent = match &mut self.backend {
            Backend::Background { requests: Some(requests), .. } => requests.send(item).is_ok(),
            Backend::Background { requests: None, .. } => false,
            Backend::Deferred { queue, .. } => {
                queue.push_back(item);
                true
            }
        };
        if !sent {
            unit.registry_mut().discard(entry, "compiler unavailable");
            return Err(CompileError::Cancelled.into());
        }

        unit.registry_mut().mark_state(entry, EntryPointState::CodeGenQueued);
        self.in_flight.insert(id, InFlight { cancelled, offered });
        self.stats.requests += 1;
        tracing::debug!(function = %unit.id(), work_item = %id, entry, ?mode, "compile requested");
        Ok(id)
    }

    /// Best-effort: the compiler may still finish, and the result is then
    /// dropped at the gate.
    pub fn cancel(&mut self, id: WorkItemId) -> bool {
        match self.in_flight.get(&id) {
            Some(flight) if !flight.cancelled.swap(true, Ordering::AcqRel) => {
                self.stats.cancellations += 1;
                tracing::debug!(work_item = %id, "compile cancelled");
                true
            }
            _ => false,
        }
    }

    /// Cancel every outstanding compile of a unit and discard its entries
    pub fn cancel_unit(&mut self, unit: &mut FunctionExecutionUnit) -> usize {
        let pending = unit.registry().pending_work();
        for &(entry, id) in &pending {
            self.cancel(id);
            unit.registry_mut().discard(entry, "cancelled");
        }
        pending.len()
    }

    /// Compile queued work on this thread (deferred backend only)
    pub fn run_deferred(&mut self) -> usize {
        let Backend::Deferred { compiler, queue } = &mut self.backend else {
            return 0;
        };
        let mut ran = 0;
        while let Some(item) = queue.pop_front() {
            let result = if item.is_cancelled() {
                Err(CompileError::Cancelled)
            } else {
                compiler.compile(&item)
            };
            self.finished.push(CompileOutcome::of(&item, result));
            ran += 1;
        }
        ran
    }

    /// Pull finished results off the background channel without blocking
    pub fn collect_finished(&mut self) -> usize {
        let Backend::Background { results, .. } = &self.backend else {
            return 0;
        };
        let mut collected = 0;
        loop {
            match results.try_recv() {
                Ok(outcome) => {
                    self.finished.push(outcome);
                    collected += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        collected
    }

    /// Wait up to `timeout` for one background result. For tooling and
    /// tests; the owning thread never waits on the compiler otherwise.
    pub fn wait_for_result(&mut self, timeout: Duration) -> bool {
        let Backend::Background { results, .. } = &self.backend else {
            return false;
        };
        match results.recv_timeout(timeout) {
            Ok(outcome) => {
                self.finished.push(outcome);
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Finished results for one unit, in completion order
    pub fn take_finished(&mut self, function: FunctionId) -> Vec<CompileOutcome> {
        let (mine, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.finished)
            .into_iter()
            .partition(|outcome| outcome.function == function);
        self.finished = rest;
        mine
    }

    /// Units with results waiting for the gate
    pub fn finished_functions(&self) -> Vec<FunctionId> {
        let mut functions: Vec<FunctionId> = self.finished.iter().map(|o| o.function).collect();
        functions.sort();
        functions.dedup();
        functions
    }

    /// The validation gate: install a finished compile only if every
    /// assumption it captured still holds. Main thread only.
    pub fn complete(&mut self, unit: &mut FunctionExecutionUnit, outcome: CompileOutcome) -> GateOutcome {
        let entry = outcome.entry;
        let flight = self.in_flight.remove(&outcome.id);
        self.stats.completed += 1;

        let registry = unit.registry_mut();
        let pending = registry.get(entry).is_some_and(|e| e.state().is_pending());
        let Some(flight) = flight.filter(|_| pending) else {
            return GateOutcome::Ignored { entry };
        };
        registry.mark_state(entry, EntryPointState::CodeGenRecorded);

        let blob = match outcome.result {
            Ok(blob) => blob,
            Err(error) => return self.fail(unit, entry, error),
        };

        if flight.cancelled.load(Ordering::Acquire) {
            unit.registry_mut().discard(entry, "cancelled");
            return GateOutcome::Ignored { entry };
        }

        if let Some(key) = blob.baked_guards.iter().find(|key| !flight.offered.contains(key)) {
            crate::invariant_violation!("work item {} baked in guard {:?} it was never offered", outcome.id, key);
        }

        if let Some(reason) = unit.registry().recorded_violation(entry) {
            return self.reject(unit, entry, outcome.mode, reason);
        }

        match unit.registry_mut().install(entry, blob.code) {
            Ok(()) => {
                self.stats.installs += 1;
                tracing::info!(function = %unit.id(), entry, mode = ?outcome.mode, "compiled code installed");
                GateOutcome::Installed { entry }
            }
            Err(err) => {
                self.stats.install_failures += 1;
                tracing::warn!(function = %unit.id(), entry, error = %err, "installation failed, keeping previous entry point");
                unit.registry_mut().discard(entry, "installation failed");
                GateOutcome::Discarded { entry, reason: err.to_string() }
            }
        }
    }

    fn reject(&mut self, unit: &mut FunctionExecutionUnit, entry: usize, mode: ExecutionMode, reason: String) -> GateOutcome {
        self.stats.validation_discards += 1;
        tracing::debug!(function = %unit.id(), entry, reason = %reason, "validation gate rejected compiled code");
        unit.registry_mut().discard(entry, &reason);
        if mode == ExecutionMode::OptimizingJit {
            unit.scheduler_mut().requeue_full_jit();
        }
        GateOutcome::Discarded { entry, reason }
    }

    fn fail(&mut self, unit: &mut FunctionExecutionUnit, entry: usize, error: CompileError) -> GateOutcome {
        unit.registry_mut().discard(entry, "compile failed");
        match &error {
            CompileError::Cancelled => return GateOutcome::Ignored { entry },
            CompileError::Fatal(_) | CompileError::Unsupported(_) => {
                tracing::warn!(function = %unit.id(), error = %error, "compiler gave up on unit, pinning to interpreter");
                self.cancel_unit(unit);
                unit.scheduler_mut().pin_to_interpreter();
                unit.registry_mut().reset_to_interpreter();
            }
            CompileError::OutOfMemory => {
                tracing::warn!(function = %unit.id(), "compiler ran out of memory, abandoning attempt");
            }
        }
        self.stats.compile_failures += 1;
        GateOutcome::Failed { entry, error }
    }
}

impl Drop for CompilationCoordinator {
    fn drop(&mut self) {
        for flight in self.in_flight.values() {
            flight.cancelled.store(true, Ordering::Release);
        }
        if let Backend::Background { requests, worker, .. } = &mut self.backend {
            // closing the channel ends the worker loop
            drop(requests.take());
            if let Some(worker) = worker.take() {
                let _ = worker.join();
            }
        }
    }
}

fn spawn_background(mut compiler: Box<dyn Compiler>) -> Result<Backend> {
    let (request_tx, request_rx) = mpsc::channel::<WorkItem>();
    let (result_tx, result_rx) = mpsc::channel::<CompileOutcome>();

    let worker = thread::Builder::new()
        .name("tierjit-bg".to_string())
        .spawn(move || run_background_worker(compiler.as_mut(), request_rx, result_tx))?;

    Ok(Backend::Background { requests: Some(request_tx), results: result_rx, worker: Some(worker) })
}

fn run_background_worker(compiler: &mut dyn Compiler, requests: Receiver<WorkItem>, results: Sender<CompileOutcome>) {
    for item in requests {
        let result = if item.is_cancelled() {
            Err(CompileError::Cancelled)
        } else {
            compiler.compile(&item)
        };
        if results.send(CompileOutcome::of(&item, result)).is_err() {
            break;
        }
    }
}

fn offered_guards(snapshots: &[Arc<TypeSpecializationSnapshot>]) -> Vec<GuardKey> {
    let mut keys = Vec::new();
    for snapshot in snapshots {
        if snapshot.property_guard().is_some() {
            keys.push(GuardKey::Property(snapshot.property()));
        }
        keys.extend(snapshot.shape_refs().iter().map(|shape| GuardKey::Type(shape.id())));
        if let Some(cache) = snapshot.constructor_cache() {
            keys.push(GuardKey::Constructor(cache.constructor()));
        }
    }
    keys.sort_by_key(guard_sort_key);
    keys.dedup();
    keys
}

fn guard_sort_key(key: &GuardKey) -> (u8, u64) {
    match *key {
        GuardKey::Property(p) => (0, u64::from(p.0)),
        GuardKey::Type(s) => (1, s.0),
        GuardKey::Constructor(f) => (2, u64::from(f.0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inline_cache::{CacheEntryKind, SlotInfo};
    use crate::shape::{ObjectId, ShapeTable, TypeId};
    use crate::unit::{FunctionDescriptor, UnitKind};

    fn deferred_config() -> JitConfig {
        JitConfig { background_compilation: false, ..JitConfig::default() }
    }

    fn unit(config: &JitConfig) -> FunctionExecutionUnit {
        FunctionExecutionUnit::new(
            &FunctionDescriptor::new(FunctionId(1), vec![PropertyId(1)]),
            UnitKind::Function,
            BytecodeHandle::new(vec![0u8; 8]),
            config,
        )
    }

    struct FailingCompiler(CompileError);

    impl Compiler for FailingCompiler {
        fn compile(&mut self, _item: &WorkItem) -> std::result::Result<CompiledCodeBlob, CompileError> {
            Err(self.0.clone())
        }
    }

    struct OverreachingCompiler;

    impl Compiler for OverreachingCompiler {
        fn compile(&mut self, _item: &WorkItem) -> std::result::Result<CompiledCodeBlob, CompileError> {
            Ok(CompiledCodeBlob {
                code: NativeCode::new(1, 1),
                baked_guards: vec![GuardKey::Property(PropertyId(99))],
            })
        }
    }

    fn complete_all(coordinator: &mut CompilationCoordinator, unit: &mut FunctionExecutionUnit) -> Vec<GateOutcome> {
        coordinator.run_deferred();
        coordinator
            .take_finished(unit.id())
            .into_iter()
            .map(|outcome| coordinator.complete(unit, outcome))
            .collect()
    }

    #[test]
    fn test_deferred_compile_installs() {
        let config = deferred_config();
        let guards = GuardManager::new();
        let mut coordinator = CompilationCoordinator::new(&config, Box::new(ThunkCompiler::new())).unwrap();
        let mut unit = unit(&config);

        coordinator.request(&mut unit, ExecutionMode::BaselineJit, &guards).unwrap();
        assert_eq!(unit.registry().get(1).unwrap().state(), EntryPointState::CodeGenQueued);

        let outcomes = complete_all(&mut coordinator, &mut unit);
        assert_eq!(outcomes, vec![GateOutcome::Installed { entry: 1 }]);
        assert!(unit.registry().current().is_native());
        assert_eq!(coordinator.stats().installs, 1);
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[test]
    fn test_gate_rejects_invalidated_property_guard() {
        let config = deferred_config();
        let guards = GuardManager::new();
        let shapes = ShapeTable::new();
        let shape = shapes.create(TypeId(1));
        let mut coordinator = CompilationCoordinator::new(&config, Box::new(ThunkCompiler::new())).unwrap();
        let mut unit = unit(&config);
        let proto = CacheEntryKind::Proto { prototype: ObjectId(1), is_missing: false };
        unit.site_mut(0).unwrap().record(&shape, SlotInfo::local(0).with_kind(proto));

        coordinator.request(&mut unit, ExecutionMode::BaselineJit, &guards).unwrap();
        coordinator.run_deferred();
        guards.invalidate_property(PropertyId(1));

        let outcomes: Vec<_> = coordinator
            .take_finished(unit.id())
            .into_iter()
            .map(|o| coordinator.complete(&mut unit, o))
            .collect();
        assert!(matches!(outcomes[0], GateOutcome::Discarded { entry: 1, .. }));
        assert_eq!(unit.registry().default_index(), 0);
        assert_eq!(unit.registry().get(1).unwrap().state(), EntryPointState::Discarded);
        assert_eq!(shape.pin_count(), 0);
    }

    #[test]
    fn test_cancelled_work_is_ignored() {
        let config = deferred_config();
        let guards = GuardManager::new();
        let mut coordinator = CompilationCoordinator::new(&config, Box::new(ThunkCompiler::new())).unwrap();
        let mut unit = unit(&config);

        coordinator.request(&mut unit, ExecutionMode::BaselineJit, &guards).unwrap();
        assert_eq!(coordinator.cancel_unit(&mut unit), 1);
        let outcomes = complete_all(&mut coordinator, &mut unit);
        assert_eq!(outcomes, vec![GateOutcome::Ignored { entry: 1 }]);
        assert!(!unit.registry().current().is_native());
        assert_eq!(coordinator.stats().cancellations, 1);
    }

    #[test]
    fn test_fatal_error_pins_unit() {
        let config = deferred_config();
        let guards = GuardManager::new();
        let compiler = FailingCompiler(CompileError::Fatal("unsupported opcode".into()));
        let mut coordinator = CompilationCoordinator::new(&config, Box::new(compiler)).unwrap();
        let mut unit = unit(&config);

        coordinator.request(&mut unit, ExecutionMode::BaselineJit, &guards).unwrap();
        let outcomes = complete_all(&mut coordinator, &mut unit);
        assert!(matches!(outcomes[0], GateOutcome::Failed { error: CompileError::Fatal(_), .. }));
        assert!(unit.scheduler().is_pinned_to_interpreter());
        assert!(unit.scheduler_mut().try_advance().is_none());
    }

    #[test]
    fn test_fatal_error_cancels_queued_work() {
        let config = deferred_config();
        let guards = GuardManager::new();
        let compiler = FailingCompiler(CompileError::Unsupported("generator".into()));
        let mut coordinator = CompilationCoordinator::new(&config, Box::new(compiler)).unwrap();
        let mut unit = unit(&config);

        coordinator.request(&mut unit, ExecutionMode::BaselineJit, &guards).unwrap();
        coordinator.run_deferred();
        coordinator.request(&mut unit, ExecutionMode::OptimizingJit, &guards).unwrap();

        let failed = coordinator.take_finished(unit.id()).remove(0);
        assert!(matches!(coordinator.complete(&mut unit, failed), GateOutcome::Failed { entry: 1, .. }));
        assert_eq!(coordinator.stats().cancellations, 1);
        assert_eq!(unit.registry().get(2).unwrap().state(), EntryPointState::Discarded);

        // the queued compile sees its flag and never reaches the compiler
        assert_eq!(complete_all(&mut coordinator, &mut unit), vec![GateOutcome::Ignored { entry: 2 }]);
        assert_eq!(coordinator.stats().compile_failures, 1);
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[test]
    fn test_oom_abandons_without_pinning() {
        let config = deferred_config();
        let guards = GuardManager::new();
        let mut coordinator =
            CompilationCoordinator::new(&config, Box::new(FailingCompiler(CompileError::OutOfMemory))).unwrap();
        let mut unit = unit(&config);

        coordinator.request(&mut unit, ExecutionMode::BaselineJit, &guards).unwrap();
        let outcomes = complete_all(&mut coordinator, &mut unit);
        assert!(matches!(outcomes[0], GateOutcome::Failed { error: CompileError::OutOfMemory, .. }));
        assert!(!unit.scheduler().is_pinned_to_interpreter());
        assert_eq!(unit.registry().default_index(), 0);
    }

    #[test]
    fn test_install_oom_rolls_back() {
        let config = deferred_config();
        let guards = GuardManager::new();
        let mut coordinator = CompilationCoordinator::new(&config, Box::new(ThunkCompiler::new())).unwrap();
        let mut unit = unit(&config);

        coordinator.request(&mut unit, ExecutionMode::BaselineJit, &guards).unwrap();
        complete_all(&mut coordinator, &mut unit);
        let previous = unit.registry().current();

        coordinator.request(&mut unit, ExecutionMode::OptimizingJit, &guards).unwrap();
        unit.registry_mut().fail_next_install();
        let outcomes = complete_all(&mut coordinator, &mut unit);
        assert!(matches!(outcomes[0], GateOutcome::Discarded { .. }));
        assert_eq!(unit.registry().current(), previous);
        assert_eq!(coordinator.stats().install_failures, 1);
    }

    #[test]
    #[should_panic(expected = "internal invariant violated")]
    fn test_baking_unoffered_guard_is_fatal() {
        let config = deferred_config();
        let guards = GuardManager::new();
        let mut coordinator = CompilationCoordinator::new(&config, Box::new(OverreachingCompiler)).unwrap();
        let mut unit = unit(&config);
        coordinator.request(&mut unit, ExecutionMode::BaselineJit, &guards).unwrap();
        complete_all(&mut coordinator, &mut unit);
    }

    #[test]
    fn test_background_compile_round_trip() {
        let config = JitConfig::default();
        let guards = GuardManager::new();
        let mut coordinator = CompilationCoordinator::new(&config, Box::new(ThunkCompiler::new())).unwrap();
        assert!(coordinator.is_background());
        let mut unit = unit(&config);

        coordinator.request(&mut unit, ExecutionMode::BaselineJit, &guards).unwrap();
        assert!(coordinator.wait_for_result(Duration::from_secs(5)));
        let outcome = coordinator.take_finished(unit.id()).pop().unwrap();
        assert_eq!(coordinator.complete(&mut unit, outcome), GateOutcome::Installed { entry: 1 });
    }

    #[test]
    fn test_offered_guards_cover_snapshot_assumptions() {
        let config = deferred_config();
        let guards = GuardManager::new();
        let shapes = ShapeTable::new();
        let a = shapes.create(TypeId(1));
        let b = shapes.create(TypeId(1));
        let mut unit = unit(&config);
        unit.site_mut(0).unwrap().record(&a, SlotInfo::local(0));
        unit.site_mut(0).unwrap().record(&b, SlotInfo::local(0));

        let mut session = guards.session();
        let snapshots = unit.build_snapshots(&SnapshotOptions::default(), &mut session);
        assert_eq!(offered_guards(&snapshots), vec![GuardKey::Type(a.id()), GuardKey::Type(b.id())]);
    }
}
