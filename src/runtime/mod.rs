//! Owning-thread façade
//!
//! [`JitRuntime`] owns the execution units and the compilation coordinator,
//! and shares the [`GuardManager`] with every thread that may mutate
//! shapes. The interpreter talks to it at three points:
//!
//! - [`JitRuntime::on_call`] before running a unit
//! - [`JitRuntime::record_property_access`] at inline cache sites
//! - [`JitRuntime::safe_point`] when it is safe to compile, sweep, and free

use rustc_hash::FxHashMap as HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::JitConfig;
use crate::coordinator::{CompilationCoordinator, Compiler, GateOutcome, ThunkCompiler};
use crate::diagnostics::{JitStats, JitSummary, UnitDiagnostics};
use crate::entry_point::{DispatchToken, EntryTarget};
use crate::error::{Error, Result};
use crate::guard::GuardManager;
use crate::inline_cache::{HitKind, SlotInfo};
use crate::scheduler::{ExecutionMode, ExecutionPhase, PhaseTransition};
use crate::shape::{FunctionId, PropertyId, ShapeId, ShapeRef};
use crate::unit::{BytecodeHandle, FunctionDescriptor, FunctionExecutionUnit, UnitKind};

/// What a safe point did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SafePointReport {
    pub compiled: usize,
    pub installed: usize,
    pub discarded: usize,
    pub retired: usize,
    pub expired: usize,
    pub cleaned: usize,
}

/// The tiering core of one runtime
#[derive(Debug)]
pub struct JitRuntime {
    config: JitConfig,
    guards: Arc<GuardManager>,
    units: HashMap<FunctionId, FunctionExecutionUnit>,
    coordinator: CompilationCoordinator,
}

impl JitRuntime {
    /// Runtime with the placeholder compiler
    pub fn new(config: JitConfig) -> Result<Self> {
        Self::with_compiler(config, Box::new(ThunkCompiler::new()))
    }

    pub fn with_compiler(config: JitConfig, compiler: Box<dyn Compiler>) -> Result<Self> {
        config.validate()?;
        let coordinator = CompilationCoordinator::new(&config, compiler)?;
        tracing::info!(
            background = coordinator.is_background(),
            full_jit_threshold = config.tier_limits.full_jit_threshold(),
            "tiering runtime started"
        );
        Ok(Self {
            config,
            guards: Arc::new(GuardManager::new()),
            units: HashMap::default(),
            coordinator,
        })
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// Shared guard tables; clone the `Arc` into any thread that mutates shapes
    pub fn guards(&self) -> &Arc<GuardManager> {
        &self.guards
    }

    pub fn register_unit(&mut self, descriptor: &FunctionDescriptor, kind: UnitKind, bytecode: BytecodeHandle) {
        let unit = FunctionExecutionUnit::new(descriptor, kind, bytecode, &self.config);
        tracing::trace!(function = %descriptor.function_id, sites = descriptor.inline_cache_count(), "unit registered");
        if let Some(mut previous) = self.units.insert(descriptor.function_id, unit) {
            self.coordinator.cancel_unit(&mut previous);
        }
    }

    pub fn unit(&self, function: FunctionId) -> Result<&FunctionExecutionUnit> {
        self.units.get(&function).ok_or(Error::UnknownUnit(function))
    }

    fn unit_mut(&mut self, function: FunctionId) -> Result<&mut FunctionExecutionUnit> {
        self.units.get_mut(&function).ok_or(Error::UnknownUnit(function))
    }

    /// Decide what a call runs, and advance the unit's schedule.
    ///
    /// Never waits for the compiler: a compile requested here is observed on
    /// a later call.
    pub fn on_call(&mut self, function: FunctionId) -> Result<EntryTarget> {
        if !self.units.contains_key(&function) {
            return Err(Error::UnknownUnit(function));
        }
        self.coordinator.collect_finished();
        self.install_finished(function);

        let Some(unit) = self.units.get_mut(&function) else {
            return Err(Error::UnknownUnit(function));
        };
        retire_stale_default(unit);

        let registry = unit.registry_mut();
        let target = registry.current();
        registry.record_call();
        if !target.is_native() {
            unit.scheduler_mut().record_interpreted_call();
        }

        if let Some(transition) = unit.scheduler_mut().try_advance() {
            self.on_transition(function, transition);
        }
        Ok(target)
    }

    fn on_transition(&mut self, function: FunctionId, transition: PhaseTransition) {
        let mode = transition.to.mode();
        if !mode.is_jit() {
            return;
        }
        let Some(unit) = self.units.get_mut(&function) else {
            return;
        };
        if let Err(err) = self.coordinator.request(unit, mode, &self.guards) {
            // contained: the schedule carries on as if nothing was requested
            tracing::warn!(%function, ?mode, error = %err, "compile request failed");
        }
    }

    fn install_finished(&mut self, function: FunctionId) -> (usize, usize) {
        let Some(unit) = self.units.get_mut(&function) else {
            return (0, 0);
        };
        let (mut installed, mut discarded) = (0, 0);
        for outcome in self.coordinator.take_finished(function) {
            match self.coordinator.complete(unit, outcome) {
                GateOutcome::Installed { .. } => installed += 1,
                GateOutcome::Discarded { .. } | GateOutcome::Failed { .. } => discarded += 1,
                GateOutcome::Ignored { .. } => {}
            }
        }
        (installed, discarded)
    }

    /// Consult an inline cache site without recording
    pub fn lookup(&mut self, function: FunctionId, site: usize, shape: ShapeId) -> Result<HitKind> {
        Ok(self.unit_mut(function)?.site_mut(site)?.lookup(shape))
    }

    /// The interpreter's property access path: consult the site and record
    /// the observation on a miss.
    pub fn record_property_access(
        &mut self,
        function: FunctionId,
        site: usize,
        shape: &ShapeRef,
        slot: SlotInfo,
    ) -> Result<HitKind> {
        let site = self.unit_mut(function)?.site_mut(site)?;
        let hit = site.lookup(shape.id());
        if hit == HitKind::None {
            site.record(shape, slot);
        }
        Ok(hit)
    }

    pub fn set_called_from_loop(&mut self, function: FunctionId) -> Result<()> {
        self.unit_mut(function)?.scheduler_mut().set_called_from_loop();
        Ok(())
    }

    /// Returns whether the shortcut was applied
    pub fn set_has_hot_loop(&mut self, function: FunctionId) -> Result<bool> {
        Ok(self.unit_mut(function)?.scheduler_mut().set_has_hot_loop())
    }

    /// A jitted loop body bailed out to the interpreter
    pub fn note_loop_bailout(&mut self, loop_body: FunctionId) -> Result<()> {
        let unit = self.unit_mut(loop_body)?;
        unit.scheduler_mut().note_bailout_from_jitted_loop();
        if let UnitKind::LoopBody { parent, .. } = unit.kind() {
            if let Some(parent) = self.units.get_mut(&parent) {
                parent.scheduler_mut().note_bailout_from_jitted_loop();
            }
        }
        Ok(())
    }

    /// Invalidate every speculation on a property. Entry points relying on
    /// it are retired on their next call or at the next safe point.
    pub fn invalidate_property(&self, property: PropertyId) -> bool {
        self.guards.invalidate_property(property)
    }

    /// Byte code was regenerated (debugger attach, redeferral)
    pub fn regenerate_bytecode(&mut self, function: FunctionId, bytecode: BytecodeHandle) -> Result<()> {
        let Some(unit) = self.units.get_mut(&function) else {
            return Err(Error::UnknownUnit(function));
        };
        let cancelled = self.coordinator.cancel_unit(unit);
        unit.regenerate(bytecode);
        tracing::info!(%function, cancelled, "byte code regenerated, unit reset to interpreter");
        Ok(())
    }

    /// Hand out a dispatch token for the unit's current default entry point
    pub fn register_dispatch_site(&self, function: FunctionId) -> Result<DispatchToken> {
        Ok(self.unit(function)?.registry().register_dispatch_site())
    }

    /// Re-resolve a dispatch site. Never returns code whose guards broke.
    pub fn resolve(&mut self, function: FunctionId, token: &DispatchToken) -> Result<EntryTarget> {
        let unit = self.unit_mut(function)?;
        retire_stale_default(unit);
        Ok(unit.registry_mut().resolve(token))
    }

    /// Compile deferred work, install results, retire stale entry points,
    /// sweep unreachable ones, and free what was retired.
    pub fn safe_point(&mut self) -> SafePointReport {
        let mut report = SafePointReport {
            compiled: self.coordinator.run_deferred(),
            ..SafePointReport::default()
        };
        self.coordinator.collect_finished();
        for function in self.coordinator.finished_functions() {
            let (installed, discarded) = self.install_finished(function);
            report.installed += installed;
            report.discarded += discarded;
        }

        for unit in self.units.values_mut() {
            report.retired += retire_stale(unit);
            report.expired += sweep_expired(unit);
            report.cleaned += unit.registry_mut().drain_deferred_cleanup();
        }
        self.guards.purge();

        if report != SafePointReport::default() {
            tracing::debug!(?report, "safe point");
        }
        report
    }

    /// Block up to `timeout` for one background compile result, then run a
    /// safe point. For tooling and tests.
    pub fn wait_for_background(&mut self, timeout: Duration) -> SafePointReport {
        self.coordinator.wait_for_result(timeout);
        self.safe_point()
    }

    pub fn diagnostics(&self, function: FunctionId) -> Result<UnitDiagnostics> {
        Ok(UnitDiagnostics::capture(self.unit(function)?))
    }

    pub fn stats(&self) -> JitStats {
        let coordinator = self.coordinator.stats();
        let mut stats = JitStats {
            compile_requests: coordinator.requests,
            installs: coordinator.installs,
            validation_discards: coordinator.validation_discards,
            compile_failures: coordinator.compile_failures,
            install_failures: coordinator.install_failures,
            cancellations: coordinator.cancellations,
            property_invalidations: self.guards.stats().property_invalidations,
            ..JitStats::default()
        };
        for unit in self.units.values() {
            stats.add_registry(&unit.registry().stats());
        }
        stats
    }

    pub fn summary(&self) -> JitSummary {
        let units: Vec<UnitDiagnostics> = self.units.values().map(UnitDiagnostics::capture).collect();
        JitSummary::from_units(&units, self.stats())
    }
}

fn retire_stale_default(unit: &mut FunctionExecutionUnit) {
    let Some(retired) = unit.registry_mut().retire_stale_default() else {
        return;
    };
    tracing::debug!(function = %unit.id(), entry = retired, "default entry point retired");
    requeue_if_optimizing_lost(unit);
}

fn retire_stale(unit: &mut FunctionExecutionUnit) -> usize {
    let retired = unit.registry_mut().retire_stale();
    if retired > 0 {
        requeue_if_optimizing_lost(unit);
    }
    retired
}

fn sweep_expired(unit: &mut FunctionExecutionUnit) -> usize {
    let expired = unit.registry_mut().sweep_expired();
    if expired > 0 {
        requeue_if_optimizing_lost(unit);
    }
    expired
}

/// A unit past its last budget has nothing left to count down; give it a
/// fresh profiling budget so it can be compiled again.
fn requeue_if_optimizing_lost(unit: &mut FunctionExecutionUnit) {
    let running_optimized = matches!(
        unit.registry().current(),
        EntryTarget::Native { mode: ExecutionMode::OptimizingJit, .. }
    );
    let compiling = !unit.registry().pending_work().is_empty();
    if unit.scheduler().phase() == ExecutionPhase::FullJit && !running_optimized && !compiling {
        unit.scheduler_mut().requeue_full_jit();
    }
}
