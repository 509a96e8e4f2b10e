//! Read-only diagnostics
//!
//! Snapshots of tiering state for tooling. Nothing here can change the
//! state it describes.

use serde::Serialize;
use std::fmt;

use crate::entry_point::{EntryPointState, EntryTarget, RegistryStats};
use crate::inline_cache::{CacheSiteStats, CacheStateKind};
use crate::scheduler::{ExecutionMode, ExecutionPhase};
use crate::shape::{FunctionId, PropertyId};
use crate::unit::{FunctionExecutionUnit, UnitKind};

/// State of one inline cache site
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiteDiagnostics {
    pub index: usize,
    pub property: PropertyId,
    pub state: CacheStateKind,
    pub shapes: usize,
    pub ignore_for_equivalence: bool,
    pub stats: CacheSiteStats,
}

/// State of one entry point
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryDiagnostics {
    pub index: usize,
    pub mode: ExecutionMode,
    pub state: EntryPointState,
    pub pinned_types: usize,
}

/// Tiering state of one unit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitDiagnostics {
    pub function: FunctionId,
    pub loop_body: bool,
    pub phase: ExecutionPhase,
    /// The tier the schedule is in. Compiled code for it may be missing
    /// (still compiling, or rejected at the validation gate).
    pub mode: ExecutionMode,
    /// What new calls actually run
    pub running_mode: ExecutionMode,
    pub pinned_to_interpreter: bool,
    pub interpreted_count: u64,
    pub committed_profiled_iterations: u32,
    pub full_jit_distance: u32,
    pub remaining_budgets: [u16; 6],
    pub default_entry: usize,
    pub running_native: bool,
    pub entries: Vec<EntryDiagnostics>,
    pub sites: Vec<SiteDiagnostics>,
}

impl UnitDiagnostics {
    pub fn capture(unit: &FunctionExecutionUnit) -> Self {
        let scheduler = unit.scheduler();
        let registry = unit.registry();
        Self {
            function: unit.id(),
            loop_body: matches!(unit.kind(), UnitKind::LoopBody { .. }),
            phase: scheduler.phase(),
            mode: scheduler.mode(),
            running_mode: running_mode(scheduler.mode(), &registry.current()),
            pinned_to_interpreter: scheduler.is_pinned_to_interpreter(),
            interpreted_count: scheduler.interpreted_count(),
            committed_profiled_iterations: scheduler.committed_profiled_iterations(),
            full_jit_distance: scheduler.full_jit_distance(),
            remaining_budgets: scheduler.remaining_budgets(),
            default_entry: registry.default_index(),
            running_native: registry.current().is_native(),
            entries: registry
                .iter()
                .map(|entry| EntryDiagnostics {
                    index: entry.index(),
                    mode: entry.mode(),
                    state: entry.state(),
                    pinned_types: entry.transfer().map_or(0, |t| t.pin_count()),
                })
                .collect(),
            sites: unit
                .sites()
                .iter()
                .enumerate()
                .map(|(index, site)| SiteDiagnostics {
                    index,
                    property: site.property(),
                    state: site.kind(),
                    shapes: site.len(),
                    ignore_for_equivalence: site.ignore_for_equivalence(),
                    stats: site.stats(),
                })
                .collect(),
        }
    }

    pub fn cache_hits(&self) -> u64 {
        self.sites.iter().map(|s| s.stats.hits).sum()
    }

    pub fn cache_misses(&self) -> u64 {
        self.sites.iter().map(|s| s.stats.misses).sum()
    }
}

fn running_mode(scheduled: ExecutionMode, target: &EntryTarget) -> ExecutionMode {
    match target {
        EntryTarget::Native { mode, .. } => *mode,
        EntryTarget::Interpreter { .. } if scheduled.is_jit() => ExecutionMode::Interpreter,
        EntryTarget::Interpreter { .. } => scheduled,
    }
}

/// Runtime-wide counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JitStats {
    pub compile_requests: u64,
    pub installs: u64,
    pub validation_discards: u64,
    pub compile_failures: u64,
    pub install_failures: u64,
    pub cancellations: u64,
    pub invalidations: u64,
    pub expirations: u64,
    pub cleanups: u64,
    pub property_invalidations: u64,
}

impl JitStats {
    /// Fold one unit's registry counters in
    pub fn add_registry(&mut self, stats: &RegistryStats) {
        self.invalidations += stats.invalidations;
        self.expirations += stats.expirations;
        self.cleanups += stats.cleanups;
    }
}

/// Summary across all units, for tooling output
#[derive(Debug, Clone, Serialize)]
pub struct JitSummary {
    pub units: usize,
    pub interpreted: usize,
    pub baseline: usize,
    pub optimized: usize,
    pub pinned: usize,
    pub megamorphic_sites: usize,
    pub cache_hit_rate: f64,
    pub stats: JitStats,
}

impl JitSummary {
    pub fn from_units<'a>(units: impl IntoIterator<Item = &'a UnitDiagnostics>, stats: JitStats) -> Self {
        let mut summary = JitSummary {
            units: 0,
            interpreted: 0,
            baseline: 0,
            optimized: 0,
            pinned: 0,
            megamorphic_sites: 0,
            cache_hit_rate: 0.0,
            stats,
        };
        let (mut hits, mut misses) = (0u64, 0u64);
        for unit in units {
            summary.units += 1;
            let running = unit
                .entries
                .iter()
                .find(|e| e.index == unit.default_entry && unit.running_native)
                .map(|e| e.mode);
            match running {
                Some(ExecutionMode::OptimizingJit) => summary.optimized += 1,
                Some(ExecutionMode::BaselineJit) => summary.baseline += 1,
                _ => summary.interpreted += 1,
            }
            if unit.pinned_to_interpreter {
                summary.pinned += 1;
            }
            summary.megamorphic_sites += unit
                .sites
                .iter()
                .filter(|s| s.state == CacheStateKind::Megamorphic)
                .count();
            hits += unit.cache_hits();
            misses += unit.cache_misses();
        }
        if hits + misses > 0 {
            summary.cache_hit_rate = hits as f64 / (hits + misses) as f64 * 100.0;
        }
        summary
    }
}

impl fmt::Display for JitSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== JIT Tiering Summary ===")?;
        writeln!(
            f,
            "Units: {} total, {} interpreted, {} baseline, {} optimized, {} pinned",
            self.units, self.interpreted, self.baseline, self.optimized, self.pinned
        )?;
        writeln!(
            f,
            "Compiles: {} requested, {} installed, {} rejected at validation, {} failed",
            self.stats.compile_requests,
            self.stats.installs,
            self.stats.validation_discards,
            self.stats.compile_failures + self.stats.install_failures
        )?;
        writeln!(
            f,
            "Entry points: {} invalidated, {} expired, {} cleaned up",
            self.stats.invalidations, self.stats.expirations, self.stats.cleanups
        )?;
        writeln!(f, "Inline caches: {:.1}% hit rate, {} megamorphic", self.cache_hit_rate, self.megamorphic_sites)?;
        writeln!(f, "Property guard invalidations: {}", self.stats.property_invalidations)?;
        Ok(())
    }
}
