//! Tier scheduling
//!
//! Each execution unit walks a ladder of phases, spending an iteration
//! budget in each:
//!
//! ```text
//! Interpreter -> AutoProfilingInterpreter0 -> ProfilingInterpreter0
//!   -> AutoProfilingInterpreter1 -> SimpleJit -> ProfilingInterpreter1 -> FullJit
//! ```
//!
//! Phases with a zero budget are skipped. The scheduler tracks the remaining
//! distance to the optimizing JIT separately from the budgets and checks
//! after every mutation that the two agree.

use bitflags::bitflags;
use serde::Serialize;
use std::fmt;

use crate::config::{JitConfig, TierLimits};

/// The execution strategy a phase runs under
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ExecutionMode {
    Interpreter,
    AutoProfilingInterpreter,
    ProfilingInterpreter,
    BaselineJit,
    OptimizingJit,
}

impl ExecutionMode {
    /// Whether this tier runs compiled code
    pub fn is_jit(&self) -> bool {
        matches!(self, ExecutionMode::BaselineJit | ExecutionMode::OptimizingJit)
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionMode::Interpreter => "interpreter",
            ExecutionMode::AutoProfilingInterpreter => "auto-profiling interpreter",
            ExecutionMode::ProfilingInterpreter => "profiling interpreter",
            ExecutionMode::BaselineJit => "baseline JIT",
            ExecutionMode::OptimizingJit => "optimizing JIT",
        };
        f.write_str(name)
    }
}

/// One rung of the phase ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ExecutionPhase {
    Interpreter = 0,
    AutoProfilingInterpreter0 = 1,
    ProfilingInterpreter0 = 2,
    AutoProfilingInterpreter1 = 3,
    SimpleJit = 4,
    ProfilingInterpreter1 = 5,
    FullJit = 6,
}

const BUDGETED_PHASES: usize = 6;

impl ExecutionPhase {
    const LADDER: [ExecutionPhase; 7] = [
        ExecutionPhase::Interpreter,
        ExecutionPhase::AutoProfilingInterpreter0,
        ExecutionPhase::ProfilingInterpreter0,
        ExecutionPhase::AutoProfilingInterpreter1,
        ExecutionPhase::SimpleJit,
        ExecutionPhase::ProfilingInterpreter1,
        ExecutionPhase::FullJit,
    ];

    pub fn ordinal(self) -> usize {
        self as usize
    }

    pub fn mode(self) -> ExecutionMode {
        match self {
            ExecutionPhase::Interpreter => ExecutionMode::Interpreter,
            ExecutionPhase::AutoProfilingInterpreter0 | ExecutionPhase::AutoProfilingInterpreter1 => {
                ExecutionMode::AutoProfilingInterpreter
            }
            ExecutionPhase::ProfilingInterpreter0 | ExecutionPhase::ProfilingInterpreter1 => {
                ExecutionMode::ProfilingInterpreter
            }
            ExecutionPhase::SimpleJit => ExecutionMode::BaselineJit,
            ExecutionPhase::FullJit => ExecutionMode::OptimizingJit,
        }
    }

    pub fn is_profiling(self) -> bool {
        self.mode() == ExecutionMode::ProfilingInterpreter
    }

    fn next(self) -> ExecutionPhase {
        Self::LADDER
            .get(self.ordinal() + 1)
            .copied()
            .unwrap_or(ExecutionPhase::FullJit)
    }
}

/// A phase change reported by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTransition {
    pub from: ExecutionPhase,
    pub to: ExecutionPhase,
    /// An optimizing compile was put back to profiling
    pub requeued: bool,
}

bitflags! {
    /// Runtime signals that adjust a unit's schedule
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SchedulerFlags: u8 {
        const CALLED_FROM_LOOP = 1 << 0;
        const HAS_HOT_LOOP = 1 << 1;
        /// Suppresses the hot-loop shortcut until the next phase change
        const RECENTLY_BAILED_OUT_OF_JITTED_LOOP = 1 << 2;
        /// A compiler reported a permanent failure
        const PINNED_TO_INTERPRETER = 1 << 3;
    }
}

/// Per-unit tiering counters
#[derive(Debug, Clone)]
pub struct TierScheduler {
    phase: ExecutionPhase,
    remaining: [u16; BUDGETED_PHASES],
    full_jit_distance: u32,
    phase_iterations: u32,
    interpreted_count: u64,
    committed_profiled_iterations: u32,
    flags: SchedulerFlags,
    limits: TierLimits,
    requeue_threshold: u16,
    min_profile_iterations: u16,
}

impl TierScheduler {
    pub fn new(config: &JitConfig) -> Self {
        let mut scheduler = Self {
            phase: ExecutionPhase::Interpreter,
            remaining: [0; BUDGETED_PHASES],
            full_jit_distance: 0,
            phase_iterations: 0,
            interpreted_count: 0,
            committed_profiled_iterations: 0,
            flags: SchedulerFlags::empty(),
            limits: config.tier_limits,
            requeue_threshold: config.full_jit_requeue_threshold,
            min_profile_iterations: config.min_profile_iterations,
        };
        scheduler.reset_budgets();
        scheduler
    }

    fn reset_budgets(&mut self) {
        let limits = self.limits;
        self.remaining = [
            limits.interpreter,
            limits.auto_profiling_interpreter0,
            limits.profiling_interpreter0,
            limits.auto_profiling_interpreter1,
            limits.simple_jit,
            limits.profiling_interpreter1,
        ];
        self.full_jit_distance = limits.full_jit_threshold();
        self.phase = ExecutionPhase::Interpreter;
        self.phase_iterations = 0;
        self.skip_exhausted_phases();
        self.check_invariant();
    }

    pub fn phase(&self) -> ExecutionPhase {
        self.phase
    }

    pub fn mode(&self) -> ExecutionMode {
        self.phase.mode()
    }

    pub fn flags(&self) -> SchedulerFlags {
        self.flags
    }

    pub fn is_pinned_to_interpreter(&self) -> bool {
        self.flags.contains(SchedulerFlags::PINNED_TO_INTERPRETER)
    }

    /// Remaining budget of a phase; `FullJit` has none
    pub fn remaining(&self, phase: ExecutionPhase) -> u16 {
        self.remaining.get(phase.ordinal()).copied().unwrap_or(0)
    }

    pub fn remaining_budgets(&self) -> [u16; BUDGETED_PHASES] {
        self.remaining
    }

    pub fn full_jit_distance(&self) -> u32 {
        self.full_jit_distance
    }

    pub fn interpreted_count(&self) -> u64 {
        self.interpreted_count
    }

    pub fn committed_profiled_iterations(&self) -> u32 {
        self.committed_profiled_iterations
    }

    /// Count a call that ran outside native code
    pub fn record_interpreted_call(&mut self) {
        self.interpreted_count += 1;
    }

    /// Spend one iteration of the current phase, moving on when it runs out
    pub fn try_advance(&mut self) -> Option<PhaseTransition> {
        if self.is_pinned_to_interpreter() || self.phase == ExecutionPhase::FullJit {
            return None;
        }

        let from = self.phase;
        let index = from.ordinal();
        let Some(left) = self.remaining[index].checked_sub(1) else {
            crate::invariant_violation!("budget of {:?} went negative", from);
        };
        self.remaining[index] = left;
        self.full_jit_distance -= 1;
        self.phase_iterations += 1;

        if left == 0 {
            self.leave_phase();
            self.skip_exhausted_phases();
        }
        self.check_invariant();

        (self.phase != from).then(|| {
            tracing::debug!(from = ?from, to = ?self.phase, "tier transition");
            PhaseTransition { from, to: self.phase, requeued: false }
        })
    }

    fn leave_phase(&mut self) {
        if self.phase.is_profiling() {
            self.committed_profiled_iterations += self.phase_iterations;
        }
        self.phase = self.phase.next();
        self.phase_iterations = 0;
        self.flags.remove(SchedulerFlags::RECENTLY_BAILED_OUT_OF_JITTED_LOOP);
    }

    fn skip_exhausted_phases(&mut self) {
        while self.phase != ExecutionPhase::FullJit && self.remaining(self.phase) == 0 {
            self.leave_phase();
        }
    }

    /// The unit is called from a loop: halve every outstanding budget, once.
    /// The current phase keeps at least one iteration.
    pub fn set_called_from_loop(&mut self) {
        if self.flags.contains(SchedulerFlags::CALLED_FROM_LOOP) || self.phase == ExecutionPhase::FullJit {
            return;
        }
        self.flags.insert(SchedulerFlags::CALLED_FROM_LOOP);

        let current = self.phase.ordinal();
        for index in current..BUDGETED_PHASES {
            let budget = self.remaining[index];
            let floor = u16::from(index == current && budget > 0);
            self.reduce(index, (budget / 2).max(floor));
        }
        self.check_invariant();
        tracing::trace!(distance = self.full_jit_distance, "budgets halved for call from loop");
    }

    /// The unit contains a hot loop: collapse every outstanding budget to one.
    /// Ignored right after a bailout out of a jitted loop body.
    pub fn set_has_hot_loop(&mut self) -> bool {
        if self.flags.contains(SchedulerFlags::RECENTLY_BAILED_OUT_OF_JITTED_LOOP)
            || self.phase == ExecutionPhase::FullJit
        {
            return false;
        }
        self.flags.insert(SchedulerFlags::HAS_HOT_LOOP);

        for index in self.phase.ordinal()..BUDGETED_PHASES {
            let budget = self.remaining[index];
            self.reduce(index, budget.min(1));
        }
        self.check_invariant();
        true
    }

    pub fn note_bailout_from_jitted_loop(&mut self) {
        self.flags.insert(SchedulerFlags::RECENTLY_BAILED_OUT_OF_JITTED_LOOP);
    }

    fn reduce(&mut self, index: usize, to: u16) {
        let budget = self.remaining[index];
        if to > budget {
            crate::invariant_violation!("budget shortcut would raise {} to {}", budget, to);
        }
        self.remaining[index] = to;
        self.full_jit_distance -= u32::from(budget - to);
    }

    /// Put a deferred or discarded optimizing compile back to profiling
    pub fn requeue_full_jit(&mut self) -> Option<PhaseTransition> {
        if self.phase != ExecutionPhase::FullJit || self.is_pinned_to_interpreter() {
            return None;
        }
        let shortfall = self
            .min_profile_iterations
            .saturating_sub(u16::try_from(self.committed_profiled_iterations).unwrap_or(u16::MAX));
        let budget = self.requeue_threshold.max(shortfall).max(1);

        let from = self.phase;
        self.phase = ExecutionPhase::ProfilingInterpreter1;
        self.phase_iterations = 0;
        self.remaining[ExecutionPhase::ProfilingInterpreter1.ordinal()] = budget;
        self.full_jit_distance = u32::from(budget);
        self.check_invariant();

        tracing::debug!(budget, "optimizing compile requeued to profiling");
        Some(PhaseTransition { from, to: self.phase, requeued: true })
    }

    /// Stop tiering for good
    pub fn pin_to_interpreter(&mut self) {
        self.flags.insert(SchedulerFlags::PINNED_TO_INTERPRETER);
        self.remaining = [0; BUDGETED_PHASES];
        self.full_jit_distance = 0;
        self.phase = ExecutionPhase::Interpreter;
        self.phase_iterations = 0;
    }

    /// Start over after the byte code was regenerated. A unit the compiler
    /// gave up on stays pinned.
    pub fn reinitialize(&mut self) {
        let pinned = self.is_pinned_to_interpreter();
        self.flags = SchedulerFlags::empty();
        self.interpreted_count = 0;
        self.committed_profiled_iterations = 0;
        self.reset_budgets();
        if pinned {
            self.pin_to_interpreter();
        }
    }

    /// Abort if the budgets no longer add up to the distance to full JIT
    pub fn check_invariant(&self) {
        if self.is_pinned_to_interpreter() {
            return;
        }
        let total: u32 = self.remaining.iter().map(|&b| u32::from(b)).sum();
        if total != self.full_jit_distance {
            crate::invariant_violation!(
                "remaining budgets sum to {} but distance to full JIT is {}",
                total,
                self.full_jit_distance
            );
        }
        if self.phase != ExecutionPhase::FullJit && self.remaining(self.phase) == 0 {
            crate::invariant_violation!("current phase {:?} has no budget", self.phase);
        }
    }
}
