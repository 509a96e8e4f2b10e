//! Tier scheduling tests
//!
//! Budgets, shortcuts, and the phase ladder as seen through the public API.

mod common;

use pretty_assertions::assert_eq;
use tierjit::{ExecutionMode, ExecutionPhase, JitConfig, TierLimits, TierScheduler};

fn example_limits() -> TierLimits {
    TierLimits {
        interpreter: 0,
        auto_profiling_interpreter0: 10,
        profiling_interpreter0: 5,
        auto_profiling_interpreter1: 0,
        simple_jit: 20,
        profiling_interpreter1: 5,
    }
}

fn budget_sum(scheduler: &TierScheduler) -> u32 {
    scheduler.remaining_budgets().iter().map(|&b| u32::from(b)).sum()
}

fn assert_budget_invariant(scheduler: &TierScheduler) {
    assert_eq!(budget_sum(scheduler), scheduler.full_jit_distance());
}

mod budgets {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_threshold_matches_limits() {
        let config = common::deferred_config(example_limits());
        let scheduler = TierScheduler::new(&config);
        assert_eq!(config.tier_limits.full_jit_threshold(), 40);
        assert_eq!(scheduler.full_jit_distance(), 40);
        assert_budget_invariant(&scheduler);
    }

    #[test]
    fn test_zero_budget_phases_are_skipped() {
        let scheduler = TierScheduler::new(&common::deferred_config(example_limits()));
        assert_eq!(scheduler.phase(), ExecutionPhase::AutoProfilingInterpreter0);
        assert_eq!(scheduler.mode(), ExecutionMode::AutoProfilingInterpreter);
    }

    #[test]
    fn test_invariant_holds_after_halving() {
        let mut scheduler = TierScheduler::new(&common::deferred_config(example_limits()));
        scheduler.set_called_from_loop();
        assert_eq!(scheduler.remaining_budgets(), [0, 5, 2, 0, 10, 2]);
        assert_budget_invariant(&scheduler);

        // one-shot
        scheduler.set_called_from_loop();
        assert_eq!(budget_sum(&scheduler), 19);

        while scheduler.phase() != ExecutionPhase::FullJit {
            scheduler.try_advance();
            assert_budget_invariant(&scheduler);
        }
        assert_eq!(scheduler.full_jit_distance(), 0);
    }

    #[test]
    fn test_halving_keeps_current_phase_alive() {
        let limits = TierLimits { auto_profiling_interpreter0: 1, ..example_limits() };
        let mut scheduler = TierScheduler::new(&common::deferred_config(limits));
        scheduler.set_called_from_loop();
        assert_eq!(scheduler.remaining(ExecutionPhase::AutoProfilingInterpreter0), 1);
        assert_budget_invariant(&scheduler);
    }

    #[test]
    fn test_hot_loop_collapses_budgets() {
        let mut scheduler = TierScheduler::new(&common::deferred_config(example_limits()));
        assert!(scheduler.set_has_hot_loop());
        assert_eq!(scheduler.remaining_budgets(), [0, 1, 1, 0, 1, 1]);
        assert_eq!(scheduler.full_jit_distance(), 4);

        for _ in 0..4 {
            scheduler.try_advance();
            assert_budget_invariant(&scheduler);
        }
        assert_eq!(scheduler.phase(), ExecutionPhase::FullJit);
    }

    #[test]
    fn test_shortcuts_never_raise_budgets() {
        let mut scheduler = TierScheduler::new(&common::deferred_config(example_limits()));
        scheduler.set_has_hot_loop();
        let before = scheduler.remaining_budgets();
        scheduler.set_called_from_loop();
        let after = scheduler.remaining_budgets();
        for (b, a) in before.iter().zip(after.iter()) {
            assert!(a <= b);
        }
        assert_budget_invariant(&scheduler);
    }
}

mod transitions {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_phases_are_monotonic() {
        let mut scheduler = TierScheduler::new(&JitConfig::default());
        let mut visited = vec![scheduler.phase()];
        let mut calls = 0;
        while scheduler.phase() != ExecutionPhase::FullJit {
            let phase = scheduler.phase();
            if let Some(transition) = scheduler.try_advance() {
                assert_eq!(transition.from, phase);
                assert!(transition.to > transition.from);
                assert!(!transition.requeued);
                visited.push(transition.to);
            }
            calls += 1;
            if calls == 20 {
                scheduler.set_called_from_loop();
            }
            assert_budget_invariant(&scheduler);
        }
        assert!(visited.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(visited.first(), Some(&ExecutionPhase::AutoProfilingInterpreter0));
        assert_eq!(visited.last(), Some(&ExecutionPhase::FullJit));
    }

    #[test]
    fn test_full_jit_is_terminal_until_requeued() {
        let mut scheduler = TierScheduler::new(&JitConfig::default());
        while scheduler.try_advance().map(|t| t.to) != Some(ExecutionPhase::FullJit) {}
        assert!(scheduler.try_advance().is_none());
        assert_eq!(scheduler.committed_profiled_iterations(), 16);

        let requeue = scheduler.requeue_full_jit().expect("requeued");
        assert!(requeue.requeued);
        assert_eq!(requeue.to, ExecutionPhase::ProfilingInterpreter1);
        assert_eq!(scheduler.remaining(ExecutionPhase::ProfilingInterpreter1), 25);
        assert_budget_invariant(&scheduler);

        for _ in 0..24 {
            assert!(scheduler.try_advance().is_none());
        }
        let back = scheduler.try_advance().expect("back to full JIT");
        assert_eq!(back.to, ExecutionPhase::FullJit);
    }

    #[test]
    fn test_requeue_outside_full_jit_is_ignored() {
        let mut scheduler = TierScheduler::new(&JitConfig::default());
        assert!(scheduler.requeue_full_jit().is_none());
        assert_eq!(scheduler.phase(), ExecutionPhase::AutoProfilingInterpreter0);
    }

    #[test]
    fn test_loop_bailout_suppresses_hot_loop_until_transition() {
        let limits = TierLimits { auto_profiling_interpreter0: 2, ..example_limits() };
        let mut scheduler = TierScheduler::new(&common::deferred_config(limits));
        scheduler.note_bailout_from_jitted_loop();
        assert!(!scheduler.set_has_hot_loop());

        scheduler.try_advance();
        scheduler.try_advance();
        assert_eq!(scheduler.phase(), ExecutionPhase::ProfilingInterpreter0);
        assert!(scheduler.set_has_hot_loop());
    }

    #[test]
    fn test_pinned_scheduler_stays_in_interpreter() {
        let mut scheduler = TierScheduler::new(&JitConfig::default());
        scheduler.pin_to_interpreter();
        for _ in 0..500 {
            assert!(scheduler.try_advance().is_none());
        }
        assert_eq!(scheduler.phase(), ExecutionPhase::Interpreter);
        assert!(scheduler.is_pinned_to_interpreter());
        assert!(scheduler.requeue_full_jit().is_none());
    }

    #[test]
    fn test_reinitialize_restores_budgets() {
        let mut scheduler = TierScheduler::new(&JitConfig::default());
        scheduler.set_has_hot_loop();
        scheduler.try_advance();
        scheduler.record_interpreted_call();
        scheduler.reinitialize();
        assert_eq!(scheduler.full_jit_distance(), 160);
        assert_eq!(scheduler.interpreted_count(), 0);
        assert!(scheduler.flags().is_empty());
    }
}
