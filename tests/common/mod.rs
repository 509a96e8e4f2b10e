//! Shared test helpers for integration tests

use tierjit::{
    BytecodeHandle, EntryTarget, FunctionDescriptor, FunctionId, JitConfig, JitRuntime, PropertyId, PropertySlot,
    ShapeRef, ShapeTable, TierLimits, TypeId, UnitKind,
};

/// Configuration compiling on the calling thread at safe points
#[allow(dead_code)]
pub fn deferred_config(tier_limits: TierLimits) -> JitConfig {
    JitConfig { background_compilation: false, tier_limits, ..JitConfig::default() }
}

/// A ladder short enough to walk in a test
#[allow(dead_code)]
pub fn short_limits() -> TierLimits {
    TierLimits {
        interpreter: 4,
        auto_profiling_interpreter0: 8,
        profiling_interpreter0: 0,
        auto_profiling_interpreter1: 0,
        simple_jit: 6,
        profiling_interpreter1: 4,
    }
}

/// Runtime with one function unit whose inline cache sites access `properties`
#[allow(dead_code)]
pub fn runtime_with_unit(config: JitConfig, function: FunctionId, properties: &[PropertyId]) -> JitRuntime {
    let mut runtime = JitRuntime::new(config).expect("valid config");
    runtime.register_unit(
        &FunctionDescriptor::new(function, properties.to_vec()),
        UnitKind::Function,
        BytecodeHandle::new(vec![0u8; 32]),
    );
    runtime
}

/// `count` shapes of one type, each holding `property` in inline slot 0
#[allow(dead_code)]
pub fn shapes_with(table: &ShapeTable, count: usize, property: PropertyId) -> Vec<ShapeRef> {
    (0..count)
        .map(|_| table.create_with(TypeId(1), &[(property, PropertySlot::inline(0))]))
        .collect()
}

/// Call a unit `count` times, returning what each call ran
#[allow(dead_code)]
pub fn call_n(runtime: &mut JitRuntime, function: FunctionId, count: usize) -> Vec<EntryTarget> {
    (0..count)
        .map(|_| runtime.on_call(function).expect("registered unit"))
        .collect()
}
