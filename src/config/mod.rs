//! JIT configuration
//!
//! [`JitConfig`] carries the tier budgets and the specialization switches.
//! It can be loaded from JSON (string or file) and overlaid with `TIERJIT_*`
//! environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::inline_cache::{MAX_POLYMORPHIC_CAPACITY, MIN_POLYMORPHIC_CAPACITY};
use crate::shape::PropertyId;

/// Per-phase iteration budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierLimits {
    pub interpreter: u16,
    pub auto_profiling_interpreter0: u16,
    pub profiling_interpreter0: u16,
    pub auto_profiling_interpreter1: u16,
    pub simple_jit: u16,
    pub profiling_interpreter1: u16,
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            interpreter: 0,
            auto_profiling_interpreter0: 12,
            profiling_interpreter0: 4,
            auto_profiling_interpreter1: 0,
            simple_jit: 132,
            profiling_interpreter1: 12,
        }
    }
}

impl TierLimits {
    /// Calls from first execution until the optimizing JIT is requested
    pub fn full_jit_threshold(&self) -> u32 {
        [
            self.interpreter,
            self.auto_profiling_interpreter0,
            self.profiling_interpreter0,
            self.auto_profiling_interpreter1,
            self.simple_jit,
            self.profiling_interpreter1,
        ]
        .iter()
        .map(|&limit| u32::from(limit))
        .sum()
    }
}

/// Tiering and specialization configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    pub tier_limits: TierLimits,
    /// Profiling budget granted when an optimizing compile is requeued
    pub full_jit_requeue_threshold: u16,
    /// Profiled iterations a requeued unit should accumulate
    pub min_profile_iterations: u16,
    /// Shapes a polymorphic inline cache holds before going megamorphic
    pub polymorphic_cache_capacity: usize,
    /// Max shapes for fixed-function polymorphic inlining
    pub polymorphic_inline_limit: usize,
    /// Compile on a background thread; otherwise at safe points
    pub background_compilation: bool,
    pub fixed_fields: bool,
    /// Test hook: treat eligible monomorphic sites as equivalent sets
    pub stress_equivalence: bool,
    /// Built-ins whose observed values may be assumed fixed
    pub builtin_properties: Vec<PropertyId>,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            tier_limits: TierLimits::default(),
            full_jit_requeue_threshold: 25,
            min_profile_iterations: 16,
            polymorphic_cache_capacity: 4,
            polymorphic_inline_limit: 4,
            background_compilation: true,
            fixed_fields: true,
            stress_equivalence: false,
            builtin_properties: Vec::new(),
        }
    }
}

impl JitConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: JitConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Defaults overlaid with `TIERJIT_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(std::env::vars())?;
        Ok(config)
    }

    /// Overlay `TIERJIT_*` variables from any source. Unknown names are ignored.
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            let Some(name) = key.strip_prefix("TIERJIT_") else {
                continue;
            };
            match name {
                "BACKGROUND" => self.background_compilation = parse_bool(key, value)?,
                "STRESS_EQUIVALENCE" => self.stress_equivalence = parse_bool(key, value)?,
                "FIXED_FIELDS" => self.fixed_fields = parse_bool(key, value)?,
                "INTERPRETER_LIMIT" => self.tier_limits.interpreter = parse_num(key, value)?,
                "AUTO_PROFILING_LIMIT" => self.tier_limits.auto_profiling_interpreter0 = parse_num(key, value)?,
                "PROFILING_LIMIT" => self.tier_limits.profiling_interpreter0 = parse_num(key, value)?,
                "AUTO_PROFILING1_LIMIT" => self.tier_limits.auto_profiling_interpreter1 = parse_num(key, value)?,
                "SIMPLE_JIT_LIMIT" => self.tier_limits.simple_jit = parse_num(key, value)?,
                "PROFILING1_LIMIT" => self.tier_limits.profiling_interpreter1 = parse_num(key, value)?,
                "REQUEUE_THRESHOLD" => self.full_jit_requeue_threshold = parse_num(key, value)?,
                "MIN_PROFILE_ITERATIONS" => self.min_profile_iterations = parse_num(key, value)?,
                "POLY_CACHE_CAPACITY" => self.polymorphic_cache_capacity = parse_num(key, value)?,
                "POLY_INLINE_LIMIT" => self.polymorphic_inline_limit = parse_num(key, value)?,
                _ => tracing::debug!(variable = key, "ignoring unknown configuration variable"),
            }
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_POLYMORPHIC_CAPACITY..=MAX_POLYMORPHIC_CAPACITY).contains(&self.polymorphic_cache_capacity) {
            return Err(Error::config(format!(
                "polymorphic_cache_capacity must be between {} and {}, got {}",
                MIN_POLYMORPHIC_CAPACITY, MAX_POLYMORPHIC_CAPACITY, self.polymorphic_cache_capacity
            )));
        }
        if self.polymorphic_inline_limit > self.polymorphic_cache_capacity {
            return Err(Error::config(format!(
                "polymorphic_inline_limit ({}) exceeds polymorphic_cache_capacity ({})",
                self.polymorphic_inline_limit, self.polymorphic_cache_capacity
            )));
        }
        if self.full_jit_requeue_threshold == 0 {
            return Err(Error::config("full_jit_requeue_threshold must be non-zero"));
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(Error::config(format!("{}: expected a boolean, got '{}'", key, other))),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("{}: expected a number, got '{}'", key, value)))
}
