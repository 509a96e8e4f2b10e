//! Error types for the tiering core
//!
//! Failures are split the way the core contains them:
//!
//! - speculation failures never reach this module; they are handled by
//!   retiring entry points and falling back a tier
//! - [`CompileError`] is what the background compiler reports for a work item
//! - [`Error`] covers the recoverable failures of the public API
//! - internal invariant violations go through [`invariant_violation!`] and
//!   terminate the process

use std::fmt;
use thiserror::Error;

use crate::shape::FunctionId;

/// Outcome reported by a compiler for a single work item
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// The compiler can never produce code for this unit
    #[error("fatal compile error: {0}")]
    Fatal(String),

    /// The unit uses something the compiler does not support
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The compiler ran out of memory while compiling
    #[error("compiler out of memory")]
    OutOfMemory,

    /// The work item was cancelled before the compiler finished it
    #[error("work item cancelled")]
    Cancelled,
}

impl CompileError {
    /// Whether this failure pins the unit to the interpreter for good
    pub fn is_permanent(&self) -> bool {
        matches!(self, CompileError::Fatal(_) | CompileError::Unsupported(_))
    }
}

/// Main error type for the tiering core
#[derive(Error, Debug)]
pub enum Error {
    /// No execution unit is registered under this id
    #[error("unknown execution unit {0}")]
    UnknownUnit(FunctionId),

    /// An inline cache index outside the unit's cache table
    #[error("function {function} has no inline cache site {site}")]
    InvalidCacheSite { function: FunctionId, site: usize },

    /// Allocation failed while installing compiled code
    #[error("OutOfMemory: {0}")]
    OutOfMemory(String),

    /// The compiler rejected a work item
    #[error("CompileError: {0}")]
    Compile(#[from] CompileError),

    /// Invalid configuration value
    #[error("ConfigError: {0}")]
    Config(String),

    /// IO error while reading configuration
    #[error("IOError: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Malformed configuration document
    #[error("JsonError: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

impl Error {
    /// Create an out-of-memory error for an installation step
    pub fn out_of_memory(step: impl fmt::Display) -> Self {
        Error::OutOfMemory(format!("allocation failed while {}", step))
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Whether the failure was contained and the unit kept its previous state
    pub fn is_contained(&self) -> bool {
        matches!(self, Error::OutOfMemory(_) | Error::Compile(_))
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(err: std::collections::TryReserveError) -> Self {
        Error::OutOfMemory(err.to_string())
    }
}

/// Result type alias for the tiering core
pub type Result<T> = std::result::Result<T, Error>;

/// Abort on a broken internal invariant.
///
/// These indicate unsound specialization (a negative budget, a guard
/// registered twice with different values) and must never be recovered from.
#[macro_export]
macro_rules! invariant_violation {
    ($($arg:tt)+) => {{
        let message = format!($($arg)+);
        tracing::error!(%message, "internal invariant violated");
        panic!("internal invariant violated: {}", message);
    }};
}
