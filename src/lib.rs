//! Tierjit: adaptive tiered execution for a managed-language runtime
//!
//! Tierjit is the part of a dynamic-language engine that decides when a
//! function leaves the interpreter, what the compiler may assume about the
//! objects it sees, and how compiled code is retired when those assumptions
//! break. It owns no interpreter and emits no machine code; both plug in at
//! the edges.
//!
//! # Features
//!
//! - **Tier scheduling**: per-unit budgets walk each function through profiling
//!   interpreters to a baseline and then an optimizing compile
//! - **Inline caches**: monomorphic and polymorphic caches record the shapes
//!   seen at each property access site
//! - **Speculation with guards**: snapshots of the caches are protected by
//!   shared invalidation words any thread can clear
//! - **Safe installation**: compiled code only becomes callable after every
//!   captured assumption is re-checked on the owning thread
//!
//! # Quick Start
//!
//! ```no_run
//! use tierjit::{BytecodeHandle, FunctionDescriptor, FunctionId, JitConfig, JitRuntime, PropertyId, UnitKind};
//!
//! fn main() -> tierjit::Result<()> {
//!     let mut runtime = JitRuntime::new(JitConfig::default())?;
//!     let f = FunctionId(1);
//!     runtime.register_unit(
//!         &FunctionDescriptor::new(f, vec![PropertyId(0)]),
//!         UnitKind::Function,
//!         BytecodeHandle::new(vec![0u8; 32]),
//!     );
//!     for _ in 0..200 {
//!         let target = runtime.on_call(f)?;
//!         println!("running {:?}", target);
//!         runtime.safe_point();
//!     }
//!     println!("{}", runtime.summary());
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! A call flows: [`runtime`] → [`scheduler`] → [`coordinator`] (with [`snapshot`] and [`guard`]) → [`entry_point`]
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Object model** | [`shape`], [`inline_cache`] |
//! | **Speculation** | [`guard`], [`snapshot`] |
//! | **Tiering** | [`scheduler`], [`unit`], [`entry_point`], [`coordinator`] |
//! | **Embedding** | [`runtime`], [`config`], [`diagnostics`], [`error`](Error) |

pub mod config;
pub mod coordinator;
pub mod diagnostics;
pub mod entry_point;
pub mod guard;
pub mod inline_cache;
pub mod runtime;
pub mod scheduler;
pub mod shape;
pub mod snapshot;
pub mod unit;

mod error;

pub use config::{JitConfig, TierLimits};
pub use coordinator::{CompilationCoordinator, CompileOutcome, CompiledCodeBlob, Compiler, GateOutcome, GuardKey, ThunkCompiler, WorkItem, WorkItemId};
pub use diagnostics::{JitStats, JitSummary, UnitDiagnostics};
pub use entry_point::{DispatchToken, EntryPointState, EntryTarget, NativeCode};
pub use error::{CompileError, Error, Result};
pub use guard::{Guard, GuardManager, PropertyGuard};
pub use inline_cache::{CacheEntryKind, HitKind, InlineCacheSite, SlotInfo};
pub use runtime::{JitRuntime, SafePointReport};
pub use scheduler::{ExecutionMode, ExecutionPhase, SchedulerFlags, TierScheduler};
pub use snapshot::{SnapshotOptions, TypeSpecializationSnapshot};
pub use shape::{FixedValue, FunctionId, ObjectId, PinnedType, PropertyId, PropertySlot, Shape, ShapeId, ShapeRef, ShapeTable, TypeId};
pub use unit::{BytecodeHandle, FunctionDescriptor, FunctionExecutionUnit, UnitKind};

/// Tierjit version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
