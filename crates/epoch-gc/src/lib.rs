//! Epoch-driven orchestration of tracing garbage collection cycles.
//!
//! `epoch-gc` drives full collection cycles ("epochs") for a managed heap:
//! it coordinates stop-the-world pauses, dispatches parallel marking across
//! worker threads, toggles weak reference barriers, hands the heap to a sweep
//! phase and forwards reclaimed objects to asynchronous finalization, while
//! mutator threads keep running outside the pause windows.
//!
//! # Features
//!
//! - **Strictly ordered cycles**: one dedicated thread runs epochs serially
//!   under a global GC lock
//! - **Two pause strategies**: a single pause, or a shortened first pause with
//!   weak references processed concurrently behind barriers
//! - **Two heap strategies** selected at startup: [`HeapStrategy::Legacy`]
//!   and [`HeapStrategy::Custom`]
//! - **Pluggable collaborators**: marking, heap, weak references, finalizers,
//!   scheduling and safepoints are traits; reference implementations ship with
//!   the crate
//!
//! # Quick Start
//!
//! ```
//! use epoch_gc::{GarbageCollector, GcConfig};
//!
//! let gc = GarbageCollector::managed(GcConfig::default(), |_| {});
//! let mutator = gc.attach_mutator();
//!
//! let root = mutator.allocate_root(64, false);
//! let garbage = mutator.allocate(32, true);
//!
//! mutator.collect();
//! assert!(gc.heap().is_live(root));
//! assert!(!gc.heap().is_live(garbage));
//! ```
//!
//! # Custom collaborators
//!
//! [`GarbageCollector::new`] accepts any [`GcCollaborators`]. The
//! orchestrator itself, [`CycleOrchestrator`], can also be driven
//! synchronously through [`CycleOrchestrator::perform_full_gc`].

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod collector;
pub mod config;
pub mod epoch;
pub mod finalizer;
pub mod gc;
pub mod heap;
pub mod metrics;
pub mod scheduler;
pub mod thread;
pub mod tracing;

pub use collector::{GarbageCollector, Mutator};
pub use config::{GcConfig, HeapStrategy, RuntimeAssertsMode};
pub use epoch::{Epoch, EpochState};
pub use finalizer::{FinalizerHandoff, FinalizerProcessor};
pub use gc::{CycleOrchestrator, GcCollaborators, MainGcThread};
pub use heap::{
    FinalizableObject, FinalizerQueue, HeapCoordinator, HeapSnapshot, ManagedHeap, ObjectId,
    WeakRef, WeakReferenceProcessor,
};
pub use metrics::{CycleMetrics, GcHandle, GlobalMetrics, MarkStats, SweepStats};
pub use scheduler::{GcScheduler, ManualScheduler};
pub use thread::{MutatorState, MutatorThread, Safepoint, ThreadRegistry};
