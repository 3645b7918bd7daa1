//! Garbage collection coordination and parallel marking.
//!
//! This module provides the core collection infrastructure:
//! - The cycle orchestrator and the main GC thread running it
//! - Parallel mark dispatching and the shared mark worklist
//! - Named GC threads and the auxiliary mark worker pool
//! - The global GC lock and lock ordering discipline
//! - The debug mark invariant check

#[allow(clippy::module_inception)]
mod gc;

pub mod marker;
pub mod sync;
pub mod verify;
pub mod worker;
pub mod worklist;

pub use gc::{CycleOrchestrator, GcCollaborators, MainGcThread};
pub use marker::{MarkDispatcher, MarkingHeap, ParallelMark};
pub use sync::{GcLock, GcLockGuard, LockOrder};
pub use verify::{check_mark_correctness, MarkViolation, ObjectGraph};
pub use worker::{AuxiliaryGcThreads, GcThread};
pub use worklist::MarkWorklist;
