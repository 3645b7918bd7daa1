//! Heap contracts consumed by the cycle orchestrator.
//!
//! The orchestrator never looks inside the heap. It prepares allocation state
//! for sweeping, takes an iteration snapshot, sweeps, and collects the
//! resulting [`FinalizerQueue`]. Those steps are expressed by
//! [`HeapCoordinator`] and [`HeapSnapshot`]. Weak reference handling during
//! the cycle goes through [`WeakReferenceProcessor`].
//!
//! [`ManagedHeap`] implements all of them and is what
//! [`GarbageCollector::managed`](crate::GarbageCollector::managed) wires up.

mod managed;

pub use managed::{FinalizableObject, ManagedHeap, ManagedHeapSnapshot, ObjectId, WeakRef};

use crate::config::HeapStrategy;
use crate::epoch::Epoch;
use crate::gc::verify::ObjectGraph;
use crate::metrics::GcHandle;
use crate::thread::MutatorThread;

// ============================================================================
// FinalizerQueue
// ============================================================================

/// Objects found dead by a sweep that still need finalization.
///
/// Built from several sources (global sweep, per-thread sub-queues) and then
/// handed off as a whole. The orchestrator never touches a queue after
/// handing it off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizerQueue<T> {
    items: Vec<T>,
}

impl<T> Default for FinalizerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FinalizerQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Appends one object.
    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    /// Moves every object of `other` to the end of this queue.
    pub fn merge_from(&mut self, mut other: Self) {
        self.items.append(&mut other.items);
    }

    /// Number of queued objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterates over queued objects.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }
}

impl<T> IntoIterator for FinalizerQueue<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a FinalizerQueue<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl<T> FromIterator<T> for FinalizerQueue<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

impl<T> Extend<T> for FinalizerQueue<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        self.items.extend(iter);
    }
}

// ============================================================================
// Contracts
// ============================================================================

/// Allocation and sweep side of the heap.
pub trait HeapCoordinator: Send + Sync + 'static {
    /// Element type of the finalizer queues this heap produces.
    type Object: Send + 'static;

    /// Iteration snapshot returned by [`HeapCoordinator::lock_for_iter`].
    type Snapshot<'a>: HeapSnapshot<Object = Self::Object>
    where
        Self: 'a;

    /// The sweep strategy this heap was built for, if it supports only one.
    fn required_strategy(&self) -> Option<HeapStrategy> {
        None
    }

    /// Finalizes the thread-local allocation state of `thread`. Objects
    /// allocated by it afterwards belong to the next cycle.
    fn prepare_thread_for_gc(&self, thread: &MutatorThread);

    /// Finalizes the global allocation state.
    fn prepare_for_gc(&self);

    /// Locks the object and extra-object stores for iteration. Destruction
    /// and compaction are excluded until the snapshot is consumed.
    fn lock_for_iter(&self, handle: &GcHandle) -> Self::Snapshot<'_>;

    /// Returns free object-pool memory.
    fn compact_object_pool(&self) {}

    /// Sweeps the whole heap, extra objects included. Dead objects found in
    /// per-thread state are kept in per-thread sub-queues.
    fn sweep_heap(&self, handle: &GcHandle) -> FinalizerQueue<Self::Object>;

    /// Takes the finalizer sub-queue accumulated for `thread`.
    fn extract_thread_finalizer_queue(&self, thread: &MutatorThread) -> FinalizerQueue<Self::Object>;

    /// Takes the global finalizer sub-queue.
    fn extract_finalizer_queue(&self) -> FinalizerQueue<Self::Object>;

    /// Hands the allocation state of an exiting thread to the global heap.
    fn detach_thread(&self, _thread: &MutatorThread) {}
}

/// Locked view of the object and extra-object stores.
pub trait HeapSnapshot: ObjectGraph {
    /// Element type of the produced finalizer queue.
    type Object;

    /// Reclaims extra-object records of dead objects. The extra-object store
    /// may be released afterwards.
    fn sweep_extra_objects(&mut self, handle: &GcHandle);

    /// Reclaims unmarked objects, releasing the snapshot.
    fn sweep(self, handle: &GcHandle) -> FinalizerQueue<Self::Object>;
}

/// Weak reference handling around the end of marking.
pub trait WeakReferenceProcessor: Send + Sync {
    /// Makes mutators observe weak references to objects unmarked in
    /// `epoch` as cleared. Only called while the world is stopped.
    fn enable_barriers(&self, epoch: Epoch);

    /// Undoes [`WeakReferenceProcessor::enable_barriers`]. Only called while
    /// the world is stopped.
    fn disable_barriers(&self);

    /// Clears every weak reference whose target is unmarked.
    fn process_weaks(&self, handle: &GcHandle);
}
