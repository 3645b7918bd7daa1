//! Mark dispatching.
//!
//! The [`MarkDispatcher`] trait is the contract between the cycle orchestrator
//! and whatever owns the marking algorithm. [`ParallelMark`] is the reference
//! dispatcher: the main GC thread seeds the worklist from the roots and drains
//! it cooperatively with any auxiliary workers that are parked in
//! [`MarkDispatcher::run_auxiliary_unit`].

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::worklist::MarkWorklist;
use crate::epoch::Epoch;
use crate::metrics::{GcHandle, MarkStats};

/// Owner of the marking algorithm, driven by the cycle orchestrator.
pub trait MarkDispatcher: Send + Sync {
    /// Publishes the epoch of the cycle about to mark.
    fn begin_marking_epoch(&self, handle: &GcHandle);

    /// Marks everything reachable from the roots, cooperating with auxiliary
    /// workers. Returns once marking is complete.
    fn run_main_cooperative(&self) -> MarkStats;

    /// Performs one unit of auxiliary mark work. Blocks while there is
    /// nothing to do and returns promptly once shutdown is requested.
    fn run_auxiliary_unit(&self);

    /// Closes the marking epoch. No mark work may be enqueued afterwards.
    fn end_marking_epoch(&self);

    /// Asks auxiliary workers to exit.
    fn request_shutdown(&self);

    /// Whether [`MarkDispatcher::request_shutdown`] was called.
    fn shutdown_requested(&self) -> bool;
}

/// Heap capability needed by [`ParallelMark`].
pub trait MarkingHeap: Send + Sync {
    /// Object reference handed between mark workers.
    type Ref: Copy + Send + Sync + fmt::Debug;

    /// Called when a marking epoch begins, before any root is scanned.
    fn begin_epoch(&self, epoch: Epoch);

    /// Called once marking for `epoch` is complete.
    fn end_epoch(&self, _epoch: Epoch) {}

    /// Calls `f` for every root.
    fn for_each_root(&self, f: &mut dyn FnMut(Self::Ref));

    /// Marks `object` for `epoch`. Returns `true` if this call marked it.
    fn try_mark(&self, object: Self::Ref, epoch: Epoch) -> bool;

    /// Calls `f` for every reference held by `object`.
    fn for_each_field(&self, object: Self::Ref, f: &mut dyn FnMut(Self::Ref));

    /// Size of `object` in bytes.
    fn object_size(&self, object: Self::Ref) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkPhase {
    Idle,
    Ready,
    Marking,
    Complete,
}

#[derive(Debug)]
struct MarkState {
    epoch: Option<Epoch>,
    phase: MarkPhase,
    participants: usize,
    shutdown: bool,
}

/// Parallel marker over a [`MarkingHeap`].
pub struct ParallelMark<H: MarkingHeap> {
    heap: Arc<H>,
    worklist: MarkWorklist<H::Ref>,
    state: Mutex<MarkState>,
    changed: Condvar,
    objects_marked: AtomicUsize,
    bytes_marked: AtomicUsize,
}

impl<H: MarkingHeap> fmt::Debug for ParallelMark<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelMark")
            .field("state", &*self.state.lock())
            .field("pending", &self.worklist.pending())
            .finish_non_exhaustive()
    }
}

impl<H: MarkingHeap> ParallelMark<H> {
    /// Creates a dispatcher marking `heap`.
    #[must_use]
    pub fn new(heap: Arc<H>) -> Self {
        Self {
            heap,
            worklist: MarkWorklist::new(),
            state: Mutex::new(MarkState {
                epoch: None,
                phase: MarkPhase::Idle,
                participants: 0,
                shutdown: false,
            }),
            changed: Condvar::new(),
            objects_marked: AtomicUsize::new(0),
            bytes_marked: AtomicUsize::new(0),
        }
    }

    /// Clears a previous shutdown request so workers can be started again.
    ///
    /// # Panics
    ///
    /// Panics if an auxiliary worker is still participating.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        assert_eq!(state.participants, 0, "mark dispatcher reset with active workers");
        state.shutdown = false;
    }

    fn current_epoch(&self) -> Epoch {
        let state = self.state.lock();
        assert_eq!(state.phase, MarkPhase::Ready, "marking run outside a marking epoch");
        state
            .epoch
            .unwrap_or_else(|| unreachable!("ready phase always carries an epoch"))
    }

    fn drain(&self, epoch: Epoch) {
        let heap = &*self.heap;
        let mut objects = 0;
        let mut bytes = 0;
        self.worklist.local().drain(|object, local| {
            heap.for_each_field(object, &mut |field| {
                if heap.try_mark(field, epoch) {
                    objects += 1;
                    bytes += heap.object_size(field);
                    local.push(field);
                }
            });
        });
        self.objects_marked.fetch_add(objects, Ordering::Relaxed);
        self.bytes_marked.fetch_add(bytes, Ordering::Relaxed);
    }
}

impl<H: MarkingHeap> MarkDispatcher for ParallelMark<H> {
    fn begin_marking_epoch(&self, handle: &GcHandle) {
        let epoch = handle.epoch();
        {
            let mut state = self.state.lock();
            assert_eq!(state.phase, MarkPhase::Idle, "marking epoch {epoch} began twice");
            state.epoch = Some(epoch);
            state.phase = MarkPhase::Ready;
        }
        self.heap.begin_epoch(epoch);
    }

    fn run_main_cooperative(&self) -> MarkStats {
        let epoch = self.current_epoch();
        self.objects_marked.store(0, Ordering::Relaxed);
        self.bytes_marked.store(0, Ordering::Relaxed);

        let heap = &*self.heap;
        let mut objects = 0;
        let mut bytes = 0;
        heap.for_each_root(&mut |root| {
            if heap.try_mark(root, epoch) {
                objects += 1;
                bytes += heap.object_size(root);
                self.worklist.push(root);
            }
        });
        self.objects_marked.fetch_add(objects, Ordering::Relaxed);
        self.bytes_marked.fetch_add(bytes, Ordering::Relaxed);

        self.state.lock().phase = MarkPhase::Marking;
        self.changed.notify_all();

        self.drain(epoch);

        let mut state = self.state.lock();
        state.phase = MarkPhase::Complete;
        self.changed.notify_all();
        while state.participants > 0 {
            self.changed.wait(&mut state);
        }
        drop(state);

        MarkStats {
            objects_marked: self.objects_marked.load(Ordering::Relaxed),
            bytes_marked: self.bytes_marked.load(Ordering::Relaxed),
        }
    }

    fn run_auxiliary_unit(&self) {
        let epoch = {
            let mut state = self.state.lock();
            while state.phase != MarkPhase::Marking && !state.shutdown {
                self.changed.wait(&mut state);
            }
            if state.shutdown {
                return;
            }
            state.participants += 1;
            state
                .epoch
                .unwrap_or_else(|| unreachable!("marking phase always carries an epoch"))
        };

        self.drain(epoch);

        let mut state = self.state.lock();
        state.participants -= 1;
        self.changed.notify_all();
        while state.phase == MarkPhase::Marking && !state.shutdown {
            self.changed.wait(&mut state);
        }
    }

    fn end_marking_epoch(&self) {
        let epoch = {
            let mut state = self.state.lock();
            assert_eq!(
                state.phase,
                MarkPhase::Complete,
                "marking epoch ended before marking completed"
            );
            state.phase = MarkPhase::Idle;
            state.epoch.take()
        };
        if let Some(epoch) = epoch {
            self.heap.end_epoch(epoch);
        }
    }

    fn request_shutdown(&self) {
        self.state.lock().shutdown = true;
        self.changed.notify_all();
    }

    fn shutdown_requested(&self) -> bool {
        self.state.lock().shutdown
    }
}
