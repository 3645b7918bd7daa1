//! The GC cycle state machine.
//!
//! [`CycleOrchestrator::perform_full_gc`] runs one epoch end to end. The
//! steps are strictly ordered and never skipped:
//!
//! 1. take the global GC lock and open a [`GcHandle`]
//! 2. begin the marking epoch, stop the world, report the start
//! 3. mark cooperatively with auxiliary workers, end the marking epoch
//! 4. with concurrent weak sweep: enable weak barriers and resume early
//! 5. process weak references
//! 6. with concurrent weak sweep: stop the world again, disable barriers
//! 7. prepare every mutator's allocation state, then the global one
//! 8. legacy heap: lock the stores for iteration and verify marks
//! 9. resume the world and sweep
//! 10. report the finish, close the handle, release the lock
//! 11. hand the finalizer queue off with no lock held
//!
//! [`MainGcThread`] runs [`CycleOrchestrator::run`] on a dedicated thread.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use super::marker::MarkDispatcher;
use super::sync::GcLock;
use super::verify::{check_mark_correctness, ObjectGraph};
use super::worker::GcThread;
use crate::config::{GcConfig, HeapStrategy, RuntimeAssertsMode};
use crate::epoch::{Epoch, EpochState};
use crate::finalizer::FinalizerHandoff;
use crate::heap::{FinalizerQueue, HeapCoordinator, HeapSnapshot, WeakReferenceProcessor};
use crate::metrics::{GcHandle, GlobalMetrics};
use crate::scheduler::GcScheduler;
use crate::thread::{Safepoint, ThreadRegistry};
use crate::tracing::{
    log_cycle_finished, log_mark_violation, log_phase_end, log_phase_start, trace_gc_cycle,
    GcPhase,
};

/// Everything the orchestrator drives.
pub struct GcCollaborators<H: HeapCoordinator> {
    /// Allocation and sweep.
    pub heap: Arc<H>,
    /// Marking.
    pub mark: Arc<dyn MarkDispatcher>,
    /// Weak reference barriers and processing.
    pub weaks: Arc<dyn WeakReferenceProcessor>,
    /// Receiver of finalizer queues.
    pub finalizers: Arc<dyn FinalizerHandoff<H::Object>>,
    /// Pacing notifications.
    pub scheduler: Arc<dyn GcScheduler>,
    /// Stop/resume of mutators.
    pub safepoint: Arc<dyn Safepoint>,
    /// Registered mutators.
    pub threads: Arc<ThreadRegistry>,
}

impl<H: HeapCoordinator> Clone for GcCollaborators<H> {
    fn clone(&self) -> Self {
        Self {
            heap: Arc::clone(&self.heap),
            mark: Arc::clone(&self.mark),
            weaks: Arc::clone(&self.weaks),
            finalizers: Arc::clone(&self.finalizers),
            scheduler: Arc::clone(&self.scheduler),
            safepoint: Arc::clone(&self.safepoint),
            threads: Arc::clone(&self.threads),
        }
    }
}

impl<H: HeapCoordinator> fmt::Debug for GcCollaborators<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcCollaborators")
            .field("threads", &self.threads)
            .finish_non_exhaustive()
    }
}

/// Runs collection cycles.
pub struct CycleOrchestrator<H: HeapCoordinator> {
    state: Arc<EpochState>,
    gc_lock: Arc<GcLock>,
    collaborators: GcCollaborators<H>,
    config: GcConfig,
    metrics: Arc<GlobalMetrics>,
}

impl<H: HeapCoordinator> fmt::Debug for CycleOrchestrator<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CycleOrchestrator")
            .field("state", &self.state)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<H: HeapCoordinator> CycleOrchestrator<H> {
    /// Creates an orchestrator. Nothing runs until [`Self::run`] or
    /// [`Self::perform_full_gc`] is called.
    ///
    /// # Panics
    ///
    /// Panics if the heap was built for a different strategy than
    /// `config.heap_strategy`.
    #[must_use]
    pub fn new(
        state: Arc<EpochState>,
        gc_lock: Arc<GcLock>,
        collaborators: GcCollaborators<H>,
        config: GcConfig,
        metrics: Arc<GlobalMetrics>,
    ) -> Self {
        if let Some(required) = collaborators.heap.required_strategy() {
            assert_eq!(
                required, config.heap_strategy,
                "heap built for {required:?} cannot be collected with {:?}",
                config.heap_strategy
            );
        }
        Self {
            state,
            gc_lock,
            collaborators,
            config,
            metrics,
        }
    }

    /// Epoch state shared with requesters.
    #[must_use]
    pub const fn state(&self) -> &Arc<EpochState> {
        &self.state
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Serves scheduled epochs until shutdown, then releases the mark
    /// workers.
    ///
    /// # Panics
    ///
    /// A panic inside a cycle leaves the collector unusable. The epoch state
    /// is shut down so requesters stop waiting, the mark workers are
    /// released, and the panic continues.
    pub fn run(&self) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            while let Some(epoch) = self.state.wait_scheduled() {
                self.perform_full_gc(epoch);
            }
        }));
        self.collaborators.mark.request_shutdown();
        if let Err(payload) = outcome {
            self.state.shutdown();
            panic::resume_unwind(payload);
        }
    }

    /// Runs one full cycle for `epoch`.
    ///
    /// # Panics
    ///
    /// Panics if `epoch` is not the scheduled epoch of the shared state.
    pub fn perform_full_gc(&self, epoch: Epoch) {
        let _span = trace_gc_cycle(epoch);
        let queue = self.collect_locked(epoch);
        // May start a thread; no lock may be held here.
        self.collaborators.finalizers.schedule(queue, epoch);
    }

    fn collect_locked(&self, epoch: Epoch) -> FinalizerQueue<H::Object> {
        let c = &self.collaborators;
        let _gc_lock = self.gc_lock.lock();
        let handle = GcHandle::create(epoch, Arc::clone(&self.metrics));

        c.mark.begin_marking_epoch(&handle);
        c.safepoint
            .stop_the_world(&handle, "GC stop the world #1: mark");
        c.scheduler.on_gc_start();
        self.state.start(epoch);

        {
            log_phase_start(GcPhase::Mark, epoch);
            let stats = c.mark.run_main_cooperative();
            handle.record_mark(stats);
            c.mark.end_marking_epoch();
            log_phase_end(GcPhase::Mark, epoch, stats.objects_marked, stats.bytes_marked);
        }

        if self.config.concurrent_weak_sweep {
            c.weaks.enable_barriers(epoch);
            c.safepoint.resume_the_world(&handle);
        }

        c.weaks.process_weaks(&handle);

        if self.config.concurrent_weak_sweep {
            c.safepoint
                .stop_the_world(&handle, "GC stop the world #2: prepare heap for sweep");
            c.weaks.disable_barriers();
        }

        {
            log_phase_start(GcPhase::PrepareHeap, epoch);
            let threads = c.threads.lock_for_iter();
            for thread in &threads {
                c.heap.prepare_thread_for_gc(thread);
            }
            log_phase_end(GcPhase::PrepareHeap, epoch, threads.len(), 0);
        }
        c.heap.prepare_for_gc();

        let queue = match self.config.heap_strategy {
            HeapStrategy::Legacy => {
                let mut snapshot = c.heap.lock_for_iter(&handle);
                self.verify_marks(&snapshot, epoch);

                c.safepoint.resume_the_world(&handle);

                snapshot.sweep_extra_objects(&handle);
                let queue = snapshot.sweep(&handle);
                c.heap.compact_object_pool();
                queue
            }
            HeapStrategy::Custom => {
                c.safepoint.resume_the_world(&handle);

                let mut queue = c.heap.sweep_heap(&handle);
                for thread in &c.threads.lock_for_iter() {
                    queue.merge_from(c.heap.extract_thread_finalizer_queue(thread));
                }
                queue.merge_from(c.heap.extract_finalizer_queue());
                queue
            }
        };

        c.scheduler.on_gc_finish(epoch, handle.kept_size_bytes());
        self.state.finish(epoch);
        handle.finalizers_scheduled(queue.len());
        handle.finished();
        log_cycle_finished(epoch, handle.kept_size_bytes(), queue.len());
        queue
    }

    fn verify_marks<G: ObjectGraph + ?Sized>(&self, graph: &G, epoch: Epoch) {
        let mode = self.config.runtime_asserts;
        let Err(violation) = check_mark_correctness(graph, mode) else {
            return;
        };
        let message = violation.to_string();
        log_mark_violation(epoch, &message);
        eprintln!("epoch-gc: mark invariant violated in epoch {epoch}: {message}");
        if mode == RuntimeAssertsMode::Panic {
            std::process::abort();
        }
    }
}

/// The dedicated thread running [`CycleOrchestrator::run`].
#[derive(Debug)]
pub struct MainGcThread {
    thread: GcThread,
}

impl MainGcThread {
    /// Name of the thread.
    pub const NAME: &'static str = "Main GC Thread";

    /// Starts the orchestrator loop.
    #[must_use]
    pub fn start<H: HeapCoordinator>(orchestrator: Arc<CycleOrchestrator<H>>) -> Self {
        Self {
            thread: GcThread::spawn(Self::NAME, move || orchestrator.run()),
        }
    }

    /// Waits for the loop to exit. It exits once the epoch state is shut
    /// down, or after a cycle panicked.
    ///
    /// # Errors
    ///
    /// Returns the panic of a failed cycle.
    pub fn join(self) -> thread::Result<()> {
        self.thread.try_join()
    }
}
