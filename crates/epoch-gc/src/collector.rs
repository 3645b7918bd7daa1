//! The collector facade.
//!
//! [`GarbageCollector`] owns the epoch state, the GC lock, the metrics sink
//! and the GC threads, and wires them to a set of [`GcCollaborators`].
//! Mutator threads take part through a [`Mutator`] guard.

use std::fmt;
use std::marker::PhantomData;
use std::panic;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::config::{GcConfig, HeapStrategy};
use crate::epoch::{Epoch, EpochState};
use crate::finalizer::{FinalizerHandoff, FinalizerProcessor};
use crate::gc::marker::ParallelMark;
use crate::gc::sync::GcLock;
use crate::gc::worker::AuxiliaryGcThreads;
use crate::gc::{CycleOrchestrator, GcCollaborators, MainGcThread};
use crate::heap::{FinalizableObject, HeapCoordinator, ManagedHeap, ObjectId, WeakRef};
use crate::metrics::GlobalMetrics;
use crate::scheduler::ManualScheduler;
use crate::thread::{MutatorThread, ThreadRegistry};

/// Schedules a collection and waits for it. Returns `None` on shutdown.
fn request_and_wait(state: &EpochState) -> Option<Epoch> {
    let epoch = state.schedule()?;
    state.wait_epoch_finished(epoch).then_some(epoch)
}

/// A running collector.
///
/// Creating one starts the main GC thread and the auxiliary mark workers.
/// Dropping it shuts them down.
pub struct GarbageCollector<H: HeapCoordinator> {
    state: Arc<EpochState>,
    metrics: Arc<GlobalMetrics>,
    collaborators: GcCollaborators<H>,
    config: GcConfig,
    finalizer: Option<Arc<FinalizerProcessor<H::Object>>>,
    main: Mutex<Option<MainGcThread>>,
    auxiliary: Mutex<AuxiliaryGcThreads>,
}

impl<H: HeapCoordinator> fmt::Debug for GarbageCollector<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("state", &self.state)
            .field("config", &self.config)
            .field("auxiliary", &*self.auxiliary.lock())
            .finish_non_exhaustive()
    }
}

impl<H: HeapCoordinator> GarbageCollector<H> {
    /// Starts a collector driving `collaborators`.
    ///
    /// # Panics
    ///
    /// Panics if the heap was built for a different strategy than
    /// `config.heap_strategy`.
    #[must_use]
    pub fn new(config: GcConfig, collaborators: GcCollaborators<H>) -> Self {
        let state = Arc::new(EpochState::new());
        let metrics = Arc::new(GlobalMetrics::new());
        let orchestrator = Arc::new(CycleOrchestrator::new(
            Arc::clone(&state),
            Arc::new(GcLock::new()),
            collaborators.clone(),
            config,
            Arc::clone(&metrics),
        ));
        let auxiliary = AuxiliaryGcThreads::new(
            Arc::clone(&collaborators.mark),
            config.effective_auxiliary_workers(),
            config.single_threaded_mark,
        );
        let main = MainGcThread::start(orchestrator);
        Self {
            state,
            metrics,
            collaborators,
            config,
            finalizer: None,
            main: Mutex::new(Some(main)),
            auxiliary: Mutex::new(auxiliary),
        }
    }

    /// Requests a collection without waiting for it.
    ///
    /// Requests made before the pending one starts are coalesced into it.
    /// Returns `None` after shutdown.
    pub fn schedule(&self) -> Option<Epoch> {
        self.state.schedule()
    }

    /// Requests a collection and waits until it has finished.
    ///
    /// Must not be called from a thread holding a [`Mutator`] in runnable
    /// state; use [`Mutator::collect`] there. Returns `None` if the
    /// collector shut down first, or if a cycle panicked.
    pub fn collect(&self) -> Option<Epoch> {
        request_and_wait(&self.state)
    }

    /// Blocks until `epoch` has finished. Returns `false` on shutdown.
    pub fn wait_epoch_finished(&self, epoch: Epoch) -> bool {
        self.state.wait_epoch_finished(epoch)
    }

    /// Blocks until `epoch` has finished and, for a collector built by
    /// [`GarbageCollector::managed`], until its finalizer queue has run.
    /// Cycle metrics are published by then. Returns `false` on shutdown.
    pub fn wait_finalized(&self, epoch: Epoch) -> bool {
        self.state.wait_epoch_finished(epoch)
            && self
                .finalizer
                .as_ref()
                .is_none_or(|processor| processor.wait_finalized(epoch))
    }

    /// The finalizer processor started by [`GarbageCollector::managed`].
    #[must_use]
    pub const fn finalizer_processor(&self) -> Option<&Arc<FinalizerProcessor<H::Object>>> {
        self.finalizer.as_ref()
    }

    /// Registers the calling thread as a mutator.
    pub fn attach_mutator(&self) -> Mutator<H> {
        self.attach_named_mutator(None)
    }

    /// Registers the calling thread as a mutator called `name`.
    pub fn attach_named_mutator(&self, name: Option<&str>) -> Mutator<H> {
        Mutator {
            thread: self.collaborators.threads.register(name),
            heap: Arc::clone(&self.collaborators.heap),
            threads: Arc::clone(&self.collaborators.threads),
            state: Arc::clone(&self.state),
            _not_send: PhantomData,
        }
    }

    /// Cumulative collection metrics.
    #[must_use]
    pub const fn metrics(&self) -> &Arc<GlobalMetrics> {
        &self.metrics
    }

    /// Epoch bookkeeping.
    #[must_use]
    pub const fn state(&self) -> &Arc<EpochState> {
        &self.state
    }

    /// Configuration the collector was started with.
    #[must_use]
    pub const fn config(&self) -> &GcConfig {
        &self.config
    }

    /// The heap being collected.
    #[must_use]
    pub const fn heap(&self) -> &Arc<H> {
        &self.collaborators.heap
    }

    /// Registered mutator threads.
    #[must_use]
    pub const fn threads(&self) -> &Arc<ThreadRegistry> {
        &self.collaborators.threads
    }

    /// Stops the collector and joins its threads. A cycle in progress is
    /// completed first; pending requests are dropped.
    ///
    /// Idempotent. The same restriction as [`Self::collect`] applies.
    ///
    /// # Panics
    ///
    /// Resumes the panic of a cycle that failed on the main GC thread, once
    /// every GC thread has been joined.
    pub fn shutdown(&self) {
        self.state.shutdown();
        let main = self.main.lock().take();
        let outcome = main.map_or(Ok(()), MainGcThread::join);
        self.collaborators.mark.request_shutdown();
        self.auxiliary.lock().stop_threads();
        if let Err(payload) = outcome {
            if !thread::panicking() {
                panic::resume_unwind(payload);
            }
        }
    }
}

impl GarbageCollector<ManagedHeap> {
    /// Starts a collector over a fresh [`ManagedHeap`] with the reference
    /// collaborators. `finalize` runs on the finalizer thread for every
    /// reclaimed finalizable object.
    #[must_use]
    pub fn managed(
        config: GcConfig,
        finalize: impl Fn(FinalizableObject) + Send + Sync + 'static,
    ) -> Self {
        let finalizers = Arc::new(FinalizerProcessor::new(finalize));
        let mut gc = Self::new(
            config,
            GcCollaborators::managed(config.heap_strategy, finalizers.clone()),
        );
        gc.finalizer = Some(finalizers);
        gc
    }
}

impl<H: HeapCoordinator> Drop for GarbageCollector<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl GcCollaborators<ManagedHeap> {
    /// Wires a fresh [`ManagedHeap`] to [`ParallelMark`], a new
    /// [`ThreadRegistry`] and a [`ManualScheduler`].
    #[must_use]
    pub fn managed(
        strategy: HeapStrategy,
        finalizers: Arc<dyn FinalizerHandoff<FinalizableObject>>,
    ) -> Self {
        let heap = Arc::new(ManagedHeap::new(strategy));
        let threads = Arc::new(ThreadRegistry::new());
        Self {
            mark: Arc::new(ParallelMark::new(Arc::clone(&heap))),
            weaks: heap.clone(),
            finalizers,
            scheduler: Arc::new(ManualScheduler::new()),
            safepoint: threads.clone(),
            threads,
            heap,
        }
    }
}

// ============================================================================
// Mutator
// ============================================================================

/// Registration of the current thread as a mutator.
///
/// While a `Mutator` is alive the thread must reach [`Mutator::safepoint`]
/// regularly or run blocking code inside [`Mutator::in_native`], otherwise
/// every pause waits for it. Dropping the guard hands the thread's
/// allocation state to the heap and unregisters it.
pub struct Mutator<H: HeapCoordinator> {
    thread: Arc<MutatorThread>,
    heap: Arc<H>,
    threads: Arc<ThreadRegistry>,
    state: Arc<EpochState>,
    _not_send: PhantomData<*const ()>,
}

impl<H: HeapCoordinator> fmt::Debug for Mutator<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutator")
            .field("thread", &self.thread)
            .finish_non_exhaustive()
    }
}

impl<H: HeapCoordinator> Mutator<H> {
    /// Registry entry of this thread.
    #[must_use]
    pub const fn thread(&self) -> &Arc<MutatorThread> {
        &self.thread
    }

    /// The heap being collected.
    #[must_use]
    pub const fn heap(&self) -> &Arc<H> {
        &self.heap
    }

    /// Parks while a pause is in progress.
    pub fn safepoint(&self) {
        self.thread.safepoint();
    }

    /// Runs `f` without blocking pauses. `f` must not touch the heap.
    pub fn in_native<R>(&self, f: impl FnOnce() -> R) -> R {
        self.thread.in_native(f)
    }

    /// Requests a collection and waits for it in native state. Returns
    /// `None` if the collector shut down first.
    pub fn collect(&self) -> Option<Epoch> {
        self.thread.in_native(|| request_and_wait(&self.state))
    }
}

impl Mutator<ManagedHeap> {
    /// Allocates an object from this thread's buffer.
    pub fn allocate(&self, size: usize, finalizable: bool) -> ObjectId {
        self.heap.allocate(&self.thread, size, finalizable)
    }

    /// Allocates an object and registers it as a root.
    pub fn allocate_root(&self, size: usize, finalizable: bool) -> ObjectId {
        let id = self.allocate(size, finalizable);
        self.heap.add_root(id);
        id
    }

    /// Reads a weak reference.
    #[must_use]
    pub fn weak_get(&self, weak: &WeakRef) -> Option<ObjectId> {
        self.heap.weak_get(weak)
    }
}

impl<H: HeapCoordinator> Drop for Mutator<H> {
    fn drop(&mut self) {
        self.heap.detach_thread(&self.thread);
        self.threads.unregister(&self.thread);
    }
}
