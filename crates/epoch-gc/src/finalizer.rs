//! Finalizer handoff.
//!
//! At the end of every cycle the orchestrator hands the finalizer queue to a
//! [`FinalizerHandoff`]. [`FinalizerProcessor`] is the reference
//! implementation: it runs a callback for every queued object on a dedicated
//! thread that is spawned on first use.

use std::fmt;
use std::panic;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Sender};
use parking_lot::{Condvar, Mutex};

use crate::epoch::Epoch;
use crate::gc::worker::GcThread;
use crate::heap::FinalizerQueue;
use crate::tracing::{log_phase_end, log_phase_start, GcPhase};

/// Receiver of the finalizer queue produced by a cycle.
pub trait FinalizerHandoff<T>: Send + Sync {
    /// Takes ownership of `queue` and arranges for its finalization.
    ///
    /// Called without any GC lock held; implementations may start threads.
    fn schedule(&self, queue: FinalizerQueue<T>, epoch: Epoch);
}

type Finalize<T> = dyn Fn(T) + Send + Sync;

#[derive(Debug)]
struct Progress {
    finalized: Mutex<(Epoch, bool)>,
    changed: Condvar,
    objects: AtomicUsize,
}

impl Progress {
    fn epoch_done(&self, epoch: Epoch) {
        let mut state = self.finalized.lock();
        if epoch > state.0 {
            state.0 = epoch;
        }
        self.changed.notify_all();
    }

    fn stopped(&self) {
        self.finalized.lock().1 = true;
        self.changed.notify_all();
    }
}

struct Worker<T> {
    sender: Sender<(FinalizerQueue<T>, Epoch)>,
    thread: GcThread,
}

/// Runs finalizers on a lazily started background thread.
pub struct FinalizerProcessor<T: Send + 'static> {
    finalize: Arc<Finalize<T>>,
    worker: Mutex<Option<Worker<T>>>,
    progress: Arc<Progress>,
}

impl<T: Send + 'static> fmt::Debug for FinalizerProcessor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinalizerProcessor")
            .field("running", &self.is_running())
            .field("progress", &self.progress)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> FinalizerProcessor<T> {
    /// Creates a processor running `finalize` for every finalizable object.
    pub fn new(finalize: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self {
            finalize: Arc::new(finalize),
            worker: Mutex::new(None),
            progress: Arc::new(Progress {
                finalized: Mutex::new((Epoch::ZERO, false)),
                changed: Condvar::new(),
                objects: AtomicUsize::new(0),
            }),
        }
    }

    /// Whether the finalizer thread has been started and not stopped.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Most recent epoch whose queue has been fully finalized.
    #[must_use]
    pub fn finalized_epoch(&self) -> Epoch {
        self.progress.finalized.lock().0
    }

    /// Total number of objects finalized so far.
    #[must_use]
    pub fn finalized_objects(&self) -> usize {
        self.progress.objects.load(Ordering::Acquire)
    }

    /// Blocks until the queue of `epoch` is finalized. Returns `false` if the
    /// processor was stopped first.
    pub fn wait_finalized(&self, epoch: Epoch) -> bool {
        let mut state = self.progress.finalized.lock();
        while state.0 < epoch && !state.1 {
            self.progress.changed.wait(&mut state);
        }
        state.0 >= epoch
    }

    /// Finalizes everything already scheduled, then joins the thread.
    ///
    /// # Panics
    ///
    /// Resumes the panic of a finalizer callback, after waiters have been
    /// released.
    pub fn stop(&self) {
        let worker = self.worker.lock().take();
        let outcome = worker.map_or(Ok(()), |Worker { sender, thread }| {
            drop(sender);
            thread.try_join()
        });
        self.progress.stopped();
        if let Err(payload) = outcome {
            if !thread::panicking() {
                panic::resume_unwind(payload);
            }
        }
    }

    fn start(&self) -> Worker<T> {
        let (sender, receiver) = channel::unbounded::<(FinalizerQueue<T>, Epoch)>();
        let finalize = Arc::clone(&self.finalize);
        let progress = Arc::clone(&self.progress);
        let thread = GcThread::spawn("GC finalizer processor", move || {
            for (queue, epoch) in receiver {
                log_phase_start(GcPhase::Finalization, epoch);
                let count = queue.len();
                for object in queue {
                    finalize(object);
                }
                progress.objects.fetch_add(count, Ordering::AcqRel);
                progress.epoch_done(epoch);
                log_phase_end(GcPhase::Finalization, epoch, count, 0);
            }
        });
        Worker { sender, thread }
    }
}

impl<T: Send + 'static> FinalizerHandoff<T> for FinalizerProcessor<T> {
    fn schedule(&self, queue: FinalizerQueue<T>, epoch: Epoch) {
        let mut worker = self.worker.lock();
        if worker.is_none() {
            if queue.is_empty() {
                drop(worker);
                self.progress.epoch_done(epoch);
                return;
            }
            *worker = Some(self.start());
        }
        if let Some(worker) = worker.as_ref() {
            if worker.sender.send((queue, epoch)).is_err() {
                // The thread died inside a finalizer callback.
                self.progress.epoch_done(epoch);
            }
        }
    }
}

impl<T: Send + 'static> Drop for FinalizerProcessor<T> {
    fn drop(&mut self) {
        self.stop();
    }
}
