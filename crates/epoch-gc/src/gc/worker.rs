//! GC-owned threads.
//!
//! [`GcThread`] is a named thread that starts running its body on
//! construction and is joined when dropped, so teardown is deterministic on
//! every exit path. A panic on a GC thread is re-raised on the joining
//! thread. [`AuxiliaryGcThreads`] is the pool of mark workers built from it.

use std::fmt;
use std::panic;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::marker::MarkDispatcher;
use super::sync::enter_thread_shutdown;
use crate::tracing::log_thread_event;

/// A named GC thread, joined on drop.
pub struct GcThread {
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl fmt::Debug for GcThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcThread")
            .field("name", &self.name)
            .field("running", &self.handle.is_some())
            .finish()
    }
}

impl GcThread {
    /// Spawns `body` on a new thread called `name`.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to create the thread.
    pub fn spawn(name: impl Into<String>, body: impl FnOnce() + Send + 'static) -> Self {
        let name = name.into();
        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                log_thread_event(&thread_name, "started");
                body();
                log_thread_event(&thread_name, "finished");
                enter_thread_shutdown();
            })
            .expect("failed to spawn GC thread");
        Self {
            name,
            handle: Some(handle),
        }
    }

    /// Thread name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocks until the thread exits.
    ///
    /// # Panics
    ///
    /// Resumes the thread's panic, if it panicked.
    pub fn join(mut self) {
        if let Err(payload) = self.join_inner() {
            panic::resume_unwind(payload);
        }
    }

    /// Blocks until the thread exits and returns its panic, if any.
    pub fn try_join(mut self) -> thread::Result<()> {
        self.join_inner()
    }

    fn join_inner(&mut self) -> thread::Result<()> {
        self.handle.take().map_or(Ok(()), JoinHandle::join)
    }
}

impl Drop for GcThread {
    fn drop(&mut self) {
        if let Err(payload) = self.join_inner() {
            if !thread::panicking() {
                panic::resume_unwind(payload);
            }
        }
    }
}

/// Pool of auxiliary mark workers.
///
/// Each worker loops on [`MarkDispatcher::run_auxiliary_unit`] until the
/// dispatcher reports shutdown.
pub struct AuxiliaryGcThreads {
    mark: Arc<dyn MarkDispatcher>,
    single_threaded_mark: bool,
    threads: Vec<GcThread>,
}

impl fmt::Debug for AuxiliaryGcThreads {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuxiliaryGcThreads")
            .field("single_threaded_mark", &self.single_threaded_mark)
            .field("threads", &self.threads)
            .finish_non_exhaustive()
    }
}

impl AuxiliaryGcThreads {
    /// Creates the pool and starts `count` workers.
    #[must_use]
    pub fn new(mark: Arc<dyn MarkDispatcher>, count: usize, single_threaded_mark: bool) -> Self {
        let mut pool = Self {
            mark,
            single_threaded_mark,
            threads: Vec::with_capacity(count),
        };
        pool.start_threads(count);
        pool
    }

    /// Spawns `count` workers.
    ///
    /// # Panics
    ///
    /// Panics if the pool already has workers, or if `count > 0` while
    /// single-threaded mark is configured.
    pub fn start_threads(&mut self, count: usize) {
        assert!(self.threads.is_empty(), "auxiliary GC threads already started");
        assert!(
            count == 0 || !self.single_threaded_mark,
            "auxiliary GC threads must not run in single-threaded mark mode"
        );
        for _ in 0..count {
            let mark = Arc::clone(&self.mark);
            self.threads.push(GcThread::spawn("Auxiliary GC thread", move || {
                while !mark.shutdown_requested() {
                    mark.run_auxiliary_unit();
                }
            }));
        }
    }

    /// Joins every worker. Workers exit once the dispatcher has been asked to
    /// shut down, so this blocks until that happens.
    pub fn stop_threads(&mut self) {
        self.threads.clear();
    }

    /// Number of running workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// Whether the pool has no workers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}
