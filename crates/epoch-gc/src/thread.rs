//! Mutator thread registry and cooperative stop-the-world.
//!
//! Every thread that touches the managed heap registers itself and gets a
//! [`MutatorThread`] entry. Mutators call [`MutatorThread::safepoint`]
//! periodically; while a pause is requested the call parks. Code that does not
//! touch the heap for a long time runs inside [`MutatorThread::in_native`],
//! which counts as stopped.
//!
//! The registry implements [`Safepoint`], the primitive the main GC thread
//! uses to stop and resume the world.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use epoch_gc::ThreadRegistry;
//!
//! let registry = Arc::new(ThreadRegistry::new());
//! let thread = registry.register(Some("worker-1"));
//! thread.safepoint();
//! assert_eq!(registry.len(), 1);
//! registry.unregister(&thread);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::gc::sync::{LockGuard, LockOrder};
use crate::metrics::GcHandle;

/// The low-level mechanism that halts and releases all mutators.
pub trait Safepoint: Send + Sync {
    /// Blocks until every mutator is halted at a safepoint.
    fn stop_the_world(&self, handle: &GcHandle, reason: &'static str);

    /// Releases every mutator halted by [`Safepoint::stop_the_world`].
    fn resume_the_world(&self, handle: &GcHandle);
}

/// Execution state of a mutator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MutatorState {
    /// Running managed code; must reach a safepoint before a pause begins.
    Runnable = 0,
    /// Outside managed code; treated as stopped.
    Native = 1,
    /// Parked at a safepoint.
    Suspended = 2,
}

impl MutatorState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Runnable,
            1 => Self::Native,
            _ => Self::Suspended,
        }
    }

    /// Whether a pause may proceed with the thread in this state.
    #[must_use]
    pub const fn is_stopped(self) -> bool {
        !matches!(self, Self::Runnable)
    }
}

/// Per-mutator registry entry.
pub struct MutatorThread {
    id: u64,
    name: Option<String>,
    state: AtomicU8,
    stw: Arc<StwControl>,
}

impl fmt::Debug for MutatorThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutatorThread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl MutatorThread {
    /// Registry-unique id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Optional name given at registration.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Current execution state.
    #[must_use]
    pub fn state(&self) -> MutatorState {
        MutatorState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Parks the calling thread while a pause is in progress.
    ///
    /// Must be called by the thread this entry belongs to.
    pub fn safepoint(&self) {
        if !self.stw.requested.load(Ordering::Acquire) {
            return;
        }
        let (_order, mut stw) = self.stw.enter();
        if !stw.requested {
            return;
        }
        self.transition(&mut stw, MutatorState::Suspended);
        while stw.requested {
            self.stw.changed.wait(&mut stw);
        }
        self.transition(&mut stw, MutatorState::Runnable);
    }

    /// Runs `f` in native state. A pause may begin and end while `f` runs;
    /// on return the thread waits out any pause still in progress.
    pub fn in_native<R>(&self, f: impl FnOnce() -> R) -> R {
        self.enter_native();
        let result = f();
        self.leave_native();
        result
    }

    fn enter_native(&self) {
        let (_order, mut stw) = self.stw.enter();
        self.transition(&mut stw, MutatorState::Native);
    }

    fn leave_native(&self) {
        let (_order, mut stw) = self.stw.enter();
        while stw.requested {
            self.stw.changed.wait(&mut stw);
        }
        self.transition(&mut stw, MutatorState::Runnable);
    }

    fn transition(&self, stw: &mut StwState, state: MutatorState) {
        self.state.store(state as u8, Ordering::Release);
        stw.transitions = stw.transitions.wrapping_add(1);
        self.stw.changed.notify_all();
    }
}

#[derive(Debug, Default)]
struct StwState {
    requested: bool,
    transitions: u64,
}

/// Stop-the-world control shared by the registry and its entries.
///
/// Every state change of an entry happens under `lock` and bumps
/// `transitions`. `requested` mirrors the flag in the mutex for the lock-free
/// fast path in [`MutatorThread::safepoint`].
#[derive(Debug, Default)]
struct StwControl {
    lock: Mutex<StwState>,
    requested: AtomicBool,
    changed: Condvar,
}

impl StwControl {
    fn enter(&self) -> (LockGuard, MutexGuard<'_, StwState>) {
        let order = LockGuard::new(LockOrder::Safepoint);
        (order, self.lock.lock())
    }
}

/// Registry of all mutator threads.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: Mutex<Vec<Arc<MutatorThread>>>,
    next_id: AtomicU64,
    stw: Arc<StwControl>,
}

/// Registry iteration guard; thread add/remove blocks while it lives.
pub struct ThreadRegistryIter<'a> {
    threads: MutexGuard<'a, Vec<Arc<MutatorThread>>>,
    _order: LockGuard,
}

impl<'a> ThreadRegistryIter<'a> {
    /// Iterates over all registered threads.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<MutatorThread>> {
        self.threads.iter()
    }

    /// Number of registered threads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// Whether no thread is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

impl<'a, 'b> IntoIterator for &'b ThreadRegistryIter<'a> {
    type Item = &'b Arc<MutatorThread>;
    type IntoIter = std::slice::Iter<'b, Arc<MutatorThread>>;

    fn into_iter(self) -> Self::IntoIter {
        self.threads.iter()
    }
}

impl ThreadRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the calling thread as a mutator.
    ///
    /// Blocks while a pause is in progress, so a new mutator never runs
    /// inside a stop-the-world window.
    pub fn register(&self, name: Option<&str>) -> Arc<MutatorThread> {
        let thread = Arc::new(MutatorThread {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            name: name.map(str::to_owned),
            state: AtomicU8::new(MutatorState::Native as u8),
            stw: Arc::clone(&self.stw),
        });
        {
            let _order = LockGuard::new(LockOrder::ThreadRegistry);
            self.threads.lock().push(Arc::clone(&thread));
        }
        thread.leave_native();
        thread
    }

    /// Removes `thread` from the registry.
    pub fn unregister(&self, thread: &MutatorThread) {
        thread.enter_native();
        let _order = LockGuard::new(LockOrder::ThreadRegistry);
        self.threads.lock().retain(|t| t.id != thread.id);
    }

    /// Locks the registry for iteration.
    pub fn lock_for_iter(&self) -> ThreadRegistryIter<'_> {
        let order = LockGuard::new(LockOrder::ThreadRegistry);
        ThreadRegistryIter {
            threads: self.threads.lock(),
            _order: order,
        }
    }

    /// Number of registered threads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    /// Whether no thread is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.threads.lock().is_empty()
    }

    /// Whether a pause is currently requested or in effect.
    #[must_use]
    pub fn is_world_stopped(&self) -> bool {
        self.stw.requested.load(Ordering::Acquire)
    }

    fn all_stopped(&self) -> bool {
        self.lock_for_iter()
            .iter()
            .all(|t| t.state().is_stopped())
    }
}

impl Safepoint for ThreadRegistry {
    fn stop_the_world(&self, handle: &GcHandle, reason: &'static str) {
        crate::tracing::log_stop_the_world(handle.epoch(), reason);
        handle.suspension_requested();
        {
            let (_order, mut stw) = self.stw.enter();
            assert!(!stw.requested, "stop the world requested while the world is stopped");
            stw.requested = true;
            self.stw.requested.store(true, Ordering::Release);
        }
        loop {
            let seen = self.stw.enter().1.transitions;
            if self.all_stopped() {
                return;
            }
            let (_order, mut stw) = self.stw.enter();
            while stw.transitions == seen {
                self.stw.changed.wait(&mut stw);
            }
        }
    }

    fn resume_the_world(&self, handle: &GcHandle) {
        {
            let (_order, mut stw) = self.stw.enter();
            assert!(stw.requested, "resume the world requested while the world runs");
            stw.requested = false;
            self.stw.requested.store(false, Ordering::Release);
            self.stw.changed.notify_all();
        }
        let pause = handle.threads_resumed();
        crate::tracing::log_resume_the_world(handle.epoch(), pause);
    }
}
