//! # Global GC lock and lock ordering discipline
//!
//! A collection cycle touches several locks owned by different components.
//! To rule out deadlocks they are always acquired in the following order:
//!
//! | Level | Lock                | Holder during a cycle                         |
//! |-------|---------------------|-----------------------------------------------|
//! | 1     | `GcLock`            | main GC thread, whole cycle                   |
//! | 2     | `ThreadRegistry`    | thread add/remove and iteration               |
//! | 3     | `ObjectStore`       | sweep snapshot, publication of thread buffers |
//! | 3     | `ExtraObjectStore`  | sweep snapshot, weak reference creation       |
//! | 4     | `Safepoint`         | stop/resume transitions, mutator polls        |
//! | 5     | `EpochState`        | schedule / start / finish                     |
//!
//! The final resume of a legacy-strategy cycle runs with both heap stores
//! still locked for the sweep snapshot.
//!
//! Locks on the same level may be taken in any order relative to each other.
//! Taking a lock of a lower level while holding a higher one is forbidden.
//!
//! ## Validation
//!
//! In debug builds every acquisition site creates a [`LockGuard`], which
//! records the level on a thread-local stack and panics on a downgrade.
//! Release builds compile the checks away.
//!
//! ```ignore
//! use epoch_gc::gc::sync::{LockGuard, LockOrder};
//!
//! let _gc = LockGuard::new(LockOrder::GcLock);
//! let _registry = LockGuard::new(LockOrder::ThreadRegistry);
//! ```

use std::cell::{Cell, RefCell};

use parking_lot::{Mutex, MutexGuard};

const MAX_LOCK_DEPTH: usize = 16;

struct LockOrderState {
    stack: RefCell<Vec<u8>>,
    is_shutdown: Cell<bool>,
}

thread_local!(static LOCK_ORDER_STATE: LockOrderState = LockOrderState {
    stack: RefCell::new(Vec::with_capacity(MAX_LOCK_DEPTH)),
    is_shutdown: Cell::new(false),
});

/// Lock order tags for validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockOrder {
    /// Global GC lock, serializes whole cycles (level 1).
    GcLock = 1,
    /// Thread registry lock, excludes thread add/remove (level 2).
    ThreadRegistry = 2,
    /// Heap object store iteration lock (level 3).
    ObjectStore = 3,
    /// Heap extra-object store iteration lock (level 3).
    ExtraObjectStore = 4,
    /// Stop-the-world transition lock (level 4).
    Safepoint = 5,
    /// Epoch state lock (level 5).
    EpochState = 6,
}

impl LockOrder {
    /// Unique value of this tag.
    #[must_use]
    pub const fn order_value(self) -> u8 {
        self as u8
    }

    /// Acquisition level of this tag.
    #[must_use]
    pub const fn level(self) -> u8 {
        match self {
            Self::GcLock => 1,
            Self::ThreadRegistry => 2,
            Self::ObjectStore | Self::ExtraObjectStore => 3,
            Self::Safepoint => 4,
            Self::EpochState => 5,
        }
    }
}

/// Records a lock acquisition for order validation for as long as it lives.
#[must_use]
pub struct LockGuard {
    _tag: LockOrder,
}

impl LockGuard {
    /// Validates that `tag` may be acquired now and records it.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if a lock of a higher level is already held by
    /// this thread.
    #[must_use = "LockGuard must be held for the duration of the critical section"]
    pub fn new(tag: LockOrder) -> Self {
        #[cfg(debug_assertions)]
        {
            validate_lock_order(tag, current_max_level());
            push_level(tag);
        }
        Self { _tag: tag }
    }
}

#[cfg(debug_assertions)]
impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = LOCK_ORDER_STATE.try_with(|state| {
            if !state.is_shutdown.get() {
                state.stack.borrow_mut().pop();
            }
        });
    }
}

/// Disables lock order tracking for the current thread.
///
/// Called by GC threads right before they exit, when thread-local storage may
/// already be torn down.
#[inline]
#[allow(clippy::missing_const_for_fn)]
pub fn enter_thread_shutdown() {
    #[cfg(debug_assertions)]
    {
        let _ = LOCK_ORDER_STATE.try_with(|state| {
            state.is_shutdown.set(true);
        });
    }
}

/// Panics in debug builds if `tag` is below `held_level`.
#[inline]
#[cfg(debug_assertions)]
pub fn validate_lock_order(tag: LockOrder, held_level: u8) {
    assert!(
        tag.level() >= held_level,
        "Lock ordering violation: {tag:?} (level {}) cannot be acquired while holding a level {held_level} lock",
        tag.level(),
    );
}

#[inline]
#[cfg(not(debug_assertions))]
#[allow(clippy::missing_const_for_fn)]
pub fn validate_lock_order(_tag: LockOrder, _held_level: u8) {}

#[cfg(debug_assertions)]
fn push_level(tag: LockOrder) {
    let _ = LOCK_ORDER_STATE.try_with(|state| {
        if !state.is_shutdown.get() {
            state.stack.borrow_mut().push(tag.level());
        }
    });
}

/// Highest lock level currently held by this thread, 0 if none.
#[must_use]
pub fn current_max_level() -> u8 {
    LOCK_ORDER_STATE
        .try_with(|state| {
            if state.is_shutdown.get() {
                return 0;
            }
            state.stack.borrow().iter().copied().max().unwrap_or(0)
        })
        .unwrap_or(0)
}

/// The global GC lock.
///
/// Held by the main GC thread for the whole duration of a cycle. Any other
/// agent that must not overlap with a collection (heap dumps, reconfiguration)
/// takes it too.
#[derive(Debug, Default)]
pub struct GcLock {
    mutex: Mutex<()>,
}

/// Guard returned by [`GcLock::lock`].
pub struct GcLockGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    _order: LockGuard,
}

impl GcLock {
    /// Creates an unlocked GC lock.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
        }
    }

    /// Blocks until the lock is acquired.
    pub fn lock(&self) -> GcLockGuard<'_> {
        let order = LockGuard::new(LockOrder::GcLock);
        GcLockGuard {
            _guard: self.mutex.lock(),
            _order: order,
        }
    }

    /// Acquires the lock if nobody holds it.
    pub fn try_lock(&self) -> Option<GcLockGuard<'_>> {
        let order = LockGuard::new(LockOrder::GcLock);
        self.mutex.try_lock().map(|guard| GcLockGuard {
            _guard: guard,
            _order: order,
        })
    }

    /// Whether some thread currently holds the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.mutex.is_locked()
    }
}
