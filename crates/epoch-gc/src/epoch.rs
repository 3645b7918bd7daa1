//! Epoch bookkeeping shared between GC requesters and the main GC thread.
//!
//! Every collection is identified by an [`Epoch`]. Requesters call
//! [`EpochState::schedule`], the main GC thread blocks in
//! [`EpochState::wait_scheduled`] and reports progress with
//! [`EpochState::start`] and [`EpochState::finish`]. Synchronous collections
//! park in [`EpochState::wait_epoch_finished`].
//!
//! # Shutdown
//!
//! [`EpochState::shutdown`] is terminal. Once set, `wait_scheduled` returns
//! `None` even if a request is pending: shutdown always wins over a
//! concurrently arriving schedule request.

use std::fmt;

use parking_lot::{Condvar, Mutex};

use crate::gc::sync::{LockGuard, LockOrder};

/// Identifier of one garbage collection cycle.
///
/// Epochs are handed out in strictly increasing order starting at 1 and
/// correlate scheduling, marking, sweeping and finalization of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(pub u64);

impl Epoch {
    /// The epoch preceding every real cycle. Never scheduled.
    pub const ZERO: Self = Self(0);

    /// Returns the epoch following `self`.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Raw numeric value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
struct Inner {
    scheduled: Epoch,
    started: Epoch,
    finished: Epoch,
    shutdown: bool,
}

impl Inner {
    const fn has_pending_request(&self) -> bool {
        self.scheduled.0 > self.started.0
    }
}

/// Shared handoff point between GC requesters and the main GC thread.
///
/// Created once per collector and observed by both sides; all access goes
/// through the operations below which serialize on an internal lock.
#[derive(Debug)]
pub struct EpochState {
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl Default for EpochState {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochState {
    /// Creates a state with no scheduled, started or finished epoch.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                scheduled: Epoch::ZERO,
                started: Epoch::ZERO,
                finished: Epoch::ZERO,
                shutdown: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Requests a collection and returns the epoch that will serve it.
    ///
    /// A request that arrives while an earlier request is still waiting to be
    /// started is coalesced with it and returns the same epoch. Returns `None`
    /// once the state has been shut down.
    pub fn schedule(&self) -> Option<Epoch> {
        let _order = LockGuard::new(LockOrder::EpochState);
        let mut inner = self.inner.lock();
        if inner.shutdown {
            return None;
        }
        if !inner.has_pending_request() {
            inner.scheduled = inner.started.next();
            self.changed.notify_all();
        }
        Some(inner.scheduled)
    }

    /// Blocks until a new epoch is requested or shutdown is signaled.
    ///
    /// Returns `None` on shutdown. Shutdown dominates a pending request.
    pub fn wait_scheduled(&self) -> Option<Epoch> {
        let _order = LockGuard::new(LockOrder::EpochState);
        let mut inner = self.inner.lock();
        while !inner.shutdown && !inner.has_pending_request() {
            self.changed.wait(&mut inner);
        }
        if inner.shutdown {
            None
        } else {
            Some(inner.scheduled)
        }
    }

    /// Records `epoch` as actively running.
    ///
    /// # Panics
    ///
    /// Panics if `epoch` is not the currently requested epoch.
    pub fn start(&self, epoch: Epoch) {
        let _order = LockGuard::new(LockOrder::EpochState);
        let mut inner = self.inner.lock();
        assert!(
            epoch == inner.scheduled && epoch > inner.finished,
            "epoch {epoch} started out of order (scheduled {}, finished {})",
            inner.scheduled,
            inner.finished
        );
        inner.started = epoch;
        self.changed.notify_all();
    }

    /// Marks `epoch` complete and wakes threads waiting for it.
    ///
    /// # Panics
    ///
    /// Panics if `epoch` was not started first.
    pub fn finish(&self, epoch: Epoch) {
        let _order = LockGuard::new(LockOrder::EpochState);
        let mut inner = self.inner.lock();
        assert!(
            epoch == inner.started && epoch > inner.finished,
            "epoch {epoch} finished without being started (started {}, finished {})",
            inner.started,
            inner.finished
        );
        inner.finished = epoch;
        self.changed.notify_all();
    }

    /// Signals shutdown. Terminal; wakes every waiter.
    pub fn shutdown(&self) {
        let _order = LockGuard::new(LockOrder::EpochState);
        let mut inner = self.inner.lock();
        inner.shutdown = true;
        self.changed.notify_all();
    }

    /// Blocks until `epoch` has started. Returns `false` if shutdown came first.
    pub fn wait_epoch_started(&self, epoch: Epoch) -> bool {
        let _order = LockGuard::new(LockOrder::EpochState);
        let mut inner = self.inner.lock();
        while inner.started < epoch && !inner.shutdown {
            self.changed.wait(&mut inner);
        }
        inner.started >= epoch
    }

    /// Blocks until `epoch` has finished. Returns `false` if shutdown came first.
    pub fn wait_epoch_finished(&self, epoch: Epoch) -> bool {
        let _order = LockGuard::new(LockOrder::EpochState);
        let mut inner = self.inner.lock();
        while inner.finished < epoch && !inner.shutdown {
            self.changed.wait(&mut inner);
        }
        inner.finished >= epoch
    }

    /// Most recently requested epoch, if any.
    #[must_use]
    pub fn scheduled(&self) -> Option<Epoch> {
        Some(self.inner.lock().scheduled).filter(|e| *e > Epoch::ZERO)
    }

    /// Running or most recently started epoch, if any.
    #[must_use]
    pub fn started(&self) -> Option<Epoch> {
        Some(self.inner.lock().started).filter(|e| *e > Epoch::ZERO)
    }

    /// Most recently finished epoch, if any.
    #[must_use]
    pub fn finished(&self) -> Option<Epoch> {
        Some(self.inner.lock().finished).filter(|e| *e > Epoch::ZERO)
    }

    /// Whether shutdown has been signaled.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.lock().shutdown
    }
}
