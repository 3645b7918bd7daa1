//! Shared mark worklist for parallel marking.
//!
//! All participants of a marking epoch share one [`MarkWorklist`]. Each
//! participant drains through its own [`LocalWorklist`]: pushes go to a
//! thread-local LIFO deque for cache locality, and once the local deque grows
//! past [`SHARE_THRESHOLD`] half of it is moved to the shared injector where
//! idle participants can pick it up.
//!
//! # Termination
//!
//! `pending` counts items that were pushed but whose processing has not
//! finished yet. An item is only retired after the fields it discovered have
//! been pushed, so `pending == 0` means the transitive closure is complete.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::deque::{Injector, Steal, Worker};
use crossbeam::utils::Backoff;

/// Local deque length above which work is shared.
pub const SHARE_THRESHOLD: usize = 64;

/// Worklist shared by all participants of a marking epoch.
pub struct MarkWorklist<T> {
    injector: Injector<T>,
    pending: AtomicUsize,
}

impl<T> Default for MarkWorklist<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MarkWorklist<T> {
    /// Creates an empty worklist.
    #[must_use]
    pub fn new() -> Self {
        Self {
            injector: Injector::new(),
            pending: AtomicUsize::new(0),
        }
    }

    /// Publishes an item for any participant to process.
    pub fn push(&self, item: T) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.injector.push(item);
    }

    /// Items pushed and not yet retired.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether every pushed item has been processed.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.pending() == 0
    }

    /// Creates a participant-local view.
    #[must_use]
    pub fn local(&self) -> LocalWorklist<'_, T> {
        LocalWorklist {
            shared: self,
            local: Worker::new_lifo(),
        }
    }

    fn retire(&self) {
        let prev = self.pending.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "mark worklist retired more items than pushed");
    }
}

/// A participant's handle on a [`MarkWorklist`].
pub struct LocalWorklist<'a, T> {
    shared: &'a MarkWorklist<T>,
    local: Worker<T>,
}

impl<T> LocalWorklist<'_, T> {
    /// Pushes newly discovered work.
    pub fn push(&mut self, item: T) {
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        self.local.push(item);
        if self.local.len() > SHARE_THRESHOLD {
            self.share();
        }
    }

    fn share(&self) {
        for _ in 0..self.local.len() / 2 {
            match self.local.pop() {
                Some(item) => self.shared.injector.push(item),
                None => break,
            }
        }
    }

    fn pop(&self) -> Option<T> {
        self.local.pop().or_else(|| loop {
            match self.shared.injector.steal_batch_and_pop(&self.local) {
                Steal::Success(item) => break Some(item),
                Steal::Empty => break None,
                Steal::Retry => {}
            }
        })
    }

    /// Processes items until the whole worklist is drained.
    ///
    /// `process` receives each item together with this worklist so it can push
    /// the item's successors. Returns the number of items this participant
    /// processed.
    pub fn drain(&mut self, mut process: impl FnMut(T, &mut Self)) -> usize {
        let backoff = Backoff::new();
        let mut processed = 0;
        loop {
            if let Some(item) = self.pop() {
                process(item, self);
                self.shared.retire();
                processed += 1;
                backoff.reset();
                continue;
            }
            if self.shared.is_drained() {
                return processed;
            }
            backoff.snooze();
        }
    }
}
