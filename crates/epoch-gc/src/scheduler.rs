//! Scheduler notifications.
//!
//! The heuristic that decides when to collect lives outside this crate. It
//! only learns about cycles starting and finishing through [`GcScheduler`].

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::epoch::Epoch;

/// Pacing hooks called by the orchestrator.
pub trait GcScheduler: Send + Sync {
    /// A cycle started; the world is stopped.
    fn on_gc_start(&self);

    /// A cycle finished sweeping with `kept_bytes` live bytes retained.
    fn on_gc_finish(&self, epoch: Epoch, kept_bytes: usize);
}

/// Scheduler that never triggers on its own and records what it is told.
#[derive(Debug, Default)]
pub struct ManualScheduler {
    started: AtomicUsize,
    finished: AtomicUsize,
    last_epoch: AtomicU64,
    last_kept_bytes: AtomicUsize,
}

impl ManualScheduler {
    /// Creates a scheduler with zeroed counters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            last_epoch: AtomicU64::new(0),
            last_kept_bytes: AtomicUsize::new(0),
        }
    }

    /// Number of cycles started.
    #[must_use]
    pub fn cycles_started(&self) -> usize {
        self.started.load(Ordering::Acquire)
    }

    /// Number of cycles finished.
    #[must_use]
    pub fn cycles_finished(&self) -> usize {
        self.finished.load(Ordering::Acquire)
    }

    /// Epoch of the last finished cycle.
    #[must_use]
    pub fn last_epoch(&self) -> Option<Epoch> {
        Some(Epoch(self.last_epoch.load(Ordering::Acquire))).filter(|e| *e > Epoch::ZERO)
    }

    /// Live bytes reported by the last finished cycle.
    #[must_use]
    pub fn last_kept_bytes(&self) -> usize {
        self.last_kept_bytes.load(Ordering::Acquire)
    }
}

impl GcScheduler for ManualScheduler {
    fn on_gc_start(&self) {
        self.started.fetch_add(1, Ordering::AcqRel);
    }

    fn on_gc_finish(&self, epoch: Epoch, kept_bytes: usize) {
        self.last_kept_bytes.store(kept_bytes, Ordering::Release);
        self.last_epoch.store(epoch.get(), Ordering::Release);
        self.finished.fetch_add(1, Ordering::AcqRel);
    }
}
