//! Per-cycle telemetry and cumulative GC statistics.
//!
//! A [`GcHandle`] is created by the main GC thread at the start of every
//! cycle. Collaborators receive it by shared reference and record what they
//! did (objects marked, bytes kept, pauses). Closing the handle with
//! [`GcHandle::finished`] publishes an immutable [`CycleMetrics`] snapshot into
//! the collector's [`GlobalMetrics`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::epoch::Epoch;

/// Result of the marking phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkStats {
    /// Number of objects marked live.
    pub objects_marked: usize,
    /// Total size of marked objects.
    pub bytes_marked: usize,
}

/// Result of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Objects that survived.
    pub kept_objects: usize,
    /// Bytes that survived.
    pub kept_bytes: usize,
    /// Objects reclaimed.
    pub swept_objects: usize,
    /// Bytes reclaimed.
    pub swept_bytes: usize,
}

impl SweepStats {
    /// Component-wise sum.
    #[must_use]
    pub const fn merged(self, other: Self) -> Self {
        Self {
            kept_objects: self.kept_objects + other.kept_objects,
            kept_bytes: self.kept_bytes + other.kept_bytes,
            swept_objects: self.swept_objects + other.swept_objects,
            swept_bytes: self.swept_bytes + other.swept_bytes,
        }
    }
}

/// Immutable summary of a finished cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleMetrics {
    /// Epoch of the cycle.
    pub epoch: Epoch,
    /// Wall time from handle creation to close.
    pub duration: Duration,
    /// Number of stop-the-world pauses.
    pub pauses: usize,
    /// Accumulated stop-the-world time.
    pub pause_time: Duration,
    /// Marking result.
    pub mark: MarkStats,
    /// Accumulated sweep result.
    pub sweep: SweepStats,
    /// Extra-object records reclaimed.
    pub extra_objects_swept: usize,
    /// Weak references cleared during weak processing.
    pub weak_refs_cleared: usize,
    /// Objects handed to finalization.
    pub finalizers_scheduled: usize,
}

/// Per-epoch telemetry record owned by the main GC thread.
#[derive(Debug)]
pub struct GcHandle {
    epoch: Epoch,
    sink: Arc<GlobalMetrics>,
    created: Instant,
    objects_marked: AtomicUsize,
    bytes_marked: AtomicUsize,
    kept_objects: AtomicUsize,
    kept_bytes: AtomicUsize,
    swept_objects: AtomicUsize,
    swept_bytes: AtomicUsize,
    extra_objects_swept: AtomicUsize,
    weak_refs_cleared: AtomicUsize,
    pauses: AtomicUsize,
    pause_ns: AtomicU64,
    suspension_start: Mutex<Option<Instant>>,
    finalizers_scheduled: AtomicUsize,
    finished: AtomicBool,
}

impl GcHandle {
    /// Opens the handle for `epoch`; the snapshot goes to `sink` on close.
    #[must_use]
    pub fn create(epoch: Epoch, sink: Arc<GlobalMetrics>) -> Self {
        Self {
            epoch,
            sink,
            created: Instant::now(),
            objects_marked: AtomicUsize::new(0),
            bytes_marked: AtomicUsize::new(0),
            kept_objects: AtomicUsize::new(0),
            kept_bytes: AtomicUsize::new(0),
            swept_objects: AtomicUsize::new(0),
            swept_bytes: AtomicUsize::new(0),
            extra_objects_swept: AtomicUsize::new(0),
            weak_refs_cleared: AtomicUsize::new(0),
            pauses: AtomicUsize::new(0),
            pause_ns: AtomicU64::new(0),
            suspension_start: Mutex::new(None),
            finalizers_scheduled: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
        }
    }

    /// Epoch this handle describes.
    #[must_use]
    pub const fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Records the marking result.
    pub fn record_mark(&self, stats: MarkStats) {
        self.objects_marked
            .fetch_add(stats.objects_marked, Ordering::Relaxed);
        self.bytes_marked
            .fetch_add(stats.bytes_marked, Ordering::Relaxed);
    }

    /// Adds one sweep pass to the cycle totals.
    pub fn record_sweep(&self, stats: SweepStats) {
        self.kept_objects
            .fetch_add(stats.kept_objects, Ordering::Relaxed);
        self.kept_bytes.fetch_add(stats.kept_bytes, Ordering::Relaxed);
        self.swept_objects
            .fetch_add(stats.swept_objects, Ordering::Relaxed);
        self.swept_bytes
            .fetch_add(stats.swept_bytes, Ordering::Relaxed);
    }

    /// Records reclaimed extra-object records.
    pub fn record_extra_objects_swept(&self, count: usize) {
        self.extra_objects_swept.fetch_add(count, Ordering::Relaxed);
    }

    /// Records weak references cleared by weak processing.
    pub fn record_weak_refs_cleared(&self, count: usize) {
        self.weak_refs_cleared.fetch_add(count, Ordering::Relaxed);
    }

    /// Marks the beginning of a stop-the-world request.
    pub fn suspension_requested(&self) {
        *self.suspension_start.lock() = Some(Instant::now());
    }

    /// Marks the end of a pause and returns its length.
    ///
    /// # Panics
    ///
    /// Panics if no pause is in progress.
    pub fn threads_resumed(&self) -> Duration {
        let start = self
            .suspension_start
            .lock()
            .take()
            .expect("threads resumed without a suspension request");
        let pause = start.elapsed();
        self.pauses.fetch_add(1, Ordering::Relaxed);
        self.pause_ns.fetch_add(
            pause.as_nanos().try_into().unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        pause
    }

    /// Bytes retained by the sweep so far.
    #[must_use]
    pub fn kept_size_bytes(&self) -> usize {
        self.kept_bytes.load(Ordering::Relaxed)
    }

    /// Records how many objects were handed to finalization.
    pub fn finalizers_scheduled(&self, count: usize) {
        self.finalizers_scheduled.store(count, Ordering::Relaxed);
    }

    /// Whether the handle has been closed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Current values as a [`CycleMetrics`].
    #[must_use]
    pub fn snapshot(&self) -> CycleMetrics {
        CycleMetrics {
            epoch: self.epoch,
            duration: self.created.elapsed(),
            pauses: self.pauses.load(Ordering::Relaxed),
            pause_time: Duration::from_nanos(self.pause_ns.load(Ordering::Relaxed)),
            mark: MarkStats {
                objects_marked: self.objects_marked.load(Ordering::Relaxed),
                bytes_marked: self.bytes_marked.load(Ordering::Relaxed),
            },
            sweep: SweepStats {
                kept_objects: self.kept_objects.load(Ordering::Relaxed),
                kept_bytes: self.kept_bytes.load(Ordering::Relaxed),
                swept_objects: self.swept_objects.load(Ordering::Relaxed),
                swept_bytes: self.swept_bytes.load(Ordering::Relaxed),
            },
            extra_objects_swept: self.extra_objects_swept.load(Ordering::Relaxed),
            weak_refs_cleared: self.weak_refs_cleared.load(Ordering::Relaxed),
            finalizers_scheduled: self.finalizers_scheduled.load(Ordering::Relaxed),
        }
    }

    /// Closes the handle and publishes the snapshot.
    ///
    /// # Panics
    ///
    /// Panics if the handle was already closed.
    pub fn finished(&self) {
        let already = self.finished.swap(true, Ordering::AcqRel);
        assert!(!already, "GC handle for epoch {} closed twice", self.epoch);
        self.sink.record(self.snapshot());
    }
}

/// Ring buffer size for cycle history.
const HISTORY_SIZE: usize = 64;

/// Cumulative statistics across all cycles of one collector.
#[derive(Debug)]
pub struct GlobalMetrics {
    collections: AtomicUsize,
    objects_marked: AtomicUsize,
    bytes_reclaimed: AtomicUsize,
    objects_reclaimed: AtomicUsize,
    pauses: AtomicUsize,
    pause_ns: AtomicU64,
    finalizers_scheduled: AtomicUsize,
    history: Mutex<VecDeque<CycleMetrics>>,
}

impl Default for GlobalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalMetrics {
    /// All counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            collections: AtomicUsize::new(0),
            objects_marked: AtomicUsize::new(0),
            bytes_reclaimed: AtomicUsize::new(0),
            objects_reclaimed: AtomicUsize::new(0),
            pauses: AtomicUsize::new(0),
            pause_ns: AtomicU64::new(0),
            finalizers_scheduled: AtomicUsize::new(0),
            history: Mutex::new(VecDeque::new()),
        }
    }

    fn record(&self, cycle: CycleMetrics) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        self.objects_marked
            .fetch_add(cycle.mark.objects_marked, Ordering::Relaxed);
        self.bytes_reclaimed
            .fetch_add(cycle.sweep.swept_bytes, Ordering::Relaxed);
        self.objects_reclaimed
            .fetch_add(cycle.sweep.swept_objects, Ordering::Relaxed);
        self.pauses.fetch_add(cycle.pauses, Ordering::Relaxed);
        self.pause_ns.fetch_add(
            cycle.pause_time.as_nanos().try_into().unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        self.finalizers_scheduled
            .fetch_add(cycle.finalizers_scheduled, Ordering::Relaxed);

        let mut history = self.history.lock();
        if history.len() == HISTORY_SIZE {
            history.pop_front();
        }
        history.push_back(cycle);
    }

    /// Number of finished cycles.
    #[inline]
    #[must_use]
    pub fn total_collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    /// Objects marked across all cycles.
    #[inline]
    #[must_use]
    pub fn total_objects_marked(&self) -> usize {
        self.objects_marked.load(Ordering::Relaxed)
    }

    /// Bytes reclaimed across all cycles.
    #[inline]
    #[must_use]
    pub fn total_bytes_reclaimed(&self) -> usize {
        self.bytes_reclaimed.load(Ordering::Relaxed)
    }

    /// Objects reclaimed across all cycles.
    #[inline]
    #[must_use]
    pub fn total_objects_reclaimed(&self) -> usize {
        self.objects_reclaimed.load(Ordering::Relaxed)
    }

    /// Stop-the-world pauses across all cycles.
    #[inline]
    #[must_use]
    pub fn total_pauses(&self) -> usize {
        self.pauses.load(Ordering::Relaxed)
    }

    /// Accumulated pause time in nanoseconds.
    #[inline]
    #[must_use]
    pub fn total_pause_ns(&self) -> u64 {
        self.pause_ns.load(Ordering::Relaxed)
    }

    /// Objects handed to finalization across all cycles.
    #[inline]
    #[must_use]
    pub fn total_finalizers_scheduled(&self) -> usize {
        self.finalizers_scheduled.load(Ordering::Relaxed)
    }

    /// Summary of the most recently finished cycle.
    #[must_use]
    pub fn last_cycle(&self) -> Option<CycleMetrics> {
        self.history.lock().back().copied()
    }

    /// Up to `n` most recent cycles, oldest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<CycleMetrics> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(n);
        history.iter().skip(skip).copied().collect()
    }

    /// Longest single-cycle pause time among the `n` most recent cycles.
    #[must_use]
    pub fn max_pause_time(&self, n: usize) -> Duration {
        self.recent(n)
            .iter()
            .map(|m| m.pause_time)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}
