//! Integration tests for the auxiliary mark worker pool.
//!
//! These tests verify that workers run the dispatcher's auxiliary units on
//! named GC threads, take part in parallel marking, and exit once the
//! dispatcher is shut down.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use epoch_gc::gc::{AuxiliaryGcThreads, MarkDispatcher, MarkingHeap, ParallelMark};
use epoch_gc::{Epoch, GcHandle, GlobalMetrics, MarkStats};

/// Dispatcher whose auxiliary unit records the calling thread and parks
/// until shutdown.
#[derive(Default)]
struct ParkingDispatcher {
    names: Mutex<HashSet<String>>,
    units: AtomicUsize,
    shutdown: Mutex<bool>,
    changed: Condvar,
}

impl MarkDispatcher for ParkingDispatcher {
    fn begin_marking_epoch(&self, _handle: &GcHandle) {}

    fn run_main_cooperative(&self) -> MarkStats {
        MarkStats::default()
    }

    fn run_auxiliary_unit(&self) {
        let name = thread::current().name().unwrap_or_default().to_owned();
        self.names.lock().insert(name);
        self.units.fetch_add(1, Ordering::AcqRel);
        let mut shutdown = self.shutdown.lock();
        while !*shutdown {
            self.changed.wait(&mut shutdown);
        }
    }

    fn end_marking_epoch(&self) {}

    fn request_shutdown(&self) {
        *self.shutdown.lock() = true;
        self.changed.notify_all();
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.lock()
    }
}

fn wait_for_units(dispatcher: &ParkingDispatcher, count: usize) {
    while dispatcher.units.load(Ordering::Acquire) < count {
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_workers_run_on_named_threads() {
    let dispatcher = Arc::new(ParkingDispatcher::default());
    let mut pool = AuxiliaryGcThreads::new(dispatcher.clone(), 3, false);
    assert_eq!(pool.len(), 3);

    wait_for_units(&dispatcher, 3);
    assert_eq!(
        *dispatcher.names.lock(),
        HashSet::from(["Auxiliary GC thread".to_owned()])
    );

    dispatcher.request_shutdown();
    pool.stop_threads();
    assert!(pool.is_empty());
}

#[test]
fn test_stop_blocks_until_shutdown_requested() {
    let dispatcher = Arc::new(ParkingDispatcher::default());
    let stopped = Arc::new(AtomicBool::new(false));
    let pool = AuxiliaryGcThreads::new(dispatcher.clone(), 2, false);
    wait_for_units(&dispatcher, 2);

    let stopper = {
        let stopped = Arc::clone(&stopped);
        thread::spawn(move || {
            let mut pool = pool;
            pool.stop_threads();
            stopped.store(true, Ordering::Release);
        })
    };

    thread::sleep(Duration::from_millis(20));
    assert!(!stopped.load(Ordering::Acquire));
    dispatcher.request_shutdown();
    stopper.join().unwrap();
    assert!(stopped.load(Ordering::Acquire));
}

#[test]
#[should_panic(expected = "already started")]
fn test_start_on_running_pool_panics() {
    let dispatcher = Arc::new(ParkingDispatcher::default());
    dispatcher.request_shutdown();
    let mut pool = AuxiliaryGcThreads::new(dispatcher, 1, false);
    pool.start_threads(1);
}

#[test]
#[should_panic(expected = "single-threaded mark mode")]
fn test_single_threaded_mark_rejects_workers() {
    let dispatcher = Arc::new(ParkingDispatcher::default());
    let _pool = AuxiliaryGcThreads::new(dispatcher, 2, true);
}

#[test]
fn test_single_threaded_mark_allows_empty_pool() {
    let dispatcher = Arc::new(ParkingDispatcher::default());
    let pool = AuxiliaryGcThreads::new(dispatcher.clone(), 0, true);
    assert!(pool.is_empty());
    assert_eq!(dispatcher.units.load(Ordering::Acquire), 0);
}

/// Linked lists hanging off a single root, wide enough to be shared.
struct FanHeap {
    marks: Vec<AtomicU64>,
    width: usize,
    depth: usize,
}

impl FanHeap {
    fn new(width: usize, depth: usize) -> Self {
        Self {
            marks: (0..=width * depth).map(|_| AtomicU64::new(0)).collect(),
            width,
            depth,
        }
    }

    fn all_marked(&self, epoch: Epoch) -> bool {
        self.marks
            .iter()
            .all(|m| m.load(Ordering::Acquire) == epoch.get())
    }
}

impl MarkingHeap for FanHeap {
    type Ref = usize;

    fn begin_epoch(&self, _epoch: Epoch) {}

    fn for_each_root(&self, f: &mut dyn FnMut(usize)) {
        f(0);
    }

    fn try_mark(&self, object: usize, epoch: Epoch) -> bool {
        self.marks[object].swap(epoch.get(), Ordering::AcqRel) != epoch.get()
    }

    fn for_each_field(&self, object: usize, f: &mut dyn FnMut(usize)) {
        if object == 0 {
            (1..=self.width).for_each(f);
        } else if object + self.width <= self.width * self.depth {
            f(object + self.width);
        }
    }

    fn object_size(&self, _object: usize) -> usize {
        16
    }
}

#[test]
fn test_pool_marks_with_parallel_mark() {
    let heap = Arc::new(FanHeap::new(256, 8));
    let mark = Arc::new(ParallelMark::new(Arc::clone(&heap)));
    let mut pool = AuxiliaryGcThreads::new(mark.clone(), 4, false);
    let metrics = Arc::new(GlobalMetrics::new());

    for epoch in 1..=4 {
        let handle = GcHandle::create(Epoch(epoch), Arc::clone(&metrics));
        mark.begin_marking_epoch(&handle);
        let stats = mark.run_main_cooperative();
        mark.end_marking_epoch();

        assert_eq!(stats.objects_marked, 256 * 8 + 1);
        assert_eq!(stats.bytes_marked, (256 * 8 + 1) * 16);
        assert!(heap.all_marked(Epoch(epoch)));
    }

    mark.request_shutdown();
    pool.stop_threads();

    mark.reset();
    assert!(!mark.shutdown_requested());
    pool.start_threads(2);
    assert_eq!(pool.len(), 2);
    mark.request_shutdown();
    pool.stop_threads();
}
