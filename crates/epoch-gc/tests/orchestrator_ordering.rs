//! Integration tests for the order of steps within a GC cycle.
//!
//! Every collaborator is replaced by a recorder that appends an event to a
//! shared log, so each test can compare the exact sequence of calls the
//! orchestrator makes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use epoch_gc::gc::sync::GcLock;
use epoch_gc::gc::{MarkDispatcher, ObjectGraph};
use epoch_gc::{
    CycleOrchestrator, Epoch, EpochState, FinalizerHandoff, FinalizerQueue, GcCollaborators,
    GcConfig, GcHandle, GcScheduler, GlobalMetrics, HeapCoordinator, HeapSnapshot, HeapStrategy,
    MarkStats, MutatorThread, RuntimeAssertsMode, Safepoint, SweepStats, ThreadRegistry,
    WeakReferenceProcessor,
};

const STW_MARK: &str = "GC stop the world #1: mark";
const STW_SWEEP: &str = "GC stop the world #2: prepare heap for sweep";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    BeginMarking(u64),
    StopTheWorld(&'static str),
    GcStart { gc_locked: bool, started: Option<Epoch> },
    MarkMain,
    EndMarking,
    EnableBarriers(u64),
    ResumeTheWorld,
    ProcessWeaks,
    DisableBarriers,
    PrepareThread(u64),
    PrepareGlobal,
    LockForIter,
    Verify,
    SweepExtraObjects,
    Sweep,
    CompactObjectPool,
    SweepHeap,
    ExtractThreadQueue(u64),
    ExtractGlobalQueue,
    GcFinish { epoch: u64, kept_bytes: usize },
    Finalize {
        epoch: u64,
        objects: Vec<u32>,
        gc_locked: bool,
        finished: Option<Epoch>,
    },
    RequestShutdown,
}

struct Recorder {
    events: Mutex<Vec<Event>>,
    gc_lock: Arc<GcLock>,
    state: Arc<EpochState>,
    shutdown: AtomicBool,
    violation: bool,
}

impl Recorder {
    fn new(violation: bool) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            gc_lock: Arc::new(GcLock::new()),
            state: Arc::new(EpochState::new()),
            shutdown: AtomicBool::new(false),
            violation,
        })
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

impl MarkDispatcher for Recorder {
    fn begin_marking_epoch(&self, handle: &GcHandle) {
        self.push(Event::BeginMarking(handle.epoch().get()));
    }

    fn run_main_cooperative(&self) -> MarkStats {
        self.push(Event::MarkMain);
        MarkStats {
            objects_marked: 2,
            bytes_marked: 48,
        }
    }

    fn run_auxiliary_unit(&self) {}

    fn end_marking_epoch(&self) {
        self.push(Event::EndMarking);
    }

    fn request_shutdown(&self) {
        self.push(Event::RequestShutdown);
        self.shutdown.store(true, Ordering::Release);
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl WeakReferenceProcessor for Recorder {
    fn enable_barriers(&self, epoch: Epoch) {
        self.push(Event::EnableBarriers(epoch.get()));
    }

    fn disable_barriers(&self) {
        self.push(Event::DisableBarriers);
    }

    fn process_weaks(&self, _handle: &GcHandle) {
        self.push(Event::ProcessWeaks);
    }
}

impl GcScheduler for Recorder {
    fn on_gc_start(&self) {
        self.push(Event::GcStart {
            gc_locked: self.gc_lock.is_locked(),
            started: self.state.started(),
        });
    }

    fn on_gc_finish(&self, epoch: Epoch, kept_bytes: usize) {
        self.push(Event::GcFinish {
            epoch: epoch.get(),
            kept_bytes,
        });
    }
}

impl Safepoint for Recorder {
    fn stop_the_world(&self, handle: &GcHandle, reason: &'static str) {
        handle.suspension_requested();
        self.push(Event::StopTheWorld(reason));
    }

    fn resume_the_world(&self, handle: &GcHandle) {
        handle.threads_resumed();
        self.push(Event::ResumeTheWorld);
    }
}

impl FinalizerHandoff<u32> for Recorder {
    fn schedule(&self, queue: FinalizerQueue<u32>, epoch: Epoch) {
        self.push(Event::Finalize {
            epoch: epoch.get(),
            objects: queue.into_iter().collect(),
            gc_locked: self.gc_lock.is_locked(),
            finished: self.state.finished(),
        });
    }
}

struct RecordingHeap {
    recorder: Arc<Recorder>,
}

impl HeapCoordinator for RecordingHeap {
    type Object = u32;
    type Snapshot<'a> = RecordingSnapshot<'a>;

    fn prepare_thread_for_gc(&self, thread: &MutatorThread) {
        self.recorder.push(Event::PrepareThread(thread.id()));
    }

    fn prepare_for_gc(&self) {
        self.recorder.push(Event::PrepareGlobal);
    }

    fn lock_for_iter(&self, _handle: &GcHandle) -> RecordingSnapshot<'_> {
        self.recorder.push(Event::LockForIter);
        RecordingSnapshot { heap: self }
    }

    fn compact_object_pool(&self) {
        self.recorder.push(Event::CompactObjectPool);
    }

    fn sweep_heap(&self, handle: &GcHandle) -> FinalizerQueue<u32> {
        self.recorder.push(Event::SweepHeap);
        handle.record_sweep(SweepStats {
            kept_objects: 2,
            kept_bytes: 48,
            swept_objects: 1,
            swept_bytes: 8,
        });
        [10].into_iter().collect()
    }

    fn extract_thread_finalizer_queue(&self, thread: &MutatorThread) -> FinalizerQueue<u32> {
        self.recorder.push(Event::ExtractThreadQueue(thread.id()));
        [u32::try_from(thread.id()).unwrap_or(u32::MAX) + 100]
            .into_iter()
            .collect()
    }

    fn extract_finalizer_queue(&self) -> FinalizerQueue<u32> {
        self.recorder.push(Event::ExtractGlobalQueue);
        [20].into_iter().collect()
    }
}

struct RecordingSnapshot<'a> {
    heap: &'a RecordingHeap,
}

impl ObjectGraph for RecordingSnapshot<'_> {
    type Ref = u32;

    fn for_each_object(&self, f: &mut dyn FnMut(u32)) {
        self.heap.recorder.push(Event::Verify);
        f(1);
        f(2);
    }

    fn is_marked(&self, object: u32) -> bool {
        object == 1 || !self.heap.recorder.violation
    }

    fn for_each_referred(&self, object: u32, f: &mut dyn FnMut(u32)) {
        if object == 1 {
            f(2);
        }
    }
}

impl HeapSnapshot for RecordingSnapshot<'_> {
    type Object = u32;

    fn sweep_extra_objects(&mut self, _handle: &GcHandle) {
        self.heap.recorder.push(Event::SweepExtraObjects);
    }

    fn sweep(self, handle: &GcHandle) -> FinalizerQueue<u32> {
        self.heap.recorder.push(Event::Sweep);
        handle.record_sweep(SweepStats {
            kept_objects: 2,
            kept_bytes: 48,
            swept_objects: 1,
            swept_bytes: 8,
        });
        [7].into_iter().collect()
    }
}

struct Fixture {
    recorder: Arc<Recorder>,
    threads: Arc<ThreadRegistry>,
    metrics: Arc<GlobalMetrics>,
    orchestrator: Arc<CycleOrchestrator<RecordingHeap>>,
}

fn fixture(config: GcConfig, violation: bool) -> Fixture {
    let recorder = Recorder::new(violation);
    let threads = Arc::new(ThreadRegistry::new());
    let metrics = Arc::new(GlobalMetrics::new());
    let collaborators = GcCollaborators {
        heap: Arc::new(RecordingHeap {
            recorder: Arc::clone(&recorder),
        }),
        mark: recorder.clone(),
        weaks: recorder.clone(),
        finalizers: recorder.clone(),
        scheduler: recorder.clone(),
        safepoint: recorder.clone(),
        threads: Arc::clone(&threads),
    };
    let orchestrator = Arc::new(CycleOrchestrator::new(
        Arc::clone(&recorder.state),
        Arc::clone(&recorder.gc_lock),
        collaborators,
        config,
        Arc::clone(&metrics),
    ));
    Fixture {
        recorder,
        threads,
        metrics,
        orchestrator,
    }
}

fn config(concurrent_weak_sweep: bool, strategy: HeapStrategy) -> GcConfig {
    GcConfig::default()
        .with_concurrent_weak_sweep(concurrent_weak_sweep)
        .with_heap_strategy(strategy)
        .with_runtime_asserts(RuntimeAssertsMode::Panic)
}

fn run_epoch(fixture: &Fixture) -> Epoch {
    let epoch = fixture.recorder.state.schedule().unwrap();
    fixture.orchestrator.perform_full_gc(epoch);
    epoch
}

fn cycle_prefix() -> Vec<Event> {
    vec![
        Event::BeginMarking(1),
        Event::StopTheWorld(STW_MARK),
        Event::GcStart {
            gc_locked: true,
            started: None,
        },
        Event::MarkMain,
        Event::EndMarking,
    ]
}

#[test]
fn test_single_pause_legacy_cycle() {
    let f = fixture(config(false, HeapStrategy::Legacy), false);
    let a = f.threads.register(None);
    let b = f.threads.register(None);

    assert_eq!(run_epoch(&f), Epoch(1));

    let mut expected = cycle_prefix();
    expected.extend([
        Event::ProcessWeaks,
        Event::PrepareThread(a.id()),
        Event::PrepareThread(b.id()),
        Event::PrepareGlobal,
        Event::LockForIter,
        Event::Verify,
        Event::ResumeTheWorld,
        Event::SweepExtraObjects,
        Event::Sweep,
        Event::CompactObjectPool,
        Event::GcFinish {
            epoch: 1,
            kept_bytes: 48,
        },
        Event::Finalize {
            epoch: 1,
            objects: vec![7],
            gc_locked: false,
            finished: Some(Epoch(1)),
        },
    ]);
    assert_eq!(f.recorder.events(), expected);
}

#[test]
fn test_concurrent_weak_sweep_legacy_cycle() {
    let f = fixture(config(true, HeapStrategy::Legacy), false);
    let a = f.threads.register(None);

    run_epoch(&f);

    let mut expected = cycle_prefix();
    expected.extend([
        Event::EnableBarriers(1),
        Event::ResumeTheWorld,
        Event::ProcessWeaks,
        Event::StopTheWorld(STW_SWEEP),
        Event::DisableBarriers,
        Event::PrepareThread(a.id()),
        Event::PrepareGlobal,
        Event::LockForIter,
        Event::Verify,
        Event::ResumeTheWorld,
        Event::SweepExtraObjects,
        Event::Sweep,
        Event::CompactObjectPool,
        Event::GcFinish {
            epoch: 1,
            kept_bytes: 48,
        },
        Event::Finalize {
            epoch: 1,
            objects: vec![7],
            gc_locked: false,
            finished: Some(Epoch(1)),
        },
    ]);
    assert_eq!(f.recorder.events(), expected);
}

#[test]
fn test_custom_strategy_merges_thread_queues() {
    let f = fixture(config(false, HeapStrategy::Custom), false);
    let a = f.threads.register(None);
    let b = f.threads.register(None);

    run_epoch(&f);

    let mut expected = cycle_prefix();
    expected.extend([
        Event::ProcessWeaks,
        Event::PrepareThread(a.id()),
        Event::PrepareThread(b.id()),
        Event::PrepareGlobal,
        Event::ResumeTheWorld,
        Event::SweepHeap,
        Event::ExtractThreadQueue(a.id()),
        Event::ExtractThreadQueue(b.id()),
        Event::ExtractGlobalQueue,
        Event::GcFinish {
            epoch: 1,
            kept_bytes: 48,
        },
        Event::Finalize {
            epoch: 1,
            objects: vec![10, 101, 102, 20],
            gc_locked: false,
            finished: Some(Epoch(1)),
        },
    ]);
    assert_eq!(f.recorder.events(), expected);
}

#[test]
fn test_single_pause_straddles_weak_processing() {
    for strategy in [HeapStrategy::Legacy, HeapStrategy::Custom] {
        let f = fixture(config(false, strategy), false);
        run_epoch(&f);
        let events = f.recorder.events();

        let stops: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, Event::StopTheWorld(_)))
            .collect();
        assert_eq!(stops.len(), 1);
        let resumes = events
            .iter()
            .filter(|e| **e == Event::ResumeTheWorld)
            .count();
        assert_eq!(resumes, 1);

        let position = |wanted: &Event| events.iter().position(|e| e == wanted).unwrap();
        assert!(position(&Event::StopTheWorld(STW_MARK)) < position(&Event::ProcessWeaks));
        assert!(position(&Event::ProcessWeaks) < position(&Event::ResumeTheWorld));
        assert!(!events.contains(&Event::EnableBarriers(1)));
        assert!(!events.contains(&Event::DisableBarriers));
    }
}

#[test]
fn test_ignore_mode_skips_verification() {
    let config = config(false, HeapStrategy::Legacy).with_runtime_asserts(RuntimeAssertsMode::Ignore);
    let f = fixture(config, true);
    run_epoch(&f);
    let events = f.recorder.events();
    assert!(events.contains(&Event::LockForIter));
    assert!(!events.contains(&Event::Verify));
}

#[test]
fn test_log_mode_reports_violation_and_continues() {
    let config = config(false, HeapStrategy::Legacy).with_runtime_asserts(RuntimeAssertsMode::Log);
    let f = fixture(config, true);
    run_epoch(&f);
    let events = f.recorder.events();
    assert!(events.contains(&Event::Verify));
    assert!(events.contains(&Event::Sweep));
    assert_eq!(f.recorder.state.finished(), Some(Epoch(1)));
}

#[test]
fn test_handle_is_closed_with_cycle_metrics() {
    let f = fixture(config(true, HeapStrategy::Legacy), false);
    run_epoch(&f);

    let cycle = f.metrics.last_cycle().unwrap();
    assert_eq!(cycle.epoch, Epoch(1));
    assert_eq!(cycle.pauses, 2);
    assert_eq!(cycle.mark.objects_marked, 2);
    assert_eq!(cycle.sweep.kept_bytes, 48);
    assert_eq!(cycle.finalizers_scheduled, 1);
    assert_eq!(f.metrics.total_collections(), 1);
}

#[test]
fn test_shutdown_stops_the_loop_without_cycles() {
    let f = fixture(config(true, HeapStrategy::Legacy), false);
    f.recorder.state.schedule();
    f.recorder.state.shutdown();

    f.orchestrator.run();

    assert_eq!(f.recorder.events(), vec![Event::RequestShutdown]);
    assert!(f.recorder.shutdown_requested());
    assert_eq!(f.recorder.state.started(), None);
}

#[test]
fn test_run_loop_processes_epochs_in_order() {
    let f = fixture(config(true, HeapStrategy::Custom), false);
    let orchestrator = Arc::clone(&f.orchestrator);
    let main = thread::spawn(move || orchestrator.run());

    let state = Arc::clone(&f.recorder.state);
    for expected in 1..=3 {
        let epoch = state.schedule().unwrap();
        assert_eq!(epoch, Epoch(expected));
        assert!(state.wait_epoch_finished(epoch));
    }
    state.shutdown();
    main.join().unwrap();

    let events = f.recorder.events();
    let begun: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            Event::BeginMarking(epoch) => Some(*epoch),
            _ => None,
        })
        .collect();
    assert_eq!(begun, vec![1, 2, 3]);

    let finished: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            Event::GcFinish { epoch, .. } => Some(*epoch),
            _ => None,
        })
        .collect();
    assert_eq!(finished, vec![1, 2, 3]);
    assert_eq!(events.last(), Some(&Event::RequestShutdown));
}

#[test]
fn test_gc_lock_is_released_between_cycles() {
    let f = fixture(config(false, HeapStrategy::Legacy), false);
    run_epoch(&f);
    assert!(!f.recorder.gc_lock.is_locked());
    run_epoch(&f);
    assert!(!f.recorder.gc_lock.is_locked());

    let starts = f
        .recorder
        .events()
        .into_iter()
        .filter(|e| matches!(e, Event::GcStart { gc_locked: true, .. }))
        .count();
    assert_eq!(starts, 2);
}
