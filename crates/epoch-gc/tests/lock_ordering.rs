//! Integration tests for lock ordering discipline.
//!
//! These tests verify that the lock ordering discipline is enforced and that
//! complete collection cycles, together with mutators entering and leaving
//! the runtime, never acquire locks out of order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use epoch_gc::gc::sync::{current_max_level, GcLock, LockGuard, LockOrder};
use epoch_gc::{GarbageCollector, GcConfig, HeapStrategy, RuntimeAssertsMode};

#[test]
fn test_lock_order_levels() {
    assert_eq!(LockOrder::GcLock.level(), 1);
    assert_eq!(LockOrder::ThreadRegistry.level(), 2);
    assert_eq!(LockOrder::ObjectStore.level(), 3);
    assert_eq!(LockOrder::ExtraObjectStore.level(), 3);
    assert_eq!(LockOrder::Safepoint.level(), 4);
    assert_eq!(LockOrder::EpochState.level(), 5);
}

#[test]
fn test_order_values_are_unique() {
    let all = [
        LockOrder::GcLock,
        LockOrder::ThreadRegistry,
        LockOrder::ObjectStore,
        LockOrder::ExtraObjectStore,
        LockOrder::Safepoint,
        LockOrder::EpochState,
    ];
    for (i, a) in all.iter().enumerate() {
        for b in &all[i + 1..] {
            assert!(a.order_value() < b.order_value());
            assert!(a.level() <= b.level());
        }
    }
}

#[test]
fn test_concurrent_lock_acquisition_no_deadlock() {
    let num_threads = 4;
    let iterations = 10;
    let gc_lock = Arc::new(GcLock::new());
    let barrier = Arc::new(Barrier::new(num_threads));
    let completed = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let gc_lock = Arc::clone(&gc_lock);
            let barrier = Arc::clone(&barrier);
            let completed = Arc::clone(&completed);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..iterations {
                    let _gc = gc_lock.lock();
                    let _registry = LockGuard::new(LockOrder::ThreadRegistry);
                    let _extra = LockGuard::new(LockOrder::ExtraObjectStore);
                    let _objects = LockGuard::new(LockOrder::ObjectStore);
                    let _safepoint = LockGuard::new(LockOrder::Safepoint);
                    let _epoch = LockGuard::new(LockOrder::EpochState);
                }
                completed.fetch_add(1, Ordering::Relaxed);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(completed.load(Ordering::Relaxed), num_threads);
    assert!(!gc_lock.is_locked());
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "Lock ordering violation")]
fn test_safepoint_before_object_store_panics() {
    let _safepoint = LockGuard::new(LockOrder::Safepoint);
    let _objects = LockGuard::new(LockOrder::ObjectStore);
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "Lock ordering violation")]
fn test_epoch_state_before_registry_panics() {
    let _epoch = LockGuard::new(LockOrder::EpochState);
    let _registry = LockGuard::new(LockOrder::ThreadRegistry);
}

#[test]
fn test_collection_cycles_respect_lock_order() {
    for strategy in [HeapStrategy::Legacy, HeapStrategy::Custom] {
        for concurrent in [false, true] {
            let config = GcConfig::default()
                .with_heap_strategy(strategy)
                .with_concurrent_weak_sweep(concurrent)
                .with_auxiliary_workers(2)
                .with_runtime_asserts(RuntimeAssertsMode::Panic);
            let gc = GarbageCollector::managed(config, |_| {});

            thread::scope(|scope| {
                for _ in 0..2 {
                    scope.spawn(|| {
                        let mutator = gc.attach_mutator();
                        let root = mutator.allocate_root(8, false);
                        for _ in 0..3 {
                            let object = mutator.allocate(8, true);
                            gc.heap().add_field(root, object);
                            let weak = gc.heap().create_weak(object);
                            mutator.collect();
                            assert_eq!(mutator.weak_get(&weak), Some(object));
                        }
                    });
                }
            });

            assert_eq!(current_max_level(), 0);
            gc.shutdown();
            assert!(gc.metrics().total_collections() >= 3);
        }
    }
}
