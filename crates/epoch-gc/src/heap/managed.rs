//! Reference managed heap.
//!
//! Objects are addressed by [`ObjectId`] and carry a size, a finalizable flag,
//! strong reference fields and an epoch-tagged mark word. An object counts as
//! marked in epoch `e` when its mark word equals `e`, so marks never need to
//! be cleared between cycles.
//!
//! # Allocation
//!
//! Mutators allocate into a per-thread buffer. Preparing a thread for GC
//! finalizes that buffer: under [`HeapStrategy::Legacy`] the objects are
//! published into the global object store, under [`HeapStrategy::Custom`] the
//! buffer is sealed and later swept in place, with dead finalizable objects
//! collected into a per-thread finalizer sub-queue.
//!
//! Objects allocated after marking of an epoch completes are born marked for
//! that epoch, so mutators running during weak processing or sweep never
//! lose fresh objects.
//!
//! # Weak references
//!
//! A weak reference is backed by an extra-object record keyed by its target.
//! While weak barriers are enabled, reading a weak reference whose target is
//! unmarked returns `None`, matching what weak processing will decide.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use super::{FinalizerQueue, HeapCoordinator, HeapSnapshot, WeakReferenceProcessor};
use crate::config::HeapStrategy;
use crate::epoch::Epoch;
use crate::gc::marker::MarkingHeap;
use crate::gc::sync::{LockGuard, LockOrder};
use crate::gc::verify::ObjectGraph;
use crate::metrics::{GcHandle, SweepStats};
use crate::thread::MutatorThread;
use crate::tracing::{log_phase_end, log_phase_start, GcPhase};

// ============================================================================
// Objects
// ============================================================================

/// Identity of a managed object. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Raw numeric value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

/// A dead object handed to finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FinalizableObject {
    /// Identity of the reclaimed object.
    pub id: ObjectId,
    /// Its size in bytes.
    pub size: usize,
}

#[derive(Debug)]
struct HeapObject {
    size: usize,
    finalizable: bool,
    mark: AtomicU64,
    fields: Mutex<Vec<ObjectId>>,
}

impl HeapObject {
    fn is_marked(&self, epoch: Epoch) -> bool {
        self.mark.load(Ordering::Acquire) == epoch.get()
    }
}

/// A weak reference to a managed object.
#[derive(Debug, Clone)]
pub struct WeakRef {
    slot: Arc<WeakSlot>,
}

#[derive(Debug)]
struct WeakSlot {
    target: AtomicU64,
}

const CLEARED: u64 = 0;

impl WeakSlot {
    fn target(&self) -> Option<ObjectId> {
        match self.target.load(Ordering::Acquire) {
            CLEARED => None,
            raw => Some(ObjectId(raw)),
        }
    }

    fn clear(&self) {
        self.target.store(CLEARED, Ordering::Release);
    }
}

/// Side record attached to an object on demand.
#[derive(Debug)]
struct ExtraObject {
    weak: Arc<WeakSlot>,
}

#[derive(Debug, Default)]
struct ThreadBuffer {
    current: Vec<ObjectId>,
    sealed: Vec<ObjectId>,
    finalizers: FinalizerQueue<FinalizableObject>,
}

// ============================================================================
// ManagedHeap
// ============================================================================

/// Id-addressed reference heap implementing every heap-side contract.
pub struct ManagedHeap {
    strategy: HeapStrategy,
    next_id: AtomicU64,
    table: RwLock<HashMap<ObjectId, Arc<HeapObject>>>,
    object_store: Mutex<Vec<ObjectId>>,
    extra_store: Mutex<HashMap<ObjectId, ExtraObject>>,
    buffers: Mutex<HashMap<u64, ThreadBuffer>>,
    global_buffer: Mutex<Vec<ObjectId>>,
    global_sealed: Mutex<Vec<ObjectId>>,
    global_finalizers: Mutex<FinalizerQueue<FinalizableObject>>,
    roots: Mutex<HashMap<ObjectId, usize>>,
    allocation_mark: AtomicU64,
    barrier_epoch: AtomicU64,
}

impl fmt::Debug for ManagedHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedHeap")
            .field("strategy", &self.strategy)
            .field("objects", &self.object_count())
            .field("roots", &self.roots.lock().len())
            .finish_non_exhaustive()
    }
}

impl Default for ManagedHeap {
    fn default() -> Self {
        Self::new(HeapStrategy::default())
    }
}

impl ManagedHeap {
    /// Creates an empty heap using `strategy`.
    #[must_use]
    pub fn new(strategy: HeapStrategy) -> Self {
        Self {
            strategy,
            next_id: AtomicU64::new(1),
            table: RwLock::new(HashMap::new()),
            object_store: Mutex::new(Vec::new()),
            extra_store: Mutex::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
            global_buffer: Mutex::new(Vec::new()),
            global_sealed: Mutex::new(Vec::new()),
            global_finalizers: Mutex::new(FinalizerQueue::new()),
            roots: Mutex::new(HashMap::new()),
            allocation_mark: AtomicU64::new(Epoch::ZERO.get()),
            barrier_epoch: AtomicU64::new(Epoch::ZERO.get()),
        }
    }

    /// Strategy this heap was created with.
    #[must_use]
    pub const fn strategy(&self) -> HeapStrategy {
        self.strategy
    }

    fn new_object(&self, size: usize, finalizable: bool) -> ObjectId {
        let id = ObjectId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let object = HeapObject {
            size,
            finalizable,
            mark: AtomicU64::new(self.allocation_mark.load(Ordering::Acquire)),
            fields: Mutex::new(Vec::new()),
        };
        self.table.write().insert(id, Arc::new(object));
        id
    }

    /// Allocates an object from `thread`'s buffer.
    ///
    /// Must be called by the runnable thread `thread` describes.
    pub fn allocate(&self, thread: &MutatorThread, size: usize, finalizable: bool) -> ObjectId {
        let id = self.new_object(size, finalizable);
        self.buffers
            .lock()
            .entry(thread.id())
            .or_default()
            .current
            .push(id);
        id
    }

    /// Allocates an object outside any mutator thread.
    ///
    /// No pause protects the caller, so an object allocated while marking
    /// runs is only safe once it is rooted.
    pub fn allocate_global(&self, size: usize, finalizable: bool) -> ObjectId {
        let id = self.new_object(size, finalizable);
        self.global_buffer.lock().push(id);
        id
    }

    fn object(&self, id: ObjectId) -> Option<Arc<HeapObject>> {
        self.table.read().get(&id).cloned()
    }

    /// Whether `id` has not been reclaimed.
    #[must_use]
    pub fn is_live(&self, id: ObjectId) -> bool {
        self.table.read().contains_key(&id)
    }

    /// Number of objects not yet reclaimed.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.table.read().len()
    }

    /// Size of `id`, if it is live.
    #[must_use]
    pub fn size_of(&self, id: ObjectId) -> Option<usize> {
        self.object(id).map(|o| o.size)
    }

    /// Adds a strong reference from `object` to `target`.
    ///
    /// # Panics
    ///
    /// Panics if `object` or `target` has been reclaimed.
    pub fn add_field(&self, object: ObjectId, target: ObjectId) {
        assert!(self.is_live(target), "reference to reclaimed object {target}");
        let object = self
            .object(object)
            .unwrap_or_else(|| panic!("write to reclaimed object {object}"));
        object.fields.lock().push(target);
    }

    /// Removes every reference from `object` to `target`.
    pub fn remove_field(&self, object: ObjectId, target: ObjectId) {
        if let Some(object) = self.object(object) {
            object.fields.lock().retain(|f| *f != target);
        }
    }

    /// Current strong references of `object`.
    #[must_use]
    pub fn fields(&self, object: ObjectId) -> Vec<ObjectId> {
        self.object(object)
            .map(|o| o.fields.lock().clone())
            .unwrap_or_default()
    }

    /// Registers `id` as a root. Roots are reference counted.
    pub fn add_root(&self, id: ObjectId) {
        *self.roots.lock().entry(id).or_insert(0) += 1;
    }

    /// Drops one root registration of `id`.
    pub fn remove_root(&self, id: ObjectId) {
        let mut roots = self.roots.lock();
        if let Some(count) = roots.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                roots.remove(&id);
            }
        }
    }

    /// Creates a weak reference to `target`.
    ///
    /// # Panics
    ///
    /// Panics if `target` has been reclaimed.
    pub fn create_weak(&self, target: ObjectId) -> WeakRef {
        assert!(self.is_live(target), "weak reference to reclaimed object {target}");
        let _order = LockGuard::new(LockOrder::ExtraObjectStore);
        let mut extra = self.extra_store.lock();
        let record = extra.entry(target).or_insert_with(|| ExtraObject {
            weak: Arc::new(WeakSlot {
                target: AtomicU64::new(target.get()),
            }),
        });
        WeakRef {
            slot: Arc::clone(&record.weak),
        }
    }

    /// Reads a weak reference.
    #[must_use]
    pub fn weak_get(&self, weak: &WeakRef) -> Option<ObjectId> {
        let target = weak.slot.target()?;
        let barrier = self.barrier_epoch.load(Ordering::Acquire);
        if barrier != Epoch::ZERO.get() {
            let object = self.object(target)?;
            if !object.is_marked(Epoch(barrier)) {
                return None;
            }
        }
        Some(target)
    }

    /// Whether weak reference barriers are enabled.
    #[must_use]
    pub fn barriers_enabled(&self) -> bool {
        self.barrier_epoch.load(Ordering::Acquire) != Epoch::ZERO.get()
    }

    /// Number of extra-object records.
    #[must_use]
    pub fn extra_object_count(&self) -> usize {
        self.extra_store.lock().len()
    }

    fn lock_object_store(&self) -> (LockGuard, MutexGuard<'_, Vec<ObjectId>>) {
        let order = LockGuard::new(LockOrder::ObjectStore);
        (order, self.object_store.lock())
    }

    /// Splits `ids` into survivors and reclaimed objects.
    fn sweep_ids(
        &self,
        ids: Vec<ObjectId>,
        epoch: Epoch,
        finalizers: &mut FinalizerQueue<FinalizableObject>,
    ) -> (Vec<ObjectId>, SweepStats) {
        let mut stats = SweepStats::default();
        let mut survivors = Vec::with_capacity(ids.len());
        let mut table = self.table.write();
        for id in ids {
            let Some(object) = table.get(&id) else {
                continue;
            };
            if object.is_marked(epoch) {
                stats.kept_objects += 1;
                stats.kept_bytes += object.size;
                survivors.push(id);
                continue;
            }
            stats.swept_objects += 1;
            stats.swept_bytes += object.size;
            if object.finalizable {
                finalizers.push(FinalizableObject {
                    id,
                    size: object.size,
                });
            }
            table.remove(&id);
        }
        (survivors, stats)
    }

    fn sweep_extra_records(&self, extra: &mut HashMap<ObjectId, ExtraObject>, epoch: Epoch) -> usize {
        let table = self.table.read();
        let before = extra.len();
        extra.retain(|target, record| {
            let alive = table.get(target).is_some_and(|o| o.is_marked(epoch));
            if !alive {
                record.weak.clear();
            }
            alive
        });
        before - extra.len()
    }
}

// ============================================================================
// Marking
// ============================================================================

impl MarkingHeap for ManagedHeap {
    type Ref = ObjectId;

    fn begin_epoch(&self, _epoch: Epoch) {}

    fn end_epoch(&self, epoch: Epoch) {
        self.allocation_mark.store(epoch.get(), Ordering::Release);
    }

    fn for_each_root(&self, f: &mut dyn FnMut(ObjectId)) {
        let roots: Vec<ObjectId> = self.roots.lock().keys().copied().collect();
        roots.into_iter().for_each(f);
    }

    fn try_mark(&self, object: ObjectId, epoch: Epoch) -> bool {
        self.object(object)
            .is_some_and(|o| o.mark.swap(epoch.get(), Ordering::AcqRel) != epoch.get())
    }

    fn for_each_field(&self, object: ObjectId, f: &mut dyn FnMut(ObjectId)) {
        if let Some(object) = self.object(object) {
            let fields = object.fields.lock().clone();
            fields.into_iter().for_each(f);
        }
    }

    fn object_size(&self, object: ObjectId) -> usize {
        self.object(object).map_or(0, |o| o.size)
    }
}

// ============================================================================
// Weak references
// ============================================================================

impl WeakReferenceProcessor for ManagedHeap {
    fn enable_barriers(&self, epoch: Epoch) {
        self.barrier_epoch.store(epoch.get(), Ordering::Release);
    }

    fn disable_barriers(&self) {
        self.barrier_epoch.store(Epoch::ZERO.get(), Ordering::Release);
    }

    fn process_weaks(&self, handle: &GcHandle) {
        let epoch = handle.epoch();
        log_phase_start(GcPhase::WeakProcessing, epoch);
        let _order = LockGuard::new(LockOrder::ExtraObjectStore);
        let extra = self.extra_store.lock();
        let table = self.table.read();
        let mut cleared = 0;
        for (target, record) in extra.iter() {
            let alive = table.get(target).is_some_and(|o| o.is_marked(epoch));
            if !alive && record.weak.target().is_some() {
                record.weak.clear();
                cleared += 1;
            }
        }
        handle.record_weak_refs_cleared(cleared);
        log_phase_end(GcPhase::WeakProcessing, epoch, cleared, 0);
    }
}

// ============================================================================
// Heap coordination
// ============================================================================

/// Iteration snapshot over a [`ManagedHeap`].
pub struct ManagedHeapSnapshot<'a> {
    heap: &'a ManagedHeap,
    epoch: Epoch,
    /// Released once extra objects are swept.
    extra: Option<(LockGuard, MutexGuard<'a, HashMap<ObjectId, ExtraObject>>)>,
    objects: MutexGuard<'a, Vec<ObjectId>>,
    _objects_order: LockGuard,
}

impl fmt::Debug for ManagedHeapSnapshot<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedHeapSnapshot")
            .field("epoch", &self.epoch)
            .field("objects", &self.objects.len())
            .field("extra_objects", &self.extra.as_ref().map(|(_, extra)| extra.len()))
            .finish_non_exhaustive()
    }
}

impl ObjectGraph for ManagedHeapSnapshot<'_> {
    type Ref = ObjectId;

    fn for_each_object(&self, f: &mut dyn FnMut(ObjectId)) {
        self.objects.iter().copied().for_each(f);
    }

    fn is_marked(&self, object: ObjectId) -> bool {
        self.heap
            .object(object)
            .is_some_and(|o| o.is_marked(self.epoch))
    }

    fn for_each_referred(&self, object: ObjectId, f: &mut dyn FnMut(ObjectId)) {
        self.heap.for_each_field(object, f);
    }
}

impl HeapSnapshot for ManagedHeapSnapshot<'_> {
    type Object = FinalizableObject;

    fn sweep_extra_objects(&mut self, handle: &GcHandle) {
        let Some((_order, mut extra)) = self.extra.take() else {
            return;
        };
        let swept = self.heap.sweep_extra_records(&mut extra, self.epoch);
        handle.record_extra_objects_swept(swept);
    }

    fn sweep(mut self, handle: &GcHandle) -> FinalizerQueue<FinalizableObject> {
        log_phase_start(GcPhase::Sweep, self.epoch);
        let mut finalizers = FinalizerQueue::new();
        let ids = std::mem::take(&mut *self.objects);
        let (survivors, stats) = self.heap.sweep_ids(ids, self.epoch, &mut finalizers);
        *self.objects = survivors;
        handle.record_sweep(stats);
        log_phase_end(GcPhase::Sweep, self.epoch, stats.swept_objects, stats.swept_bytes);
        finalizers
    }
}

impl HeapCoordinator for ManagedHeap {
    type Object = FinalizableObject;
    type Snapshot<'a> = ManagedHeapSnapshot<'a>;

    fn required_strategy(&self) -> Option<HeapStrategy> {
        Some(self.strategy)
    }

    fn prepare_thread_for_gc(&self, thread: &MutatorThread) {
        let mut buffers = self.buffers.lock();
        let Some(buffer) = buffers.get_mut(&thread.id()) else {
            return;
        };
        let current = std::mem::take(&mut buffer.current);
        match self.strategy {
            HeapStrategy::Legacy => {
                let (_order, mut store) = self.lock_object_store();
                store.extend(current);
            }
            HeapStrategy::Custom => buffer.sealed.extend(current),
        }
    }

    fn prepare_for_gc(&self) {
        let pending = std::mem::take(&mut *self.global_buffer.lock());
        match self.strategy {
            HeapStrategy::Legacy => {
                let (_order, mut store) = self.lock_object_store();
                store.extend(pending);
            }
            HeapStrategy::Custom => self.global_sealed.lock().extend(pending),
        }
    }

    fn lock_for_iter(&self, handle: &GcHandle) -> ManagedHeapSnapshot<'_> {
        let extra_order = LockGuard::new(LockOrder::ExtraObjectStore);
        let extra = self.extra_store.lock();
        let objects_order = LockGuard::new(LockOrder::ObjectStore);
        let objects = self.object_store.lock();
        ManagedHeapSnapshot {
            heap: self,
            epoch: handle.epoch(),
            extra: Some((extra_order, extra)),
            objects,
            _objects_order: objects_order,
        }
    }

    fn compact_object_pool(&self) {
        {
            let (_order, mut store) = self.lock_object_store();
            store.shrink_to_fit();
        }
        self.table.write().shrink_to_fit();
    }

    fn sweep_heap(&self, handle: &GcHandle) -> FinalizerQueue<FinalizableObject> {
        let epoch = handle.epoch();
        log_phase_start(GcPhase::Sweep, epoch);

        let swept_extra = {
            let _order = LockGuard::new(LockOrder::ExtraObjectStore);
            let mut extra = self.extra_store.lock();
            self.sweep_extra_records(&mut extra, epoch)
        };
        handle.record_extra_objects_swept(swept_extra);

        let mut global = FinalizerQueue::new();
        let (mut kept, mut total) = {
            let (_order, mut store) = self.lock_object_store();
            self.sweep_ids(std::mem::take(&mut *store), epoch, &mut global)
        };

        let sealed_global = std::mem::take(&mut *self.global_sealed.lock());
        let (survivors, stats) = self.sweep_ids(sealed_global, epoch, &mut global);
        kept.extend(survivors);
        total = total.merged(stats);

        let sealed: Vec<(u64, Vec<ObjectId>)> = self
            .buffers
            .lock()
            .iter_mut()
            .map(|(id, buffer)| (*id, std::mem::take(&mut buffer.sealed)))
            .collect();
        for (thread_id, ids) in sealed {
            let mut local = FinalizerQueue::new();
            let (survivors, stats) = self.sweep_ids(ids, epoch, &mut local);
            kept.extend(survivors);
            total = total.merged(stats);
            match self.buffers.lock().get_mut(&thread_id) {
                Some(buffer) => buffer.finalizers.merge_from(local),
                None => self.global_finalizers.lock().merge_from(local),
            }
        }

        {
            let (_order, mut store) = self.lock_object_store();
            store.extend(kept);
        }

        handle.record_sweep(total);
        log_phase_end(GcPhase::Sweep, epoch, total.swept_objects, total.swept_bytes);
        global
    }

    fn extract_thread_finalizer_queue(&self, thread: &MutatorThread) -> FinalizerQueue<FinalizableObject> {
        self.buffers
            .lock()
            .get_mut(&thread.id())
            .map(|buffer| std::mem::take(&mut buffer.finalizers))
            .unwrap_or_default()
    }

    fn extract_finalizer_queue(&self) -> FinalizerQueue<FinalizableObject> {
        std::mem::take(&mut *self.global_finalizers.lock())
    }

    fn detach_thread(&self, thread: &MutatorThread) {
        let Some(buffer) = self.buffers.lock().remove(&thread.id()) else {
            return;
        };
        let mut global = self.global_buffer.lock();
        global.extend(buffer.current);
        global.extend(buffer.sealed);
        drop(global);
        self.global_finalizers.lock().merge_from(buffer.finalizers);
    }
}
