//! Collector configuration.

use std::num::NonZeroUsize;

/// How runtime invariant checks behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeAssertsMode {
    /// Skip the checks entirely.
    #[cfg_attr(not(debug_assertions), default)]
    Ignore,
    /// Run the checks and report violations without stopping.
    Log,
    /// Run the checks and abort the process on violation.
    #[cfg_attr(debug_assertions, default)]
    Panic,
}

impl RuntimeAssertsMode {
    /// Whether checks run at all.
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        !matches!(self, Self::Ignore)
    }
}

/// Heap layout the sweep phase works against.
///
/// Chosen once at startup; both variants live in every build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeapStrategy {
    /// Object and extra-object stores are locked for iteration before the
    /// final pause ends, optionally verified, then swept store by store.
    #[default]
    Legacy,
    /// The heap sweeps itself (extra objects included); per-thread finalizer
    /// sub-queues are merged afterwards.
    Custom,
}

/// Configuration consumed by the collector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GcConfig {
    /// Process weak references with mutators running, guarded by weak
    /// reference barriers. Adds a second short pause.
    pub concurrent_weak_sweep: bool,
    /// Mark on the main GC thread only. No auxiliary workers are started.
    pub single_threaded_mark: bool,
    /// Behavior of the mark invariant check.
    pub runtime_asserts: RuntimeAssertsMode,
    /// Heap layout strategy.
    pub heap_strategy: HeapStrategy,
    /// Number of auxiliary mark workers.
    pub auxiliary_workers: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            concurrent_weak_sweep: true,
            single_threaded_mark: false,
            runtime_asserts: RuntimeAssertsMode::default(),
            heap_strategy: HeapStrategy::default(),
            auxiliary_workers: available_parallelism().saturating_sub(1),
        }
    }
}

impl GcConfig {
    /// Worker count actually started; zero in single-threaded mark mode.
    #[must_use]
    pub const fn effective_auxiliary_workers(&self) -> usize {
        if self.single_threaded_mark {
            0
        } else {
            self.auxiliary_workers
        }
    }

    /// Sets concurrent weak sweep.
    #[must_use]
    pub const fn with_concurrent_weak_sweep(mut self, enabled: bool) -> Self {
        self.concurrent_weak_sweep = enabled;
        self
    }

    /// Sets single-threaded mark.
    #[must_use]
    pub const fn with_single_threaded_mark(mut self, enabled: bool) -> Self {
        self.single_threaded_mark = enabled;
        self
    }

    /// Sets the runtime asserts mode.
    #[must_use]
    pub const fn with_runtime_asserts(mut self, mode: RuntimeAssertsMode) -> Self {
        self.runtime_asserts = mode;
        self
    }

    /// Sets the heap strategy.
    #[must_use]
    pub const fn with_heap_strategy(mut self, strategy: HeapStrategy) -> Self {
        self.heap_strategy = strategy;
        self
    }

    /// Sets the auxiliary worker count.
    #[must_use]
    pub const fn with_auxiliary_workers(mut self, workers: usize) -> Self {
        self.auxiliary_workers = workers;
        self
    }
}

/// Number of CPUs available to the process, at least 1.
#[must_use]
pub fn available_parallelism() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}
