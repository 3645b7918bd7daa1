//! GC tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! tracing spans and events for collection cycles. Without the feature the
//! same functions exist as no-ops so call sites stay unconditional.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::time::Duration;

    use tracing::{span, Level};

    use crate::epoch::Epoch;

    /// Phases of one cycle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// Trace the live object graph.
        Mark,
        /// Clear or queue dead weak references.
        WeakProcessing,
        /// Finalize thread-local allocation state.
        PrepareHeap,
        /// Reclaim unmarked objects.
        Sweep,
        /// Hand reclaimed objects to finalization.
        Finalization,
    }

    /// Create a span for an entire cycle.
    pub fn trace_gc_cycle(epoch: Epoch) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_cycle", epoch = epoch.get()).entered()
    }

    /// Log the start of a phase.
    pub fn log_phase_start(phase: GcPhase, epoch: Epoch) {
        tracing::debug!(phase = ?phase, epoch = epoch.get(), "phase_start");
    }

    /// Log the end of a phase with the number of objects it dealt with.
    pub fn log_phase_end(phase: GcPhase, epoch: Epoch, objects: usize, bytes: usize) {
        tracing::debug!(
            phase = ?phase,
            epoch = epoch.get(),
            objects,
            bytes,
            "phase_end"
        );
    }

    /// Log a stop-the-world request.
    pub fn log_stop_the_world(epoch: Epoch, reason: &str) {
        tracing::debug!(epoch = epoch.get(), reason, "stop_the_world");
    }

    /// Log the end of a pause.
    pub fn log_resume_the_world(epoch: Epoch, pause: Duration) {
        #[allow(clippy::cast_possible_truncation)]
        let pause_us = pause.as_micros() as u64;
        tracing::debug!(epoch = epoch.get(), pause_us, "resume_the_world");
    }

    /// Log a GC thread starting or finishing execution.
    pub fn log_thread_event(name: &str, event: &str) {
        tracing::debug!(thread = name, event, "gc_thread");
    }

    /// Log a reported mark invariant violation.
    pub fn log_mark_violation(epoch: Epoch, message: &str) {
        tracing::error!(epoch = epoch.get(), message, "mark_invariant_violation");
    }

    /// Log the end of a cycle.
    pub fn log_cycle_finished(epoch: Epoch, kept_bytes: usize, finalizers: usize) {
        tracing::info!(epoch = epoch.get(), kept_bytes, finalizers, "gc_finished");
    }
}

#[cfg(not(feature = "tracing"))]
#[allow(clippy::missing_const_for_fn)]
pub mod internal {
    use std::time::Duration;

    use crate::epoch::Epoch;

    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// Trace the live object graph.
        Mark,
        /// Clear or queue dead weak references.
        WeakProcessing,
        /// Finalize thread-local allocation state.
        PrepareHeap,
        /// Reclaim unmarked objects.
        Sweep,
        /// Hand reclaimed objects to finalization.
        Finalization,
    }

    /// Stub span guard when tracing is disabled.
    pub struct NoSpan;

    /// Stub function when tracing is disabled.
    pub fn trace_gc_cycle(_epoch: Epoch) -> NoSpan {
        NoSpan
    }

    /// Stub function when tracing is disabled.
    pub fn log_phase_start(_phase: GcPhase, _epoch: Epoch) {}

    /// Stub function when tracing is disabled.
    pub fn log_phase_end(_phase: GcPhase, _epoch: Epoch, _objects: usize, _bytes: usize) {}

    /// Stub function when tracing is disabled.
    pub fn log_stop_the_world(_epoch: Epoch, _reason: &str) {}

    /// Stub function when tracing is disabled.
    pub fn log_resume_the_world(_epoch: Epoch, _pause: Duration) {}

    /// Stub function when tracing is disabled.
    pub fn log_thread_event(_name: &str, _event: &str) {}

    /// Stub function when tracing is disabled.
    pub fn log_mark_violation(_epoch: Epoch, _message: &str) {}

    /// Stub function when tracing is disabled.
    pub fn log_cycle_finished(_epoch: Epoch, _kept_bytes: usize, _finalizers: usize) {}
}

pub use internal::*;
