//! Post-mark heap verification.
//!
//! After marking completes, every object reachable from a marked object must
//! itself be marked. A violation means the marker missed a live object and
//! the sweep that follows would free it while still referenced.

use std::fmt;

use crate::config::RuntimeAssertsMode;

/// Read-only view of the object graph used by verification.
///
/// Implementations expose object identity, the mark bit and outgoing
/// references. The view never hands out ownership of objects.
pub trait ObjectGraph {
    /// Opaque object reference.
    type Ref: Copy + fmt::Debug + Eq;

    /// Calls `f` for every object currently in the heap.
    fn for_each_object(&self, f: &mut dyn FnMut(Self::Ref));

    /// Whether `object` carries the mark of the current epoch.
    fn is_marked(&self, object: Self::Ref) -> bool;

    /// Whether `object` lives in the collected heap. References to permanent
    /// or stack-allocated objects are exempt from the check.
    fn is_heap_object(&self, _object: Self::Ref) -> bool {
        true
    }

    /// Calls `f` for every reference stored in the fields of `object`.
    fn for_each_referred(&self, object: Self::Ref, f: &mut dyn FnMut(Self::Ref));
}

/// A marked object holding a reference to an unmarked heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkViolation<R> {
    /// The marked object.
    pub object: R,
    /// The unmarked object it references.
    pub field: R,
}

impl<R: fmt::Debug> fmt::Display for MarkViolation<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "field {:?} of an alive object {:?} must be alive",
            self.field, self.object
        )
    }
}

impl<R: fmt::Debug> std::error::Error for MarkViolation<R> {}

/// Checks that no marked object references an unmarked heap object.
///
/// Does nothing when `mode` is [`RuntimeAssertsMode::Ignore`]. Returns the
/// first violation found otherwise.
///
/// # Errors
///
/// Returns a [`MarkViolation`] naming the offending pair of objects.
pub fn check_mark_correctness<G: ObjectGraph + ?Sized>(
    graph: &G,
    mode: RuntimeAssertsMode,
) -> Result<(), MarkViolation<G::Ref>> {
    if !mode.is_enabled() {
        return Ok(());
    }
    let mut violation = None;
    graph.for_each_object(&mut |object| {
        if violation.is_some() || !graph.is_marked(object) {
            return;
        }
        graph.for_each_referred(object, &mut |field| {
            if violation.is_none() && graph.is_heap_object(field) && !graph.is_marked(field) {
                violation = Some(MarkViolation { object, field });
            }
        });
    });
    violation.map_or(Ok(()), Err)
}
