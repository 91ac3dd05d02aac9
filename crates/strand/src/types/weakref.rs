//! Weak references to generators.
//!
//! A `WeakRef` never holds a count on its target. The target keeps a list of
//! the weakrefs registered on it and clears them when it is freed, so a reused
//! arena slot is never observed through a stale reference.

use crate::heap::HeapId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeakRef {
    target: Option<HeapId>,
}

impl WeakRef {
    #[must_use]
    pub fn new(target: HeapId) -> Self {
        Self { target: Some(target) }
    }

    /// The referenced heap ID, or `None` once the target has died.
    #[must_use]
    pub fn target(&self) -> Option<HeapId> {
        self.target
    }

    pub(crate) fn clear(&mut self) {
        self.target = None;
    }
}
