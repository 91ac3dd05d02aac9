use crate::{heap::HeapId, value::Value};

/// A shared mutable slot, captured by closures and generator bodies.
///
/// Bodies that need state to survive a forced unwind keep it here instead of
/// in Rust locals: the cell is owned by the heap, not by the fiber stack.
#[derive(Debug)]
pub struct Cell {
    value: Value,
}

impl Cell {
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    #[must_use]
    pub fn get(&self) -> &Value {
        &self.value
    }

    /// Stores a new value, returning the previous one for the caller to release.
    #[must_use]
    pub fn replace(&mut self, value: Value) -> Value {
        std::mem::replace(&mut self.value, value)
    }

    pub(crate) fn dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        self.value.dec_ref_ids(stack);
    }
}
