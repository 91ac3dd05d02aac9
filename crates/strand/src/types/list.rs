use crate::{
    heap::{Heap, HeapId},
    value::Value,
};

/// Growable sequence.
///
/// Lists are what generator bodies most often accumulate into, so the type
/// exposes `push` directly; ownership of the pushed value moves into the list.
#[derive(Debug, Default)]
pub struct List {
    items: Vec<Value>,
}

impl List {
    #[must_use]
    pub fn new(items: Vec<Value>) -> Self {
        Self { items }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Value] {
        &self.items
    }

    pub fn push(&mut self, value: Value) {
        self.items.push(value);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Clones every element, taking a new reference for each heap value.
    #[must_use]
    pub fn clone_items(&self, heap: &Heap) -> Vec<Value> {
        self.items.iter().map(|v| v.clone_with_heap(heap)).collect()
    }

    pub(crate) fn dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        for item in &mut self.items {
            item.dec_ref_ids(stack);
        }
    }
}
