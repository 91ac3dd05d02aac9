use crate::{heap::HeapId, value::Value};

/// Fixed-length sequence. Used for `*args` collections and exception arguments.
#[derive(Debug, Default)]
pub struct Tuple {
    items: Vec<Value>,
}

impl Tuple {
    #[must_use]
    pub fn new(items: Vec<Value>) -> Self {
        Self { items }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Value] {
        &self.items
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        for item in &mut self.items {
            item.dec_ref_ids(stack);
        }
    }
}
