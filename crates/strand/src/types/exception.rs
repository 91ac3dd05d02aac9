use crate::{
    heap::{Heap, HeapData, HeapId},
    value::Value,
};

/// A normalized exception instance: its class and constructor arguments.
#[derive(Debug)]
pub struct ExceptionObject {
    class: Value,
    args: Vec<Value>,
}

impl ExceptionObject {
    #[must_use]
    pub fn new(class: Value, args: Vec<Value>) -> Self {
        Self { class, args }
    }

    #[must_use]
    pub fn class(&self) -> &Value {
        &self.class
    }

    #[must_use]
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub(crate) fn dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        self.class.dec_ref_ids(stack);
        for arg in &mut self.args {
            arg.dec_ref_ids(stack);
        }
    }
}

/// The class of an exception instance, if `value` is one.
#[must_use]
pub fn class_of<'h>(value: &Value, heap: &'h Heap) -> Option<&'h Value> {
    match value {
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Exception(e) => Some(e.class()),
            _ => None,
        },
        _ => None,
    }
}

/// `str()` of an exception value: the single string argument, or the repr of the args.
#[must_use]
pub fn message_of(value: &Value, heap: &Heap) -> Option<String> {
    let Value::Ref(id) = value else {
        return Some(value.py_repr(heap));
    };
    match heap.get(*id) {
        HeapData::Exception(e) => match e.args() {
            [] => None,
            [single] => Some(single.as_str(heap).map_or_else(|| single.py_repr(heap), str::to_owned)),
            many => {
                let parts: Vec<String> = many.iter().map(|v| v.py_repr(heap)).collect();
                Some(format!("({})", parts.join(", ")))
            }
        },
        HeapData::Str(s) => Some(s.as_str().to_owned()),
        _ => Some(value.py_repr(heap)),
    }
}
