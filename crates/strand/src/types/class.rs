//! User-defined exception classes.
//!
//! A class always bottoms out in a builtin [`ExcType`]; the helpers here walk the
//! `base` chain for naming, builtin mapping and subclass checks.

use std::{borrow::Cow, fmt, rc::Rc};

use crate::{
    exception_private::{ExcType, RunResult},
    heap::{Heap, HeapData, HeapId},
    runtime::Runtime,
    value::Value,
};

/// Hook run with the constructor arguments before an instance is created.
///
/// Returning an error aborts construction; the error becomes what the caller
/// (or the exception normalizer) observes instead.
pub type ClassInit = Rc<dyn Fn(&mut Runtime, &[Value]) -> RunResult<()>>;

pub struct ClassObject {
    pub name: String,
    /// `Value::ExcClass` or a reference to another `ClassObject`.
    pub(crate) base: Value,
    pub(crate) init: Option<ClassInit>,
}

impl fmt::Debug for ClassObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassObject")
            .field("name", &self.name)
            .field("base", &self.base)
            .field("init", &self.init.is_some())
            .finish()
    }
}

impl ClassObject {
    #[must_use]
    pub fn new(name: impl Into<String>, base: Value, init: Option<ClassInit>) -> Self {
        Self {
            name: name.into(),
            base,
            init,
        }
    }

    #[must_use]
    pub fn base(&self) -> &Value {
        &self.base
    }

    pub(crate) fn dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        self.base.dec_ref_ids(stack);
    }
}

/// Name of an exception class, falling back to the value's type name for non-classes.
#[must_use]
pub fn class_name<'h>(class: &Value, heap: &'h Heap) -> Cow<'h, str> {
    match class {
        Value::ExcClass(t) => {
            let name: &'static str = (*t).into();
            Cow::Borrowed(name)
        }
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Class(c) => Cow::Borrowed(c.name.as_str()),
            _ => class.type_name(heap),
        },
        other => other.type_name(heap),
    }
}

/// The builtin exception type a class derives from, or `None` if `class` is not an exception class.
#[must_use]
pub fn builtin_base_of(class: &Value, heap: &Heap) -> Option<ExcType> {
    let mut current = class;
    loop {
        match current {
            Value::ExcClass(t) => return Some(*t),
            Value::Ref(id) => match heap.get(*id) {
                HeapData::Class(c) => current = &c.base,
                _ => return None,
            },
            _ => return None,
        }
    }
}

#[must_use]
pub fn is_exception_class(value: &Value, heap: &Heap) -> bool {
    builtin_base_of(value, heap).is_some()
}

/// True when `class` is `of` or derives from it.
#[must_use]
pub fn is_subclass(class: &Value, of: &Value, heap: &Heap) -> bool {
    let mut current = class;
    loop {
        match (current, of) {
            (Value::ExcClass(a), Value::ExcClass(b)) => return a.is_subclass_of(*b),
            (Value::Ref(a), Value::Ref(b)) if a == b => return true,
            (Value::Ref(id), _) => match heap.get(*id) {
                HeapData::Class(c) => current = &c.base,
                _ => return false,
            },
            _ => return false,
        }
    }
}
