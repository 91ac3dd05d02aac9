use std::{borrow::Cow, fmt::Write};

use crate::{
    exception_private::ExcType,
    heap::{Heap, HeapData, HeapId},
    types::{FunctionKind, GeneratorKind, class::class_name},
};

/// Primary value type flowing through generator bodies, frames and calls.
///
/// Small immediate values (Int, Bool, None, builtin exception classes) are stored
/// inline, while everything else lives in the heap arena and is referenced via
/// `Ref(HeapId)`.
///
/// NOTE: `Clone` is intentionally NOT derived. Use `clone_with_heap()` for heap values
/// or `clone_immediate()` for immediate values only. Direct cloning would bypass
/// reference counting and cause memory leaks.
#[derive(Debug)]
pub enum Value {
    /// Unassigned frame slot.
    Undefined,
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// A builtin exception class such as `ValueError`.
    ExcClass(ExcType),

    // Heap-allocated values (stored in arena)
    Ref(HeapId),

    /// Sentinel value indicating this Value was properly cleaned up via `drop_with_heap`.
    /// Only exists when `ref-count-panic` feature is enabled.
    #[cfg(feature = "ref-count-panic")]
    Dereferenced,
}

/// Drop implementation that panics if a `Ref` variant is dropped without calling `drop_with_heap`.
/// This helps catch reference counting bugs during development/testing.
/// Only enabled when the `ref-count-panic` feature is active.
#[cfg(feature = "ref-count-panic")]
impl Drop for Value {
    fn drop(&mut self) {
        if let Self::Ref(id) = self {
            panic!("Value::Ref({id:?}) dropped without calling drop_with_heap() - this is a reference counting bug");
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<ExcType> for Value {
    fn from(v: ExcType) -> Self {
        Self::ExcClass(v)
    }
}

impl Value {
    /// Clones the value, incrementing the reference count for heap values.
    ///
    /// This method MUST be used instead of a derived `Clone` to keep reference
    /// counts correct.
    #[must_use]
    pub fn clone_with_heap(&self, heap: &Heap) -> Self {
        match self {
            Self::Ref(id) => {
                heap.inc_ref(*id);
                Self::Ref(*id)
            }
            other => other.clone_immediate(),
        }
    }

    /// Drops a value, decrementing its heap reference count if applicable.
    #[cfg(not(feature = "ref-count-panic"))]
    #[inline]
    pub fn drop_with_heap(self, heap: &mut Heap) {
        if let Self::Ref(id) = self {
            heap.dec_ref(id);
        }
    }

    /// With `ref-count-panic` enabled, `Ref` variants are replaced with `Dereferenced` and
    /// the original is forgotten to prevent the Drop impl from panicking.
    #[cfg(feature = "ref-count-panic")]
    pub fn drop_with_heap(mut self, heap: &mut Heap) {
        let old = std::mem::replace(&mut self, Self::Dereferenced);
        if let Self::Ref(id) = &old {
            heap.dec_ref(*id);
            std::mem::forget(old);
        }
    }

    /// Copies an immediate value.
    ///
    /// # Panics
    /// Panics on `Ref`; those must go through `clone_with_heap`.
    #[must_use]
    pub fn clone_immediate(&self) -> Self {
        match self {
            Self::Undefined => Self::Undefined,
            Self::None => Self::None,
            Self::Bool(b) => Self::Bool(*b),
            Self::Int(v) => Self::Int(*v),
            Self::Float(v) => Self::Float(*v),
            Self::ExcClass(t) => Self::ExcClass(*t),
            Self::Ref(_) => panic!("Ref clones must go through clone_with_heap to maintain refcounts"),
            #[cfg(feature = "ref-count-panic")]
            Self::Dereferenced => panic!("Cannot clone Dereferenced object"),
        }
    }

    /// Reports this value's heap reference to a freeing parent.
    pub(crate) fn dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        if let Self::Ref(id) = self {
            stack.push(*id);
            // Mark as Dereferenced to prevent Drop panic
            #[cfg(feature = "ref-count-panic")]
            self.dec_ref_forget();
        }
    }

    /// Replaces the value with `Dereferenced` without running its drop check.
    #[cfg(feature = "ref-count-panic")]
    pub fn dec_ref_forget(&mut self) {
        let old = std::mem::replace(self, Self::Dereferenced);
        std::mem::forget(old);
    }

    /// Moves the value out, leaving `Undefined` behind.
    #[must_use]
    pub fn take(&mut self) -> Self {
        std::mem::replace(self, Self::Undefined)
    }

    /// Returns the heap ID if this is a heap reference.
    #[must_use]
    pub fn ref_id(&self) -> Option<HeapId> {
        match self {
            Self::Ref(id) => Some(*id),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Returns the string content if this is a `str`.
    #[must_use]
    pub fn as_str<'h>(&self, heap: &'h Heap) -> Option<&'h str> {
        match self {
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => Some(s.as_str()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Python-style type name, as used in error messages.
    #[must_use]
    pub fn type_name(&self, heap: &Heap) -> Cow<'static, str> {
        let name = match self {
            Self::Undefined => "undefined",
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::ExcClass(_) => "type",
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(_) => "str",
                HeapData::Tuple(_) => "tuple",
                HeapData::List(_) => "list",
                HeapData::Dict(_) => "dict",
                HeapData::Cell(_) => "cell",
                HeapData::WeakRef(_) => "weakref",
                HeapData::Function(f) => match f.kind {
                    FunctionKind::Native(_) => "builtin_function_or_method",
                    _ => "function",
                },
                HeapData::Class(_) => "type",
                HeapData::Exception(e) => return Cow::Owned(class_name(e.class(), heap).into_owned()),
                HeapData::Frame(_) => "frame",
                HeapData::Generator(g) => match g.kind {
                    GeneratorKind::Generator => "generator",
                    GeneratorKind::Coroutine => "coroutine",
                },
            },
            #[cfg(feature = "ref-count-panic")]
            Self::Dereferenced => "dereferenced",
        };
        Cow::Borrowed(name)
    }

    /// Python-style `repr()` of the value, used by tracers and diagnostics.
    #[must_use]
    pub fn py_repr(&self, heap: &Heap) -> String {
        let mut out = String::new();
        self.repr_fmt(heap, &mut out, 0);
        out
    }

    fn repr_fmt(&self, heap: &Heap, out: &mut String, depth: usize) {
        if depth > MAX_REPR_DEPTH {
            out.push_str("...");
            return;
        }
        match self {
            Self::Undefined => out.push_str("<undefined>"),
            Self::None => out.push_str("None"),
            Self::Bool(true) => out.push_str("True"),
            Self::Bool(false) => out.push_str("False"),
            Self::Int(i) => {
                let _ = write!(out, "{i}");
            }
            Self::Float(v) => {
                if v.fract() == 0.0 && v.is_finite() {
                    let _ = write!(out, "{v:.1}");
                } else {
                    let _ = write!(out, "{v}");
                }
            }
            Self::ExcClass(t) => {
                let _ = write!(out, "<class '{t}'>");
            }
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => {
                    let _ = write!(out, "'{}'", s.as_str().replace('\'', "\\'"));
                }
                HeapData::Tuple(t) => {
                    out.push('(');
                    seq_repr(t.as_slice(), heap, out, depth);
                    if t.as_slice().len() == 1 {
                        out.push(',');
                    }
                    out.push(')');
                }
                HeapData::List(l) => {
                    out.push('[');
                    seq_repr(l.as_slice(), heap, out, depth);
                    out.push(']');
                }
                HeapData::Dict(d) => {
                    out.push('{');
                    for (i, (k, v)) in d.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        let _ = write!(out, "{k}: ");
                        v.repr_fmt(heap, out, depth + 1);
                    }
                    out.push('}');
                }
                HeapData::Exception(e) => {
                    out.push_str(&class_name(e.class(), heap));
                    out.push('(');
                    seq_repr(e.args(), heap, out, depth);
                    out.push(')');
                }
                HeapData::Function(f) => {
                    let _ = write!(out, "<function {}>", f.name);
                }
                HeapData::Class(c) => {
                    let _ = write!(out, "<class '{}'>", c.name);
                }
                HeapData::Generator(g) => {
                    let _ = write!(out, "<{} object {}>", self.type_name(heap), g.qualname);
                }
                HeapData::Frame(f) => {
                    let _ = write!(out, "<frame of {}, line {}>", f.code().name, f.line());
                }
                HeapData::Cell(_) => out.push_str("<cell>"),
                HeapData::WeakRef(w) => match w.target() {
                    Some(_) => out.push_str("<weakref; alive>"),
                    None => out.push_str("<weakref; dead>"),
                },
            },
            #[cfg(feature = "ref-count-panic")]
            Self::Dereferenced => out.push_str("<dereferenced>"),
        }
    }
}

const MAX_REPR_DEPTH: usize = 32;

fn seq_repr(items: &[Value], heap: &Heap, out: &mut String, depth: usize) {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        item.repr_fmt(heap, out, depth + 1);
    }
}
