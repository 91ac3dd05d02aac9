//! Per-runtime "currently handled exception" state.
//!
//! Generators get their own view of this state: on resume the caller's state
//! is parked in the generator's frame and the generator's saved state is
//! installed; on suspend the two are swapped back. Neither side ever observes
//! the other's handled exception.

use crate::{
    args::ArgValues,
    exception_private::{ExcTriple, ExcType, ExcValue, RunError, RunResult, SimpleException},
    heap::{DropWithHeap, HeapData, HeapId},
    runtime::Runtime,
    types::{
        Str,
        class::{class_name, is_exception_class, is_subclass},
        exception::class_of,
    },
    value::Value,
};

/// Default number of replacement rounds the normalizer allows.
pub const DEFAULT_NORMALIZE_BUDGET: usize = 32;

/// The exception currently being handled. Either fully set or fully unset.
#[derive(Debug, Default)]
pub(crate) struct ExceptionState {
    current: Option<ExcTriple>,
}

impl Runtime {
    /// Removes and returns the current exception state, leaving it empty.
    pub fn fetch_exception(&mut self) -> Option<ExcTriple> {
        self.exc_state.current.take()
    }

    /// Installs `state` as the current exception, releasing whatever was there.
    pub fn restore_exception(&mut self, state: Option<ExcTriple>) {
        let old = std::mem::replace(&mut self.exc_state.current, state);
        old.drop_with_heap(&mut self.heap);
    }

    /// The current exception, without taking it.
    #[must_use]
    pub fn current_exception(&self) -> Option<&ExcTriple> {
        self.exc_state.current.as_ref()
    }

    /// Turns `(type, value)` into `(type, instance)` by calling the type.
    ///
    /// If constructing the instance raises, the new exception replaces the one
    /// being normalized and normalization starts over. After the configured
    /// budget of replacements the result is an uncatchable `RecursionError`.
    /// Uncatchable errors raised during construction are returned as-is.
    pub fn normalize_exception(&mut self, triple: ExcTriple) -> RunResult<ExcTriple> {
        let mut triple = triple;
        for _ in 0..self.config.normalize_budget {
            if !is_exception_class(&triple.exc_type, &self.heap) {
                let type_name = triple.exc_type.type_name(&self.heap).into_owned();
                triple.drop_with_heap(&mut self.heap);
                return Err(ExcType::type_error_not_exception(&type_name));
            }
            if let ExcValue::Object(value) = &triple.value
                && let Some(class) = class_of(value, &self.heap)
                && is_subclass(class, &triple.exc_type, &self.heap)
            {
                // an instance of the type (or a subclass): adopt its exact class
                let class = class.clone_with_heap(&self.heap);
                let old = std::mem::replace(&mut triple.exc_type, class);
                old.drop_with_heap(&mut self.heap);
                return Ok(triple);
            }
            let value = std::mem::replace(&mut triple.value, ExcValue::Absent);
            let args = match self.exception_args(value) {
                Ok(args) => args,
                Err(e) => {
                    triple.drop_with_heap(&mut self.heap);
                    return Err(e);
                }
            };
            match self.call(&triple.exc_type, args) {
                Ok(instance) => {
                    triple.value = ExcValue::Object(instance);
                    return Ok(triple);
                }
                Err(RunError::Exc(replacement)) => {
                    triple.drop_with_heap(&mut self.heap);
                    triple = *replacement;
                }
                Err(other) => {
                    triple.drop_with_heap(&mut self.heap);
                    return Err(other);
                }
            }
        }
        triple.drop_with_heap(&mut self.heap);
        Err(RunError::uncatchable(SimpleException::new_msg(
            ExcType::RecursionError,
            "maximum recursion depth exceeded while normalizing an exception",
        )))
    }

    /// Constructor arguments for an unnormalized exception value.
    fn exception_args(&mut self, value: ExcValue) -> RunResult<ArgValues> {
        Ok(match value {
            ExcValue::Absent => ArgValues::Empty,
            ExcValue::Message(msg) => {
                let id = self.heap.allocate(HeapData::Str(Str::from(msg)))?;
                ArgValues::One(Value::Ref(id))
            }
            ExcValue::Object(value) => {
                if let Value::Ref(id) = &value
                    && let HeapData::Tuple(t) = self.heap.get(*id)
                {
                    let items: Vec<Value> = t.as_slice().iter().map(|v| v.clone_with_heap(&self.heap)).collect();
                    value.drop_with_heap(&mut self.heap);
                    ArgValues::from(items)
                } else {
                    ArgValues::One(value)
                }
            }
        })
    }

    /// Parks the current exception state in `frame`, leaving the runtime's empty.
    ///
    /// A frame that already holds parked state keeps it.
    pub(crate) fn preserve_for_frame(&mut self, frame: HeapId) {
        if self.frame_ref(frame).preserved_exc.is_some() {
            return;
        }
        let state = self.exc_state.current.take();
        let had = state.is_some();
        self.frame_mut(frame).preserved_exc = Some(state);
        if let HeapData::Frame(f) = self.heap.get(frame) {
            self.tracer.on_exception_preserve(&f.code().name, had);
        }
    }

    /// Reinstalls the state parked by [`preserve_for_frame`](Self::preserve_for_frame).
    ///
    /// Does nothing if nothing was parked.
    pub(crate) fn restore_from_frame(&mut self, frame: HeapId) {
        let Some(state) = self.frame_mut(frame).preserved_exc.take() else {
            return;
        };
        let had = state.is_some();
        self.restore_exception(state);
        if let HeapData::Frame(f) = self.heap.get(frame) {
            self.tracer.on_exception_restore(&f.code().name, had);
        }
    }

    /// `except` matching: is `exc` (a class or an instance) covered by `target`?
    ///
    /// `target` is a class or a tuple of classes. Anything else in `target` is a
    /// `TypeError`.
    pub fn exception_matches(&self, exc: &Value, target: &Value) -> RunResult<bool> {
        let class = class_of(exc, &self.heap).unwrap_or(exc);
        if let Value::Ref(id) = target
            && let HeapData::Tuple(t) = self.heap.get(*id)
        {
            for member in t.as_slice() {
                if self.exception_matches(class, member)? {
                    return Ok(true);
                }
            }
            return Ok(false);
        }
        if !is_exception_class(target, &self.heap) {
            return Err(ExcType::type_error_bad_except_clause());
        }
        Ok(is_subclass(class, target, &self.heap))
    }

    /// Whether a raised error would be caught by `except target`.
    ///
    /// Uncatchable and internal errors never match.
    pub fn error_matches(&self, err: &RunError, target: &Value) -> RunResult<bool> {
        match err {
            RunError::Exc(exc) => self.exception_matches(&exc.exc_type, target),
            _ => Ok(false),
        }
    }

    /// Display name of an exception class or instance.
    #[must_use]
    pub fn exception_name(&self, exc: &Value) -> String {
        let class = class_of(exc, &self.heap).unwrap_or(exc);
        class_name(class, &self.heap).into_owned()
    }
}
