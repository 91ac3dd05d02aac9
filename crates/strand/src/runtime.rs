//! The runtime: heap, frame stack, exception state and configuration.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::{
    args::ArgValues,
    exc_state::{DEFAULT_NORMALIZE_BUDGET, ExceptionState},
    exception_private::{ExcTriple, ExcType, ExcValue, RunError, RunResult},
    exception_public::Exception,
    fiber::{LocalStackPool, StackPool},
    frame::CodeInfo,
    generator::{ClosePolicy, GeneratorScope},
    heap::{ContainsHeap, DropWithHeap, Heap, HeapData, HeapId, HeapStats},
    object::Object,
    resource::ResourceLimits,
    tracer::{EngineTracer, NoopTracer},
    types::{
        Cell, ClassInit, ClassObject, Dict, DictKey, Function, FunctionKind, List, Str, Tuple, WeakRef,
        class::is_exception_class,
    },
    value::Value,
};

/// Default fiber stack size: 1 MiB.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Runtime settings.
///
/// Deserializable so hosts can keep it in their own config files; every field
/// falls back to its default when missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Bytes of stack given to each fiber.
    pub stack_size: usize,
    pub close_policy: ClosePolicy,
    /// Replacement rounds allowed while normalizing one exception.
    pub normalize_budget: usize,
    pub limits: ResourceLimits,
    /// Initial arena capacity.
    pub heap_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            close_policy: ClosePolicy::default(),
            normalize_budget: DEFAULT_NORMALIZE_BUDGET,
            limits: ResourceLimits::new(),
            heap_capacity: 64,
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    #[must_use]
    pub fn close_policy(mut self, policy: ClosePolicy) -> Self {
        self.close_policy = policy;
        self
    }

    #[must_use]
    pub fn normalize_budget(mut self, rounds: usize) -> Self {
        self.normalize_budget = rounds;
        self
    }

    #[must_use]
    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub fn heap_capacity(mut self, capacity: usize) -> Self {
        self.heap_capacity = capacity;
        self
    }
}

/// One engine instance.
///
/// Everything a generator body can touch lives here. A runtime is
/// single-threaded; separate threads use separate runtimes, optionally
/// sharing a [`SharedStackPool`](crate::SharedStackPool).
pub struct Runtime {
    pub(crate) heap: Heap,
    /// Innermost active frame.
    pub(crate) frame: Option<HeapId>,
    pub(crate) depth: usize,
    pub(crate) exc_state: ExceptionState,
    pub(crate) config: RuntimeConfig,
    pub(crate) tracer: Box<dyn EngineTracer>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("heap", &self.heap)
            .field("depth", &self.depth)
            .field("config", &self.config)
            .field("tracer", &self.tracer)
            .finish_non_exhaustive()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.run_finalizers();
        let state = self.fetch_exception();
        state.drop_with_heap(&mut self.heap);
    }
}

impl ContainsHeap for Runtime {
    #[inline]
    fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }
}

impl Runtime {
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        let tracker = config.limits.clone().into_tracker();
        let heap = Heap::new(config.heap_capacity, tracker, Box::new(LocalStackPool::default()));
        Self {
            heap,
            frame: None,
            depth: 0,
            exc_state: ExceptionState::default(),
            config,
            tracer: Box::new(NoopTracer),
        }
    }

    #[must_use]
    pub fn with_tracer(mut self, tracer: impl EngineTracer + 'static) -> Self {
        self.tracer = Box::new(tracer);
        self
    }

    /// Uses `pool` for fiber stacks instead of the runtime's private cache.
    #[must_use]
    pub fn with_stack_pool(mut self, pool: impl StackPool + 'static) -> Self {
        drop(self.heap.replace_stack_pool(Box::new(pool)));
        self
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Changes what `close()` does from now on.
    pub fn set_close_policy(&mut self, policy: ClosePolicy) {
        self.config.close_policy = policy;
    }

    #[must_use]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.heap_stats()
    }

    /// Releases a value (or anything else holding values) owned by the host.
    ///
    /// Dropping the last reference to a suspended generator closes it first, so
    /// the body's cleanup runs under [`ClosePolicy::Unwind`].
    pub fn drop_value(&mut self, value: impl DropWithHeap) {
        value.drop_with_heap(&mut self.heap);
        self.run_finalizers();
    }

    /// A new reference to the same value.
    #[must_use]
    pub fn clone_value(&self, value: &Value) -> Value {
        value.clone_with_heap(&self.heap)
    }

    /// Detached copy of `value` for the host.
    #[must_use]
    pub fn to_object(&self, value: &Value) -> Object {
        Object::from_value(value, &self.heap)
    }

    /// Allocates `object` on the heap.
    pub fn from_object(&mut self, object: &Object) -> RunResult<Value> {
        object.to_value(self)
    }

    /// `repr()` of a value.
    #[must_use]
    pub fn repr(&self, value: &Value) -> String {
        value.py_repr(&self.heap)
    }

    /// Detaches an error from this runtime's heap.
    #[must_use]
    pub fn into_exception(&mut self, err: RunError) -> Exception {
        err.into_exception(&mut self.heap)
    }

    // ============================================================
    // Allocation
    // ============================================================

    pub fn new_str(&mut self, s: impl Into<String>) -> RunResult<Value> {
        let id = self.heap.allocate(HeapData::Str(Str::new(s.into())))?;
        Ok(Value::Ref(id))
    }

    pub fn new_tuple(&mut self, items: Vec<Value>) -> RunResult<Value> {
        let id = self.heap.allocate(HeapData::Tuple(Tuple::new(items)))?;
        Ok(Value::Ref(id))
    }

    pub fn new_list(&mut self, items: Vec<Value>) -> RunResult<Value> {
        let id = self.heap.allocate(HeapData::List(List::new(items)))?;
        Ok(Value::Ref(id))
    }

    /// Builds a dict from string-keyed entries. Later duplicates win.
    pub fn new_dict(&mut self, entries: Vec<(String, Value)>) -> RunResult<Value> {
        let mut dict = Dict::new();
        for (key, value) in entries {
            let old = dict.insert(DictKey::Str(key), value);
            old.drop_with_heap(&mut self.heap);
        }
        let id = self.heap.allocate(HeapData::Dict(dict))?;
        Ok(Value::Ref(id))
    }

    /// Appends to a list, e.g. from a generator body recording what it saw.
    pub fn list_push(&mut self, list: &Value, item: Value) -> RunResult<()> {
        match list {
            Value::Ref(id) if matches!(self.heap.get(*id), HeapData::List(_)) => {
                if let HeapData::List(l) = self.heap.get_mut(*id) {
                    l.push(item);
                }
                Ok(())
            }
            other => {
                let type_name = other.type_name(&self.heap);
                item.drop_with_heap(&mut self.heap);
                Err(ExcType::type_error(format!("'{type_name}' object has no attribute 'append'")))
            }
        }
    }

    pub fn new_cell(&mut self, value: Value) -> RunResult<Value> {
        let id = self.heap.allocate(HeapData::Cell(Cell::new(value)))?;
        Ok(Value::Ref(id))
    }

    pub fn cell_get(&self, cell: &Value) -> RunResult<Value> {
        match cell {
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Cell(c) => Ok(c.get().clone_with_heap(&self.heap)),
                _ => Err(ExcType::type_error("expected a cell")),
            },
            _ => Err(ExcType::type_error("expected a cell")),
        }
    }

    pub fn cell_set(&mut self, cell: &Value, value: Value) -> RunResult<()> {
        let Some(id) = cell.ref_id().filter(|id| matches!(self.heap.get(*id), HeapData::Cell(_))) else {
            value.drop_with_heap(&mut self.heap);
            return Err(ExcType::type_error("expected a cell"));
        };
        let old = match self.heap.get_mut(id) {
            HeapData::Cell(c) => c.replace(value),
            _ => return Err(RunError::internal("cell vanished")),
        };
        old.drop_with_heap(&mut self.heap);
        Ok(())
    }

    /// Defines a callable for `code`. See [`define_with`](Self::define_with).
    pub fn define(&mut self, code: CodeInfo, kind: FunctionKind) -> RunResult<Value> {
        self.define_with(code, kind, Vec::new(), Vec::new())
    }

    /// Defines a callable with default values for its trailing parameters and
    /// closure values its frames can read.
    ///
    /// There may be at most as many defaults as positional parameters.
    pub fn define_with(
        &mut self,
        code: CodeInfo,
        kind: FunctionKind,
        defaults: Vec<Value>,
        closure: Vec<Value>,
    ) -> RunResult<Value> {
        if defaults.len() > code.arg_count {
            let err = ExcType::type_error(format!(
                "{}() has {} defaults but only {} positional parameters",
                code.qualname,
                defaults.len(),
                code.arg_count
            ));
            defaults.drop_with_heap(&mut self.heap);
            closure.drop_with_heap(&mut self.heap);
            return Err(err);
        }
        let mut function = Function::new(Rc::new(code), kind);
        function.defaults = defaults;
        function.closure = closure;
        let id = self.heap.allocate(HeapData::Function(function))?;
        Ok(Value::Ref(id))
    }

    /// Defines a generator function: calling it returns a new generator.
    pub fn generator_function(
        &mut self,
        code: CodeInfo,
        body: impl Fn(&mut GeneratorScope<'_>) -> RunResult<Value> + 'static,
    ) -> RunResult<Value> {
        self.define(code, FunctionKind::Generator(Rc::new(body)))
    }

    /// Defines a coroutine function: calling it returns a new coroutine.
    pub fn coroutine_function(
        &mut self,
        code: CodeInfo,
        body: impl Fn(&mut GeneratorScope<'_>) -> RunResult<Value> + 'static,
    ) -> RunResult<Value> {
        self.define(code, FunctionKind::Coroutine(Rc::new(body)))
    }

    /// Defines a plain function that runs in its own frame.
    pub fn function(
        &mut self,
        code: CodeInfo,
        body: impl Fn(&mut Self) -> RunResult<Value> + 'static,
    ) -> RunResult<Value> {
        self.define(code, FunctionKind::Function(Rc::new(body)))
    }

    /// Defines a host function that receives its raw arguments.
    pub fn native(
        &mut self,
        name: &str,
        f: impl Fn(&mut Self, ArgValues) -> RunResult<Value> + 'static,
    ) -> RunResult<Value> {
        self.define(CodeInfo::new(name), FunctionKind::Native(Rc::new(f)))
    }

    /// Defines an exception class deriving from `base` (a builtin or another class).
    pub fn new_exception_class(&mut self, name: &str, base: Value, init: Option<ClassInit>) -> RunResult<Value> {
        if !is_exception_class(&base, &self.heap) {
            let type_name = base.type_name(&self.heap).into_owned();
            base.drop_with_heap(&mut self.heap);
            return Err(ExcType::type_error(format!(
                "exception classes must derive from BaseException, not '{type_name}'"
            )));
        }
        let id = self.heap.allocate(HeapData::Class(ClassObject::new(name, base, init)))?;
        Ok(Value::Ref(id))
    }

    /// An error of class `class` with an optional message, not yet normalized.
    #[must_use]
    pub fn make_error(&self, class: &Value, message: Option<&str>) -> RunError {
        let value = match message {
            Some(m) => ExcValue::Message(m.to_owned()),
            None => ExcValue::Absent,
        };
        ExcTriple::new(class.clone_with_heap(&self.heap), value).into()
    }

    /// Creates a weak reference to a generator or coroutine.
    pub fn weakref(&mut self, target: &Value) -> RunResult<Value> {
        let target_id = self.expect_generator(target).map_err(|_| {
            ExcType::type_error(format!(
                "cannot create weak reference to '{}' object",
                target.type_name(&self.heap)
            ))
        })?;
        // forget weakrefs that died (or whose slot now holds something else)
        let mut registered = std::mem::take(&mut self.generator_mut(target_id).weakrefs);
        registered.retain(|&w| {
            matches!(self.heap.get_if_live(w), Some(HeapData::WeakRef(wr)) if wr.target() == Some(target_id))
        });
        let allocated = self.heap.allocate(HeapData::WeakRef(WeakRef::new(target_id)));
        let g = self.generator_mut(target_id);
        g.weakrefs = registered;
        let id = allocated?;
        g.weakrefs.push(id);
        Ok(Value::Ref(id))
    }

    /// Dereferences a weak reference: a new strong reference, or `None` once the target died.
    pub fn weakref_get(&self, weakref: &Value) -> RunResult<Option<Value>> {
        match weakref {
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::WeakRef(w) => Ok(w.target().map(|target| {
                    self.heap.inc_ref(target);
                    Value::Ref(target)
                })),
                _ => Err(ExcType::type_error("expected a weakref")),
            },
            _ => Err(ExcType::type_error("expected a weakref")),
        }
    }
}
