//! The call adaptor: one entry point for every callable kind.
//!
//! Fixed-arity helpers pack their arguments into an [`ArgValues`] and go
//! through [`Runtime::call`]. Star calls first merge `*args` and `**kwargs`
//! into the explicit arguments, reporting duplicates with CPython's messages.

use std::rc::Rc;

use crate::{
    args::{ArgValues, MAX_FIXED_ARITY, PendingArgs, PendingGuard, PositionalArgs},
    defer_drop, defer_drop_mut,
    exception_private::{ExcType, RunError, RunResult},
    frame::CodeInfo,
    heap::{DropWithHeap, HeapData, HeapGuard, HeapId},
    runtime::Runtime,
    types::{Dict, DictKey, ExceptionObject, FunctionKind, GeneratorKind, Tuple, class::class_name},
    value::Value,
};

impl Runtime {
    /// Calls `callable` with an argument bundle.
    ///
    /// Functions run to completion on the current stack; generator and
    /// coroutine functions return a new unstarted object; classes construct an
    /// exception instance.
    pub fn call(&mut self, callable: &Value, args: ArgValues) -> RunResult<Value> {
        match callable {
            Value::ExcClass(_) => self.construct_exception(callable, args),
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Function(f) => {
                    let kind = f.kind.clone();
                    match kind {
                        FunctionKind::Native(native) => native(self, args),
                        FunctionKind::Function(body) => {
                            let (code, locals, closure) = self.bind_call(*id, args)?;
                            self.run_function(code, locals, closure, |rt| body(rt))
                        }
                        FunctionKind::Generator(body) => {
                            let (code, locals, closure) = self.bind_call(*id, args)?;
                            self.new_generator_object(GeneratorKind::Generator, code, body, locals, closure)
                        }
                        FunctionKind::Coroutine(body) => {
                            let (code, locals, closure) = self.bind_call(*id, args)?;
                            self.new_generator_object(GeneratorKind::Coroutine, code, body, locals, closure)
                        }
                    }
                }
                HeapData::Class(_) => self.construct_exception(callable, args),
                _ => {
                    args.drop_with_heap(&mut self.heap);
                    Err(ExcType::type_error_not_callable(&callable.type_name(&self.heap)))
                }
            },
            other => {
                args.drop_with_heap(&mut self.heap);
                Err(ExcType::type_error_not_callable(&other.type_name(&self.heap)))
            }
        }
    }

    /// Calls with no arguments.
    pub fn call0(&mut self, callable: &Value) -> RunResult<Value> {
        self.call(callable, ArgValues::Empty)
    }

    /// Calls with one positional argument.
    pub fn call1(&mut self, callable: &Value, arg: Value) -> RunResult<Value> {
        self.call(callable, ArgValues::One(arg))
    }

    /// Calls with two positional arguments.
    pub fn call2(&mut self, callable: &Value, a: Value, b: Value) -> RunResult<Value> {
        self.call(callable, ArgValues::Two(a, b))
    }

    /// Calls with a fixed number of positional arguments, up to ten.
    ///
    /// Larger arities fail to compile.
    pub fn call_n<const N: usize>(&mut self, callable: &Value, args: [Value; N]) -> RunResult<Value> {
        const { assert!(N <= MAX_FIXED_ARITY, "call_n supports at most 10 arguments") };
        self.call(callable, ArgValues::from(args))
    }

    /// Calls with explicit positional and keyword arguments.
    pub fn call_kw(&mut self, callable: &Value, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> RunResult<Value> {
        let this = self;
        let pending = PendingArgs {
            positional: args.into(),
            kwargs: Vec::with_capacity(kwargs.len()),
        };
        let mut guard: PendingGuard<'_, Runtime> = HeapGuard::new(pending, this);
        let name = guard.heap().callable_name(callable);
        for (key, value) in kwargs {
            let (pending, rt) = guard.as_parts_mut();
            if pending.kwargs.iter().any(|(k, _)| *k == key) {
                value.drop_with_heap(&mut rt.heap);
                return Err(ExcType::type_error_multiple_values(&name, &key));
            }
            pending.kwargs.push((key, value));
        }
        let (pending, rt) = guard.into_parts();
        rt.call(callable, pending.into_arg_values())
    }

    /// Calls `f(*args, *star_args, **kwargs, **star_kwargs)`.
    ///
    /// `star_args` may be a tuple, list, dict (its keys) or generator.
    /// `star_kwargs` must be a dict with string keys. A keyword given both
    /// explicitly and through `star_kwargs` is a `TypeError`.
    pub fn call_star(
        &mut self,
        callable: &Value,
        args: Vec<Value>,
        star_args: Option<Value>,
        kwargs: Vec<(String, Value)>,
        star_kwargs: Option<Value>,
    ) -> RunResult<Value> {
        let this = self;
        let name = this.callable_name(callable);
        let pending = PendingArgs {
            positional: args.into(),
            kwargs,
        };
        let mut guard: PendingGuard<'_, Runtime> = HeapGuard::new(pending, this);
        if let Some(star) = star_args {
            let (pending, rt) = guard.as_parts_mut();
            if let Err(e) = rt.extend_star_args(&name, star, &mut pending.positional) {
                star_kwargs.drop_with_heap(&mut rt.heap);
                return Err(e);
            }
        }
        if let Some(mapping) = star_kwargs {
            let (pending, rt) = guard.as_parts_mut();
            rt.merge_star_kwargs(&name, mapping, &mut pending.kwargs)?;
        }
        let (pending, rt) = guard.into_parts();
        rt.call(callable, pending.into_arg_values())
    }

    /// Name used in argument error messages.
    #[must_use]
    pub fn callable_name(&self, callable: &Value) -> String {
        match callable {
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Function(f) => f.name.clone(),
                HeapData::Class(c) => c.name.clone(),
                _ => callable.type_name(&self.heap).into_owned(),
            },
            other => class_name(other, &self.heap).into_owned(),
        }
    }

    fn extend_star_args(&mut self, name: &str, star: Value, out: &mut PositionalArgs) -> RunResult<()> {
        let this = self;
        defer_drop!(star, this);
        match star {
            Value::Ref(id) => match this.heap.get(*id) {
                HeapData::Tuple(t) => out.extend(t.as_slice().iter().map(|v| v.clone_with_heap(&this.heap))),
                HeapData::List(l) => out.extend(l.clone_items(&this.heap)),
                HeapData::Dict(d) => {
                    let keys: Vec<DictKey> = d.keys().cloned().collect();
                    for key in keys {
                        out.push(key.to_value(&mut this.heap)?);
                    }
                }
                HeapData::Generator(g) if g.kind == GeneratorKind::Generator => {
                    while let Some(item) = this.next(star)? {
                        out.push(item);
                    }
                }
                _ => return Err(ExcType::type_error_args_not_iterable(name, &star.type_name(&this.heap))),
            },
            other => return Err(ExcType::type_error_args_not_iterable(name, &other.type_name(&this.heap))),
        }
        Ok(())
    }

    fn merge_star_kwargs(&mut self, name: &str, mapping: Value, out: &mut Vec<(String, Value)>) -> RunResult<()> {
        let this = self;
        defer_drop!(mapping, this);
        let dict = match mapping {
            Value::Ref(id) => match this.heap.get(*id) {
                HeapData::Dict(dict) => dict,
                _ => return Err(ExcType::type_error_kwargs_not_mapping(name, &mapping.type_name(&this.heap))),
            },
            other => return Err(ExcType::type_error_kwargs_not_mapping(name, &other.type_name(&this.heap))),
        };
        for key in dict.keys() {
            let Some(key) = key.as_str() else {
                return Err(ExcType::type_error_kwargs_nonstring_key());
            };
            if out.iter().any(|(k, _)| k == key) {
                return Err(ExcType::type_error_multiple_values(name, key));
            }
        }
        out.extend(dict.iter().filter_map(|(key, value)| {
            key.as_str()
                .map(|key| (key.to_owned(), value.clone_with_heap(&this.heap)))
        }));
        Ok(())
    }

    /// Binds `args` against a function's signature.
    ///
    /// Returns the code object, the frame's initial local slots and a copy of
    /// the function's closure.
    fn bind_call(&mut self, func: HeapId, args: ArgValues) -> RunResult<(Rc<CodeInfo>, Vec<Value>, Vec<Value>)> {
        let HeapData::Function(f) = self.heap.get(func) else {
            args.drop_with_heap(&mut self.heap);
            return Err(RunError::internal("bind_call on a non-function"));
        };
        let code = Rc::clone(&f.code);
        let defaults: Vec<Value> = f.defaults.iter().map(|v| v.clone_with_heap(&self.heap)).collect();
        let closure: Vec<Value> = f.closure.iter().map(|v| v.clone_with_heap(&self.heap)).collect();
        let name = f.name.clone();
        let this = self;
        defer_drop!(defaults, this);
        let locals = match this.bind_args(&name, &code, defaults, args) {
            Ok(locals) => locals,
            Err(e) => {
                closure.drop_with_heap(&mut this.heap);
                return Err(e);
            }
        };
        Ok((code, locals, closure))
    }

    fn bind_args(&mut self, name: &str, code: &CodeInfo, defaults: &[Value], args: ArgValues) -> RunResult<Vec<Value>> {
        let mut slots: Vec<Value> = Vec::with_capacity(code.local_names.len());
        slots.resize_with(code.local_names.len(), || Value::Undefined);
        let this = self;
        defer_drop_mut!(slots, this);

        let (positional, kwargs) = args.into_parts();
        let given = positional.len();
        let mut extra_positional = Vec::new();
        for (i, value) in positional.enumerate() {
            if i < code.arg_count {
                slots[i] = value;
            } else {
                extra_positional.push(value);
            }
        }
        if !extra_positional.is_empty() && !code.var_args {
            extra_positional.drop_with_heap(&mut this.heap);
            kwargs.drop_with_heap(&mut this.heap);
            return Err(ExcType::type_error_too_many_positional(name, code.arg_count, given));
        }

        let mut extra_kwargs = Dict::new();
        let mut kwargs_iter = kwargs.into_iter();
        while let Some((key, value)) = kwargs_iter.next() {
            let param = code.local_names[..code.arg_count].iter().position(|n| *n == key);
            let err = match param {
                Some(i) if matches!(slots[i], Value::Undefined) => {
                    slots[i] = value;
                    continue;
                }
                Some(_) => ExcType::type_error_duplicate_arg(name, &key),
                None if code.var_kwargs => {
                    let key = DictKey::Str(key);
                    if !extra_kwargs.contains_key(&key) {
                        let replaced = extra_kwargs.insert(key, value);
                        debug_assert!(replaced.is_none());
                        continue;
                    }
                    ExcType::type_error_multiple_values(name, key.as_str().unwrap_or_default())
                }
                None => ExcType::type_error_unexpected_keyword(name, &key),
            };
            value.drop_with_heap(&mut this.heap);
            kwargs_iter.drop_with_heap(&mut this.heap);
            extra_positional.drop_with_heap(&mut this.heap);
            extra_kwargs.drop_with_heap(&mut this.heap);
            return Err(err);
        }

        // defaults cover the trailing parameters; `define_with` caps their number
        let first_default = code.arg_count - defaults.len();
        let mut missing = Vec::new();
        for (i, slot) in slots.iter_mut().enumerate().take(code.arg_count) {
            if matches!(slot, Value::Undefined) {
                if i >= first_default {
                    *slot = defaults[i - first_default].clone_with_heap(&this.heap);
                } else {
                    missing.push(code.local_names[i].as_str());
                }
            }
        }
        if !missing.is_empty() {
            extra_positional.drop_with_heap(&mut this.heap);
            extra_kwargs.drop_with_heap(&mut this.heap);
            return Err(ExcType::type_error_missing_positional_with_names(name, &missing));
        }

        if let Some(slot) = code.var_args_slot() {
            let id = this.heap.allocate(HeapData::Tuple(Tuple::new(extra_positional)))?;
            slots[slot] = Value::Ref(id);
        }
        if let Some(slot) = code.var_kwargs_slot() {
            let id = this.heap.allocate(HeapData::Dict(extra_kwargs))?;
            slots[slot] = Value::Ref(id);
        }
        Ok(std::mem::take(slots))
    }

    /// Runs a plain function body in a fresh frame.
    pub(crate) fn run_function(
        &mut self,
        code: Rc<CodeInfo>,
        locals: Vec<Value>,
        closure: Vec<Value>,
        body: impl FnOnce(&mut Self) -> RunResult<Value>,
    ) -> RunResult<Value> {
        let frame = self.make_frame(code, locals, closure)?;
        if let Err(e) = self.push_frame(frame) {
            self.heap.dec_ref(frame);
            return Err(e);
        }
        let result = body(self).map_err(|e| e.with_traceback(self.frame_ref(frame).traceback_entry()));
        self.pop_frame();
        self.heap.dec_ref(frame);
        result
    }

    /// Creates an exception instance, running the class's init hook first.
    fn construct_exception(&mut self, class: &Value, args: ArgValues) -> RunResult<Value> {
        let name = self.callable_name(class);
        let args = args.into_positional(&name, &mut self.heap)?;
        let this = self;
        defer_drop!(args, this);
        let mut cursor = class.ref_id();
        while let Some(id) = cursor {
            let HeapData::Class(c) = this.heap.get(id) else {
                break;
            };
            cursor = c.base.ref_id();
            if let Some(init) = c.init.clone() {
                init(this, args)?;
                break;
            }
        }
        let owned: Vec<Value> = args.iter().map(|v| v.clone_with_heap(&this.heap)).collect();
        let class = class.clone_with_heap(&this.heap);
        let id = this.heap.allocate(HeapData::Exception(ExceptionObject::new(class, owned)))?;
        Ok(Value::Ref(id))
    }
}
