//! Driving generators and coroutines.
//!
//! Every resumption follows the same sequence:
//!
//! 1. link the generator's frame on top of the caller's,
//! 2. park the caller's handled exception in that frame and install the
//!    generator's own,
//! 3. switch to the fiber with the send value or the exception to throw,
//! 4. on the way back, save the body's handled exception, unlink the frame
//!    and reinstall the caller's.
//!
//! A generator that returns or raises is finished on the spot: its fiber
//! stack goes back to the pool and its frame is released.

use std::{ptr::NonNull, rc::Rc};

use corosensei::CoroutineResult;
use serde::{Deserialize, Serialize};

use crate::{
    exception_private::{ExcTriple, ExcType, ExcValue, RunError, RunResult, SimpleException},
    fiber::{Fiber, FiberInput, FiberYielder, ResumeSignal},
    frame::CodeInfo,
    heap::{DropWithHeap, Heap, HeapData, HeapId},
    runtime::Runtime,
    tracer::FinishKind,
    types::{
        Generator, GeneratorBody, GeneratorKind, GeneratorStatus,
        class::{builtin_base_of, is_exception_class},
        exception::class_of,
    },
    value::Value,
};

/// Outcome of one resumption that did not raise.
#[derive(Debug)]
pub enum GenStep {
    /// The body yielded this value and is suspended.
    Yielded(Value),
    /// The body finished with this return value (`None` for plain exhaustion).
    Exhausted(Value),
}

impl GenStep {
    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            Self::Yielded(v) | Self::Exhausted(v) => v,
        }
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted(_))
    }
}

impl DropWithHeap for GenStep {
    fn drop_with_heap(self, heap: &mut Heap) {
        self.into_value().drop_with_heap(heap);
    }
}

/// What `close()` does to a suspended generator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClosePolicy {
    /// Raise `GeneratorExit` at the suspension point so the body's cleanup runs.
    #[default]
    Unwind,
    /// Mark the generator finished and discard its stack without running the body.
    MarkFinished,
}

/// A generator body's handle on its runtime and its suspension point.
///
/// Borrows handed out by [`runtime`](Self::runtime) are tied to `&mut self`,
/// so none of them can be held across a yield.
pub struct GeneratorScope<'y> {
    yielder: &'y FiberYielder,
    rt: NonNull<Runtime>,
    id: HeapId,
}

impl GeneratorScope<'_> {
    /// The runtime driving this generator.
    pub fn runtime(&mut self) -> &mut Runtime {
        // SAFETY: `rt` comes from the `&mut Runtime` that resumed this fiber. The
        // driver does not touch the runtime until the fiber suspends or returns,
        // and the pointer is replaced on every resumption.
        unsafe { self.rt.as_mut() }
    }

    /// A new reference to the generator object running this body.
    pub fn generator(&mut self) -> Value {
        let id = self.id;
        self.runtime().heap.inc_ref(id);
        Value::Ref(id)
    }

    pub fn local(&mut self, index: usize) -> RunResult<Value> {
        self.runtime().local(index)
    }

    pub fn set_local(&mut self, index: usize, value: Value) -> RunResult<()> {
        self.runtime().set_local(index, value)
    }

    pub fn closure(&mut self, index: usize) -> RunResult<Value> {
        self.runtime().closure(index)
    }

    pub fn set_line(&mut self, line: u32) {
        self.runtime().set_line(line);
    }

    /// Suspends with `value`; returns what the next `send` delivers.
    ///
    /// If the generator is resumed by `throw` or `close`, the exception is
    /// returned as the error instead.
    pub fn yield_value(&mut self, value: Value) -> RunResult<Value> {
        match self.suspend(value) {
            ResumeSignal::Send(v) => Ok(v),
            ResumeSignal::Throw(exc) => Err(exc.into()),
        }
    }

    /// `yield from iterable`.
    ///
    /// Generators and coroutines are delegated to: sends, throws and close
    /// pass through to them and their return value is the result. Tuples and
    /// lists are yielded item by item.
    pub fn yield_from(&mut self, iterable: Value) -> RunResult<Value> {
        let rt = self.runtime();
        let kind = match &iterable {
            Value::Ref(id) => match rt.heap.get(*id) {
                HeapData::Generator(_) => Some(true),
                HeapData::Tuple(_) | HeapData::List(_) => Some(false),
                _ => None,
            },
            _ => None,
        };
        match kind {
            Some(true) => self.delegate(iterable),
            Some(false) => self.yield_each(iterable),
            None => {
                let type_name = iterable.type_name(&rt.heap).into_owned();
                iterable.drop_with_heap(&mut rt.heap);
                Err(ExcType::type_error(format!("'{type_name}' object is not iterable")))
            }
        }
    }

    /// `await awaitable`. Only coroutines can be awaited, each at most once to completion.
    pub fn await_value(&mut self, awaitable: Value) -> RunResult<Value> {
        let rt = self.runtime();
        let check = match &awaitable {
            Value::Ref(id) => match rt.heap.get(*id) {
                HeapData::Generator(g) if g.kind == GeneratorKind::Coroutine => {
                    if g.is_finished() || g.is_running() {
                        Err(ExcType::coroutine_reused())
                    } else {
                        Ok(())
                    }
                }
                _ => Err(ExcType::type_error_not_awaitable(&awaitable.type_name(&rt.heap))),
            },
            other => Err(ExcType::type_error_not_awaitable(&other.type_name(&rt.heap))),
        };
        if let Err(e) = check {
            awaitable.drop_with_heap(&mut rt.heap);
            return Err(e);
        }
        self.delegate(awaitable)
    }

    fn suspend(&mut self, value: Value) -> ResumeSignal {
        let FiberInput { rt, signal } = self.yielder.suspend(value);
        self.rt = rt;
        signal
    }

    /// Stores `inner` as this generator's delegate and runs it to completion,
    /// yielding everything it yields.
    fn delegate(&mut self, inner: Value) -> RunResult<Value> {
        let Some(inner_id) = inner.ref_id() else {
            let rt = self.runtime();
            inner.drop_with_heap(&mut rt.heap);
            return Err(RunError::internal("delegate target is not a heap object"));
        };
        self.set_delegate(Some(inner));

        let mut signal = ResumeSignal::Send(Value::None);
        let result = loop {
            let step = self.runtime().resume_generator(inner_id, signal);
            match step {
                Ok(GenStep::Yielded(value)) => match self.suspend(value) {
                    ResumeSignal::Throw(exc) if is_generator_exit(&exc, &self.runtime().heap) => {
                        let rt = self.runtime();
                        match rt.close_generator(inner_id) {
                            Ok(()) => break Err(exc.into()),
                            Err(e) => {
                                exc.drop_with_heap(&mut rt.heap);
                                break Err(e);
                            }
                        }
                    }
                    other => signal = other,
                },
                Ok(GenStep::Exhausted(value)) => break Ok(value),
                Err(e) => break Err(e),
            }
        };
        self.set_delegate(None);
        result
    }

    fn yield_each(&mut self, sequence: Value) -> RunResult<Value> {
        let Some(seq_id) = sequence.ref_id() else {
            return Err(RunError::internal("sequence is not a heap object"));
        };
        self.set_delegate(Some(sequence));
        let mut index = 0;
        let result = loop {
            let rt = self.runtime();
            let item = match rt.heap.get(seq_id) {
                HeapData::Tuple(t) => t.as_slice().get(index).map(|v| v.clone_with_heap(&rt.heap)),
                HeapData::List(l) => l.as_slice().get(index).map(|v| v.clone_with_heap(&rt.heap)),
                _ => None,
            };
            let Some(item) = item else {
                break Ok(Value::None);
            };
            index += 1;
            match self.suspend(item) {
                ResumeSignal::Send(v) => {
                    let rt = self.runtime();
                    v.drop_with_heap(&mut rt.heap);
                }
                ResumeSignal::Throw(exc) => break Err(exc.into()),
            }
        };
        self.set_delegate(None);
        result
    }

    fn set_delegate(&mut self, delegate: Option<Value>) {
        let id = self.id;
        let rt = self.runtime();
        let old = std::mem::replace(&mut rt.generator_mut(id).delegate, delegate);
        old.drop_with_heap(&mut rt.heap);
    }
}

fn is_generator_exit(exc: &ExcTriple, heap: &Heap) -> bool {
    builtin_base_of(&exc.exc_type, heap).is_some_and(|t| t.is_subclass_of(ExcType::GeneratorExit))
}

/// Runs on the fiber: unpacks the first input and calls the body.
fn fiber_entry(yielder: &FiberYielder, input: FiberInput, id: HeapId, body: &GeneratorBody) -> RunResult<Value> {
    let FiberInput { rt, signal } = input;
    let mut scope = GeneratorScope { yielder, rt, id };
    match signal {
        ResumeSignal::Send(v) => {
            let rt = scope.runtime();
            v.drop_with_heap(&mut rt.heap);
        }
        ResumeSignal::Throw(exc) => return Err(exc.into()),
    }
    body(&mut scope)
}

impl Runtime {
    /// Creates an unstarted generator or coroutine with no bound arguments.
    pub fn new_generator(&mut self, kind: GeneratorKind, code: CodeInfo, body: GeneratorBody) -> RunResult<Value> {
        self.new_generator_object(kind, Rc::new(code), body, Vec::new(), Vec::new())
    }

    pub(crate) fn new_generator_object(
        &mut self,
        kind: GeneratorKind,
        code: Rc<CodeInfo>,
        body: GeneratorBody,
        locals: Vec<Value>,
        closure: Vec<Value>,
    ) -> RunResult<Value> {
        let generator = Generator::new(kind, code, body, locals, closure);
        let id = self.heap.allocate(HeapData::Generator(generator))?;
        Ok(Value::Ref(id))
    }

    /// `next(gen)`: advances with `None`. Returns `None` once exhausted.
    ///
    /// A return value is discarded; use [`send`](Self::send) to observe it.
    /// Coroutines are not iterators and are rejected with a `TypeError`.
    pub fn next(&mut self, generator: &Value) -> RunResult<Option<Value>> {
        let id = self.expect_generator(generator)?;
        if self.generator_ref(id).is_coroutine() {
            return Err(ExcType::type_error("'coroutine' object is not an iterator"));
        }
        match self.resume_generator(id, ResumeSignal::Send(Value::None))? {
            GenStep::Yielded(v) => Ok(Some(v)),
            GenStep::Exhausted(v) => {
                v.drop_with_heap(&mut self.heap);
                Ok(None)
            }
        }
    }

    /// Advances with `None`.
    pub fn advance(&mut self, generator: &Value) -> RunResult<GenStep> {
        self.send(generator, Value::None)
    }

    /// `gen.send(value)`.
    ///
    /// The first resumption only accepts `None`. Sending to a finished
    /// generator reports exhaustion again.
    pub fn send(&mut self, generator: &Value, value: Value) -> RunResult<GenStep> {
        let id = match self.expect_generator(generator) {
            Ok(id) => id,
            Err(e) => {
                value.drop_with_heap(&mut self.heap);
                return Err(e);
            }
        };
        self.resume_generator(id, ResumeSignal::Send(value))
    }

    /// `gen.throw(exc_type, value)`.
    ///
    /// `exc` is an exception class (with an optional value) or an instance (no
    /// value allowed). The exception is normalized and raised at the
    /// suspension point; an unstarted generator is finished and the exception
    /// propagates straight back.
    pub fn throw(&mut self, generator: &Value, exc: Value, value: Option<Value>) -> RunResult<GenStep> {
        let id = match self.expect_generator(generator) {
            Ok(id) => id,
            Err(e) => {
                exc.drop_with_heap(&mut self.heap);
                value.drop_with_heap(&mut self.heap);
                return Err(e);
            }
        };
        let triple = self.throw_triple(exc, value)?;
        let triple = self.normalize_exception(triple)?;
        self.resume_generator(id, ResumeSignal::Throw(triple))
    }

    /// Forwards an error to a generator as if by `throw`.
    ///
    /// Internal errors are returned unchanged without touching the generator.
    pub fn throw_error(&mut self, generator: &Value, err: RunError) -> RunResult<GenStep> {
        let triple = match err {
            RunError::Exc(exc) => *exc,
            other => return Err(other),
        };
        let id = match self.expect_generator(generator) {
            Ok(id) => id,
            Err(e) => {
                triple.drop_with_heap(&mut self.heap);
                return Err(e);
            }
        };
        let triple = self.normalize_exception(triple)?;
        self.resume_generator(id, ResumeSignal::Throw(triple))
    }

    fn throw_triple(&mut self, exc: Value, value: Option<Value>) -> RunResult<ExcTriple> {
        if is_exception_class(&exc, &self.heap) {
            let value = match value {
                None | Some(Value::None) => ExcValue::Absent,
                Some(v) => ExcValue::Object(v),
            };
            return Ok(ExcTriple::new(exc, value));
        }
        if let Some(class) = class_of(&exc, &self.heap) {
            let class = class.clone_with_heap(&self.heap);
            if let Some(v) = value
                && !v.is_none()
            {
                v.drop_with_heap(&mut self.heap);
                class.drop_with_heap(&mut self.heap);
                exc.drop_with_heap(&mut self.heap);
                return Err(ExcType::type_error("instance exception may not have a separate value"));
            }
            return Ok(ExcTriple::new(class, ExcValue::Object(exc)));
        }
        let type_name = exc.type_name(&self.heap).into_owned();
        exc.drop_with_heap(&mut self.heap);
        value.drop_with_heap(&mut self.heap);
        Err(ExcType::type_error_not_exception(&type_name))
    }

    /// `gen.close()`.
    ///
    /// Unstarted and finished generators are simply marked finished. A
    /// suspended one is handled per the configured [`ClosePolicy`]; under
    /// `Unwind`, a body that yields again instead of exiting gets a
    /// `RuntimeError` and is finished anyway.
    pub fn close(&mut self, generator: &Value) -> RunResult<()> {
        let id = self.expect_generator(generator)?;
        self.close_generator(id)
    }

    pub(crate) fn close_generator(&mut self, id: HeapId) -> RunResult<()> {
        let g = self.generator_ref(id);
        let (coroutine, running, status) = (g.is_coroutine(), g.running, g.status);
        if running {
            return Err(ExcType::generator_already_executing(coroutine));
        }
        match status {
            GeneratorStatus::Finished => return Ok(()),
            GeneratorStatus::Unused => {
                self.finish_generator(id, FinishKind::Closed);
                return Ok(());
            }
            GeneratorStatus::Running => {}
        }
        if self.config.close_policy == ClosePolicy::MarkFinished {
            self.finish_generator(id, FinishKind::Closed);
            return Ok(());
        }
        let exit = self.normalize_exception(SimpleException::new(ExcType::GeneratorExit, None).into())?;
        match self.resume_generator(id, ResumeSignal::Throw(exit)) {
            Ok(GenStep::Yielded(v)) => {
                v.drop_with_heap(&mut self.heap);
                self.finish_generator(id, FinishKind::Closed);
                Err(ExcType::generator_ignored_exit(coroutine))
            }
            Ok(GenStep::Exhausted(v)) => {
                v.drop_with_heap(&mut self.heap);
                Ok(())
            }
            Err(e) if e.is_exception_type(ExcType::GeneratorExit, &self.heap) || e.is_stop_iteration(&self.heap) => {
                e.drop_with_heap(&mut self.heap);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// `inspect.getgeneratorstate()` style name, e.g. `GEN_SUSPENDED`.
    pub fn generator_state(&self, generator: &Value) -> RunResult<&'static str> {
        let id = self.expect_generator(generator)?;
        Ok(self.generator_ref(id).state_name())
    }

    /// `gi_running`.
    pub fn generator_running(&self, generator: &Value) -> RunResult<bool> {
        let id = self.expect_generator(generator)?;
        Ok(self.generator_ref(id).is_running())
    }

    /// `gi_frame`: `None` before the first resumption and after finishing.
    pub fn generator_frame(&self, generator: &Value) -> RunResult<Option<Value>> {
        let id = self.expect_generator(generator)?;
        Ok(self.generator_ref(id).frame.map(|frame| {
            self.heap.inc_ref(frame);
            Value::Ref(frame)
        }))
    }

    /// `gi_yieldfrom` / `cr_await`: what the generator is currently delegating to.
    pub fn generator_delegate(&self, generator: &Value) -> RunResult<Option<Value>> {
        let id = self.expect_generator(generator)?;
        Ok(self
            .generator_ref(id)
            .delegate
            .as_ref()
            .map(|d| d.clone_with_heap(&self.heap)))
    }

    pub(crate) fn resume_generator(&mut self, id: HeapId, signal: ResumeSignal) -> RunResult<GenStep> {
        let g = self.generator_ref(id);
        let (coroutine, running, status) = (g.is_coroutine(), g.running, g.status);
        if running {
            self.drop_signal(signal);
            return Err(ExcType::generator_already_executing(coroutine));
        }
        match status {
            GeneratorStatus::Finished => {
                return match signal {
                    ResumeSignal::Send(v) => {
                        v.drop_with_heap(&mut self.heap);
                        Ok(GenStep::Exhausted(Value::None))
                    }
                    ResumeSignal::Throw(exc) => Err(exc.into()),
                };
            }
            GeneratorStatus::Unused => {
                if let ResumeSignal::Send(v) = &signal
                    && !v.is_none()
                {
                    self.drop_signal(signal);
                    return Err(ExcType::type_error_send_to_fresh(coroutine));
                }
                if let ResumeSignal::Throw(exc) = signal {
                    self.finish_generator(id, FinishKind::Raised);
                    return Err(exc.into());
                }
                if let Err(e) = self.start_generator(id) {
                    self.drop_signal(signal);
                    return Err(e);
                }
            }
            GeneratorStatus::Running => {}
        }

        let g = self.generator_mut(id);
        let (Some(frame), Some(mut fiber)) = (g.frame, g.fiber.take()) else {
            self.drop_signal(signal);
            return Err(RunError::internal("suspended generator without frame or fiber"));
        };
        if let Err(e) = self.push_frame(frame) {
            self.generator_mut(id).fiber = Some(fiber);
            self.drop_signal(signal);
            return Err(e);
        }
        // keep the object alive while its body runs
        self.heap.inc_ref(id);
        self.preserve_for_frame(frame);
        let g = self.generator_mut(id);
        g.running = true;
        let saved = g.saved_exc.take();
        self.restore_exception(saved);
        if let HeapData::Generator(g) = self.heap.get(id) {
            self.tracer.on_resume(&g.qualname, self.depth);
        }

        let input = FiberInput {
            rt: NonNull::from(&mut *self),
            signal,
        };
        let outcome = fiber.resume(input);

        let body_exc = self.fetch_exception();
        let failed_at = matches!(outcome, CoroutineResult::Return(Err(_))).then(|| self.frame_ref(frame).traceback_entry());
        debug_assert_eq!(self.frame, Some(frame), "generator body left frames linked");
        self.pop_frame();
        self.restore_from_frame(frame);
        self.generator_mut(id).running = false;

        let step = match outcome {
            CoroutineResult::Yield(value) => {
                let g = self.generator_mut(id);
                g.fiber = Some(fiber);
                g.saved_exc = body_exc;
                if let HeapData::Generator(g) = self.heap.get(id) {
                    self.tracer.on_suspend(&g.qualname, self.depth);
                }
                Ok(GenStep::Yielded(value))
            }
            CoroutineResult::Return(result) => {
                body_exc.drop_with_heap(&mut self.heap);
                fiber.release(self.heap.stack_pool());
                match result {
                    Ok(value) => {
                        self.finish_generator(id, FinishKind::Returned);
                        Ok(GenStep::Exhausted(value))
                    }
                    Err(e) if e.is_stop_iteration(&self.heap) => {
                        e.drop_with_heap(&mut self.heap);
                        self.finish_generator(id, FinishKind::Returned);
                        Ok(GenStep::Exhausted(Value::None))
                    }
                    Err(e) => {
                        self.finish_generator(id, FinishKind::Raised);
                        Err(match failed_at {
                            Some(entry) => e.with_traceback(entry),
                            None => e,
                        })
                    }
                }
            }
        };
        self.heap.dec_ref(id);
        self.run_finalizers();
        step
    }

    /// Closes suspended generators whose last reference went away, then frees them.
    ///
    /// Errors raised while closing are discarded; nothing is left to receive them.
    pub(crate) fn run_finalizers(&mut self) {
        while let Some(id) = self.heap.take_finalizer() {
            if let Err(e) = self.close_generator(id) {
                e.drop_with_heap(&mut self.heap);
            }
            if !self.generator_ref(id).is_finished() {
                self.finish_generator(id, FinishKind::Closed);
            }
            self.heap.dec_ref(id);
        }
    }

    /// Creates the frame and fiber for a generator's first resumption.
    fn start_generator(&mut self, id: HeapId) -> RunResult<()> {
        let g = self.generator_mut(id);
        let code = Rc::clone(&g.code);
        let body = Rc::clone(&g.body);
        let locals = std::mem::take(&mut g.initial_locals);
        let closure = std::mem::take(&mut g.closure);

        let frame = match self.make_frame(code, locals, closure) {
            Ok(frame) => frame,
            Err(e) => {
                self.finish_generator(id, FinishKind::Raised);
                return Err(e);
            }
        };
        let mut fiber = Fiber::new();
        let size = self.config.stack_size;
        let prepared = fiber.prepare(self.heap.stack_pool(), size, move |yielder, input| {
            fiber_entry(yielder, input, id, &body)
        });
        let reused = match prepared {
            Ok(reused) => reused,
            Err(e) => {
                self.heap.dec_ref(frame);
                self.finish_generator(id, FinishKind::Raised);
                return Err(e);
            }
        };
        self.tracer.on_stack_acquire(reused, size);
        let g = self.generator_mut(id);
        g.frame = Some(frame);
        g.fiber = Some(fiber);
        g.status = GeneratorStatus::Running;
        Ok(())
    }

    /// Moves a generator to `Finished`, releasing its fiber, frame and pending state.
    fn finish_generator(&mut self, id: HeapId, kind: FinishKind) {
        let g = self.generator_mut(id);
        g.status = GeneratorStatus::Finished;
        g.running = false;
        let fiber = g.fiber.take();
        let frame = g.frame.take();
        let locals = std::mem::take(&mut g.initial_locals);
        let closure = std::mem::take(&mut g.closure);
        let saved = g.saved_exc.take();
        let delegate = g.delegate.take();
        if let Some(fiber) = fiber {
            fiber.release(self.heap.stack_pool());
        }
        if let Some(frame) = frame {
            self.heap.dec_ref(frame);
        }
        locals.drop_with_heap(&mut self.heap);
        closure.drop_with_heap(&mut self.heap);
        saved.drop_with_heap(&mut self.heap);
        delegate.drop_with_heap(&mut self.heap);
        if let HeapData::Generator(g) = self.heap.get(id) {
            self.tracer.on_finish(&g.qualname, kind);
        }
    }

    fn drop_signal(&mut self, signal: ResumeSignal) {
        match signal {
            ResumeSignal::Send(v) => v.drop_with_heap(&mut self.heap),
            ResumeSignal::Throw(exc) => exc.drop_with_heap(&mut self.heap),
        }
    }

    pub(crate) fn expect_generator(&self, value: &Value) -> RunResult<HeapId> {
        match value {
            Value::Ref(id) if matches!(self.heap.get(*id), HeapData::Generator(_)) => Ok(*id),
            other => Err(ExcType::type_error_not_generator(&other.type_name(&self.heap))),
        }
    }

    pub(crate) fn generator_ref(&self, id: HeapId) -> &Generator {
        match self.heap.get(id) {
            HeapData::Generator(g) => g,
            other => panic!("expected generator at {id:?}, found {}", other.variant_name()),
        }
    }

    pub(crate) fn generator_mut(&mut self, id: HeapId) -> &mut Generator {
        match self.heap.get_mut(id) {
            HeapData::Generator(g) => g,
            other => panic!("expected generator at {id:?}, found {}", other.variant_name()),
        }
    }
}
