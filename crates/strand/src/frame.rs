//! Frame records and the runtime's frame stack.
//!
//! Frames are heap objects. The runtime holds a strong reference to the active
//! frame, and every frame on the stack holds a strong reference to the frame
//! below it through `back`. A suspended generator's frame is detached: its
//! `back` is cleared on every pop, so the chain never points into a stack that
//! has since moved on.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::{
    exception_private::{ExcTriple, ExcType, ExcValue, RunError, RunResult, TracebackEntry},
    exception_public::StackFrame,
    heap::{DropWithHeap, HeapData, HeapId},
    runtime::Runtime,
    types::{Dict, DictKey},
    value::Value,
};

/// Static description of a function body: names, location and local layout.
///
/// Local slots are laid out as `[params...][*args][**kwargs][other locals...]`,
/// where the star slots exist only when `var_args`/`var_kwargs` are set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeInfo {
    pub name: String,
    pub qualname: String,
    pub filename: String,
    pub first_line: u32,
    pub local_names: Vec<String>,
    /// Number of leading local slots that are positional-or-keyword parameters.
    pub arg_count: usize,
    pub var_args: bool,
    pub var_kwargs: bool,
    /// Optimized frames materialize a locals mapping only on request; others
    /// keep a live mapping in sync with every store.
    pub optimized: bool,
}

impl CodeInfo {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            qualname: name.clone(),
            name,
            filename: "<host>".to_owned(),
            first_line: 1,
            local_names: Vec::new(),
            arg_count: 0,
            var_args: false,
            var_kwargs: false,
            optimized: true,
        }
    }

    #[must_use]
    pub fn qualname(mut self, qualname: impl Into<String>) -> Self {
        self.qualname = qualname.into();
        self
    }

    #[must_use]
    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    #[must_use]
    pub fn first_line(mut self, line: u32) -> Self {
        self.first_line = line;
        self
    }

    /// Declares positional-or-keyword parameters; they become the first local slots.
    #[must_use]
    pub fn params(mut self, names: &[&str]) -> Self {
        self.arg_count = names.len();
        let rest = self.local_names.split_off(0);
        self.local_names = names.iter().map(|n| (*n).to_owned()).collect();
        self.local_names.extend(rest);
        self
    }

    /// Adds a `*name` slot right after the parameters.
    #[must_use]
    pub fn var_args(mut self, name: &str) -> Self {
        self.var_args = true;
        self.local_names.insert(self.arg_count, name.to_owned());
        self
    }

    /// Adds a `**name` slot after the parameters and any `*args` slot.
    #[must_use]
    pub fn var_kwargs(mut self, name: &str) -> Self {
        self.var_kwargs = true;
        let at = self.arg_count + usize::from(self.var_args);
        self.local_names.insert(at, name.to_owned());
        self
    }

    /// Appends plain local slots.
    #[must_use]
    pub fn locals(mut self, names: &[&str]) -> Self {
        self.local_names.extend(names.iter().map(|n| (*n).to_owned()));
        self
    }

    #[must_use]
    pub fn unoptimized(mut self) -> Self {
        self.optimized = false;
        self
    }

    #[must_use]
    pub fn var_args_slot(&self) -> Option<usize> {
        self.var_args.then_some(self.arg_count)
    }

    #[must_use]
    pub fn var_kwargs_slot(&self) -> Option<usize> {
        self.var_kwargs.then_some(self.arg_count + usize::from(self.var_args))
    }

    #[must_use]
    pub fn slot_of(&self, name: &str) -> Option<usize> {
        self.local_names.iter().position(|n| n == name)
    }
}

/// One activation record.
#[derive(Debug)]
pub struct Frame {
    code: Rc<CodeInfo>,
    /// Caller frame while this one is on the stack.
    pub(crate) back: Option<HeapId>,
    pub(crate) line: u32,
    pub(crate) locals: Vec<Value>,
    pub(crate) closure: Vec<Value>,
    /// Live `Dict` mirror of `locals` for unoptimized frames.
    pub(crate) locals_map: Option<HeapId>,
    /// Exception state of whoever resumed this frame, parked here while the
    /// frame runs. The outer `Option` tells "nothing parked" apart from
    /// "parked an empty state".
    pub(crate) preserved_exc: Option<Option<ExcTriple>>,
    pub(crate) on_stack: bool,
}

impl Frame {
    pub(crate) fn new(code: Rc<CodeInfo>, mut locals: Vec<Value>, closure: Vec<Value>) -> Self {
        locals.resize_with(code.local_names.len(), || Value::Undefined);
        Self {
            line: code.first_line,
            code,
            back: None,
            locals,
            closure,
            locals_map: None,
            preserved_exc: None,
            on_stack: false,
        }
    }

    #[must_use]
    pub fn code(&self) -> &CodeInfo {
        &self.code
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    #[must_use]
    pub fn back(&self) -> Option<HeapId> {
        self.back
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.locals.len()
    }

    #[must_use]
    pub fn is_on_stack(&self) -> bool {
        self.on_stack
    }

    pub(crate) fn traceback_entry(&self) -> TracebackEntry {
        TracebackEntry {
            name: self.code.name.clone(),
            filename: self.code.filename.clone(),
            line: self.line,
        }
    }

    pub(crate) fn dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        if let Some(back) = self.back.take() {
            stack.push(back);
        }
        if let Some(map) = self.locals_map.take() {
            stack.push(map);
        }
        for value in self.locals.iter_mut().chain(self.closure.iter_mut()) {
            value.dec_ref_ids(stack);
        }
        if let Some(Some(exc)) = &mut self.preserved_exc {
            exc.exc_type.dec_ref_ids(stack);
            if let ExcValue::Object(v) = &mut exc.value {
                v.dec_ref_ids(stack);
            }
        }
    }
}

/// Heapless summary of a frame for hosts and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub name: String,
    pub qualname: String,
    pub filename: String,
    pub line: u32,
    pub on_stack: bool,
}

impl Runtime {
    /// Allocates a frame for `code`, eagerly building the locals mapping for unoptimized code.
    pub(crate) fn make_frame(
        &mut self,
        code: Rc<CodeInfo>,
        locals: Vec<Value>,
        closure: Vec<Value>,
    ) -> RunResult<HeapId> {
        let optimized = code.optimized;
        let id = self.heap.allocate(HeapData::Frame(Frame::new(code, locals, closure)))?;
        if !optimized {
            let map = match self.snapshot_locals(id) {
                Ok(map) => map,
                Err(e) => {
                    self.heap.dec_ref(id);
                    return Err(e);
                }
            };
            self.frame_mut(id).locals_map = Some(map);
        }
        Ok(id)
    }

    /// Links `frame_id` on top of the stack.
    ///
    /// # Panics
    /// Panics if the frame is already on the stack.
    pub(crate) fn push_frame(&mut self, frame_id: HeapId) -> RunResult<()> {
        self.heap.tracker().check_recursion_depth(self.depth)?;
        let caller = self.frame.take();
        let frame = self.frame_mut(frame_id);
        assert!(
            !frame.on_stack && frame.back.is_none(),
            "frame {frame_id:?} pushed while already linked"
        );
        frame.on_stack = true;
        frame.back = caller;
        self.heap.inc_ref(frame_id);
        self.frame = Some(frame_id);
        self.depth += 1;
        if let HeapData::Frame(f) = self.heap.get(frame_id) {
            self.tracer.on_frame_push(&f.code.name, self.depth);
        }
        Ok(())
    }

    /// Unlinks the active frame, handing the caller back to the runtime.
    pub(crate) fn pop_frame(&mut self) {
        let Some(top) = self.frame.take() else {
            return;
        };
        let frame = self.frame_mut(top);
        frame.on_stack = false;
        self.frame = frame.back.take();
        self.tracer.on_frame_pop(self.depth);
        self.depth -= 1;
        self.heap.dec_ref(top);
    }

    pub(crate) fn frame_ref(&self, id: HeapId) -> &Frame {
        match self.heap.get(id) {
            HeapData::Frame(f) => f,
            other => panic!("expected frame at {id:?}, found {}", other.variant_name()),
        }
    }

    pub(crate) fn frame_mut(&mut self, id: HeapId) -> &mut Frame {
        match self.heap.get_mut(id) {
            HeapData::Frame(f) => f,
            other => panic!("expected frame at {id:?}, found {}", other.variant_name()),
        }
    }

    fn active_frame(&self) -> RunResult<HeapId> {
        self.frame.ok_or_else(|| RunError::internal("no active frame"))
    }

    /// Current frame stack depth.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The active frame, if any.
    #[must_use]
    pub fn current_frame(&self) -> Option<Value> {
        self.frame.map(|id| {
            self.heap.inc_ref(id);
            Value::Ref(id)
        })
    }

    /// Reads local slot `index` of the active frame.
    pub fn local(&self, index: usize) -> RunResult<Value> {
        let frame = self.frame_ref(self.active_frame()?);
        match frame.locals.get(index) {
            Some(Value::Undefined) => Err(ExcType::unbound_local(&frame.code.local_names[index])),
            Some(value) => Ok(value.clone_with_heap(&self.heap)),
            None => Err(RunError::internal("local slot out of range")),
        }
    }

    /// Reads a local by name.
    pub fn local_by_name(&self, name: &str) -> RunResult<Value> {
        let index = self
            .frame_ref(self.active_frame()?)
            .code
            .slot_of(name)
            .ok_or_else(|| RunError::internal("no such local"))?;
        self.local(index)
    }

    /// Stores into local slot `index` of the active frame, releasing the previous value.
    ///
    /// Unoptimized frames also update their live locals mapping.
    pub fn set_local(&mut self, index: usize, value: Value) -> RunResult<()> {
        let id = self.active_frame()?;
        let mirrored = match self.frame_ref(id).locals_map {
            Some(map) => Some((map, value.clone_with_heap(&self.heap))),
            None => None,
        };
        let frame = self.frame_mut(id);
        let Some(slot) = frame.locals.get_mut(index) else {
            value.drop_with_heap(&mut self.heap);
            if let Some((_, copy)) = mirrored {
                copy.drop_with_heap(&mut self.heap);
            }
            return Err(RunError::internal("local slot out of range"));
        };
        let old = std::mem::replace(slot, value);
        let key = DictKey::Str(frame.code.local_names[index].clone());
        old.drop_with_heap(&mut self.heap);
        if let Some((map, copy)) = mirrored {
            let HeapData::Dict(dict) = self.heap.get_mut(map) else {
                copy.drop_with_heap(&mut self.heap);
                return Err(RunError::internal("locals mapping is not a dict"));
            };
            let replaced = dict.insert(key, copy);
            replaced.drop_with_heap(&mut self.heap);
        }
        Ok(())
    }

    /// Reads closure value `index` of the active frame.
    pub fn closure(&self, index: usize) -> RunResult<Value> {
        let frame = self.frame_ref(self.active_frame()?);
        frame
            .closure
            .get(index)
            .map(|v| v.clone_with_heap(&self.heap))
            .ok_or_else(|| RunError::internal("closure index out of range"))
    }

    /// Records the line the active frame is executing. A no-op with no frame active.
    pub fn set_line(&mut self, line: u32) {
        debug_assert!(self.frame.is_some(), "set_line with no active frame");
        if let Some(id) = self.frame {
            self.frame_mut(id).line = line;
        }
    }

    /// Stack trace of the active frames, outermost first.
    #[must_use]
    pub fn stack_trace(&self) -> Vec<StackFrame> {
        let mut out = Vec::new();
        let mut cursor = self.frame;
        while let Some(id) = cursor {
            let frame = self.frame_ref(id);
            out.push(StackFrame::from(&frame.traceback_entry()));
            cursor = frame.back;
        }
        out.reverse();
        out
    }

    /// Describes a frame value.
    pub fn frame_info(&self, frame: &Value) -> RunResult<FrameInfo> {
        let id = self.expect_frame(frame)?;
        let f = self.frame_ref(id);
        Ok(FrameInfo {
            name: f.code.name.clone(),
            qualname: f.code.qualname.clone(),
            filename: f.code.filename.clone(),
            line: f.line,
            on_stack: f.on_stack,
        })
    }

    /// The caller of a frame; `None` for outermost and suspended frames.
    pub fn frame_back(&self, frame: &Value) -> RunResult<Option<Value>> {
        let id = self.expect_frame(frame)?;
        Ok(self.frame_ref(id).back.map(|back| {
            self.heap.inc_ref(back);
            Value::Ref(back)
        }))
    }

    /// Locals mapping of a frame.
    ///
    /// Optimized frames return a fresh snapshot; unoptimized frames return
    /// their live mapping. Unassigned slots are omitted.
    pub fn frame_locals(&mut self, frame: &Value) -> RunResult<Value> {
        let id = self.expect_frame(frame)?;
        if let Some(map) = self.frame_ref(id).locals_map {
            self.heap.inc_ref(map);
            return Ok(Value::Ref(map));
        }
        Ok(Value::Ref(self.snapshot_locals(id)?))
    }

    fn snapshot_locals(&mut self, id: HeapId) -> RunResult<HeapId> {
        let frame = self.frame_ref(id);
        let mut dict = Dict::new();
        for (name, value) in frame.code.local_names.iter().zip(&frame.locals) {
            if matches!(value, Value::Undefined) {
                continue;
            }
            let replaced = dict.insert(DictKey::Str(name.clone()), value.clone_with_heap(&self.heap));
            debug_assert!(replaced.is_none(), "duplicate local name {name}");
        }
        Ok(self.heap.allocate(HeapData::Dict(dict))?)
    }

    fn expect_frame(&self, value: &Value) -> RunResult<HeapId> {
        match value {
            Value::Ref(id) if matches!(self.heap.get(*id), HeapData::Frame(_)) => Ok(*id),
            other => Err(ExcType::type_error(format!(
                "expected a frame, not {}",
                other.type_name(&self.heap)
            ))),
        }
    }
}
