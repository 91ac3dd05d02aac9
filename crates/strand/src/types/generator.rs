//! Generator and coroutine objects.
//!
//! The object only records state; driving it (advance, send, throw, close) lives
//! in [`crate::generator`]. A generator owns its frame and fiber from the first
//! resumption until it finishes, at which point both are released at once.

use std::rc::Rc;

use crate::{
    exception_private::{ExcTriple, ExcValue},
    fiber::Fiber,
    frame::CodeInfo,
    heap::HeapId,
    types::GeneratorBody,
    value::Value,
};

/// Which protocol the object speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum GeneratorKind {
    Generator,
    /// Only coroutines may be awaited.
    Coroutine,
}

/// Lifecycle of a generator.
///
/// `Running` covers both "currently executing" and "suspended at a yield";
/// the two are told apart by [`Generator::is_running`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum GeneratorStatus {
    /// Created, body not yet entered. No frame or fiber exists.
    Unused,
    Running,
    /// Returned, raised, or closed. Every further advance reports exhaustion.
    Finished,
}

pub struct Generator {
    pub kind: GeneratorKind,
    pub name: String,
    pub qualname: String,
    pub(crate) status: GeneratorStatus,
    /// Set while the body is executing; guards against reentrant resumption.
    pub(crate) running: bool,
    /// `None` before the first resumption, after finishing, and while the
    /// driver has taken it out to resume it.
    pub(crate) fiber: Option<Fiber>,
    /// Created lazily on first resumption.
    pub(crate) frame: Option<HeapId>,
    pub(crate) code: Rc<CodeInfo>,
    pub(crate) body: GeneratorBody,
    /// Bound arguments waiting to become the frame's locals.
    pub(crate) initial_locals: Vec<Value>,
    pub(crate) closure: Vec<Value>,
    /// The body's "currently handled" exception while it is suspended.
    pub(crate) saved_exc: Option<ExcTriple>,
    /// Inner generator or coroutine this one is delegating to.
    pub(crate) delegate: Option<Value>,
    pub(crate) weakrefs: Vec<HeapId>,
}

impl std::fmt::Debug for Generator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generator")
            .field("kind", &self.kind)
            .field("qualname", &self.qualname)
            .field("status", &self.status)
            .field("running", &self.running)
            .field("frame", &self.frame)
            .finish_non_exhaustive()
    }
}

impl Generator {
    /// Creates an unstarted generator.
    ///
    /// # Arguments
    /// * `initial_locals` - Frame slots with bound parameters, sized to `code.local_names`
    /// * `closure` - Values copied into the frame when the body starts
    #[must_use]
    pub(crate) fn new(
        kind: GeneratorKind,
        code: Rc<CodeInfo>,
        body: GeneratorBody,
        initial_locals: Vec<Value>,
        closure: Vec<Value>,
    ) -> Self {
        Self {
            kind,
            name: code.name.clone(),
            qualname: code.qualname.clone(),
            status: GeneratorStatus::Unused,
            running: false,
            fiber: None,
            frame: None,
            code,
            body,
            initial_locals,
            closure,
            saved_exc: None,
            delegate: None,
            weakrefs: Vec::new(),
        }
    }

    #[must_use]
    pub fn status(&self) -> GeneratorStatus {
        self.status
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.status == GeneratorStatus::Finished
    }

    #[must_use]
    pub fn frame(&self) -> Option<HeapId> {
        self.frame
    }

    #[must_use]
    pub fn is_coroutine(&self) -> bool {
        self.kind == GeneratorKind::Coroutine
    }

    /// `inspect.getgeneratorstate()` / `inspect.getcoroutinestate()` name.
    #[must_use]
    pub fn state_name(&self) -> &'static str {
        let coroutine = self.is_coroutine();
        match (self.status, self.running) {
            (GeneratorStatus::Unused, _) if coroutine => "CORO_CREATED",
            (GeneratorStatus::Unused, _) => "GEN_CREATED",
            (GeneratorStatus::Running, true) if coroutine => "CORO_RUNNING",
            (GeneratorStatus::Running, true) => "GEN_RUNNING",
            (GeneratorStatus::Running, false) if coroutine => "CORO_SUSPENDED",
            (GeneratorStatus::Running, false) => "GEN_SUSPENDED",
            (GeneratorStatus::Finished, _) if coroutine => "CORO_CLOSED",
            (GeneratorStatus::Finished, _) => "GEN_CLOSED",
        }
    }

    /// Suspended at a yield with a live stack, so dropping it must close it first.
    pub(crate) fn needs_finalizer(&self) -> bool {
        self.status == GeneratorStatus::Running && !self.running && self.fiber.is_some()
    }

    pub(crate) fn dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        if let Some(frame) = self.frame.take() {
            stack.push(frame);
        }
        for value in self.initial_locals.iter_mut().chain(self.closure.iter_mut()) {
            value.dec_ref_ids(stack);
        }
        if let Some(exc) = &mut self.saved_exc {
            exc.exc_type.dec_ref_ids(stack);
            if let ExcValue::Object(v) = &mut exc.value {
                v.dec_ref_ids(stack);
            }
        }
        if let Some(delegate) = &mut self.delegate {
            delegate.dec_ref_ids(stack);
        }
    }
}
