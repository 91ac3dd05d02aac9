//! Engine tracing.
//!
//! Provides a trait-based hook system for observing generator lifecycles,
//! frame pushes and exception-state swaps. This is the engine's logging
//! surface: hosts pick a tracer when building the runtime.
//!
//! | Tracer | Purpose |
//! |--------|---------|
//! | [`NoopTracer`] | No-op (default) |
//! | [`StderrTracer`] | Human-readable event log to stderr |
//! | [`ProfilingTracer`] | Counters for resumptions, stack reuse and frame depth |
//! | [`RecordingTracer`] | Full event recording for tests and post-mortem |
//!
//! # Usage
//!
//! ```ignore
//! let tracer = RecordingTracer::new();
//! let log = tracer.log();
//! let mut rt = Runtime::new(RuntimeConfig::default()).with_tracer(tracer);
//! // ... drive generators ...
//! assert!(log.events().iter().any(|e| matches!(e, TraceEvent::Resume { .. })));
//! ```

use std::{cell::RefCell, rc::Rc};

/// How a generator reached `Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishKind {
    Returned,
    Raised,
    Closed,
}

/// Trace event emitted by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// A generator body is about to run.
    Resume { name: String, depth: usize },
    /// A generator body yielded.
    Suspend { name: String, depth: usize },
    /// A generator finished.
    Finish { name: String, kind: FinishKind },
    /// A frame was linked on top of the stack. `depth` is after the push.
    FramePush { name: String, depth: usize },
    /// A frame was unlinked. `depth` is before the pop.
    FramePop { depth: usize },
    /// The resumer's exception state was parked in a frame.
    ExceptionPreserve { frame: String, had_exception: bool },
    /// Parked exception state was reinstalled.
    ExceptionRestore { frame: String, had_exception: bool },
    /// A fiber got its stack, either from the pool or freshly allocated.
    StackAcquire { reused: bool, size: usize },
}

/// Hooks called by the runtime.
///
/// All methods have default no-op implementations, so implementations only
/// override the hooks they care about.
pub trait EngineTracer: std::fmt::Debug {
    /// Called right before switching into a generator's fiber.
    ///
    /// # Arguments
    /// * `name` - Qualified name of the generator
    /// * `depth` - Frame stack depth with the generator's frame pushed
    #[inline(always)]
    fn on_resume(&mut self, _name: &str, _depth: usize) {}

    /// Called after a generator yielded and its frame was popped.
    #[inline(always)]
    fn on_suspend(&mut self, _name: &str, _depth: usize) {}

    #[inline(always)]
    fn on_finish(&mut self, _name: &str, _kind: FinishKind) {}

    #[inline(always)]
    fn on_frame_push(&mut self, _name: &str, _depth: usize) {}

    #[inline(always)]
    fn on_frame_pop(&mut self, _depth: usize) {}

    #[inline(always)]
    fn on_exception_preserve(&mut self, _frame: &str, _had_exception: bool) {}

    #[inline(always)]
    fn on_exception_restore(&mut self, _frame: &str, _had_exception: bool) {}

    /// Called when a fiber is prepared.
    ///
    /// # Arguments
    /// * `reused` - Whether the stack came from the pool
    /// * `size` - Requested stack size in bytes
    #[inline(always)]
    fn on_stack_acquire(&mut self, _reused: bool, _size: usize) {}
}

// ============================================================================
// NoopTracer
// ============================================================================

/// Tracer that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl EngineTracer for NoopTracer {}

// ============================================================================
// StderrTracer: human-readable event log
// ============================================================================

/// Prints events to stderr, optionally stopping after `limit` events.
#[derive(Debug, Default)]
pub struct StderrTracer {
    limit: Option<usize>,
    count: usize,
}

impl StderrTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            count: 0,
        }
    }

    /// Counts one event; false once the limit is reached.
    fn tick(&mut self) -> bool {
        if self.limit.is_some_and(|limit| self.count >= limit) {
            return false;
        }
        self.count += 1;
        if self.limit == Some(self.count) {
            eprintln!("--- trace limit reached ({} events) ---", self.count);
        }
        true
    }
}

impl EngineTracer for StderrTracer {
    fn on_resume(&mut self, name: &str, depth: usize) {
        if self.tick() {
            eprintln!("  >>> RESUME  {name:<24} depth={depth}");
        }
    }

    fn on_suspend(&mut self, name: &str, depth: usize) {
        if self.tick() {
            eprintln!("  <<< SUSPEND {name:<24} depth={depth}");
        }
    }

    fn on_finish(&mut self, name: &str, kind: FinishKind) {
        if self.tick() {
            eprintln!("  ### FINISH  {name:<24} {kind:?}");
        }
    }

    fn on_frame_push(&mut self, name: &str, depth: usize) {
        if self.tick() {
            eprintln!("  +++ FRAME   {name:<24} depth={depth}");
        }
    }

    fn on_frame_pop(&mut self, depth: usize) {
        if self.tick() {
            eprintln!("  --- FRAME   {:<24} depth={depth}", "");
        }
    }

    fn on_exception_preserve(&mut self, frame: &str, had_exception: bool) {
        if self.tick() {
            eprintln!("  ... EXC PARK    {frame} had={had_exception}");
        }
    }

    fn on_exception_restore(&mut self, frame: &str, had_exception: bool) {
        if self.tick() {
            eprintln!("  ... EXC RESTORE {frame} had={had_exception}");
        }
    }

    fn on_stack_acquire(&mut self, reused: bool, size: usize) {
        if self.tick() {
            let how = if reused { "reused" } else { "allocated" };
            eprintln!("  ... STACK {how} size={size}");
        }
    }
}

// ============================================================================
// ProfilingTracer: counters
// ============================================================================

/// Aggregate counters, cheap enough to leave on in benchmarks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfilingReport {
    pub resumes: u64,
    pub suspends: u64,
    pub finishes: u64,
    pub stacks_reused: u64,
    pub stacks_allocated: u64,
    pub max_depth: usize,
}

/// Tracer that counts events; read it back through a [`ProfilingHandle`].
#[derive(Debug, Default)]
pub struct ProfilingTracer {
    report: Rc<RefCell<ProfilingReport>>,
}

/// Shared view of a [`ProfilingTracer`]'s counters.
#[derive(Debug, Clone)]
pub struct ProfilingHandle(Rc<RefCell<ProfilingReport>>);

impl ProfilingHandle {
    #[must_use]
    pub fn report(&self) -> ProfilingReport {
        *self.0.borrow()
    }
}

impl ProfilingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn handle(&self) -> ProfilingHandle {
        ProfilingHandle(Rc::clone(&self.report))
    }
}

impl EngineTracer for ProfilingTracer {
    fn on_resume(&mut self, _name: &str, depth: usize) {
        let mut report = self.report.borrow_mut();
        report.resumes += 1;
        report.max_depth = report.max_depth.max(depth);
    }

    fn on_suspend(&mut self, _name: &str, _depth: usize) {
        self.report.borrow_mut().suspends += 1;
    }

    fn on_finish(&mut self, _name: &str, _kind: FinishKind) {
        self.report.borrow_mut().finishes += 1;
    }

    fn on_frame_push(&mut self, _name: &str, depth: usize) {
        let mut report = self.report.borrow_mut();
        report.max_depth = report.max_depth.max(depth);
    }

    fn on_stack_acquire(&mut self, reused: bool, _size: usize) {
        let mut report = self.report.borrow_mut();
        if reused {
            report.stacks_reused += 1;
        } else {
            report.stacks_allocated += 1;
        }
    }
}

// ============================================================================
// RecordingTracer: full event log
// ============================================================================

/// Records every event. The log stays readable through [`TraceLog`] after the
/// tracer has been moved into a runtime.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Rc<RefCell<Vec<TraceEvent>>>,
}

/// Shared handle to a [`RecordingTracer`]'s events.
#[derive(Debug, Clone)]
pub struct TraceLog(Rc<RefCell<Vec<TraceEvent>>>);

impl TraceLog {
    #[must_use]
    pub fn events(&self) -> Vec<TraceEvent> {
        self.0.borrow().clone()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn log(&self) -> TraceLog {
        TraceLog(Rc::clone(&self.events))
    }

    fn push(&self, event: TraceEvent) {
        self.events.borrow_mut().push(event);
    }
}

impl EngineTracer for RecordingTracer {
    fn on_resume(&mut self, name: &str, depth: usize) {
        self.push(TraceEvent::Resume {
            name: name.to_owned(),
            depth,
        });
    }

    fn on_suspend(&mut self, name: &str, depth: usize) {
        self.push(TraceEvent::Suspend {
            name: name.to_owned(),
            depth,
        });
    }

    fn on_finish(&mut self, name: &str, kind: FinishKind) {
        self.push(TraceEvent::Finish {
            name: name.to_owned(),
            kind,
        });
    }

    fn on_frame_push(&mut self, name: &str, depth: usize) {
        self.push(TraceEvent::FramePush {
            name: name.to_owned(),
            depth,
        });
    }

    fn on_frame_pop(&mut self, depth: usize) {
        self.push(TraceEvent::FramePop { depth });
    }

    fn on_exception_preserve(&mut self, frame: &str, had_exception: bool) {
        self.push(TraceEvent::ExceptionPreserve {
            frame: frame.to_owned(),
            had_exception,
        });
    }

    fn on_exception_restore(&mut self, frame: &str, had_exception: bool) {
        self.push(TraceEvent::ExceptionRestore {
            frame: frame.to_owned(),
            had_exception,
        });
    }

    fn on_stack_acquire(&mut self, reused: bool, size: usize) {
        self.push(TraceEvent::StackAcquire { reused, size });
    }
}
