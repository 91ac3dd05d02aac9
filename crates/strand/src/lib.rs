#![doc = include_str!("../../../README.md")]
// first to include defer_drop macro
mod heap;

mod args;
mod call;
mod exc_state;
mod exception_private;
mod exception_public;
mod fiber;
mod frame;
mod generator;
mod object;
mod resource;
mod runtime;
pub mod tracer;
pub mod types;
mod value;

pub use crate::{
    args::{ArgPosIter, ArgValues, KwargsValues, MAX_FIXED_ARITY},
    exc_state::DEFAULT_NORMALIZE_BUDGET,
    exception_private::{ExcTriple, ExcType, ExcValue, RunError, RunResult, SimpleException, TracebackEntry},
    exception_public::{Exception, StackFrame},
    fiber::{LocalStackPool, SharedStackPool, StackPool},
    frame::{CodeInfo, FrameInfo},
    generator::{ClosePolicy, GenStep, GeneratorScope},
    heap::{DropWithHeap, Heap, HeapDiff, HeapId, HeapStats},
    object::Object,
    resource::{
        DEFAULT_MAX_RECURSION_DEPTH, LimitedTracker, NoLimitTracker, ResourceError, ResourceLimits, ResourceTracker,
    },
    runtime::{DEFAULT_STACK_SIZE, Runtime, RuntimeConfig},
    tracer::{
        EngineTracer, FinishKind, NoopTracer, ProfilingHandle, ProfilingReport, ProfilingTracer, RecordingTracer,
        StderrTracer, TraceEvent, TraceLog,
    },
    types::{GeneratorKind, GeneratorStatus},
    value::Value,
};
