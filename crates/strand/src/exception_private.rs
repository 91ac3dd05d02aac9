use std::{
    borrow::Cow,
    fmt::{self, Display},
};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    exception_public::{Exception, StackFrame},
    heap::{DropWithHeap, Heap, HeapData},
    value::Value,
};

/// Result type alias for operations that can produce a runtime error.
pub type RunResult<T> = Result<T, RunError>;

/// Builtin exception types known to the engine.
///
/// Uses strum derives for automatic `Display`, `FromStr`, and `Into<&'static str>` implementations.
/// The string representation matches the variant name exactly (e.g., `ValueError` -> "ValueError").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
pub enum ExcType {
    /// primary exception class - matches any exception in isinstance checks.
    Exception,

    /// System exit exceptions
    BaseException,
    SystemExit,
    KeyboardInterrupt,
    /// Injected into a suspended generator by `close()`.
    /// Inherits from BaseException, not Exception.
    GeneratorExit,

    // --- ArithmeticError hierarchy ---
    ArithmeticError,
    OverflowError,
    ZeroDivisionError,

    // --- LookupError hierarchy ---
    LookupError,
    IndexError,
    KeyError,

    // --- RuntimeError hierarchy ---
    RuntimeError,
    NotImplementedError,
    RecursionError,

    AttributeError,

    // --- NameError hierarchy ---
    NameError,
    /// Reading a frame slot that has not been assigned.
    UnboundLocalError,

    ValueError,

    // --- Standalone exception types ---
    AssertionError,
    MemoryError,
    ReferenceError,
    StopAsyncIteration,
    StopIteration,
    SystemError,
    TimeoutError,
    TypeError,
}

impl ExcType {
    /// Checks if this exception type is a subclass of another exception type.
    ///
    /// Returns true if `self` would be caught by `except handler_type:`.
    #[must_use]
    pub fn is_subclass_of(self, handler_type: Self) -> bool {
        if self == handler_type {
            return true;
        }
        match handler_type {
            Self::BaseException => true,
            // Exception catches everything except the direct BaseException subclasses
            Self::Exception => !matches!(
                self,
                Self::BaseException | Self::KeyboardInterrupt | Self::SystemExit | Self::GeneratorExit
            ),
            Self::LookupError => matches!(self, Self::KeyError | Self::IndexError),
            Self::ArithmeticError => matches!(self, Self::ZeroDivisionError | Self::OverflowError),
            Self::RuntimeError => matches!(self, Self::RecursionError | Self::NotImplementedError),
            Self::NameError => matches!(self, Self::UnboundLocalError),
            _ => false,
        }
    }

    /// Creates a TypeError for missing positional arguments.
    ///
    /// Matches CPython's format: `{name}() missing {count} required positional argument(s): 'a' and 'b'`
    #[must_use]
    pub(crate) fn type_error_missing_positional_with_names(name: &str, missing_names: &[&str]) -> RunError {
        let count = missing_names.len();
        let names_str = format_param_names(missing_names);
        if count == 1 {
            SimpleException::new_msg(
                Self::TypeError,
                format!("{name}() missing 1 required positional argument: {names_str}"),
            )
            .into()
        } else {
            SimpleException::new_msg(
                Self::TypeError,
                format!("{name}() missing {count} required positional arguments: {names_str}"),
            )
            .into()
        }
    }

    /// Creates a TypeError for too many positional arguments.
    ///
    /// Matches CPython's format: `{name}() takes {max} positional argument(s) but {actual} were given`
    #[must_use]
    pub(crate) fn type_error_too_many_positional(name: &str, max: usize, actual: usize) -> RunError {
        let takes_word = if max == 1 { "argument" } else { "arguments" };
        let were = if actual == 1 { "was" } else { "were" };
        SimpleException::new_msg(
            Self::TypeError,
            format!("{name}() takes {max} positional {takes_word} but {actual} {were} given"),
        )
        .into()
    }

    /// Creates a TypeError for a builtin that takes no arguments.
    ///
    /// Matches CPython's format: `{name}() takes no arguments ({count} given)`
    #[must_use]
    pub(crate) fn type_error_no_args(name: &str, count: usize) -> RunError {
        SimpleException::new_msg(Self::TypeError, format!("{name}() takes no arguments ({count} given)")).into()
    }

    /// Creates a TypeError for a builtin that takes an exact argument count.
    ///
    /// Matches CPython's format: `{name}() takes exactly {n} argument(s) ({count} given)`
    #[must_use]
    pub(crate) fn type_error_arg_count(name: &str, expected: usize, count: usize) -> RunError {
        let word = if expected == 1 { "argument" } else { "arguments" };
        SimpleException::new_msg(
            Self::TypeError,
            format!("{name}() takes exactly {expected} {word} ({count} given)"),
        )
        .into()
    }

    /// Creates a TypeError for a builtin that accepts no keyword arguments.
    #[must_use]
    pub(crate) fn type_error_no_kwargs(name: &str) -> RunError {
        SimpleException::new_msg(Self::TypeError, format!("{name}() takes no keyword arguments")).into()
    }

    /// Creates a TypeError for duplicate argument.
    ///
    /// Matches CPython's format: `{name}() got multiple values for argument '{param}'`
    #[must_use]
    pub(crate) fn type_error_duplicate_arg(name: &str, param: &str) -> RunError {
        SimpleException::new_msg(
            Self::TypeError,
            format!("{name}() got multiple values for argument '{param}'"),
        )
        .into()
    }

    /// Creates a TypeError for a keyword supplied both explicitly and through `**`.
    ///
    /// Matches CPython's format: `{name}() got multiple values for keyword argument '{key}'`
    #[must_use]
    pub(crate) fn type_error_multiple_values(name: &str, key: &str) -> RunError {
        SimpleException::new_msg(
            Self::TypeError,
            format!("{name}() got multiple values for keyword argument '{key}'"),
        )
        .into()
    }

    /// Creates a TypeError for unexpected keyword argument.
    ///
    /// Matches CPython's format: `{name}() got an unexpected keyword argument '{key}'`
    #[must_use]
    pub(crate) fn type_error_unexpected_keyword(name: &str, key: &str) -> RunError {
        SimpleException::new_msg(
            Self::TypeError,
            format!("{name}() got an unexpected keyword argument '{key}'"),
        )
        .into()
    }

    /// Creates a TypeError for `**kwargs` argument that is not a mapping.
    #[must_use]
    pub(crate) fn type_error_kwargs_not_mapping(name: &str, type_name: &str) -> RunError {
        SimpleException::new_msg(
            Self::TypeError,
            format!("{name}() argument after ** must be a mapping, not {type_name}"),
        )
        .into()
    }

    /// Creates a TypeError for `*args` argument that cannot be iterated.
    #[must_use]
    pub(crate) fn type_error_args_not_iterable(name: &str, type_name: &str) -> RunError {
        SimpleException::new_msg(
            Self::TypeError,
            format!("{name}() argument after * must be an iterable, not {type_name}"),
        )
        .into()
    }

    /// Creates a TypeError for `**kwargs` with non-string keys.
    #[must_use]
    pub(crate) fn type_error_kwargs_nonstring_key() -> RunError {
        SimpleException::new_msg(Self::TypeError, "keywords must be strings").into()
    }

    #[must_use]
    pub(crate) fn type_error(msg: impl fmt::Display) -> RunError {
        SimpleException::new_msg(Self::TypeError, msg).into()
    }

    #[must_use]
    pub(crate) fn type_error_not_callable(type_name: &str) -> RunError {
        SimpleException::new_msg(Self::TypeError, format!("'{type_name}' object is not callable")).into()
    }

    #[must_use]
    pub(crate) fn type_error_unhashable(type_name: &str) -> RunError {
        SimpleException::new_msg(Self::TypeError, format!("unhashable type: '{type_name}'")).into()
    }

    /// `throw()`/`raise` with something that is neither an exception class nor an instance.
    #[must_use]
    pub(crate) fn type_error_not_exception(type_name: &str) -> RunError {
        SimpleException::new_msg(
            Self::TypeError,
            format!("exceptions must be classes or instances deriving from BaseException, not {type_name}"),
        )
        .into()
    }

    /// A tuple passed to an exception match contained something other than a class.
    #[must_use]
    pub(crate) fn type_error_bad_except_clause() -> RunError {
        SimpleException::new_msg(
            Self::TypeError,
            "catching classes that do not inherit from BaseException is not allowed",
        )
        .into()
    }

    #[must_use]
    pub(crate) fn generator_already_executing(coroutine: bool) -> RunError {
        let what = if coroutine { "coroutine" } else { "generator" };
        SimpleException::new_msg(Self::ValueError, format!("{what} already executing")).into()
    }

    #[must_use]
    pub(crate) fn type_error_send_to_fresh(coroutine: bool) -> RunError {
        let what = if coroutine { "coroutine" } else { "generator" };
        SimpleException::new_msg(
            Self::TypeError,
            format!("can't send non-None value to a just-started {what}"),
        )
        .into()
    }

    #[must_use]
    pub(crate) fn generator_ignored_exit(coroutine: bool) -> RunError {
        let what = if coroutine { "coroutine" } else { "generator" };
        SimpleException::new_msg(Self::RuntimeError, format!("{what} ignored GeneratorExit")).into()
    }

    #[must_use]
    pub(crate) fn type_error_not_awaitable(type_name: &str) -> RunError {
        SimpleException::new_msg(
            Self::TypeError,
            format!("object {type_name} can't be used in 'await' expression"),
        )
        .into()
    }

    #[must_use]
    pub(crate) fn coroutine_reused() -> RunError {
        SimpleException::new_msg(Self::RuntimeError, "cannot reuse already awaited coroutine").into()
    }

    #[must_use]
    pub(crate) fn unbound_local(name: &str) -> RunError {
        SimpleException::new_msg(
            Self::UnboundLocalError,
            format!("cannot access local variable '{name}' where it is not associated with a value"),
        )
        .into()
    }

    #[must_use]
    pub(crate) fn type_error_not_generator(type_name: &str) -> RunError {
        SimpleException::new_msg(Self::TypeError, format!("'{type_name}' object is not a generator")).into()
    }
}

/// An exception type paired with an optional message, with no heap involvement.
///
/// This is the cheap form errors are raised in; it becomes an exception instance
/// only when something normalizes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleException {
    exc_type: ExcType,
    arg: Option<String>,
}

impl Display for SimpleException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.arg {
            Some(arg) => write!(f, "{}: {arg}", self.exc_type),
            None => write!(f, "{}", self.exc_type),
        }
    }
}

impl SimpleException {
    #[must_use]
    pub fn new(exc_type: ExcType, arg: Option<String>) -> Self {
        Self { exc_type, arg }
    }

    #[must_use]
    pub fn new_msg(exc_type: ExcType, arg: impl fmt::Display) -> Self {
        Self {
            exc_type,
            arg: Some(arg.to_string()),
        }
    }

    #[must_use]
    pub fn exc_type(&self) -> ExcType {
        self.exc_type
    }

    #[must_use]
    pub fn arg(&self) -> Option<&String> {
        self.arg.as_ref()
    }
}

/// One entry of a traceback: the frame an exception passed through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracebackEntry {
    pub name: String,
    pub filename: String,
    pub line: u32,
}

/// The value half of an exception triple before normalization.
///
/// `Message` is an unallocated single string argument; `Object` is any value,
/// which may already be an instance of the triple's type.
#[derive(Debug)]
pub enum ExcValue {
    Absent,
    Message(String),
    Object(Value),
}

/// An exception-state triple: type, value and traceback.
///
/// The triple owns its values and must be released with `drop_with_heap` or moved
/// into another owner; it is never implicitly duplicated.
#[derive(Debug)]
pub struct ExcTriple {
    /// Exception class: `Value::ExcClass` or a reference to a user class.
    pub exc_type: Value,
    pub value: ExcValue,
    /// Innermost frame first.
    pub traceback: Vec<TracebackEntry>,
}

impl ExcTriple {
    #[must_use]
    pub fn new(exc_type: Value, value: ExcValue) -> Self {
        Self {
            exc_type,
            value,
            traceback: Vec::new(),
        }
    }

    /// True once the value is an exception instance.
    ///
    /// This does not re-check that the instance belongs to `exc_type`; the
    /// normalizer is the only producer of `Object` values for raised classes.
    #[must_use]
    pub fn is_normalized(&self, heap: &Heap) -> bool {
        match &self.value {
            ExcValue::Object(Value::Ref(id)) => matches!(heap.get(*id), HeapData::Exception(_)),
            _ => false,
        }
    }

    /// Returns the builtin type of the exception if its class is (or derives from) a builtin.
    #[must_use]
    pub fn builtin_type(&self, heap: &Heap) -> Option<ExcType> {
        crate::types::class::builtin_base_of(&self.exc_type, heap)
    }

    /// Appends the frame an error is leaving to the traceback.
    pub(crate) fn push_traceback(&mut self, entry: TracebackEntry) {
        self.traceback.push(entry);
    }

    /// Duplicates the triple, taking new references to the contained values.
    #[must_use]
    pub fn clone_with_heap(&self, heap: &Heap) -> Self {
        let value = match &self.value {
            ExcValue::Absent => ExcValue::Absent,
            ExcValue::Message(m) => ExcValue::Message(m.clone()),
            ExcValue::Object(v) => ExcValue::Object(v.clone_with_heap(heap)),
        };
        Self {
            exc_type: self.exc_type.clone_with_heap(heap),
            value,
            traceback: self.traceback.clone(),
        }
    }

    /// Converts the triple into the public heapless form.
    #[must_use]
    pub fn into_exception(self, heap: &mut Heap) -> Exception {
        let type_name = crate::types::class::class_name(&self.exc_type, heap).into_owned();
        let exc_type = self.builtin_type(heap).unwrap_or(ExcType::Exception);
        let message = match &self.value {
            ExcValue::Absent => None,
            ExcValue::Message(m) => Some(m.clone()),
            ExcValue::Object(v) => crate::types::exception::message_of(v, heap),
        };
        let traceback = self.traceback.iter().rev().map(StackFrame::from).collect();
        self.drop_with_heap(heap);
        Exception::new_full(exc_type, type_name, message, traceback)
    }
}

impl From<SimpleException> for ExcTriple {
    fn from(exc: SimpleException) -> Self {
        let value = match exc.arg {
            Some(arg) => ExcValue::Message(arg),
            None => ExcValue::Absent,
        };
        Self::new(Value::ExcClass(exc.exc_type), value)
    }
}

impl DropWithHeap for ExcValue {
    fn drop_with_heap(self, heap: &mut Heap) {
        if let Self::Object(v) = self {
            v.drop_with_heap(heap);
        }
    }
}

impl DropWithHeap for ExcTriple {
    fn drop_with_heap(self, heap: &mut Heap) {
        self.exc_type.drop_with_heap(heap);
        self.value.drop_with_heap(heap);
    }
}

/// Runtime error types that can occur during execution.
///
/// Three variants:
/// - `Internal`: Bug in the engine implementation (static message)
/// - `Exc`: exception that generator and function bodies can catch
/// - `UncatchableExc`: exception from resource exhaustion that bodies cannot catch
#[derive(Debug)]
pub enum RunError {
    /// Internal engine error - indicates a bug in strand, not user code.
    Internal(Cow<'static, str>),
    /// Catchable exception (e.g., ValueError, TypeError).
    Exc(Box<ExcTriple>),
    /// Uncatchable exception from resource exhaustion (MemoryError, budget overflows).
    UncatchableExc(Box<ExcTriple>),
}

impl From<ExcTriple> for RunError {
    fn from(exc: ExcTriple) -> Self {
        Self::Exc(Box::new(exc))
    }
}

impl From<SimpleException> for RunError {
    fn from(exc: SimpleException) -> Self {
        Self::Exc(Box::new(exc.into()))
    }
}

impl RunError {
    pub fn internal(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Internal(msg.into())
    }

    /// Wraps a simple exception as an uncatchable error.
    #[must_use]
    pub fn uncatchable(exc: SimpleException) -> Self {
        Self::UncatchableExc(Box::new(exc.into()))
    }

    /// Converts this runtime error to an `Exception` for the public API.
    ///
    /// Internal errors are converted to `RuntimeError` exceptions with no traceback.
    #[must_use]
    pub fn into_exception(self, heap: &mut Heap) -> Exception {
        match self {
            Self::Exc(exc) | Self::UncatchableExc(exc) => exc.into_exception(heap),
            Self::Internal(err) => Exception::runtime_error(format!("Internal error in strand: {err}")),
        }
    }

    /// Returns the contained triple, if this is an exception at all.
    #[must_use]
    pub fn triple(&self) -> Option<&ExcTriple> {
        match self {
            Self::Exc(exc) | Self::UncatchableExc(exc) => Some(exc),
            Self::Internal(_) => None,
        }
    }

    /// Takes the triple out of a catchable error, as an `except` clause would.
    ///
    /// Internal and uncatchable errors are handed back unchanged.
    pub fn into_catchable(self) -> Result<ExcTriple, Self> {
        match self {
            Self::Exc(exc) => Ok(*exc),
            other => Err(other),
        }
    }

    /// Returns true if this error is a catchable exception of `exc_type` or a subclass of it.
    #[must_use]
    pub fn is_exception_type(&self, exc_type: ExcType, heap: &Heap) -> bool {
        match self {
            Self::Exc(exc) => exc.builtin_type(heap).is_some_and(|t| t.is_subclass_of(exc_type)),
            _ => false,
        }
    }

    /// Returns true if this error is a StopIteration exception.
    #[must_use]
    pub fn is_stop_iteration(&self, heap: &Heap) -> bool {
        self.is_exception_type(ExcType::StopIteration, heap)
    }

    /// Adds a traceback entry if this error carries an exception.
    pub(crate) fn with_traceback(mut self, entry: TracebackEntry) -> Self {
        if let Self::Exc(exc) | Self::UncatchableExc(exc) = &mut self {
            exc.push_traceback(entry);
        }
        self
    }
}

impl DropWithHeap for RunError {
    fn drop_with_heap(self, heap: &mut Heap) {
        match self {
            Self::Exc(exc) | Self::UncatchableExc(exc) => exc.drop_with_heap(heap),
            Self::Internal(_) => {}
        }
    }
}

/// Formats a list of parameter names for error messages.
///
/// Examples:
/// - `["a"]` -> `'a'`
/// - `["a", "b"]` -> `'a' and 'b'`
/// - `["a", "b", "c"]` -> `'a', 'b' and 'c'`
fn format_param_names(names: &[&str]) -> String {
    match names {
        [] => String::new(),
        [one] => format!("'{one}'"),
        [first, second] => format!("'{first}' and '{second}'"),
        [rest @ .., last] => {
            let rest: Vec<_> = rest.iter().map(|n| format!("'{n}'")).collect();
            format!("{} and '{last}'", rest.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_names_are_joined_like_cpython() {
        assert_eq!(format_param_names(&["a"]), "'a'");
        assert_eq!(format_param_names(&["a", "b"]), "'a' and 'b'");
        assert_eq!(format_param_names(&["a", "b", "c"]), "'a', 'b' and 'c'");
    }

    #[test]
    fn generator_exit_is_not_an_exception() {
        assert!(!ExcType::GeneratorExit.is_subclass_of(ExcType::Exception));
        assert!(ExcType::GeneratorExit.is_subclass_of(ExcType::BaseException));
        assert!(ExcType::RecursionError.is_subclass_of(ExcType::RuntimeError));
        assert!(ExcType::StopIteration.is_subclass_of(ExcType::Exception));
    }

    #[test]
    fn exc_type_parses_from_name() {
        assert_eq!("ValueError".parse::<ExcType>(), Ok(ExcType::ValueError));
        let name: &'static str = ExcType::GeneratorExit.into();
        assert_eq!(name, "GeneratorExit");
    }
}
