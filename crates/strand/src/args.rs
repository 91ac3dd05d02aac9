use std::vec::IntoIter;

use smallvec::SmallVec;

use crate::{
    exception_private::{ExcType, RunResult},
    heap::{DropWithHeap, Heap, HeapGuard},
    value::Value,
};

/// Largest fixed arity accepted by `Runtime::call_n`.
pub const MAX_FIXED_ARITY: usize = 10;

/// Positional arguments collected while merging `*args`, inline for typical calls.
pub(crate) type PositionalArgs = SmallVec<[Value; 8]>;

/// Call arguments.
///
/// Uses specific variants for common cases (0-2 arguments).
/// Most calls have at most 2 arguments, so this
/// eliminates the Vec heap allocation overhead for the vast majority of calls.
#[derive(Debug)]
pub enum ArgValues {
    Empty,
    One(Value),
    Two(Value, Value),
    Kwargs(KwargsValues),
    ArgsKargs { args: Vec<Value>, kwargs: KwargsValues },
}

impl From<Vec<Value>> for ArgValues {
    fn from(args: Vec<Value>) -> Self {
        let mut iter = args.into_iter();
        match (iter.len(), iter.next(), iter.next()) {
            (0, _, _) => Self::Empty,
            (1, Some(a), _) => Self::One(a),
            (2, Some(a), Some(b)) => Self::Two(a, b),
            (_, a, b) => {
                let args: Vec<Value> = a.into_iter().chain(b).chain(iter).collect();
                Self::ArgsKargs {
                    args,
                    kwargs: KwargsValues::Empty,
                }
            }
        }
    }
}

impl<const N: usize> From<[Value; N]> for ArgValues {
    fn from(args: [Value; N]) -> Self {
        Self::from(Vec::from(args))
    }
}

impl ArgValues {
    /// Builds the bundle from separately collected positional and keyword arguments.
    #[must_use]
    pub fn from_parts(args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Self {
        if kwargs.is_empty() {
            return Self::from(args);
        }
        let kwargs = KwargsValues::Inline(kwargs);
        if args.is_empty() {
            Self::Kwargs(kwargs)
        } else {
            Self::ArgsKargs { args, kwargs }
        }
    }

    /// Checks that zero arguments were passed.
    ///
    /// On error, properly drops all contained values to maintain reference counts.
    pub fn check_zero_args(self, name: &str, heap: &mut Heap) -> RunResult<()> {
        match self {
            Self::Empty => Ok(()),
            other => {
                let count = other.count();
                other.drop_with_heap(heap);
                Err(ExcType::type_error_no_args(name, count))
            }
        }
    }

    /// Checks that exactly one positional argument was passed, returning it.
    ///
    /// On error, properly drops all contained values to maintain reference counts.
    pub fn get_one_arg(self, name: &str, heap: &mut Heap) -> RunResult<Value> {
        match self {
            Self::One(a) => Ok(a),
            other => {
                let count = other.count();
                other.drop_with_heap(heap);
                Err(ExcType::type_error_arg_count(name, 1, count))
            }
        }
    }

    /// Checks that exactly two positional arguments were passed, returning them as a tuple.
    ///
    /// On error, properly drops all contained values to maintain reference counts.
    pub fn get_two_args(self, name: &str, heap: &mut Heap) -> RunResult<(Value, Value)> {
        match self {
            Self::Two(a1, a2) => Ok((a1, a2)),
            other => {
                let count = other.count();
                other.drop_with_heap(heap);
                Err(ExcType::type_error_arg_count(name, 2, count))
            }
        }
    }

    /// Returns the positional arguments, rejecting any keyword arguments.
    pub fn into_positional(self, name: &str, heap: &mut Heap) -> RunResult<Vec<Value>> {
        let (pos, kwargs) = self.into_parts();
        if !kwargs.is_empty() {
            pos.drop_with_heap(heap);
            kwargs.drop_with_heap(heap);
            return Err(ExcType::type_error_no_kwargs(name));
        }
        Ok(pos.collect())
    }

    /// Splits into positional iterator and keyword values without allocating
    /// for the common One/Two cases.
    #[must_use]
    pub fn into_parts(self) -> (ArgPosIter, KwargsValues) {
        match self {
            Self::Empty => (ArgPosIter::Empty, KwargsValues::Empty),
            Self::One(v) => (ArgPosIter::One(Some(v)), KwargsValues::Empty),
            Self::Two(v1, v2) => (ArgPosIter::Two(Some(v1), Some(v2)), KwargsValues::Empty),
            Self::Kwargs(kwargs) => (ArgPosIter::Empty, kwargs),
            Self::ArgsKargs { args, kwargs } => (ArgPosIter::Vec(args.into_iter()), kwargs),
        }
    }

    /// Returns the number of positional arguments.
    ///
    /// For `Kwargs` returns 0, for `ArgsKargs` returns only the positional args count.
    #[must_use]
    pub fn count(&self) -> usize {
        match self {
            Self::Empty | Self::Kwargs(_) => 0,
            Self::One(_) => 1,
            Self::Two(_, _) => 2,
            Self::ArgsKargs { args, .. } => args.len(),
        }
    }
}

impl DropWithHeap for ArgValues {
    fn drop_with_heap(self, heap: &mut Heap) {
        match self {
            Self::Empty => {}
            Self::One(v) => v.drop_with_heap(heap),
            Self::Two(v1, v2) => {
                v1.drop_with_heap(heap);
                v2.drop_with_heap(heap);
            }
            Self::Kwargs(kwargs) => {
                kwargs.drop_with_heap(heap);
            }
            Self::ArgsKargs { args, kwargs } => {
                args.drop_with_heap(heap);
                kwargs.drop_with_heap(heap);
            }
        }
    }
}

/// Iterator over positional arguments without allocation.
///
/// Supports iterating over `ArgValues::One/Two` without converting to Vec.
/// This iterator must be fully consumed OR explicitly dropped with
/// `drop_with_heap()` to maintain correct reference counts.
///
/// The iterator yields values by ownership transfer. Once a value is yielded,
/// the caller is responsible for either using it or calling `drop_with_heap()` on it.
pub enum ArgPosIter {
    Empty,
    One(Option<Value>),
    Two(Option<Value>, Option<Value>),
    Vec(IntoIter<Value>),
}

impl Iterator for ArgPosIter {
    type Item = Value;

    #[inline]
    fn next(&mut self) -> Option<Value> {
        match self {
            Self::Empty => None,
            Self::One(v) => v.take(),
            Self::Two(v1, v2) => v1.take().or_else(|| v2.take()),
            Self::Vec(iter) => iter.next(),
        }
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        match self {
            Self::Empty => (0, Some(0)),
            Self::One(v) => {
                let n = usize::from(v.is_some());
                (n, Some(n))
            }
            Self::Two(v1, v2) => {
                let n = usize::from(v1.is_some()) + usize::from(v2.is_some());
                (n, Some(n))
            }
            Self::Vec(iter) => iter.size_hint(),
        }
    }
}

impl ExactSizeIterator for ArgPosIter {}

impl DropWithHeap for ArgPosIter {
    fn drop_with_heap(self, heap: &mut Heap) {
        for value in self {
            value.drop_with_heap(heap);
        }
    }
}

/// Keyword arguments, in call order.
#[derive(Debug)]
pub enum KwargsValues {
    Empty,
    Inline(Vec<(String, Value)>),
}

impl KwargsValues {
    /// Returns the number of keyword arguments.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Inline(kvs) => kvs.len(),
        }
    }

    /// Returns true if there are no keyword arguments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DropWithHeap for KwargsValues {
    fn drop_with_heap(self, heap: &mut Heap) {
        if let Self::Inline(kvs) = self {
            kvs.drop_with_heap(heap);
        }
    }
}

impl IntoIterator for KwargsValues {
    type Item = (String, Value);
    type IntoIter = IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        match self {
            Self::Empty => Vec::new().into_iter(),
            Self::Inline(kvs) => kvs.into_iter(),
        }
    }
}

/// Positional and keyword arguments being assembled for a star call.
///
/// Owned in one place so an error part-way through releases everything.
#[derive(Debug, Default)]
pub(crate) struct PendingArgs {
    pub positional: PositionalArgs,
    pub kwargs: Vec<(String, Value)>,
}

impl PendingArgs {
    pub fn into_arg_values(self) -> ArgValues {
        ArgValues::from_parts(self.positional.into_vec(), self.kwargs)
    }
}

impl DropWithHeap for PendingArgs {
    fn drop_with_heap(self, heap: &mut Heap) {
        self.positional.drop_with_heap(heap);
        self.kwargs.drop_with_heap(heap);
    }
}

/// Guard used by the star-call merge; see [`PendingArgs`].
pub(crate) type PendingGuard<'a, H> = HeapGuard<'a, H, PendingArgs>;
