//! Fibers: independent execution stacks that generator bodies run on.
//!
//! A fiber is a corosensei coroutine that takes a [`FiberInput`] on every
//! resumption, yields [`Value`]s and finally returns the body's result.
//! Stacks come from a [`StackPool`], which caches a single released stack so
//! that the common "create, exhaust, create again" pattern does not go back to
//! the allocator.
//!
//! ```text
//!   Unused ──prepare──▶ Prepared ──resume──▶ ... ──release──▶ (stack back to pool)
//! ```

use std::{cell::RefCell, fmt, io, ptr::NonNull, sync::Arc};

use corosensei::{Coroutine, CoroutineResult, Yielder, stack::DefaultStack, stack::Stack};
use parking_lot::Mutex;

use crate::{
    exception_private::{ExcTriple, ExcType, RunError, RunResult, SimpleException},
    runtime::Runtime,
    value::Value,
};

/// What a suspended body receives when it is resumed.
pub(crate) enum ResumeSignal {
    /// Value for the pending `yield` expression.
    Send(Value),
    /// Exception to raise at the suspension point.
    Throw(ExcTriple),
}

/// Input passed into a fiber on every resumption.
///
/// The runtime pointer is only valid until the fiber next suspends; it is
/// refreshed on each resumption.
pub(crate) struct FiberInput {
    pub(crate) rt: NonNull<Runtime>,
    pub(crate) signal: ResumeSignal,
}

pub(crate) type FiberYielder = Yielder<FiberInput, Value>;

type FiberCoroutine = Coroutine<FiberInput, Value, RunResult<Value>, DefaultStack>;

/// Usable size of a stack, guard page excluded.
fn stack_size_of(stack: &DefaultStack) -> usize {
    stack.base().get() - stack.limit().get()
}

/// Cache of released fiber stacks.
///
/// Both implementations keep at most one stack: a released stack is kept only
/// when the slot is empty, and handed out only when it is at least as large as
/// the request.
pub trait StackPool: fmt::Debug {
    /// Takes the cached stack if it is at least `min_size` bytes.
    fn take(&self, min_size: usize) -> Option<DefaultStack>;

    /// Offers a stack back to the pool. Dropped if the slot is occupied.
    fn give(&self, stack: DefaultStack);

    /// True if a stack is currently cached.
    fn is_cached(&self) -> bool;
}

/// Single-threaded one-slot pool. The default for a runtime.
#[derive(Default)]
pub struct LocalStackPool {
    slot: RefCell<Option<DefaultStack>>,
}

impl fmt::Debug for LocalStackPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStackPool")
            .field("cached", &self.is_cached())
            .finish()
    }
}

impl StackPool for LocalStackPool {
    fn take(&self, min_size: usize) -> Option<DefaultStack> {
        let mut slot = self.slot.borrow_mut();
        if slot.as_ref().is_some_and(|s| stack_size_of(s) >= min_size) {
            slot.take()
        } else {
            None
        }
    }

    fn give(&self, stack: DefaultStack) {
        let mut slot = self.slot.borrow_mut();
        if slot.is_none() {
            *slot = Some(stack);
        }
    }

    fn is_cached(&self) -> bool {
        self.slot.borrow().is_some()
    }
}

/// One-slot pool shared by runtimes on different threads.
///
/// Cloning shares the slot. Each thread still owns its own runtime; only
/// released stacks cross threads, guarded by a `parking_lot` mutex.
#[derive(Clone, Default)]
pub struct SharedStackPool {
    slot: Arc<Mutex<Option<DefaultStack>>>,
}

impl fmt::Debug for SharedStackPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedStackPool")
            .field("cached", &self.is_cached())
            .finish()
    }
}

impl StackPool for SharedStackPool {
    fn take(&self, min_size: usize) -> Option<DefaultStack> {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|s| stack_size_of(s) >= min_size) {
            slot.take()
        } else {
            None
        }
    }

    fn give(&self, stack: DefaultStack) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(stack);
        }
    }

    fn is_cached(&self) -> bool {
        self.slot.lock().is_some()
    }
}

/// A generator's execution context.
pub(crate) enum Fiber {
    /// No stack yet.
    Unused,
    /// Has a stack and an entry point; may be started, suspended, or done.
    Prepared(FiberCoroutine),
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unused => f.write_str("Fiber::Unused"),
            Self::Prepared(co) => f
                .debug_struct("Fiber::Prepared")
                .field("started", &co.started())
                .field("done", &co.done())
                .finish(),
        }
    }
}

impl Fiber {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self::Unused
    }

    /// Gives the fiber a stack and an entry point.
    ///
    /// Reuses the pool's cached stack when it is large enough, otherwise
    /// allocates one. Returns whether the cached stack was reused. Failing to
    /// allocate is reported as an uncatchable `MemoryError`.
    pub(crate) fn prepare<F>(&mut self, pool: &dyn StackPool, stack_size: usize, entry: F) -> RunResult<bool>
    where
        F: FnOnce(&FiberYielder, FiberInput) -> RunResult<Value> + 'static,
    {
        if !matches!(self, Self::Unused) {
            return Err(RunError::internal("fiber prepared twice"));
        }
        let (stack, reused) = match pool.take(stack_size) {
            Some(stack) => (stack, true),
            None => (DefaultStack::new(stack_size).map_err(stack_alloc_error)?, false),
        };
        *self = Self::Prepared(Coroutine::with_stack(stack, entry));
        Ok(reused)
    }

    /// Switches to the fiber until it yields or returns.
    ///
    /// # Panics
    /// Panics if the fiber was never prepared or has already returned.
    pub(crate) fn resume(&mut self, input: FiberInput) -> CoroutineResult<Value, RunResult<Value>> {
        match self {
            Self::Prepared(co) => {
                assert!(!co.done(), "resumed a finished fiber");
                co.resume(input)
            }
            Self::Unused => panic!("resumed an unprepared fiber"),
        }
    }

    #[must_use]
    pub(crate) fn is_suspended(&self) -> bool {
        matches!(self, Self::Prepared(co) if co.started() && !co.done())
    }

    /// Tears the fiber down and returns its stack to the pool.
    ///
    /// A suspended body is force-unwound first, which runs the destructors of
    /// everything on its stack.
    pub(crate) fn release(self, pool: &dyn StackPool) {
        let suspended = self.is_suspended();
        if let Self::Prepared(mut co) = self {
            if suspended {
                co.force_unwind();
            }
            pool.give(co.into_stack());
        }
    }
}

fn stack_alloc_error(err: io::Error) -> RunError {
    RunError::uncatchable(SimpleException::new_msg(
        ExcType::MemoryError,
        format!("cannot allocate fiber stack: {err}"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: usize = 64 * 1024;

    #[test]
    fn pool_keeps_one_stack() {
        let pool = LocalStackPool::default();
        pool.give(DefaultStack::new(SIZE).unwrap());
        pool.give(DefaultStack::new(SIZE).unwrap());
        assert!(pool.is_cached());
        assert!(pool.take(SIZE).is_some());
        assert!(!pool.is_cached(), "slot should be empty after take");
    }

    #[test]
    fn pool_refuses_small_stack() {
        let pool = SharedStackPool::default();
        pool.give(DefaultStack::new(SIZE).unwrap());
        assert!(pool.take(SIZE * 4).is_none(), "cached stack is too small");
        assert!(pool.is_cached(), "a refused stack stays cached");
    }

    #[test]
    fn shared_pool_clones_share_slot() {
        let a = SharedStackPool::default();
        let b = a.clone();
        a.give(DefaultStack::new(SIZE).unwrap());
        assert!(b.take(SIZE).is_some());
        assert!(!a.is_cached());
    }
}
