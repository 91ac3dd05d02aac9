use std::fmt;

use crate::exception_private::{ExcType, RunError, SimpleException};

/// Error returned when a resource limit is exceeded during execution.
///
/// The runtime consults its tracker before heap allocations and frame pushes so
/// that hosts can bound what generator bodies are allowed to consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// Maximum number of allocations exceeded.
    Allocation { limit: usize, count: usize },
    /// Maximum memory usage exceeded.
    Memory { limit: usize, used: usize },
    /// Maximum recursion depth exceeded.
    Recursion { limit: usize, depth: usize },
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allocation { limit, count } => {
                write!(f, "allocation limit exceeded: {count} > {limit}")
            }
            Self::Memory { limit, used } => {
                write!(f, "memory limit exceeded: {used} bytes > {limit} bytes")
            }
            Self::Recursion { .. } => {
                write!(f, "maximum recursion depth exceeded")
            }
        }
    }
}

impl std::error::Error for ResourceError {}

impl ResourceError {
    /// Maps the resource error onto the exception type user code observes.
    ///
    /// - `Allocation` → `MemoryError`
    /// - `Memory` → `MemoryError`
    /// - `Recursion` → `RecursionError`
    #[must_use]
    pub(crate) fn into_simple_exception(self) -> SimpleException {
        let exc_type = match self {
            Self::Allocation { .. } | Self::Memory { .. } => ExcType::MemoryError,
            Self::Recursion { .. } => ExcType::RecursionError,
        };
        SimpleException::new_msg(exc_type, self)
    }
}

impl From<ResourceError> for RunError {
    fn from(err: ResourceError) -> Self {
        // RecursionError stays catchable so generator bodies can recover from deep
        // delegation chains; memory exhaustion is never catchable.
        if matches!(err, ResourceError::Recursion { .. }) {
            Self::Exc(Box::new(err.into_simple_exception().into()))
        } else {
            Self::UncatchableExc(Box::new(err.into_simple_exception().into()))
        }
    }
}

/// Trait for tracking resource usage.
///
/// The heap owns a boxed tracker, so the trait stays object safe: sizes are
/// passed as plain estimates rather than lazily computed.
pub trait ResourceTracker: fmt::Debug {
    /// Called before each heap allocation.
    ///
    /// Returns `Ok(())` if the allocation should proceed, or `Err(ResourceError)`
    /// if a limit would be exceeded.
    ///
    /// # Arguments
    /// * `size` - Approximate size in bytes of the allocation
    fn on_allocate(&mut self, size: usize) -> Result<(), ResourceError>;

    /// Called when memory is freed by `dec_ref`.
    ///
    /// # Arguments
    /// * `size` - Size in bytes of the freed allocation
    fn on_free(&mut self, size: usize);

    /// Called before pushing a new frame to check recursion depth.
    ///
    /// # Arguments
    /// * `current_depth` - Current frame stack depth (before the new frame is pushed)
    fn check_recursion_depth(&self, current_depth: usize) -> Result<(), ResourceError>;

    /// Returns the total number of allocations tracked, if this tracker records them.
    fn allocation_count(&self) -> Option<usize> {
        None
    }

    /// Returns the current approximate memory usage in bytes, if tracked.
    fn current_memory_bytes(&self) -> Option<usize> {
        None
    }
}

/// A tracker that enforces nothing except the default recursion depth.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLimitTracker;

impl ResourceTracker for NoLimitTracker {
    #[inline]
    fn on_allocate(&mut self, _size: usize) -> Result<(), ResourceError> {
        Ok(())
    }

    #[inline]
    fn on_free(&mut self, _size: usize) {}

    /// The default value of 1000 matches CPython behavior.
    #[inline]
    fn check_recursion_depth(&self, current_depth: usize) -> Result<(), ResourceError> {
        if current_depth >= DEFAULT_MAX_RECURSION_DEPTH {
            Err(ResourceError::Recursion {
                limit: DEFAULT_MAX_RECURSION_DEPTH,
                depth: current_depth + 1,
            })
        } else {
            Ok(())
        }
    }
}

/// Configuration for resource limits.
///
/// All limits are optional - set to `None` to disable a specific limit.
/// Use `ResourceLimits::default()` for no limits, or build custom limits
/// with the builder pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ResourceLimits {
    /// Maximum number of heap allocations allowed.
    pub max_allocations: Option<usize>,
    /// Maximum heap memory in bytes (approximate).
    pub max_memory: Option<usize>,
    /// Maximum frame stack depth.
    pub max_recursion_depth: Option<usize>,
}

/// Recommended maximum recursion depth if not otherwise specified.
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 1000;

impl ResourceLimits {
    /// Creates a new ResourceLimits with all limits disabled, except max recursion which is set to 1000.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_recursion_depth: Some(DEFAULT_MAX_RECURSION_DEPTH),
            ..Default::default()
        }
    }

    /// Sets the maximum number of allocations.
    #[must_use]
    pub fn max_allocations(mut self, limit: usize) -> Self {
        self.max_allocations = Some(limit);
        self
    }

    /// Sets the maximum memory usage in bytes.
    #[must_use]
    pub fn max_memory(mut self, limit: usize) -> Self {
        self.max_memory = Some(limit);
        self
    }

    /// Sets the maximum recursion depth (frame stack depth).
    #[must_use]
    pub fn max_recursion_depth(mut self, limit: Option<usize>) -> Self {
        self.max_recursion_depth = limit;
        self
    }

    /// True when no limit is set, in which case [`NoLimitTracker`] is sufficient.
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.max_allocations.is_none()
            && self.max_memory.is_none()
            && self.max_recursion_depth.is_none_or(|d| d == DEFAULT_MAX_RECURSION_DEPTH)
    }

    /// Builds the tracker that enforces these limits.
    #[must_use]
    pub(crate) fn into_tracker(self) -> Box<dyn ResourceTracker> {
        if self.is_unlimited() {
            Box::new(NoLimitTracker)
        } else {
            Box::new(LimitedTracker::new(self))
        }
    }
}

/// A resource tracker that enforces configurable limits.
#[derive(Debug)]
pub struct LimitedTracker {
    limits: ResourceLimits,
    /// Total number of allocations made.
    allocation_count: usize,
    /// Current approximate memory usage in bytes.
    current_memory: usize,
}

impl LimitedTracker {
    /// Creates a new LimitedTracker with the given limits.
    #[must_use]
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            allocation_count: 0,
            current_memory: 0,
        }
    }
}

impl ResourceTracker for LimitedTracker {
    fn on_allocate(&mut self, size: usize) -> Result<(), ResourceError> {
        if let Some(max) = self.limits.max_allocations
            && self.allocation_count >= max
        {
            return Err(ResourceError::Allocation {
                limit: max,
                count: self.allocation_count + 1,
            });
        }

        if let Some(max) = self.limits.max_memory {
            let new_memory = self.current_memory + size;
            if new_memory > max {
                return Err(ResourceError::Memory {
                    limit: max,
                    used: new_memory,
                });
            }
        }

        self.allocation_count += 1;
        self.current_memory += size;
        Ok(())
    }

    fn on_free(&mut self, size: usize) {
        self.current_memory = self.current_memory.saturating_sub(size);
    }

    fn check_recursion_depth(&self, current_depth: usize) -> Result<(), ResourceError> {
        if let Some(max) = self.limits.max_recursion_depth {
            // current_depth is before push, so new depth would be current_depth + 1
            if current_depth >= max {
                return Err(ResourceError::Recursion {
                    limit: max,
                    depth: current_depth + 1,
                });
            }
        }
        Ok(())
    }

    fn allocation_count(&self) -> Option<usize> {
        Some(self.allocation_count)
    }

    fn current_memory_bytes(&self) -> Option<usize> {
        Some(self.current_memory)
    }
}
