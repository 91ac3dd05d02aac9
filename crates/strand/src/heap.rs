use std::{
    collections::BTreeMap,
    mem::{ManuallyDrop, size_of},
    ptr::addr_of,
    sync::atomic::{AtomicUsize, Ordering},
    vec,
};

use crate::{
    fiber::StackPool,
    frame::Frame,
    resource::{ResourceError, ResourceTracker},
    types::{Cell, ClassObject, Dict, ExceptionObject, Function, Generator, List, Str, Tuple, WeakRef},
    value::Value,
};

/// Snapshot of heap state at a point in time.
///
/// Captures object counts by type and allocation estimates. Used by tests to
/// assert that generator lifecycles return the heap to its baseline.
///
/// The `objects_by_type` map uses `BTreeMap` for deterministic iteration order,
/// making snapshots suitable for display and comparison without sort overhead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    /// Total number of live objects on the heap.
    pub live_objects: usize,
    /// Number of free (recycled) slots available for reuse.
    pub free_slots: usize,
    /// Total heap capacity (live + free).
    pub total_slots: usize,
    /// Breakdown of live objects by `HeapData` variant name.
    pub objects_by_type: BTreeMap<&'static str, usize>,
    /// Resource tracker allocation count, if using `LimitedTracker`.
    pub tracker_allocations: Option<usize>,
    /// Resource tracker memory usage in bytes, if using `LimitedTracker`.
    pub tracker_memory_bytes: Option<usize>,
}

/// Difference between two heap snapshots.
///
/// Positive deltas mean growth, negative means shrinkage. Only types present in
/// at least one of the two snapshots appear in `objects_by_type_delta`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapDiff {
    /// Change in live object count (`after - before`).
    pub live_objects_delta: isize,
    /// Per-type deltas, zero entries included.
    pub objects_by_type_delta: BTreeMap<&'static str, isize>,
}

impl HeapStats {
    /// Computes the difference between `self` ("before") and `other` ("after").
    #[must_use]
    pub fn diff(&self, other: &Self) -> HeapDiff {
        let mut objects_by_type_delta = BTreeMap::new();
        for (&name, &count) in &self.objects_by_type {
            let after = other.objects_by_type.get(name).copied().unwrap_or(0);
            objects_by_type_delta.insert(name, isize_delta(count, after));
        }
        for (&name, &count) in &other.objects_by_type {
            objects_by_type_delta
                .entry(name)
                .or_insert_with(|| isize_delta(0, count));
        }
        HeapDiff {
            live_objects_delta: isize_delta(self.live_objects, other.live_objects),
            objects_by_type_delta,
        }
    }
}

impl HeapDiff {
    /// Returns `true` when no live object count changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live_objects_delta == 0 && self.objects_by_type_delta.values().all(|&v| v == 0)
    }
}

impl std::fmt::Display for HeapDiff {
    /// Produces a human-readable summary, e.g.:
    ///
    /// ```text
    /// HeapDiff: +3 live objects
    ///   List: +1
    ///   Frame: +2
    /// ```
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "HeapDiff: no changes");
        }
        write!(f, "HeapDiff: {:+} live objects", self.live_objects_delta)?;
        for (&type_name, &delta) in &self.objects_by_type_delta {
            if delta != 0 {
                write!(f, "\n  {type_name}: {delta:+}")?;
            }
        }
        Ok(())
    }
}

fn isize_delta(before: usize, after: usize) -> isize {
    // heap sizes never approach isize::MAX
    after.cast_signed() - before.cast_signed()
}

/// Unique identifier for values stored inside the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct HeapId(usize);

impl HeapId {
    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// HeapData captures every runtime object that must live in the arena.
///
/// Each variant owns whatever heap references it holds; `dec_ref_ids` reports
/// them so freeing a value releases its children.
#[derive(Debug)]
pub enum HeapData {
    Str(Str),
    Tuple(Tuple),
    List(List),
    Dict(Dict),
    Cell(Cell),
    WeakRef(WeakRef),
    Function(Function),
    Class(ClassObject),
    Exception(ExceptionObject),
    Frame(Frame),
    Generator(Generator),
}

impl HeapData {
    /// Variant name used in heap statistics.
    #[must_use]
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "Str",
            Self::Tuple(_) => "Tuple",
            Self::List(_) => "List",
            Self::Dict(_) => "Dict",
            Self::Cell(_) => "Cell",
            Self::WeakRef(_) => "WeakRef",
            Self::Function(_) => "Function",
            Self::Class(_) => "Class",
            Self::Exception(_) => "Exception",
            Self::Frame(_) => "Frame",
            Self::Generator(_) => "Generator",
        }
    }

    /// Approximate size in bytes, reported to the resource tracker.
    #[must_use]
    pub fn estimate_size(&self) -> usize {
        let inline = match self {
            Self::Str(s) => s.as_str().len(),
            Self::Tuple(t) => t.as_slice().len() * size_of::<Value>(),
            Self::List(l) => l.as_slice().len() * size_of::<Value>(),
            Self::Dict(d) => d.len() * 2 * size_of::<Value>(),
            Self::Frame(f) => f.slot_count() * size_of::<Value>(),
            _ => 0,
        };
        size_of::<Self>() + inline
    }

    /// Moves every heap reference owned by this value into `out`.
    ///
    /// With `ref-count-panic` enabled the moved-from values are marked as dereferenced.
    fn dec_ref_ids(&mut self, out: &mut Vec<HeapId>) {
        match self {
            Self::Str(_) | Self::WeakRef(_) => {}
            Self::Tuple(t) => t.dec_ref_ids(out),
            Self::List(l) => l.dec_ref_ids(out),
            Self::Dict(d) => d.dec_ref_ids(out),
            Self::Cell(c) => c.dec_ref_ids(out),
            Self::Function(f) => f.dec_ref_ids(out),
            Self::Class(c) => c.dec_ref_ids(out),
            Self::Exception(e) => e.dec_ref_ids(out),
            Self::Frame(f) => f.dec_ref_ids(out),
            Self::Generator(g) => g.dec_ref_ids(out),
        }
    }
}

/// Arena entry: reference count plus payload.
#[derive(Debug)]
pub struct HeapValue {
    refcount: AtomicUsize,
    data: HeapData,
}

/// Reference-counted arena that backs all heap-only runtime values.
///
/// Uses a free list to reuse slots from freed values, keeping memory usage
/// constant for long-running loops that repeatedly create and drop generators.
/// When a value is freed via `dec_ref`, its slot ID is added to the free list.
/// New allocations pop from the free list when available, otherwise append.
///
/// The heap also owns the fiber stack pool so that freeing a generator returns
/// its stack for reuse regardless of who dropped the last reference.
pub struct Heap {
    entries: Vec<Option<HeapValue>>,
    /// IDs of freed slots available for reuse. Populated by `dec_ref`, consumed by `allocate`.
    free_list: Vec<HeapId>,
    /// Resource tracker for enforcing limits.
    tracker: Box<dyn ResourceTracker>,
    /// Stack cache used when generators are freed.
    stacks: Box<dyn StackPool>,
    /// Suspended generators whose last reference was dropped, waiting for the
    /// runtime to close them. Each entry owns that last reference.
    pending_finalizers: Vec<HeapId>,
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("live", &(self.entries.len() - self.free_list.len()))
            .field("free", &self.free_list.len())
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

impl Heap {
    /// Creates a new heap with the given resource tracker and stack pool.
    #[must_use]
    pub fn new(capacity: usize, tracker: Box<dyn ResourceTracker>, stacks: Box<dyn StackPool>) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            free_list: Vec::new(),
            tracker,
            stacks,
            pending_finalizers: Vec::new(),
        }
    }

    /// Returns the stack pool shared by every fiber allocated from this heap.
    #[must_use]
    pub fn stack_pool(&self) -> &dyn StackPool {
        &*self.stacks
    }

    /// Swaps in a different stack pool, returning the old one.
    pub(crate) fn replace_stack_pool(&mut self, stacks: Box<dyn StackPool>) -> Box<dyn StackPool> {
        std::mem::replace(&mut self.stacks, stacks)
    }

    #[must_use]
    pub fn tracker(&self) -> &dyn ResourceTracker {
        &*self.tracker
    }

    /// Captures a snapshot of heap statistics.
    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        let mut objects_by_type: BTreeMap<&'static str, usize> = BTreeMap::new();
        for value in self.entries.iter().flatten() {
            *objects_by_type.entry(value.data.variant_name()).or_insert(0) += 1;
        }
        HeapStats {
            live_objects: self.entries.len() - self.free_list.len(),
            free_slots: self.free_list.len(),
            total_slots: self.entries.len(),
            objects_by_type,
            tracker_allocations: self.tracker.allocation_count(),
            tracker_memory_bytes: self.tracker.current_memory_bytes(),
        }
    }

    /// Allocates a new heap entry, returning the fresh identifier.
    ///
    /// The new entry starts with a reference count of one, owned by the caller.
    /// Returns `Err(ResourceError)` if allocation would exceed configured limits.
    pub fn allocate(&mut self, data: HeapData) -> Result<HeapId, ResourceError> {
        self.tracker.on_allocate(data.estimate_size())?;
        let new_entry = HeapValue {
            refcount: AtomicUsize::new(1),
            data,
        };

        let id = if let Some(id) = self.free_list.pop() {
            // Reuse a freed slot
            self.entries[id.index()] = Some(new_entry);
            id
        } else {
            let id = self.entries.len();
            self.entries.push(Some(new_entry));
            HeapId(id)
        };
        Ok(id)
    }

    /// Increments the reference count for an existing heap entry.
    ///
    /// # Panics
    /// Panics if the value ID is invalid or the value has already been freed.
    pub fn inc_ref(&self, id: HeapId) {
        let value = self
            .entries
            .get(id.index())
            .expect("Heap::inc_ref: slot missing")
            .as_ref()
            .expect("Heap::inc_ref: object already freed");
        value.refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements the reference count and frees the value (plus children) once it hits zero.
    ///
    /// A suspended generator losing its last reference is not freed here: it is
    /// queued for the runtime to close first (see [`take_finalizer`](Self::take_finalizer)).
    /// Freeing a generator hands its stack back to the pool and clears weak
    /// references registered on it.
    ///
    /// # Panics
    /// Panics if the value ID is invalid or the value has already been freed.
    pub fn dec_ref(&mut self, id: HeapId) {
        let value = {
            let slot = self.entries.get_mut(id.index()).expect("Heap::dec_ref: slot missing");
            let entry = slot.as_mut().expect("Heap::dec_ref: object already freed");
            let count = entry.refcount.load(Ordering::Relaxed);
            if count > 1 {
                entry.refcount.store(count - 1, Ordering::Relaxed);
                return;
            }
            if let HeapData::Generator(generator) = &entry.data
                && generator.needs_finalizer()
            {
                self.pending_finalizers.push(id);
                return;
            }
            slot.take().expect("Heap::dec_ref: object already freed")
        };

        // refcount == 1, free the value and add slot to free list for reuse
        self.free_list.push(id);
        self.tracker.on_free(value.data.estimate_size());

        let mut data = value.data;
        if let HeapData::Generator(generator) = &mut data {
            if let Some(fiber) = generator.fiber.take() {
                fiber.release(&*self.stacks);
            }
            let weakrefs = std::mem::take(&mut generator.weakrefs);
            self.clear_weakrefs(id, &weakrefs);
        }
        let mut child_ids = Vec::new();
        data.dec_ref_ids(&mut child_ids);
        drop(data);
        for child_id in child_ids {
            self.dec_ref(child_id);
        }
    }

    /// Pops a suspended generator queued by [`dec_ref`](Self::dec_ref).
    ///
    /// The caller takes over the queued reference and must release it with
    /// `dec_ref` once the generator is finished.
    pub(crate) fn take_finalizer(&mut self) -> Option<HeapId> {
        self.pending_finalizers.pop()
    }

    /// Clears weakrefs registered on a dying object.
    ///
    /// This sets each weakref's target to `None` so a reused slot cannot be
    /// observed through a stale weak reference.
    fn clear_weakrefs(&mut self, target_id: HeapId, weakref_ids: &[HeapId]) {
        for &weakref_id in weakref_ids {
            if let Some(HeapData::WeakRef(wr)) = self.get_mut_if_live(weakref_id)
                && wr.target() == Some(target_id)
            {
                wr.clear();
            }
        }
    }

    /// Returns an immutable reference to the heap data stored at the given ID.
    ///
    /// # Panics
    /// Panics if the value ID is invalid or the value has already been freed.
    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapData {
        &self
            .entries
            .get(id.index())
            .expect("Heap::get: slot missing")
            .as_ref()
            .expect("Heap::get: object already freed")
            .data
    }

    /// Returns an immutable reference to heap data if the slot is live.
    #[must_use]
    pub fn get_if_live(&self, id: HeapId) -> Option<&HeapData> {
        self.entries.get(id.index())?.as_ref().map(|v| &v.data)
    }

    /// Returns a mutable reference to the heap data stored at the given ID.
    ///
    /// # Panics
    /// Panics if the value ID is invalid or the value has already been freed.
    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self
            .entries
            .get_mut(id.index())
            .expect("Heap::get_mut: slot missing")
            .as_mut()
            .expect("Heap::get_mut: object already freed")
            .data
    }

    /// Returns a mutable reference to heap data if the slot is live.
    #[must_use]
    pub fn get_mut_if_live(&mut self, id: HeapId) -> Option<&mut HeapData> {
        self.entries.get_mut(id.index())?.as_mut().map(|v| &mut v.data)
    }

    /// Returns the reference count of a live entry.
    ///
    /// # Panics
    /// Panics if the value ID is invalid or the value has already been freed.
    #[must_use]
    pub fn get_refcount(&self, id: HeapId) -> usize {
        self.entries
            .get(id.index())
            .expect("Heap::get_refcount: slot missing")
            .as_ref()
            .expect("Heap::get_refcount: object already freed")
            .refcount
            .load(Ordering::Relaxed)
    }

    /// Number of live entries.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.entries.len() - self.free_list.len()
    }
}

/// Drop implementation for Heap that marks all contained values as Dereferenced
/// before dropping to prevent panics when the `ref-count-panic` feature is enabled.
#[cfg(feature = "ref-count-panic")]
impl Drop for Heap {
    fn drop(&mut self) {
        let mut dummy_stack = Vec::new();
        for value in self.entries.iter_mut().flatten() {
            value.data.dec_ref_ids(&mut dummy_stack);
        }
    }
}

/// This trait represents types that contain a `Heap`; it allows for more complex structures
/// to participate in the `HeapGuard` pattern.
pub trait ContainsHeap {
    fn heap_mut(&mut self) -> &mut Heap;
}

impl ContainsHeap for Heap {
    #[inline]
    fn heap_mut(&mut self) -> &mut Self {
        self
    }
}

/// Trait for types that require heap access for proper cleanup.
///
/// Rust's standard `Drop` trait cannot decrement heap reference counts because it has no
/// access to the `Heap`. This trait provides an explicit drop-with-heap method so that
/// ref-counted values (and containers of them) can properly decrement their counts when
/// they are no longer needed.
///
/// **All types implementing this trait must be cleaned up on every code path.** A missed
/// call on any branch leaks reference counts. Prefer [`defer_drop!`] or [`HeapGuard`] to
/// guarantee cleanup automatically rather than inserting manual calls in every branch.
pub trait DropWithHeap {
    /// Consume `self` and decrement reference counts for any heap-allocated values contained within.
    fn drop_with_heap(self, heap: &mut Heap);
}

impl DropWithHeap for Value {
    #[inline]
    fn drop_with_heap(self, heap: &mut Heap) {
        Self::drop_with_heap(self, heap);
    }
}

impl<U: DropWithHeap> DropWithHeap for Option<U> {
    #[inline]
    fn drop_with_heap(self, heap: &mut Heap) {
        if let Some(value) = self {
            value.drop_with_heap(heap);
        }
    }
}

impl<U: DropWithHeap> DropWithHeap for Vec<U> {
    fn drop_with_heap(self, heap: &mut Heap) {
        for value in self {
            value.drop_with_heap(heap);
        }
    }
}

impl<U: DropWithHeap> DropWithHeap for vec::IntoIter<U> {
    fn drop_with_heap(self, heap: &mut Heap) {
        for value in self {
            value.drop_with_heap(heap);
        }
    }
}

impl DropWithHeap for crate::args::PositionalArgs {
    fn drop_with_heap(self, heap: &mut Heap) {
        for value in self {
            value.drop_with_heap(heap);
        }
    }
}

impl DropWithHeap for (String, Value) {
    fn drop_with_heap(self, heap: &mut Heap) {
        self.1.drop_with_heap(heap);
    }
}

/// RAII guard that ensures a [`DropWithHeap`] value is cleaned up on every code path.
///
/// The guard's `Drop` impl calls [`DropWithHeap::drop_with_heap`] automatically, so
/// cleanup happens whether the scope exits normally, via `?`, early return, or any
/// other branch.
///
/// Prefer the [`defer_drop!`] macro for the common case where you just need to ensure a
/// value is dropped at scope exit. Use `HeapGuard` directly when you need to conditionally
/// reclaim the value or need mutable access to both the value and heap through
/// [`as_parts_mut`](Self::as_parts_mut).
pub struct HeapGuard<'a, H: ContainsHeap, V: DropWithHeap> {
    // manually dropped because it needs to be dropped by move.
    value: ManuallyDrop<V>,
    heap: &'a mut H,
}

impl<'a, H: ContainsHeap, V: DropWithHeap> HeapGuard<'a, H, V> {
    /// Creates a new `HeapGuard` for the given value and heap.
    #[inline]
    pub fn new(value: V, heap: &'a mut H) -> Self {
        Self {
            value: ManuallyDrop::new(value),
            heap,
        }
    }

    /// Consumes the guard and returns the contained value without dropping it.
    #[inline]
    pub fn into_inner(self) -> V {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: [DH] - `ManuallyDrop::new(self)` prevents `Drop` on self, so we can take the value out
        unsafe { ManuallyDrop::take(&mut this.value) }
    }

    /// Borrows the value (immutably) and heap (mutably) out of the guard.
    #[inline]
    pub fn as_parts(&mut self) -> (&V, &mut H) {
        (&self.value, self.heap)
    }

    /// Borrows the value (mutably) and heap (mutably) out of the guard.
    #[inline]
    pub fn as_parts_mut(&mut self) -> (&mut V, &mut H) {
        (&mut self.value, self.heap)
    }

    /// Consumes the guard and returns the value and heap separately, without dropping.
    #[inline]
    pub fn into_parts(self) -> (V, &'a mut H) {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: [DH] - `ManuallyDrop` prevents `Drop` on self, so we can recover the parts
        unsafe { (ManuallyDrop::take(&mut this.value), addr_of!(this.heap).read()) }
    }

    /// Borrows just the heap out of the guard
    #[inline]
    pub fn heap(&mut self) -> &mut H {
        self.heap
    }
}

impl<H: ContainsHeap, V: DropWithHeap> Drop for HeapGuard<'_, H, V> {
    fn drop(&mut self) {
        // SAFETY: [DH] - value is never manually dropped until this point
        unsafe { ManuallyDrop::take(&mut self.value) }.drop_with_heap(self.heap.heap_mut());
    }
}

/// The preferred way to ensure a [`DropWithHeap`] value is cleaned up on every code path.
///
/// Creates a [`HeapGuard`] and immediately rebinds `$value` as `&V` and `$heap` as
/// `&mut H` via [`HeapGuard::as_parts`]. For mutable access to the value, use
/// [`defer_drop_mut!`].
///
/// # Limitation
///
/// The macro rebinds `$heap` as a new `let` binding, so it cannot be used when `$heap`
/// is `self`. In `&mut self` methods, first assign `let this = self;` and pass `this`.
#[macro_export]
macro_rules! defer_drop {
    ($value:ident, $heap:ident) => {
        let mut _guard = $crate::heap::HeapGuard::new($value, $heap);
        #[allow(
            clippy::allow_attributes,
            reason = "the reborrowed parts may not both be used in every case, so allow unused vars to avoid warnings"
        )]
        #[allow(unused_variables)]
        let ($value, $heap) = _guard.as_parts();
    };
}

/// Like [`defer_drop!`], but rebinds `$value` as `&mut V` via [`HeapGuard::as_parts_mut`].
#[macro_export]
macro_rules! defer_drop_mut {
    ($value:ident, $heap:ident) => {
        let mut _guard = $crate::heap::HeapGuard::new($value, $heap);
        #[allow(
            clippy::allow_attributes,
            reason = "the reborrowed parts may not both be used in every case, so allow unused vars to avoid warnings"
        )]
        #[allow(unused_variables)]
        let ($value, $heap) = _guard.as_parts_mut();
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fiber::LocalStackPool, resource::NoLimitTracker};

    fn heap() -> Heap {
        Heap::new(8, Box::new(NoLimitTracker), Box::new(LocalStackPool::default()))
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut heap = heap();
        let a = heap.allocate(HeapData::Str(Str::from("a"))).unwrap();
        heap.dec_ref(a);
        let b = heap.allocate(HeapData::Str(Str::from("b"))).unwrap();
        assert_eq!(a, b, "free list slot should be reused");
        assert_eq!(heap.heap_stats().total_slots, 1);
    }

    #[test]
    fn freeing_container_releases_children() {
        let mut heap = heap();
        let s = heap.allocate(HeapData::Str(Str::from("x"))).unwrap();
        let list = heap
            .allocate(HeapData::List(List::new(vec![Value::Ref(s), Value::Int(1)])))
            .unwrap();
        assert_eq!(heap.live_count(), 2);
        heap.dec_ref(list);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn diff_reports_per_type_growth() {
        let mut heap = heap();
        let before = heap.heap_stats();
        let _s = heap.allocate(HeapData::Str(Str::from("x"))).unwrap();
        let diff = before.diff(&heap.heap_stats());
        assert_eq!(diff.live_objects_delta, 1);
        assert_eq!(diff.objects_by_type_delta.get("Str"), Some(&1));
        assert_eq!(diff.to_string(), "HeapDiff: +1 live objects\n  Str: +1");
    }
}
