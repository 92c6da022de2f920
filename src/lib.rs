#![doc = include_str!("../README.md")]
//! The core, concurrent, fixed-size pool allocator implementation.
//!
//! This module provides `SlotPool`, a lock-free allocator that serves storage
//! slots for a single element type `T`.
//!
//! # Internals
//!
//! -   **Slots:** The unit of allocation. A slot holds storage for one `T`
//!     plus an intrusive link that is only meaningful while the slot sits on
//!     the free list.
//! -   **Blocks:** The unit of growth. A block is one contiguous buffer
//!     carved into slots; blocks form a singly-linked owner list that is
//!     walked on drop and never shrunk while the pool is alive.
//! -   **Free list:** A Treiber stack of free slots anchored by a single
//!     128-bit atomic head. The head pairs the top-of-stack pointer with a
//!     monotonic tag so that a slot recycled back to the top cannot satisfy
//!     a stale compare-and-swap (the classic ABA hazard of intrusive pools).
//! -   **Growth:** When the free list runs dry, one thread at a time carves
//!     a new block and splices its slot chain onto the live head with a CAS
//!     loop, so frees that race the growth are never lost. Growth can be
//!     rate-limited; a refused growth surfaces as [`PoolError::Exhausted`].

use std::alloc::Layout;
use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use ::metrics::{counter, gauge};
use crossbeam_utils::{Backoff, CachePadded};
use log::{debug, warn};
use portable_atomic::AtomicU128;

pub mod error;
pub mod metrics;
pub use crate::error::PoolError;

use crate::metrics::{CAPACITY_SLOTS, GROWTHS_TOTAL, GROWTH_REFUSALS_TOTAL, LABEL_REASON};

/// Default number of slots a growth event aims to carve from one block.
const DEFAULT_BLOCK_SLOTS: usize = 4096;

/// One storage slot.
///
/// The payload comes first so that a pointer to the slot and a pointer to the
/// element coincide; `allocate` hands out the payload address and
/// `deallocate` casts it straight back. The link field is an `AtomicPtr`
/// rather than a plain pointer because a concurrent `allocate` may read the
/// link of a slot that another thread has just claimed; the read value is
/// discarded when the head CAS fails, but the access itself must not race.
#[repr(C)]
struct Slot<T> {
    payload: MaybeUninit<T>,
    /// Next free slot. Only meaningful while this slot is on the free list;
    /// holds stale garbage while the slot is handed out.
    next: AtomicPtr<Slot<T>>,
    /// Occupancy flag for catching double frees in debug builds.
    #[cfg(debug_assertions)]
    allocated: AtomicBool,
}

/// An owning record for one buffer of slots.
///
/// Block headers live on the heap and form a singly-linked list, newest
/// first. The pool walks this list exactly once, on drop, to return each
/// buffer to the process allocator.
struct Block {
    buf: *mut u8,
    layout: Layout,
    next: *mut Block,
}

/// The free-list head: a slot pointer and a monotonic tag packed into a
/// single `u128` for double-width compare-and-swap.
///
/// ```text
///   bits [127:64]  tag      (incremented on every successful CAS)
///   bits [63:0]    pointer  (full virtual address, null when empty)
/// ```
///
/// The tag defeats ABA: a head observed as `(t, p)` and since superseded can
/// never match again, even if `p` returns to the top of the stack, because
/// every successful mutation bumped the tag.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct TaggedHead(u128);

impl TaggedHead {
    const EMPTY: Self = TaggedHead(0);

    #[inline]
    fn new<T>(slot: *mut Slot<T>, tag: u64) -> Self {
        TaggedHead((u128::from(tag) << 64) | (slot as usize as u128))
    }

    #[inline]
    fn slot<T>(self) -> *mut Slot<T> {
        (self.0 as usize) as *mut Slot<T>
    }

    #[inline]
    fn tag(self) -> u64 {
        (self.0 >> 64) as u64
    }
}

/// State mutated only while the governor flag is held.
struct GrowState {
    /// Head of the block owner list, newest block first.
    blocks: *mut Block,
    /// When the last growth event started, for rate limiting.
    last_growth: Option<Instant>,
}

/// A concurrent, lock-free, fixed-size object pool allocator.
///
/// `SlotPool` serves storage for values of a single type `T`. Allocation and
/// deallocation are lock-free pushes and pops against a shared free list;
/// when the list runs dry the pool grows by carving a new block of slots, one
/// thread at a time, optionally rate-limited.
///
/// Slot addresses are stable: a pointer returned by [`allocate`] stays valid
/// until it is passed back to [`deallocate`] or the pool is dropped. Blocks
/// are never relocated or individually freed while the pool is alive.
///
/// Dropping the pool releases every block without running destructors on any
/// still-outstanding element; reclaiming live elements first is the caller's
/// responsibility.
///
/// [`allocate`]: SlotPool::allocate
/// [`deallocate`]: SlotPool::deallocate
///
/// # Example
///
/// ```
/// use slotpool::SlotPool;
///
/// let pool: SlotPool<u64> = SlotPool::new();
/// let a = pool.new_element(7).unwrap();
/// let b = pool.new_element(8).unwrap();
/// assert_ne!(a, b);
/// unsafe {
///     pool.delete_element(Some(a));
///     pool.delete_element(Some(b));
/// }
/// ```
pub struct SlotPool<T> {
    /// The only field touched on the hot path, padded to keep head CAS
    /// traffic off the neighbouring fields' cache lines.
    free: CachePadded<AtomicU128>,
    /// Test-and-set flag serializing growth.
    growing: AtomicBool,
    /// Block list and growth timestamp, guarded by `growing`.
    state: UnsafeCell<GrowState>,
    /// Total slots ever carved. Written only under the governor flag;
    /// relaxed readers tolerate a value stale by one growth event.
    capacity: AtomicUsize,
    /// Minimum whole seconds between growth events; 0 disables the limit.
    growth_threshold_secs: AtomicU64,
    /// Target slot count per block. The actual yield is slightly lower
    /// because the buffer loses a prefix to alignment.
    block_slots: usize,
    _marker: PhantomData<T>,
}

// SAFETY: The pool is thread-safe by construction. The free-list head is a
// single atomic word-pair, the growth path is serialized by the `growing`
// flag, and the `GrowState` behind the UnsafeCell is only ever touched while
// that flag is held (or through `&mut self` in Drop). Handing slots across
// threads moves `T` values, hence the `T: Send` bound.
unsafe impl<T: Send> Send for SlotPool<T> {}
unsafe impl<T: Send> Sync for SlotPool<T> {}

/// Releases the governor flag on every exit path, including panics.
struct GovernorGuard<'a>(&'a AtomicBool);

impl Drop for GovernorGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<T> SlotPool<T> {
    /// Creates a new, empty pool with the default block size and no growth
    /// rate limit. The first allocation triggers the first growth.
    pub fn new() -> Self {
        Self::with_config(DEFAULT_BLOCK_SLOTS, Duration::ZERO)
    }

    /// Returns a builder for configuring block size and growth rate limit.
    pub fn builder() -> PoolBuilder<T> {
        PoolBuilder {
            block_slots: DEFAULT_BLOCK_SLOTS,
            growth_threshold: Duration::ZERO,
            _marker: PhantomData,
        }
    }

    fn with_config(block_slots: usize, growth_threshold: Duration) -> Self {
        SlotPool {
            free: CachePadded::new(AtomicU128::new(TaggedHead::EMPTY.0)),
            growing: AtomicBool::new(false),
            state: UnsafeCell::new(GrowState {
                blocks: ptr::null_mut(),
                last_growth: None,
            }),
            capacity: AtomicUsize::new(0),
            growth_threshold_secs: AtomicU64::new(growth_threshold.as_secs()),
            block_slots,
            _marker: PhantomData,
        }
    }

    /// Allocates storage for one element from the lock-free free list.
    ///
    /// The returned storage is uninitialized. If the free list is empty the
    /// pool attempts to grow; a refused growth (rate-limited, or the memory
    /// request failed) surfaces as [`PoolError::Exhausted`] and leaves the
    /// pool fully usable.
    ///
    /// # Example
    ///
    /// ```
    /// use slotpool::SlotPool;
    ///
    /// let pool: SlotPool<u32> = SlotPool::new();
    /// let slot = pool.allocate().unwrap();
    /// unsafe {
    ///     SlotPool::construct_at(slot, 5);
    ///     SlotPool::destroy_at(slot);
    ///     pool.deallocate(slot);
    /// }
    /// ```
    pub fn allocate(&self) -> Result<NonNull<T>, PoolError> {
        let mut head = TaggedHead(self.free.load(Ordering::Acquire));
        loop {
            let slot = head.slot::<T>();
            if slot.is_null() {
                // Free list is empty: grow, then start over from the fresh
                // head. `grow` also succeeds without carving anything if a
                // concurrent free or growth repopulated the list first.
                self.grow()?;
                head = TaggedHead(self.free.load(Ordering::Acquire));
                continue;
            }

            // SAFETY: slots live inside blocks that are never freed while
            // the pool is alive, so `slot` is dereferenceable even if a
            // racing thread claims it first. If the link we read is stale,
            // the tag has moved on and the CAS below fails.
            let next = unsafe { (*slot).next.load(Ordering::Relaxed) };
            let claimed = TaggedHead::new(next, head.tag().wrapping_add(1));

            match self.free.compare_exchange_weak(
                head.0,
                claimed.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    #[cfg(debug_assertions)]
                    // SAFETY: we just won the CAS, so the slot is ours.
                    unsafe {
                        if (*slot).allocated.swap(true, Ordering::Relaxed) {
                            panic!("pool slot {:p} handed out while already in use", slot);
                        }
                    }
                    // SAFETY: `slot` is non-null and the payload sits at
                    // offset zero of the `#[repr(C)]` slot.
                    return Ok(unsafe { NonNull::new_unchecked(slot.cast::<T>()) });
                }
                Err(actual) => head = TaggedHead(actual),
            }
        }
    }

    /// Returns a slot to the lock-free free list.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](SlotPool::allocate) on
    /// this pool, must currently be checked out, and must not be used again
    /// after this call. Any element constructed in the slot must already have
    /// been destroyed; the memory may be reused immediately. Debug builds
    /// panic on a detected double free.
    pub unsafe fn deallocate(&self, ptr: NonNull<T>) {
        let slot = ptr.as_ptr().cast::<Slot<T>>();

        #[cfg(debug_assertions)]
        // SAFETY: per the contract, `slot` came from this pool and is live.
        unsafe {
            if !(*slot).allocated.swap(false, Ordering::Relaxed) {
                panic!("double free of pool slot {:p}", slot);
            }
        }

        let mut head = TaggedHead(self.free.load(Ordering::Acquire));
        loop {
            // SAFETY: the caller guarantees exclusive ownership of the slot,
            // and the link store must land before the CAS publishes it.
            unsafe {
                (*slot).next.store(head.slot(), Ordering::Relaxed);
            }
            let pushed = TaggedHead::new(slot, head.tag().wrapping_add(1));

            match self.free.compare_exchange_weak(
                head.0,
                pushed.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => head = TaggedHead(actual),
            }
        }
    }

    /// Moves `value` into uninitialized slot storage.
    ///
    /// # Safety
    ///
    /// `ptr` must point at slot storage from this pool that does not
    /// currently hold a live element.
    #[inline]
    pub unsafe fn construct_at(ptr: NonNull<T>, value: T) {
        // SAFETY: the caller guarantees the storage is valid and vacant.
        unsafe { ptr.as_ptr().write(value) };
    }

    /// Drops the element in `ptr` in place, leaving the storage vacant.
    ///
    /// # Safety
    ///
    /// `ptr` must point at a live element previously placed in this pool's
    /// storage, and that element must not be used again.
    #[inline]
    pub unsafe fn destroy_at(ptr: NonNull<T>) {
        // SAFETY: the caller guarantees a live element at `ptr`.
        unsafe { ptr::drop_in_place(ptr.as_ptr()) };
    }

    /// Allocates a slot and moves `value` into it.
    ///
    /// Returns `None` when the pool is exhausted and growth was refused.
    pub fn new_element(&self, value: T) -> Option<NonNull<T>> {
        let slot = self.allocate().ok()?;
        // SAFETY: freshly allocated slots are vacant.
        unsafe { Self::construct_at(slot, value) };
        Some(slot)
    }

    /// Drops the element and returns its slot to the pool. Does nothing for
    /// `None`, mirroring delete of a null pointer.
    ///
    /// # Safety
    ///
    /// A `Some` pointer must hold a live element in a slot checked out from
    /// this pool, and must not be used again after this call.
    pub unsafe fn delete_element(&self, ptr: Option<NonNull<T>>) {
        if let Some(p) = ptr {
            // SAFETY: forwarded caller contract.
            unsafe {
                Self::destroy_at(p);
                self.deallocate(p);
            }
        }
    }

    /// Total number of slots ever carved across all blocks the pool owns.
    ///
    /// Monotonic while the pool is alive. The value may trail a concurrent
    /// growth by one event.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Total bytes of slot storage the pool owns, i.e. capacity times the
    /// per-slot footprint (element plus link).
    pub fn max_bytes(&self) -> usize {
        self.capacity() * std::mem::size_of::<Slot<T>>()
    }

    /// Sets the minimum interval between growth events, at whole-second
    /// granularity. Zero disables the limit. The first growth of an empty
    /// pool is always permitted.
    ///
    /// The interval is a rate hint, not a deadline: an allocation that hits
    /// the limit fails fast with [`PoolError::Exhausted`] instead of waiting.
    pub fn set_growth_threshold(&self, interval: Duration) {
        self.growth_threshold_secs
            .store(interval.as_secs(), Ordering::Relaxed);
    }

    /// Extends the pool with one freshly carved block. The cold path.
    ///
    /// Returns `Ok(())` when the free list is (or has become) non-empty and
    /// `Err(Exhausted)` when growth was refused. Serialized by the `growing`
    /// flag; the flag is spun with exponential backoff rather than parked on
    /// an OS mutex so the pool never blocks the scheduler.
    fn grow(&self) -> Result<(), PoolError> {
        let backoff = Backoff::new();
        while self.growing.swap(true, Ordering::Acquire) {
            backoff.snooze();
        }
        let _guard = GovernorGuard(&self.growing);

        // Double-checked exit: another thread may have grown the pool, or a
        // free may have landed, while we were spinning on the flag. In that
        // case the work is already done.
        if !TaggedHead(self.free.load(Ordering::Acquire)).slot::<T>().is_null() {
            return Ok(());
        }

        // SAFETY: the governor flag is held, making us the sole mutator of
        // the grow state.
        let state = unsafe { &mut *self.state.get() };

        // Rate limit. Only ever applied after the first growth, so an empty
        // pool can always serve its very first allocation.
        let threshold = self.growth_threshold_secs.load(Ordering::Relaxed);
        if self.capacity.load(Ordering::Relaxed) > 0 && threshold > 0 {
            if let Some(last) = state.last_growth {
                if last.elapsed() < Duration::from_secs(threshold) {
                    counter!(GROWTH_REFUSALS_TOTAL, LABEL_REASON => "rate_limited").increment(1);
                    return Err(PoolError::Exhausted);
                }
            }
        }
        state.last_growth = Some(Instant::now());

        let slot_size = std::mem::size_of::<Slot<T>>();
        let slot_align = std::mem::align_of::<Slot<T>>();

        // Ask the process allocator for the raw buffer. A failed request is
        // a growth refusal, not a crash: prior capacity stays intact.
        let bytes = match self.block_slots.checked_mul(slot_size) {
            Some(b) => b,
            None => {
                warn!("pool block of {} slots overflows usize", self.block_slots);
                counter!(GROWTH_REFUSALS_TOTAL, LABEL_REASON => "alloc_failed").increment(1);
                return Err(PoolError::Exhausted);
            }
        };
        let layout = match Layout::from_size_align(bytes, slot_align) {
            Ok(l) => l,
            Err(_) => {
                counter!(GROWTH_REFUSALS_TOTAL, LABEL_REASON => "alloc_failed").increment(1);
                return Err(PoolError::Exhausted);
            }
        };
        // SAFETY: `layout` has non-zero size (block_slots >= 2 slots).
        let buf = unsafe { std::alloc::alloc(layout) };
        if buf.is_null() {
            warn!("pool growth failed: allocator refused {} bytes", bytes);
            counter!(GROWTH_REFUSALS_TOTAL, LABEL_REASON => "alloc_failed").increment(1);
            return Err(PoolError::Exhausted);
        }

        state.blocks = Box::into_raw(Box::new(Block {
            buf,
            layout,
            next: state.blocks,
        }));

        // Reserve a machine word of prefix, then align up to the slot
        // boundary; slots run from there to wherever the last whole slot
        // fits. The yield lands slightly under `block_slots`.
        let start = {
            let prefix = std::mem::size_of::<*mut u8>();
            (prefix + slot_align - 1) & !(slot_align - 1)
        };
        let produced = (bytes - start) / slot_size;
        // SAFETY: `start + produced * slot_size <= bytes`, so every slot
        // pointer below stays inside the buffer.
        let first = unsafe { buf.add(start) }.cast::<Slot<T>>();

        // Thread each slot's link to its successor; the last slot is linked
        // to the live free list during the splice below. Plain relaxed
        // stores suffice: the buffer is still private to this thread, and
        // the publishing CAS provides the release fence.
        for i in 0..produced {
            let next = if i + 1 == produced {
                ptr::null_mut()
            } else {
                // SAFETY: `i + 1 < produced`, in bounds per above.
                unsafe { first.add(i + 1) }
            };
            // SAFETY: in-bounds raw writes into the uninitialized buffer.
            unsafe {
                let slot = first.add(i);
                ptr::addr_of_mut!((*slot).next).write(AtomicPtr::new(next));
                #[cfg(debug_assertions)]
                ptr::addr_of_mut!((*slot).allocated).write(AtomicBool::new(false));
            }
        }
        // SAFETY: `produced >= 1` because the block holds at least two slot
        // footprints and the prefix consumes at most one.
        let last = unsafe { first.add(produced - 1) };

        // Splice: prepend the whole chain onto the live head. Frees may have
        // raced in while we were carving, so the new chain's tail is linked
        // to whatever the head holds *at publish time*, and the CAS retries
        // until it wins. Nothing concurrently pushed can be lost.
        let mut head = TaggedHead(self.free.load(Ordering::Acquire));
        loop {
            // SAFETY: `last` is still private until the CAS succeeds.
            unsafe {
                (*last).next.store(head.slot(), Ordering::Relaxed);
            }
            let spliced = TaggedHead::new(first, head.tag().wrapping_add(1));
            match self.free.compare_exchange_weak(
                head.0,
                spliced.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => head = TaggedHead(actual),
            }
        }

        let total = self.capacity.fetch_add(produced, Ordering::Relaxed) + produced;
        counter!(GROWTHS_TOTAL).increment(1);
        gauge!(CAPACITY_SLOTS).set(total as f64);
        debug!("pool grew by {} slots to a capacity of {}", produced, total);

        Ok(())
    }
}

impl<T> Default for SlotPool<T> {
    /// An empty pool with default configuration. Combined with
    /// `std::mem::take`, this is the move-assignment story: taking a pool
    /// transfers its blocks, free list and capacity wholesale and leaves an
    /// empty pool behind. Both pools must be otherwise idle during the take.
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for SlotPool<T> {
    fn drop(&mut self) {
        // Walk the owner list and hand every buffer back, exactly once.
        // Elements still checked out are NOT dropped; outstanding pointers
        // are the caller's problem, as documented on `allocate`.
        let mut block = self.state.get_mut().blocks;
        while !block.is_null() {
            // SAFETY: headers and buffers were created in `grow` via
            // `Box::into_raw` and `alloc` with the recorded layout, and this
            // is the only place that frees them.
            unsafe {
                let owned = Box::from_raw(block);
                std::alloc::dealloc(owned.buf, owned.layout);
                block = owned.next;
            }
        }
    }
}

impl<T> fmt::Debug for SlotPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotPool")
            .field("capacity", &self.capacity())
            .field("block_slots", &self.block_slots)
            .finish_non_exhaustive()
    }
}

/// Configures and builds a [`SlotPool`].
///
/// # Example
///
/// ```
/// use slotpool::SlotPool;
/// use std::time::Duration;
///
/// let pool: SlotPool<u64> = SlotPool::builder()
///     .block_slots(64)
///     .growth_threshold(Duration::from_secs(1))
///     .build()
///     .unwrap();
/// assert_eq!(pool.capacity(), 0);
/// ```
#[derive(Debug)]
pub struct PoolBuilder<T> {
    block_slots: usize,
    growth_threshold: Duration,
    _marker: PhantomData<T>,
}

impl<T> PoolBuilder<T> {
    /// Target number of slots per block. This is a hint: alignment padding
    /// at the front of each buffer costs a fraction of one slot, so the
    /// actual yield per growth is slightly lower. Defaults to 4096.
    pub fn block_slots(mut self, block_slots: usize) -> Self {
        self.block_slots = block_slots;
        self
    }

    /// Minimum interval between growth events after the first, at
    /// whole-second granularity. Defaults to zero (no limit).
    pub fn growth_threshold(mut self, interval: Duration) -> Self {
        self.growth_threshold = interval;
        self
    }

    /// Builds the pool.
    ///
    /// Fails with [`PoolError::Configuration`] if the block size cannot
    /// yield at least one slot per growth, or if a block's byte size would
    /// not fit in `usize`.
    pub fn build(self) -> Result<SlotPool<T>, PoolError> {
        if self.block_slots < 2 {
            return Err(PoolError::Configuration(format!(
                "block_slots must be at least 2 to yield a slot after alignment, got {}",
                self.block_slots
            )));
        }
        if self
            .block_slots
            .checked_mul(std::mem::size_of::<Slot<T>>())
            .is_none()
        {
            return Err(PoolError::Configuration(format!(
                "a block of {} slots of {} bytes overflows usize",
                self.block_slots,
                std::mem::size_of::<Slot<T>>()
            )));
        }
        Ok(SlotPool::with_config(self.block_slots, self.growth_threshold))
    }
}
