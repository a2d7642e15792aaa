//! Per-worker size-class free-list allocator.
//!
//! Grounded on `PeonMemoryAllocator` in the original source: allocations
//! are rounded up to a power of two and served from a per-class free list;
//! a class that runs dry grows by allocating a contiguous slab sized at
//! `max(MIN_SLAB_BLOCKS, 1.7 * blocks_already_in_class)`. Every block
//! carries its owning worker's index in its header so that a block freed
//! by a worker other than its owner can be routed home instead of
//! corrupting the owner's free list.

use std::alloc::{alloc, Layout};
use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::error::SchedulerError;
use crate::worker::Worker;

const NUM_CLASSES: usize = 32;
const MIN_SLAB_BLOCKS: usize = 10;

#[repr(C)]
struct BlockHeader {
    owner: usize,
    class: u8,
    next: Cell<*mut BlockHeader>,
}

/// A handle to an allocated block. Must be passed back to [`Arena::deallocate`]
/// exactly once; this type does not free on drop (matching the explicit
/// allocate/deallocate pairing of the source allocator rather than RAII).
pub struct ArenaBlock(NonNull<BlockHeader>);

// SAFETY: the block's header only records bookkeeping (owner/class/next);
// ownership of the handle itself is what the caller uses to serialize access.
unsafe impl Send for ArenaBlock {}

impl ArenaBlock {
    /// Pointer to the block's payload (the `size` bytes requested by the
    /// `allocate` call that produced it), immediately following the header.
    pub fn as_ptr(&self) -> *mut u8 {
        let header_size = std::mem::size_of::<BlockHeader>();
        unsafe { (self.0.as_ptr() as *mut u8).add(header_size) }
    }
}

/// Per-worker size-class allocator with cross-worker deferred frees.
pub(crate) struct Arena {
    owner: usize,
    free_lists: [Cell<*mut BlockHeader>; NUM_CLASSES],
    total_blocks: [Cell<usize>; NUM_CLASSES],
    #[cfg(debug_assertions)]
    used_blocks: [Cell<usize>; NUM_CLASSES],
    deferred_head: AtomicPtr<BlockHeader>,
}

// SAFETY: the free lists and block counts are mutated only by the owning
// worker (on its own allocate/local-deallocate path); cross-worker frees
// go exclusively through `deferred_head`, a lock-free Treiber stack whose
// CAS loop is the only concurrently-touched state here.
unsafe impl Sync for Arena {}
// SAFETY: an `Arena` is moved wholesale (inside its owning `Worker`) before
// any thread starts touching its free lists; nothing here is thread-affine
// the way e.g. a non-reentrant allocator's TLS would be.
unsafe impl Send for Arena {}

impl Arena {
    pub fn new(owner: usize) -> Self {
        Self {
            owner,
            free_lists: std::array::from_fn(|_| Cell::new(std::ptr::null_mut())),
            total_blocks: std::array::from_fn(|_| Cell::new(0)),
            #[cfg(debug_assertions)]
            used_blocks: std::array::from_fn(|_| Cell::new(0)),
            deferred_head: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// Allocates a block able to hold at least `size` bytes, tagged as
    /// owned by this arena's worker.
    pub fn allocate(&self, size: usize) -> Result<ArenaBlock, SchedulerError> {
        let header_size = std::mem::size_of::<BlockHeader>();
        let total = size
            .checked_add(header_size)
            .ok_or_else(|| SchedulerError::ResourceExhausted("allocation size overflow".into()))?
            .max(1);
        let rounded = total.next_power_of_two();
        let class = rounded.trailing_zeros() as usize;
        if class >= NUM_CLASSES {
            return Err(SchedulerError::ContractViolation(format!(
                "allocation class {class} out of range (requested {size} bytes)"
            )));
        }

        if let Some(block) = self.pop_free(class) {
            #[cfg(debug_assertions)]
            self.used_blocks[class].set(self.used_blocks[class].get() + 1);
            return Ok(ArenaBlock(block));
        }

        self.allocate_slab(class, rounded)
    }

    /// Frees a block. If this arena does not own it, the block is parked
    /// on a deferred chain and only actually freed the next time its owner
    /// calls [`Arena::drain_deferred`].
    pub fn deallocate(&self, block: ArenaBlock) {
        let header = block.0.as_ptr();
        // SAFETY: header fields are set once at allocation time and never
        // mutated except under the free-list/deferred-chain disciplines.
        let owner = unsafe { (*header).owner };
        if owner == self.owner {
            self.deallocate_locally(header);
        } else {
            self.push_deferred(header);
        }
    }

    pub(crate) fn deallocate_locally(&self, header: *mut BlockHeader) {
        let class = unsafe { (*header).class } as usize;
        unsafe {
            (*header).next.set(self.free_lists[class].get());
        }
        self.free_lists[class].set(header);
        #[cfg(debug_assertions)]
        self.used_blocks[class].set(self.used_blocks[class].get().saturating_sub(1));
    }

    fn push_deferred(&self, header: *mut BlockHeader) {
        let mut head = self.deferred_head.load(Ordering::Acquire);
        loop {
            unsafe {
                (*header).next.set(head);
            }
            match self.deferred_head.compare_exchange_weak(
                head,
                header,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
    }

    /// Drains blocks this arena's worker freed on behalf of other workers,
    /// routing each one back to its true owner's free list. Must only be
    /// called during a quiet frame (see [`crate::Scheduler::reset_frame`]):
    /// it writes directly into other workers' free lists without taking a
    /// lock, relying on the caller's quiescence guarantee.
    pub fn drain_deferred(&self, workers: &[Worker]) {
        let mut current = self.deferred_head.swap(std::ptr::null_mut(), Ordering::AcqRel);
        let mut count = 0usize;
        while !current.is_null() {
            let next = unsafe { (*current).next.get() };
            let owner = unsafe { (*current).owner };
            workers[owner].arena().deallocate_locally(current);
            current = next;
            count += 1;
        }
        if count > 0 {
            tracing::trace!(worker = self.owner, drained = count, "drained deferred arena frees");
        }
    }

    fn pop_free(&self, class: usize) -> Option<NonNull<BlockHeader>> {
        let head = self.free_lists[class].get();
        if head.is_null() {
            return None;
        }
        unsafe {
            self.free_lists[class].set((*head).next.get());
        }
        NonNull::new(head)
    }

    fn allocate_slab(&self, class: usize, block_size: usize) -> Result<ArenaBlock, SchedulerError> {
        let existing = self.total_blocks[class].get();
        let grown = (existing as f64 * 1.7) as usize;
        let count = MIN_SLAB_BLOCKS.max(grown);

        let total_bytes = block_size
            .checked_mul(count)
            .ok_or_else(|| SchedulerError::ResourceExhausted("slab size overflow".into()))?;
        let layout = Layout::array::<u8>(total_bytes)
            .map_err(|_| SchedulerError::ResourceExhausted("slab layout overflow".into()))?;

        // SAFETY: layout has non-zero size (block_size >= header size > 0).
        let base = unsafe { alloc(layout) };
        if base.is_null() {
            return Err(SchedulerError::ResourceExhausted(format!(
                "backing allocator refused a {count}-block slab of class {class}"
            )));
        }

        for i in (1..count).rev() {
            let block_ptr = unsafe { base.add(i * block_size) } as *mut BlockHeader;
            unsafe {
                (*block_ptr).owner = self.owner;
                (*block_ptr).class = class as u8;
                (*block_ptr).next.set(self.free_lists[class].get());
            }
            self.free_lists[class].set(block_ptr);
        }

        let first = base as *mut BlockHeader;
        unsafe {
            (*first).owner = self.owner;
            (*first).class = class as u8;
        }

        self.total_blocks[class].set(existing + count);
        #[cfg(debug_assertions)]
        self.used_blocks[class].set(self.used_blocks[class].get() + 1);

        Ok(ArenaBlock(NonNull::new(first).expect("alloc returned non-null")))
    }

    /// Number of blocks of a given size class currently checked out
    /// (allocated minus freed), for test assertions only.
    #[cfg(debug_assertions)]
    pub fn outstanding_blocks(&self, class: usize) -> usize {
        self.used_blocks[class].get()
    }

    /// Sum of [`Arena::outstanding_blocks`] across every size class, for
    /// test assertions that don't want to recompute a specific allocation's
    /// class index.
    #[cfg(debug_assertions)]
    pub(crate) fn total_outstanding(&self) -> usize {
        self.used_blocks.iter().map(Cell::get).sum()
    }
}
