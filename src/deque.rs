use crate::error::SchedulerError;
use crate::job::{Job, JobHandle};
use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{fence, AtomicI64, Ordering};

/// A Chase–Lev work-stealing double-ended queue of job pointers, paired
/// with the per-worker job pool it hands fresh slots out of.
///
/// Only the owning worker ever calls [`Deque::push`], [`Deque::pop`] or
/// [`Deque::get_fresh_job`]; any worker may call [`Deque::steal`]. The
/// memory-ordering choices below mirror the original Chase–Lev protocol:
/// a successful `top` CAS in `pop`/`steal` is the single point at which
/// exactly one thread wins a given slot, and the release-store of
/// `bottom` in `push` is what makes the slot write visible to a thief's
/// acquire-load of `bottom` in `steal`.
pub(crate) struct Deque {
    buffer: Box<[UnsafeCell<Option<JobHandle>>]>,
    mask: i64,
    top: AtomicI64,
    bottom: AtomicI64,
    job_pool: Box<[Job]>,
    pool_capacity: usize,
    pool_pos: Cell<usize>,
}

// SAFETY: `buffer` slots are written only by the owner (`push`) and
// consumed under the Chase-Lev CAS discipline by `pop`/`steal`; `pool_pos`
// is advanced only by the owner, contractually never from another thread.
unsafe impl Sync for Deque {}

impl Deque {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two(), "deque capacity must be a power of two");
        let buffer = (0..capacity)
            .map(|_| UnsafeCell::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let job_pool = (0..capacity)
            .map(|_| Job::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            buffer,
            mask: capacity as i64 - 1,
            top: AtomicI64::new(0),
            bottom: AtomicI64::new(0),
            job_pool,
            pool_capacity: capacity,
            pool_pos: Cell::new(0),
        }
    }

    /// Hands out the next fresh slot from this worker's job pool. Owner-only.
    ///
    /// Returns [`SchedulerError::ResourceExhausted`] if the pool has already
    /// handed out every slot this frame — reusing a slot without a
    /// `reset_frame` in between would race with whatever still references
    /// the earlier job at that slot.
    pub fn get_fresh_job(&self) -> Result<JobHandle, SchedulerError> {
        let pos = self.pool_pos.get();
        if pos >= self.pool_capacity {
            return Err(SchedulerError::ResourceExhausted(format!(
                "job pool exhausted after {pos} allocations this frame; call reset_frame() between frames"
            )));
        }
        self.pool_pos.set(pos + 1);
        Ok(JobHandle::new(&self.job_pool[pos] as *const Job))
    }

    /// Rewinds the fresh-slot ring to the start. Owner-only; the caller
    /// must guarantee no job from the previous frame is still referenced.
    pub fn reset_pool(&self) {
        self.pool_pos.set(0);
    }

    /// Pushes a job onto the bottom of the deque. Owner-only.
    pub fn push(&self, job: JobHandle) -> Result<(), SchedulerError> {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        if b - t >= self.mask + 1 {
            return Err(SchedulerError::ResourceExhausted(format!(
                "deque buffer (capacity {}) is full",
                self.mask + 1
            )));
        }

        // SAFETY: only the owner writes the buffer, and only at an index
        // the owner has exclusive claim to (between `top` and `bottom`).
        unsafe {
            *self.buffer[(b & self.mask) as usize].get() = Some(job);
        }
        self.bottom.store(b + 1, Ordering::Release);
        Ok(())
    }

    /// Pops a job from the bottom of the deque (LIFO). Owner-only.
    pub fn pop(&self) -> Option<JobHandle> {
        let b = self.bottom.load(Ordering::Relaxed) - 1;
        self.bottom.store(b, Ordering::SeqCst);
        let t = self.top.load(Ordering::SeqCst);

        if t > b {
            // Deque was already empty; restore bottom.
            self.bottom.store(t, Ordering::Relaxed);
            return None;
        }

        // SAFETY: `t <= b` means this slot was written by a prior `push`
        // and has not yet been claimed by a steal.
        let job = unsafe { *self.buffer[(b & self.mask) as usize].get() };

        if t < b {
            // More than one item remains; no race with stealers possible.
            return job;
        }

        // Exactly one item left: race a concurrent steal for it.
        let won = self
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        self.bottom.store(t + 1, Ordering::Relaxed);
        if won {
            job
        } else {
            None
        }
    }

    /// Steals a job from the top of the deque. Any thread may call this.
    pub fn steal(&self) -> Option<JobHandle> {
        let t = self.top.load(Ordering::Acquire);
        // Ensure `top` is read before `bottom`.
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);

        if t >= b {
            return None;
        }

        // SAFETY: `t < b` means a push has made this slot visible; the
        // CAS below is what arbitrates against a racing pop/steal.
        let job = unsafe { *self.buffer[(t & self.mask) as usize].get() };

        if self
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            job
        } else {
            None
        }
    }
}
