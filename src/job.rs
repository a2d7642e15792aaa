use crate::error::SchedulerError;
use crate::worker::Worker;
use std::cell::UnsafeCell;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};

/// Inline capacity for a job's successor list.
///
/// The original source reserves 17 slots (an off-by-one in its C array
/// declaration); this crate keeps the documented bound of 16 and turns
/// overflow into a [`SchedulerError::ContractViolation`] instead of
/// silently indexing past the array.
pub(crate) const MAX_SUCCESSORS: usize = 16;

/// A unit of schedulable work.
///
/// Jobs are never individually constructed or destroyed by user code: they
/// live in a per-worker pool (see [`crate::deque::Deque`]) and are handed
/// out, run, and wholesale-recycled a frame at a time. A `Job`'s fields
/// that are written before scheduling (`parent`, the body, successors) are
/// touched only by the thread that created it; fields touched after
/// scheduling (`pending`, `started`) are atomics whose ordering is exactly
/// what makes that single-writer-before-handoff contract safe.
#[repr(align(64))]
pub struct Job {
    origin_worker: UnsafeCell<usize>,
    pending: AtomicI32,
    started: AtomicBool,
    parent: UnsafeCell<Option<JobHandle>>,
    function: UnsafeCell<Option<Box<dyn FnMut(&JobHandle) + Send>>>,
    successor_count: AtomicU8,
    successors: [UnsafeCell<Option<JobHandle>>; MAX_SUCCESSORS],
}

// SAFETY: the `UnsafeCell` fields are only ever written by the single
// thread that currently owns the job (either the creator, before the job
// is pushed onto a deque, or the one worker that is executing its body),
// and every handoff between those owners goes through an atomic
// release/acquire pair (deque push/pop/steal, or the `pending` decrement
// in `finish`). See the module docs above.
unsafe impl Sync for Job {}
unsafe impl Send for Job {}

impl Debug for Job {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("pending", &self.pending)
            .field("started", &self.started)
            .field("successor_count", &self.successor_count)
            .finish()
    }
}

impl Default for Job {
    fn default() -> Self {
        Self {
            origin_worker: UnsafeCell::new(0),
            pending: AtomicI32::new(0),
            started: AtomicBool::new(false),
            parent: UnsafeCell::new(None),
            function: UnsafeCell::new(None),
            successor_count: AtomicU8::new(0),
            successors: std::array::from_fn(|_| UnsafeCell::new(None)),
        }
    }
}

/// A cheap, `Copy` handle to a pool-owned [`Job`].
///
/// Unlike a refcounted handle, `JobHandle` does not own the job's storage:
/// the slot it points at belongs to a worker's job pool and is recycled
/// wholesale by [`crate::Scheduler::reset_frame`]. Holding a `JobHandle`
/// across a `reset_frame` call is a use-after-recycle bug the caller must
/// avoid (see that method's contract).
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct JobHandle(*const Job);

impl Debug for JobHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("JobHandle").field(&self.0).finish()
    }
}

// SAFETY: a JobHandle is just a pointer into a pool slot whose access
// discipline is documented on `Job` above.
unsafe impl Send for JobHandle {}
unsafe impl Sync for JobHandle {}

impl JobHandle {
    pub(crate) fn new(ptr: *const Job) -> Self {
        Self(ptr)
    }

    fn job(&self) -> &Job {
        // SAFETY: the pointer was produced by `Deque::get_fresh_job` and
        // remains valid until the owning worker's next `reset_frame`.
        unsafe { &*self.0 }
    }

    pub(crate) fn origin_worker(&self) -> usize {
        // SAFETY: written once at `reinit` time by the creating thread
        // before the handle escapes to any other thread.
        unsafe { *self.job().origin_worker.get() }
    }

    /// Resets a freshly-allocated slot to its initial state: one pending
    /// self-ticket, no parent, no body, no successors.
    pub(crate) fn reinit(&self, origin_worker: usize) {
        let job = self.job();
        // SAFETY: only the thread that just pulled this slot from the pool
        // touches it before it is handed off.
        unsafe {
            *job.origin_worker.get() = origin_worker;
            *job.parent.get() = None;
            *job.function.get() = None;
        }
        job.pending.store(1, Ordering::Relaxed);
        job.started.store(false, Ordering::Relaxed);
        job.successor_count.store(0, Ordering::Relaxed);
        for slot in &job.successors {
            unsafe {
                *slot.get() = None;
            }
        }
    }

    /// Stores the job body and, if this is a child job, its parent link.
    /// Must be called exactly once, before the job is started.
    pub(crate) fn attach<F>(&self, parent: Option<JobHandle>, f: F)
    where
        F: FnMut(&JobHandle) + Send + 'static,
    {
        let job = self.job();
        // SAFETY: called only by the creating thread, before `start`.
        unsafe {
            *job.parent.get() = parent;
            *job.function.get() = Some(Box::new(f));
        }
    }

    /// Adds one ticket to this job's pending count. Must happen-before the
    /// child job it accounts for is handed to any other thread, so that the
    /// child cannot drive this job to zero before the ticket exists.
    pub(crate) fn add_pending(&self) {
        self.job().pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Declares `then` as a successor: it will be pushed onto whichever
    /// worker finishes `self` once `self` completes. `then` must not be
    /// independently started — `finish` schedules it.
    pub fn add_successor(&self, then: JobHandle) -> Result<(), SchedulerError> {
        let job = self.job();
        let index = job.successor_count.fetch_add(1, Ordering::AcqRel) as usize;
        if index >= MAX_SUCCESSORS {
            job.successor_count.fetch_sub(1, Ordering::AcqRel);
            return Err(SchedulerError::ContractViolation(format!(
                "successor capacity ({MAX_SUCCESSORS}) exceeded for job"
            )));
        }
        // SAFETY: add_successor is only valid before `self` is started, at
        // which point only the calling thread touches the successor array.
        unsafe {
            *job.successors[index].get() = Some(then);
        }
        Ok(())
    }

    pub(crate) fn mark_started(&self) -> Result<(), SchedulerError> {
        if self.job().started.swap(true, Ordering::AcqRel) {
            return Err(SchedulerError::ContractViolation(
                "job was already started".to_string(),
            ));
        }
        Ok(())
    }

    /// Reports whether [`Scheduler::start`](crate::Scheduler::start) has
    /// been called on this job yet.
    pub(crate) fn is_started(&self) -> bool {
        self.job().started.load(Ordering::Acquire)
    }

    /// Reports whether this job's body has run and every child (direct or
    /// transitive) has finished.
    pub fn has_completed(&self) -> bool {
        self.job().pending.load(Ordering::Acquire) <= 0
    }

    /// Runs the job body exactly once. Panics from the body are left to
    /// propagate to the caller (the worker tick catches them so it can log
    /// before aborting; see [`crate::worker::Worker::run_job`]).
    pub(crate) fn run(&self) {
        let job = self.job();
        // SAFETY: the executing worker has exclusive access to the body
        // for the duration of the call, established by the deque
        // pop/steal that handed this job to it.
        let function = unsafe { (*job.function.get()).take() };
        if let Some(mut f) = function {
            f(self);
        }
    }

    /// Completion-propagation protocol: decrement this job's pending
    /// count; if it just reached zero, recurse into the parent and push
    /// every successor onto the finishing worker's deque.
    pub(crate) fn finish(job: JobHandle, executing_worker: &Worker) {
        let job_ref = job.job();
        let previous = job_ref.pending.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(
            previous >= 1,
            "pending counter underflow: a job finished more times than it had tickets"
        );

        if previous != 1 {
            return;
        }

        // SAFETY: reached only once pending hit zero, after which nothing
        // else touches `parent` or `successors` for this slot until the
        // next `reinit`.
        let parent = unsafe { *job_ref.parent.get() };
        if let Some(parent) = parent {
            Job::finish(parent, executing_worker);
        }

        let count = job_ref.successor_count.load(Ordering::Acquire) as usize;
        for slot in job_ref.successors.iter().take(count) {
            let successor = unsafe { (*slot.get()).take() };
            if let Some(successor) = successor {
                if let Err(err) = executing_worker.deque().push(successor) {
                    tracing::error!(error = %err, "failed to schedule successor job");
                    std::process::abort();
                }
            }
        }
    }
}
