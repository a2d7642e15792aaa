use crate::arena::Arena;
use crate::deque::Deque;
use crate::job::{Job, JobHandle};
use crate::scheduler::Scheduler;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::Duration;

thread_local! {
    static CURRENT_WORKER_INDEX: Cell<Option<usize>> = const { Cell::new(None) };
    static CURRENT_JOB: RefCell<Option<JobHandle>> = const { RefCell::new(None) };
}

/// The index of the worker the calling thread is bound to, if any.
///
/// Bound for the lifetime of the worker thread (or, for worker 0, the
/// thread that called [`crate::Scheduler::new`]).
pub fn current_worker_index() -> Option<usize> {
    CURRENT_WORKER_INDEX.with(Cell::get)
}

/// The job currently executing on the calling thread's worker, if any.
/// Used by `create_child_job` overloads that omit an explicit parent.
pub fn current_job() -> Option<JobHandle> {
    CURRENT_JOB.with(|c| *c.borrow())
}

pub(crate) fn bind_current_thread(index: usize) {
    CURRENT_WORKER_INDEX.with(|c| c.set(Some(index)));
}

/// One worker: a deque (with its attached job pool), an arena, and either
/// a dedicated OS thread (workers 1..N-1) or none (worker 0, which is
/// bound to whatever thread called `Scheduler::new`).
pub(crate) struct Worker {
    index: usize,
    deque: Deque,
    arena: Arena,
    seed: Cell<u32>,
    thread: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

// SAFETY: `seed` is only ever touched by the worker's own thread while
// picking a steal victim (the analogous fresh-slot ring position in
// `Deque` carries the same contract).
unsafe impl Sync for Worker {}

impl Worker {
    pub fn new(index: usize, buffer_size: usize) -> Self {
        Self {
            index,
            deque: Deque::new(buffer_size),
            arena: Arena::new(index),
            seed: Cell::new(0x9e37_79b9u32.wrapping_add(index as u32)),
            thread: parking_lot::Mutex::new(None),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn deque(&self) -> &Deque {
        &self.deque
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn set_thread(&self, handle: JoinHandle<()>) {
        *self.thread.lock() = Some(handle);
    }

    pub fn take_thread(&self) -> Option<JoinHandle<()>> {
        self.thread.lock().take()
    }

    /// Entry point for a spawned worker thread (never called for worker 0,
    /// which runs its own caller's thread instead).
    pub fn thread_main(scheduler: &Scheduler, index: usize) {
        bind_current_thread(index);
        tracing::debug!(worker = index, "worker thread started");
        while !scheduler.is_stopped() {
            scheduler.worker(index).step(scheduler);
        }
        tracing::debug!(worker = index, "worker thread exiting");
    }

    /// One tick of the pick-or-steal loop: try our own deque, then a
    /// random peer's, then sleep briefly if nothing was found.
    pub fn step(&self, scheduler: &Scheduler) {
        if scheduler.is_paused() {
            thread::yield_now();
            return;
        }

        if let Some(job) = self.deque.pop() {
            self.run_job(job, scheduler);
            return;
        }

        let worker_count = scheduler.worker_count();
        if worker_count > 1 {
            let peer_index = self.random_peer_index(worker_count);
            if peer_index != self.index {
                if let Some(job) = scheduler.worker(peer_index).deque.steal() {
                    self.run_job(job, scheduler);
                    return;
                }
            }
        }

        scheduler.park_briefly(Duration::from_micros(200));
    }

    fn run_job(&self, job: JobHandle, scheduler: &Scheduler) {
        let previous = CURRENT_JOB.with(|c| c.replace(Some(job)));
        let result = panic::catch_unwind(AssertUnwindSafe(|| job.run()));
        CURRENT_JOB.with(|c| *c.borrow_mut() = previous);

        if let Err(payload) = result {
            tracing::error!(worker = self.index, "job body panicked; aborting process");
            drop(payload);
            std::process::abort();
        }

        Job::finish(job, self);
    }

    /// Fast LCG victim-selection PRNG, matching the original source's
    /// constants exactly (`seed = 214013*seed + 2531011`, top bits of the
    /// high half) so stealing behavior stays reproducible across ports.
    fn random_peer_index(&self, worker_count: usize) -> usize {
        let mut seed = self.seed.get();
        seed = seed.wrapping_mul(214_013).wrapping_add(2_531_011);
        self.seed.set(seed);
        (((seed >> 16) & 0x7FFF) as usize) % worker_count
    }
}
