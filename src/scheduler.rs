use crate::error::SchedulerError;
use crate::job::JobHandle;
use crate::worker::{self, Worker};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Construction parameters for a [`Scheduler`].
///
/// Mirrors the original source's `Initialize(numWorkerThreads,
/// jobBufferSize)`, but validated up front instead of silently rounding a
/// nonsensical input.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Total number of workers, including worker 0 (the thread that calls
    /// [`Scheduler::new`], which does not get a dedicated OS thread).
    pub num_workers: usize,
    /// Per-worker job-pool / deque buffer capacity, rounded up to the next
    /// power of two.
    pub job_pool_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: Scheduler::cpu_thread_count().max(1),
            job_pool_capacity: 4096,
        }
    }
}

impl SchedulerConfig {
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_job_pool_capacity(mut self, capacity: usize) -> Self {
        self.job_pool_capacity = capacity;
        self
    }

    fn validate(&self) -> Result<(), SchedulerError> {
        if self.num_workers == 0 {
            return Err(SchedulerError::ContractViolation(
                "scheduler requires at least one worker".to_string(),
            ));
        }
        if self.job_pool_capacity == 0 {
            return Err(SchedulerError::ContractViolation(
                "job pool capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// A fixed array of workers, plus the public job API surface.
///
/// `Scheduler` is always handed out behind an `Arc` (see [`Scheduler::new`])
/// because worker threads, the global accessor, and the caller all need to
/// share it; each spawned worker thread holds its own `Arc::clone`, so the
/// allocation stays alive for as long as any thread is still running. There
/// is no `Drop` impl: call [`Scheduler::shutdown`] before letting the last
/// `Arc` go, which stops and joins every worker thread explicitly instead of
/// relying on a destructor racing against those same threads.
pub struct Scheduler {
    workers: Vec<Worker>,
    paused: AtomicBool,
    stopped: AtomicBool,
    sleep_condvar: Condvar,
    sleep_mutex: Mutex<()>,
    user_data: Vec<Mutex<Option<Box<dyn Any + Send>>>>,
}

impl Scheduler {
    /// Constructs a scheduler from the given config, binds the calling
    /// thread as worker 0, and spawns one OS thread per remaining worker.
    pub fn new(config: SchedulerConfig) -> Result<Arc<Self>, SchedulerError> {
        config.validate()?;

        let buffer_size = config.job_pool_capacity.next_power_of_two();
        let workers = (0..config.num_workers)
            .map(|i| Worker::new(i, buffer_size))
            .collect::<Vec<_>>();
        let user_data = (0..config.num_workers).map(|_| Mutex::new(None)).collect();

        // Paused until every worker exists, matching the source's
        // "BlockThreadsStatus(true)" window around construction.
        let scheduler = Arc::new(Self {
            workers,
            paused: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            sleep_condvar: Condvar::new(),
            sleep_mutex: Mutex::new(()),
            user_data,
        });

        worker::bind_current_thread(0);

        for index in 1..scheduler.workers.len() {
            let worker_scheduler = Arc::clone(&scheduler);
            let handle = thread::Builder::new()
                .name(format!("worker-{index}"))
                .spawn(move || {
                    Worker::thread_main(&worker_scheduler, index);
                })
                .expect("failed to spawn worker thread");
            scheduler.workers[index].set_thread(handle);
        }

        scheduler.paused.store(false, Ordering::Release);
        tracing::info!(workers = scheduler.workers.len(), "scheduler initialized");
        Ok(scheduler)
    }

    pub fn cpu_thread_count() -> usize {
        num_cpus::get().saturating_sub(1).max(1)
    }

    pub(crate) fn worker(&self, index: usize) -> &Worker {
        &self.workers[index]
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn park_briefly(&self, timeout: Duration) {
        let mut guard = self.sleep_mutex.lock();
        self.sleep_condvar.wait_for(&mut guard, timeout);
    }

    /// Pauses every worker: they will yield their timeslice instead of
    /// claiming jobs. Used internally during `new` and `reset_frame`.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    /// Resumes workers paused by [`Scheduler::pause`].
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.sleep_condvar.notify_all();
    }

    fn current_worker_index(&self) -> Result<usize, SchedulerError> {
        worker::current_worker_index().ok_or_else(|| {
            SchedulerError::ContractViolation(
                "called from a thread that is not bound to a worker".to_string(),
            )
        })
    }

    /// Creates a new, unparented job on the calling worker's pool. The job
    /// is not scheduled until [`Scheduler::start`] is called.
    pub fn create_job<F>(&self, f: F) -> Result<JobHandle, SchedulerError>
    where
        F: FnMut(&JobHandle) + Send + 'static,
    {
        self.create_job_with_parent(None, f)
    }

    /// Creates a job as a child of `parent`: `parent` cannot complete until
    /// this job (and everything it in turn parents) finishes. The
    /// increment to `parent`'s pending count happens before this call
    /// returns, so the child cannot race its own completion against its
    /// own creation.
    pub fn create_child_job<F>(&self, parent: &JobHandle, f: F) -> Result<JobHandle, SchedulerError>
    where
        F: FnMut(&JobHandle) + Send + 'static,
    {
        parent.add_pending();
        self.create_job_with_parent(Some(*parent), f)
    }

    /// Equivalent to `create_child_job(current_job(), f)`. Only valid when
    /// called from inside a running job's body.
    pub fn create_child_job_of_current<F>(&self, f: F) -> Result<JobHandle, SchedulerError>
    where
        F: FnMut(&JobHandle) + Send + 'static,
    {
        let parent = worker::current_job().ok_or_else(|| {
            SchedulerError::ContractViolation(
                "create_child_job_of_current called outside of a running job".to_string(),
            )
        })?;
        self.create_child_job(&parent, f)
    }

    fn create_job_with_parent<F>(
        &self,
        parent: Option<JobHandle>,
        f: F,
    ) -> Result<JobHandle, SchedulerError>
    where
        F: FnMut(&JobHandle) + Send + 'static,
    {
        let index = self.current_worker_index()?;
        let job = self.workers[index].deque().get_fresh_job()?;
        job.reinit(index);
        job.attach(parent, f);
        Ok(job)
    }

    /// A job whose body does nothing: a pure join point for its children.
    pub fn create_container(&self) -> Result<JobHandle, SchedulerError> {
        self.create_job(|_| {})
    }

    /// A child container: join point scoped to the current job's lifetime.
    pub fn create_child_container(&self, parent: &JobHandle) -> Result<JobHandle, SchedulerError> {
        self.create_child_job(parent, |_| {})
    }

    /// Schedules `then` to run once `first` completes. `first` must not yet
    /// be started, and `then` must never be started independently —
    /// `first`'s completion is what schedules it.
    pub fn add_dependency(&self, first: &JobHandle, then: &JobHandle) -> Result<(), SchedulerError> {
        first.add_successor(*then)
    }

    /// Schedules a job onto the worker that allocated it (its "origin"),
    /// not necessarily the calling worker. See the design notes on why
    /// routing is origin-sticky rather than caller-sticky.
    pub fn start(&self, job: &JobHandle) -> Result<(), SchedulerError> {
        job.mark_started()?;
        let origin = job.origin_worker();
        self.workers[origin].deque().push(*job)?;
        self.sleep_condvar.notify_all();
        Ok(())
    }

    /// Blocks the calling worker until `job` completes, running other
    /// jobs in the meantime instead of truly sleeping. Safe to call
    /// re-entrantly from inside a running job's body.
    ///
    /// Waiting on a job that was never [`start`](Scheduler::start)ed can
    /// never return — its `pending` count stays at its initial tick
    /// forever — so per the contract-violation taxonomy this is treated as
    /// a fatal programmer error rather than a silent deadlock: it is
    /// logged and the process aborts.
    pub fn wait(&self, job: &JobHandle) {
        if !job.is_started() {
            let err = SchedulerError::ContractViolation(
                "wait() called on a job that was never started".to_string(),
            );
            tracing::error!(error = %err, "contract violation");
            std::process::abort();
        }

        let index = self
            .current_worker_index()
            .expect("wait() called from a thread that is not bound to a worker");
        while !job.has_completed() {
            self.workers[index].step(self);
        }
    }

    /// Runs two closures as fork/join jobs on the calling worker's pool and
    /// waits for both, in the spirit of the original `join` helper.
    pub fn join<F1, F2>(&self, f1: F1, f2: F2) -> Result<(), SchedulerError>
    where
        F1: FnOnce() + Send + 'static,
        F2: FnOnce() + Send + 'static,
    {
        let mut f1 = Some(f1);
        let mut f2 = Some(f2);
        let left = self.create_job(move |_| {
            if let Some(f) = f1.take() {
                f();
            }
        })?;
        let right = self.create_job(move |_| {
            if let Some(f) = f2.take() {
                f();
            }
        })?;
        self.start(&left)?;
        self.start(&right)?;
        self.wait(&left);
        self.wait(&right);
        Ok(())
    }

    /// Reclaims every worker's job-pool ring and drains deferred arena
    /// frees. The caller must guarantee no job from the current frame is
    /// still in flight (held as a `JobHandle`, referenced as a parent or
    /// successor, or running): this call does not synchronize with
    /// running workers, by design (see the design notes on quiescence).
    pub fn reset_frame(&self) {
        self.pause();
        for worker in &self.workers {
            worker.deque().reset_pool();
            worker.arena().drain_deferred(&self.workers);
        }
        self.resume();
    }

    /// Stores a per-worker opaque value, looked up later by worker index.
    pub fn set_user_data<T: Any + Send>(&self, worker_index: usize, value: T) {
        *self.user_data[worker_index].lock() = Some(Box::new(value));
    }

    /// Runs `f` with a typed reference to the value stored for
    /// `worker_index` via [`Scheduler::set_user_data`], if any and if the
    /// stored type matches `T`.
    pub fn with_user_data<T: Any + Send, R>(&self, worker_index: usize, f: impl FnOnce(&T) -> R) -> Option<R> {
        let guard = self.user_data[worker_index].lock();
        guard.as_ref().and_then(|b| b.downcast_ref::<T>()).map(f)
    }

    /// Stops every worker and blocks until each spawned thread has joined.
    ///
    /// The embedding code must call this before letting the last `Arc`
    /// holding this scheduler drop: since each worker thread holds its own
    /// `Arc::clone`, nothing frees the scheduler's storage until `shutdown`
    /// (and the thread exits it joins) has run, so calling it repeatedly or
    /// not at all only leaks threads rather than causing a use-after-free.
    /// Safe to call from worker 0 (the thread that called [`Scheduler::new`])
    /// since it only ever takes `&self`.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        {
            let _guard = self.sleep_mutex.lock();
            self.sleep_condvar.notify_all();
        }
        for worker in &self.workers {
            if let Some(handle) = worker.take_thread() {
                let _ = handle.join();
            }
        }
        tracing::info!("scheduler shut down");
    }
}
