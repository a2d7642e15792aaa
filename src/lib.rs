//! A fork/join work-stealing job scheduler.
//!
//! Work is expressed as small job closures that may spawn children (which
//! must finish before their parent is considered complete) and chain
//! successors (which run only once a predecessor finishes). Each worker
//! owns a Chase–Lev deque and a matching job pool; idle workers steal from
//! a randomly chosen peer rather than sitting on a single shared queue.
//!
//! ```
//! use forkjoin_scheduler::{Scheduler, SchedulerConfig};
//!
//! let scheduler = Scheduler::new(SchedulerConfig::new(2)).unwrap();
//! let job = scheduler.create_job(|_| {}).unwrap();
//! scheduler.start(&job).unwrap();
//! scheduler.wait(&job);
//! ```

mod arena;
mod deque;
mod error;
mod job;
mod scheduler;
mod worker;

pub use error::SchedulerError;
pub use job::JobHandle;
pub use scheduler::{Scheduler, SchedulerConfig};
pub use worker::{current_job, current_worker_index};

use once_cell::sync::OnceCell;
use std::sync::Arc;

static GLOBAL_SCHEDULER: OnceCell<Arc<Scheduler>> = OnceCell::new();

/// Returns the process-wide scheduler set by [`initialize_global`].
///
/// # Panics
/// Panics if no global scheduler has been initialized yet.
pub fn global() -> &'static Arc<Scheduler> {
    GLOBAL_SCHEDULER
        .get()
        .expect("global scheduler was not initialized")
}

/// Installs `scheduler` as the process-wide global.
///
/// # Panics
/// Panics if a global scheduler was already installed.
pub fn initialize_global(scheduler: Arc<Scheduler>) {
    GLOBAL_SCHEDULER
        .set(scheduler)
        .unwrap_or_else(|_| panic!("global scheduler was already initialized"));
}

/// Installs `scheduler` as the process-wide global unless one is already set.
pub fn try_initialize_global(scheduler: Arc<Scheduler>) -> Result<(), Arc<Scheduler>> {
    GLOBAL_SCHEDULER.set(scheduler)
}
