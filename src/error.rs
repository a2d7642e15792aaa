use thiserror::Error;

/// Error taxonomy for the scheduler.
///
/// Every variant here is a programmer error (see the crate-level docs):
/// nothing in this enum is ever returned from inside a job body, and the
/// scheduler's own callers are expected to treat both variants as fatal
/// unless they have a specific reason not to (e.g. a test asserting the
/// contract was actually violated).
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// The caller broke an API contract: starting a job twice, waiting on a
    /// job that was never started, overflowing a fixed-capacity successor
    /// list, calling `reset_frame` while jobs are still in flight, and so on.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// A fixed-size internal structure ran out of room: the per-worker job
    /// pool wrapped within a frame, a deque buffer overflowed, or the
    /// backing allocator refused to grow a slab.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}
