//! Scheduler error taxonomy.
//!
//! Every variant here describes a sizing bug or a broken invariant. The
//! scheduler does not try to survive them: the infallible entry points route
//! them through [`fatal`], which logs the diagnostic and panics. The `try_*`
//! entry points hand the same value back to the caller instead.

use thiserror::Error;

/// Errors raised by the job table and its workers.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Every slot holds a job that has not been joined yet.
    #[error("Ran out of space for jobs (capacity {capacity})")]
    TableFull { capacity: usize },

    /// A parent already has the maximum number of blocked dependents.
    #[error("Ran out of space for dependents on job {parent} (capacity {capacity})")]
    DependentsFull { parent: usize, capacity: usize },

    /// A handle no longer refers to the job it was issued for.
    #[error("Stale job handle {index} (generation {generation})")]
    StaleHandle { index: usize, generation: u32 },

    /// A claimed slot had no payload to execute.
    #[error("Job {index} was claimed without a payload")]
    MissingPayload { index: usize },

    /// A worker reserved a job from the unclaimed counter but found none to claim.
    #[error("Unclaimed counter promised a job but the table had none")]
    LostWakeup,

    /// A job was found in a state that the operation cannot handle.
    #[error("Job {index} is {state} during {operation}")]
    InvalidState {
        index: usize,
        state: &'static str,
        operation: &'static str,
    },

    /// A mutex guarding scheduler state was poisoned by a panic.
    #[error("Failed to lock {0} mutex")]
    Poisoned(&'static str),

    /// `init` was handed a configuration the table cannot be built from.
    #[error("Invalid scheduler config: {0}")]
    InvalidConfig(&'static str),

    /// `spawn_workers` was called while workers were still running.
    #[error("Workers already spawned ({0} running)")]
    WorkersRunning(usize),

    /// The OS refused to start a worker thread.
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Logs the diagnostic and terminates the calling thread with a panic.
#[cold]
#[track_caller]
pub(crate) fn fatal(err: SchedulerError) -> ! {
    log::error!("{err}");
    panic!("{err}");
}
