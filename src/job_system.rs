//! High-level job system interface.
//!
//! `JobSystem` is the scheduler context handed to the game's runtime. It owns
//! the job table and the worker pool. Producers go through it to submit,
//! chain and join jobs.

use crate::PinningStrategy;
use crate::error::{SchedulerError, fatal};
use crate::job::{Execute, JobHandle, JobState, Payload, WorkTask};
use crate::table::{JobTable, lock};
use crate::worker::WorkerPool;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::thread;

/// Sizing and behaviour of one job system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of job table slots. Default: 100.
    pub max_jobs: usize,
    /// How many jobs may block on one parent. Default: 16.
    pub max_dependents: usize,
    /// How many times a helping join may find nothing to run before it blocks.
    /// Default: 32.
    ///
    /// Only idle polls count. Running a claimed job does not, so while
    /// claimable work keeps arriving a helping join has no upper bound on how
    /// many jobs it executes.
    pub help_attempts: usize,
    /// Core pinning for worker threads.
    pub pinning: PinningStrategy,
    /// Record an execution span per job (see [`crate::tracing`]).
    pub trace_jobs: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_jobs: 100,
            max_dependents: 16,
            help_attempts: 32,
            pinning: PinningStrategy::None,
            trace_jobs: false,
        }
    }
}

impl SchedulerConfig {
    fn validate(&self) -> Result<(), SchedulerError> {
        if self.max_jobs == 0 {
            return Err(SchedulerError::InvalidConfig("max_jobs must be at least 1"));
        }
        if self.max_dependents == 0 {
            return Err(SchedulerError::InvalidConfig("max_dependents must be at least 1"));
        }
        Ok(())
    }
}

/// The scheduler context: a job table plus the workers draining it.
///
/// # Example
///
/// ```no_run
/// use framejobs::JobSystem;
///
/// let jobs = JobSystem::new(4);
/// let handle = jobs.submit_fn(|| println!("Hello from a job!"));
/// jobs.join(handle, true);
/// jobs.kill_workers();
/// ```
pub struct JobSystem {
    table: Arc<JobTable>,
    pool: Mutex<WorkerPool>,
    config: SchedulerConfig,
}

impl JobSystem {
    /// Builds the job table. No workers run until [`spawn_workers`](Self::spawn_workers).
    pub fn init(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        let table = Arc::new(JobTable::new(
            config.max_jobs,
            config.max_dependents,
            config.help_attempts,
            config.trace_jobs,
        ));
        log::debug!(
            "job system initialised: {} slots, {} dependents per job",
            config.max_jobs,
            config.max_dependents
        );
        Ok(JobSystem {
            pool: Mutex::new(WorkerPool::new(Arc::clone(&table))),
            table,
            config,
        })
    }

    /// Default configuration with `num_threads` workers already running.
    pub fn new(num_threads: usize) -> Self {
        let system = Self::init(SchedulerConfig::default()).unwrap_or_else(|err| fatal(err));
        system.spawn_workers(num_threads);
        system
    }

    /// One worker per available core.
    pub fn with_default_threads() -> Self {
        let num_cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        JobSystem::new(num_cpus)
    }

    /// Starts `count` worker threads. Calling it twice without
    /// [`kill_workers`](Self::kill_workers) in between is fatal.
    pub fn spawn_workers(&self, count: usize) {
        let mut pool = lock(&self.pool, "worker pool");
        if let Err(err) = pool.spawn(count, self.config.pinning) {
            drop(pool);
            fatal(err);
        }
    }

    /// Stops every worker and waits for their threads to exit.
    ///
    /// Returns the number of workers that panicked.
    pub fn kill_workers(&self) -> usize {
        lock(&self.pool, "worker pool").kill()
    }

    /// Submits a typed job with no dependency.
    pub fn submit<J: Execute>(&self, job: J) -> JobHandle {
        self.table.push(Payload::User(Box::new(job)), None)
    }

    /// Submits a typed job that stays BLOCKED until `parent` finishes.
    pub fn submit_dependent<J: Execute>(&self, parent: &JobHandle, job: J) -> JobHandle {
        self.table.push(Payload::User(Box::new(job)), Some(parent))
    }

    /// Fallible form of [`submit`](Self::submit) and
    /// [`submit_dependent`](Self::submit_dependent).
    pub fn try_submit<J: Execute>(
        &self,
        parent: Option<&JobHandle>,
        job: J,
    ) -> Result<JobHandle, SchedulerError> {
        self.table.try_push(Payload::User(Box::new(job)), parent)
    }

    /// Submits a closure.
    pub fn submit_fn<F>(&self, work: F) -> JobHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_task(WorkTask::Func(Box::new(work)))
    }

    /// Submits a closure gated on `parent`.
    pub fn submit_dependent_fn<F>(&self, parent: &JobHandle, work: F) -> JobHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_dependent_task(parent, WorkTask::Func(Box::new(work)))
    }

    /// Submits one of the built-in job kinds.
    pub fn submit_task(&self, task: WorkTask) -> JobHandle {
        self.table.push(Payload::Task(task), None)
    }

    pub fn submit_dependent_task(&self, parent: &JobHandle, task: WorkTask) -> JobHandle {
        self.table.push(Payload::Task(task), Some(parent))
    }

    /// Submits a job that joins every handle in `handles`.
    ///
    /// Jobs submitted with the fence as parent start only after all of
    /// `handles` finished. The fence takes ownership of the handles.
    pub fn submit_fence(&self, handles: Vec<JobHandle>) -> JobHandle {
        self.table.push(Payload::Fence(handles), None)
    }

    /// Like [`submit_fence`](Self::submit_fence), gated on `parent`.
    pub fn submit_dependent_fence(&self, parent: &JobHandle, handles: Vec<JobHandle>) -> JobHandle {
        self.table.push(Payload::Fence(handles), Some(parent))
    }

    /// Waits for the job and retires its handle.
    ///
    /// With `help`, the calling thread executes pending jobs between polls
    /// before it falls back to sleeping.
    pub fn join(&self, handle: JobHandle, help: bool) {
        self.table.join(handle, help);
    }

    /// Retires the job if it already finished. Never blocks.
    pub fn try_join(&self, handle: JobHandle) -> Result<(), JobHandle> {
        self.table.try_join(handle)
    }

    pub fn join_all(&self, handles: impl IntoIterator<Item = JobHandle>, help: bool) {
        self.table.join_all(handles, help);
    }

    /// Claims and executes one pending job on the calling thread.
    ///
    /// Returns false if nothing was claimable.
    pub fn run_pending(&self) -> bool {
        match self.table.try_pop() {
            Some(job) => {
                self.table.run_claimed(job, usize::MAX);
                true
            }
            None => false,
        }
    }

    pub fn state(&self, handle: &JobHandle) -> JobState {
        self.table.state(handle)
    }

    /// Slot indices currently blocked on `handle`.
    pub fn dependents(&self, handle: &JobHandle) -> Vec<usize> {
        self.table.dependents(handle)
    }

    pub fn unclaimed_count(&self) -> usize {
        self.table.unclaimed_count()
    }

    pub fn live_jobs(&self) -> usize {
        self.table.live_jobs()
    }

    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    pub fn num_workers(&self) -> usize {
        lock(&self.pool, "worker pool").size()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> crate::metrics::MetricsSnapshot {
        self.table.metrics.snapshot()
    }
}

impl Default for JobSystem {
    fn default() -> Self {
        JobSystem::with_default_threads()
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        // A scheduler bug is already unwinding; pushing more jobs could panic again.
        if thread::panicking() {
            return;
        }
        if let Ok(pool) = self.pool.get_mut() {
            if pool.size() > 0 {
                pool.kill();
            }
        }
    }
}
