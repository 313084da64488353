//! Worker thread implementation.
//!
//! A worker loops on the job table: block until a job is claimable, execute
//! it, mark it finished. It exits after executing a termination job. Workers
//! are spawned once and reused for every job until `kill_workers`.

use crate::PinningStrategy;
use crate::error::SchedulerError;
use crate::job::{Flow, JobHandle, Payload, WorkTask};
use crate::table::JobTable;
use crate::tracing::CollectorGuard;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A long-lived OS thread bound to one job table.
pub struct Worker {
    id: usize,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Starts a worker thread named `job-worker-{id}`.
    pub(crate) fn spawn(
        id: usize,
        table: Arc<JobTable>,
        pinning: PinningStrategy,
    ) -> Result<Self, SchedulerError> {
        let handle = thread::Builder::new()
            .name(format!("job-worker-{id}"))
            .spawn(move || {
                pin_current(id, pinning);
                Worker::run_loop(id, &table);
            })?;

        Ok(Worker {
            id,
            handle: Some(handle),
        })
    }

    fn run_loop(id: usize, table: &JobTable) {
        let _collect = table.trace_jobs.then_some(CollectorGuard);
        log::debug!("worker {id} started");

        loop {
            let job = table.pop();
            if table.run_claimed(job, id) == Flow::Exit {
                break;
            }
        }

        log::debug!("worker {id} exiting");
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Waits for the OS thread to exit.
    pub fn join(mut self) -> thread::Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }
}

fn pin_current(id: usize, pinning: PinningStrategy) {
    let logical = match pinning {
        PinningStrategy::None => return,
        PinningStrategy::Linear => id,
        PinningStrategy::AvoidSMT => id * 2,
    };
    let Some(core_ids) = core_affinity::get_core_ids() else {
        log::warn!("worker {id}: core ids unavailable, running unpinned");
        return;
    };
    match core_ids.get(logical) {
        Some(&core) => {
            if !core_affinity::set_for_current(core) {
                log::warn!("worker {id}: failed to pin to core {logical}");
            }
        }
        None => log::warn!("worker {id}: no logical core {logical} to pin to"),
    }
}

/// The set of workers serving one job table.
pub struct WorkerPool {
    table: Arc<JobTable>,
    workers: Vec<Worker>,
}

impl WorkerPool {
    pub(crate) fn new(table: Arc<JobTable>) -> Self {
        WorkerPool {
            table,
            workers: Vec::new(),
        }
    }

    /// Spawns `count` workers. Fails if workers are already running.
    pub(crate) fn spawn(&mut self, count: usize, pinning: PinningStrategy) -> Result<(), SchedulerError> {
        if !self.workers.is_empty() {
            return Err(SchedulerError::WorkersRunning(self.workers.len()));
        }
        for id in 0..count {
            let worker = Worker::spawn(id, Arc::clone(&self.table), pinning)?;
            self.workers.push(worker);
        }
        log::debug!("spawned {count} workers");
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Pushes one termination job per worker and joins every thread.
    ///
    /// Returns the number of workers that panicked.
    pub(crate) fn kill(&mut self) -> usize {
        let stops: Vec<JobHandle> = self
            .workers
            .iter()
            .map(|_| self.table.push(Payload::Task(WorkTask::Terminate), None))
            .collect();

        let mut failed = 0;
        for worker in self.workers.drain(..) {
            let id = worker.id();
            if worker.join().is_err() {
                failed += 1;
                log::error!("worker {id} panicked");
            }
        }

        // Each worker consumed exactly one termination job unless a caller
        // submitted extra ones; those leave some of ours unclaimed.
        for stop in stops {
            if let Err(stop) = self.table.try_join(stop) {
                log::warn!("termination job {stop} was never claimed");
            }
        }
        failed
    }
}
