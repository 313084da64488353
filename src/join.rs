//! Join / wait protocol.
//!
//! A producer retires a job by joining its handle. A pure blocking join sleeps
//! on the slot's condvar. A helping join first alternates non-blocking polls
//! with executing one pending job on the calling thread. It falls back to
//! blocking once the help budget is spent.
//!
//! Joining a BLOCKED job resolves through its parent: the joiner settles the
//! parent first (with the same help mode, without retiring it) and then waits
//! on the job itself. The joiner never sleeps on a BLOCKED job's condvar
//! while nothing can make progress on the job's behalf.

use crate::error::{SchedulerError, fatal};
use crate::job::{JobHandle, JobState, SlotRef};
use crate::table::{JobTable, wait};
use crossbeam::utils::Backoff;
use std::sync::TryLockError;

#[cfg(feature = "metrics")]
use std::sync::atomic::Ordering;

/// Thread id used for traces recorded by joining threads rather than workers.
const HELPER_TID: usize = usize::MAX;

/// Outcome of a single non-blocking poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Poll {
    Settled,
    Pending,
    Contended,
}

impl JobTable {
    /// Waits for `handle` to finish and retires it.
    pub(crate) fn join(&self, handle: JobHandle, help: bool) {
        let job = handle.slot;
        self.settle(job, help, true);

        let mut inner = self.lock_owned(job);
        if inner.state != JobState::Finished {
            let state = inner.state.name();
            drop(inner);
            fatal(SchedulerError::InvalidState {
                index: job.index,
                state,
                operation: "join",
            });
        }
        inner.state = JobState::Joined;
        log::trace!("joined job #{}", job.index);
    }

    /// Retires `handle` if it already finished; hands it back otherwise.
    pub(crate) fn try_join(&self, handle: JobHandle) -> Result<(), JobHandle> {
        let slot = self.slot(handle.slot.index);
        let mut inner = match slot.inner.try_lock() {
            Ok(inner) => inner,
            Err(TryLockError::WouldBlock) => return Err(handle),
            Err(TryLockError::Poisoned(_)) => fatal(SchedulerError::Poisoned("job slot")),
        };
        if inner.generation != handle.slot.generation {
            drop(inner);
            fatal(SchedulerError::StaleHandle {
                index: handle.slot.index,
                generation: handle.slot.generation,
            });
        }
        if inner.state == JobState::Finished {
            inner.state = JobState::Joined;
            Ok(())
        } else {
            #[cfg(feature = "metrics")]
            self.metrics.try_join_misses.fetch_add(1, Ordering::Relaxed);
            Err(handle)
        }
    }

    /// Joins every handle in order.
    pub(crate) fn join_all(&self, handles: impl IntoIterator<Item = JobHandle>, help: bool) {
        for handle in handles {
            self.join(handle, help);
        }
    }

    /// Returns once `job` is FINISHED (or, for a borrowed parent, retired).
    ///
    /// `owned` is true for the job being joined: its slot cannot be reclaimed
    /// under us, so a generation mismatch is a bug. A parent we only wait on
    /// may be joined and reclaimed by its own producer at any time.
    fn settle(&self, job: SlotRef, help: bool, owned: bool) {
        loop {
            if help && self.help_until_settled(job) {
                return;
            }

            let slot = self.slot(job.index);
            let mut inner = self.lock_slot(job.index);
            if inner.generation != job.generation {
                drop(inner);
                if owned {
                    fatal(SchedulerError::StaleHandle {
                        index: job.index,
                        generation: job.generation,
                    });
                }
                return;
            }

            match inner.state {
                JobState::Finished | JobState::Joined => return,
                JobState::Dead => {
                    drop(inner);
                    fatal(SchedulerError::InvalidState {
                        index: job.index,
                        state: JobState::Dead.name(),
                        operation: "join",
                    });
                }
                JobState::Blocked => {
                    let Some(parent) = inner.parent else {
                        drop(inner);
                        fatal(SchedulerError::InvalidState {
                            index: job.index,
                            state: "BLOCKED without a parent",
                            operation: "join",
                        });
                    };
                    drop(inner);
                    log::warn!(
                        "join on blocked job #{} waits for its parent #{} first",
                        job.index,
                        parent.index
                    );
                    self.settle(parent, help, false);
                }
                JobState::Unclaimed | JobState::Claimed => {
                    #[cfg(feature = "metrics")]
                    self.metrics.blocking_joins.fetch_add(1, Ordering::Relaxed);
                    while matches!(inner.state, JobState::Unclaimed | JobState::Claimed) {
                        inner = wait(&slot.done, inner, "job slot");
                    }
                    return;
                }
            }
        }
    }

    /// Polls `job`, running one pending job between polls. Returns true if
    /// the job settled before the help budget ran out.
    ///
    /// Only polls that found nothing to run count against the budget, so a
    /// helper never gives up while claimable work (possibly `job` itself) is
    /// still sitting in the table.
    fn help_until_settled(&self, job: SlotRef) -> bool {
        let backoff = Backoff::new();
        let mut idle = 0;
        while idle < self.help_attempts {
            if self.poll(job) == Poll::Settled {
                return true;
            }
            match self.try_pop() {
                Some(claimed) => {
                    #[cfg(feature = "metrics")]
                    self.metrics.help_executions.fetch_add(1, Ordering::Relaxed);
                    self.run_claimed(claimed, HELPER_TID);
                    backoff.reset();
                }
                None => {
                    idle += 1;
                    backoff.snooze();
                }
            }
        }
        self.poll(job) == Poll::Settled
    }

    fn poll(&self, job: SlotRef) -> Poll {
        match self.slot(job.index).inner.try_lock() {
            Ok(inner) if inner.generation != job.generation => Poll::Settled,
            Ok(inner) if matches!(inner.state, JobState::Finished | JobState::Joined) => {
                Poll::Settled
            }
            Ok(_) => Poll::Pending,
            Err(TryLockError::WouldBlock) => Poll::Contended,
            Err(TryLockError::Poisoned(_)) => fatal(SchedulerError::Poisoned("job slot")),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::job::{JobState, Payload, WorkTask};
    use crate::table::JobTable;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: &Arc<AtomicUsize>) -> Payload {
        let counter = counter.clone();
        Payload::Task(WorkTask::Func(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })))
    }

    #[test]
    fn test_try_join_pending_returns_handle() {
        let table = JobTable::new(10, 4, 8, false);
        let ran = Arc::new(AtomicUsize::new(0));
        let handle = table.push(counting(&ran), None);

        let handle = table.try_join(handle).unwrap_err();
        assert_eq!(table.state(&handle), JobState::Unclaimed);

        let job = table.try_pop().unwrap();
        table.run_claimed(job, 0);
        assert!(table.try_join(handle).is_ok());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_helping_join_runs_job_inline() {
        // No workers: the joining thread has to execute the job itself.
        let table = JobTable::new(10, 4, 8, false);
        let ran = Arc::new(AtomicUsize::new(0));
        let handle = table.push(counting(&ran), None);

        table.join(handle, true);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(table.live_jobs(), 0);
    }

    #[test]
    fn test_helping_join_on_blocked_job_runs_parent_first() {
        let table = JobTable::new(10, 4, 8, false);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let log_a = order.clone();
        let a = table.push(
            Payload::Task(WorkTask::Func(Box::new(move || log_a.lock().unwrap().push("a")))),
            None,
        );
        let log_b = order.clone();
        let b = table.push(
            Payload::Task(WorkTask::Func(Box::new(move || log_b.lock().unwrap().push("b")))),
            Some(&a),
        );
        assert_eq!(table.state(&b), JobState::Blocked);

        table.join(b, true);
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
        // The parent ran but is still owned by its producer.
        assert_eq!(table.state(&a), JobState::Finished);
        table.join(a, false);
    }

    #[test]
    fn test_fence_joins_its_handles() {
        let table = JobTable::new(10, 4, 8, false);
        let ran = Arc::new(AtomicUsize::new(0));
        let slices: Vec<_> = (0..3).map(|_| table.push(counting(&ran), None)).collect();
        let fence = table.push(Payload::Fence(slices), None);
        let after = table.push(counting(&ran), Some(&fence));

        table.join(after, true);
        assert_eq!(ran.load(Ordering::SeqCst), 4);
        table.join(fence, false);
        assert_eq!(table.live_jobs(), 0);
    }
}
