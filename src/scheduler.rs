//! Push, pop and finish: the scheduling core of the job table.

use crate::error::{SchedulerError, fatal};
use crate::job::{Flow, JobHandle, JobState, Payload, SlotRef, WorkTask};
use crate::table::{JobTable, SlotInner, lock, wait};
use crate::tracing::TraceGuard;
use std::panic::{self, AssertUnwindSafe};
use std::sync::MutexGuard;

#[cfg(feature = "metrics")]
use std::sync::atomic::Ordering;

impl JobTable {
    /// Inserts a job, optionally gated on `parent`, and returns its handle.
    ///
    /// The job is visible to workers before this returns.
    pub(crate) fn try_push(
        &self,
        payload: Payload,
        parent: Option<&JobHandle>,
    ) -> Result<JobHandle, SchedulerError> {
        let task_type = payload.task_type();
        let _claim = lock(&self.claim_lock, "job table");

        let (index, mut slot) = self.find_free_slot(parent.map(|p| p.slot))?;
        // Whatever was left in a JOINED slot is destroyed here.
        slot.state = JobState::Dead;
        slot.payload = None;
        slot.parent = None;
        slot.dependents.clear();

        let state = match parent {
            Some(parent) => self.register_dependent(parent.slot, index)?,
            None => JobState::Unclaimed,
        };

        slot.generation = slot.generation.wrapping_add(1);
        slot.state = state;
        slot.task_type = task_type;
        slot.payload = Some(payload);
        slot.parent = match (state, parent) {
            (JobState::Blocked, Some(parent)) => Some(parent.slot),
            _ => None,
        };
        let handle = JobHandle::new(index, slot.generation);
        drop(slot);

        log::trace!("pushed {} job {} as {}", task_type.name(), handle, state);
        #[cfg(feature = "metrics")]
        self.metrics.jobs_submitted.fetch_add(1, Ordering::Relaxed);

        if state == JobState::Unclaimed {
            self.publish(1);
        }
        Ok(handle)
    }

    /// Like [`try_push`](Self::try_push) but capacity errors are fatal.
    pub(crate) fn push(&self, payload: Payload, parent: Option<&JobHandle>) -> JobHandle {
        self.try_push(payload, parent).unwrap_or_else(|err| fatal(err))
    }

    /// First DEAD or JOINED slot, locked. Caller holds the claim lock.
    fn find_free_slot(
        &self,
        parent: Option<SlotRef>,
    ) -> Result<(usize, MutexGuard<'_, SlotInner>), SchedulerError> {
        for (index, _) in self.slots() {
            if parent.is_some_and(|p| p.index == index) {
                continue;
            }
            let inner = self.lock_slot(index);
            if matches!(inner.state, JobState::Dead | JobState::Joined) {
                return Ok((index, inner));
            }
        }
        Err(SchedulerError::TableFull {
            capacity: self.capacity(),
        })
    }

    /// Decides the initial state of `child` and registers it with `parent` if needed.
    fn register_dependent(&self, parent: SlotRef, child: usize) -> Result<JobState, SchedulerError> {
        debug_assert_ne!(parent.index, child, "a job cannot be its own parent");
        let mut inner = self.lock_slot(parent.index);
        if inner.generation != parent.generation || inner.state.is_settled() {
            return Ok(JobState::Unclaimed);
        }
        if inner.dependents.len() >= self.max_dependents {
            return Err(SchedulerError::DependentsFull {
                parent: parent.index,
                capacity: self.max_dependents,
            });
        }
        debug_assert!(!inner.dependents.contains(&child));
        inner.dependents.push(child);
        Ok(JobState::Blocked)
    }

    /// Blocks until a job is claimable, then claims it.
    pub(crate) fn pop(&self) -> SlotRef {
        {
            let mut unclaimed = lock(&self.unclaimed, "unclaimed counter");
            while *unclaimed == 0 {
                unclaimed = wait(&self.work_available, unclaimed, "unclaimed counter");
            }
            *unclaimed -= 1;
        }

        let _claim = lock(&self.claim_lock, "job table");
        match self.claim_first(|_| true) {
            Some(job) => job,
            None => fatal(SchedulerError::LostWakeup),
        }
    }

    /// Claims a job if one is immediately available. Never blocks on work.
    ///
    /// Termination jobs are left for the workers they are meant for.
    pub(crate) fn try_pop(&self) -> Option<SlotRef> {
        let _claim = lock(&self.claim_lock, "job table");
        let mut unclaimed = lock(&self.unclaimed, "unclaimed counter");
        // Every unit of the counter may already be reserved by a sleeping worker.
        if *unclaimed == 0 {
            return None;
        }
        let job = self.claim_first(|inner| inner.task_type != crate::job::TaskType::Terminate)?;
        *unclaimed -= 1;
        Some(job)
    }

    /// Scans for the first UNCLAIMED slot accepted by `filter` and claims it.
    /// Caller holds the claim lock.
    fn claim_first(&self, filter: impl Fn(&SlotInner) -> bool) -> Option<SlotRef> {
        for (index, _) in self.slots() {
            let mut inner = self.lock_slot(index);
            if inner.state == JobState::Unclaimed && filter(&inner) {
                inner.state = JobState::Claimed;
                log::trace!("claimed {} job #{}", inner.task_type.name(), index);
                return Some(inner.slot_ref(index));
            }
        }
        None
    }

    /// Marks a job FINISHED and releases everything blocked on it.
    pub(crate) fn finish(&self, job: SlotRef) {
        let unblocked = {
            let mut inner = self.lock_owned(job);
            inner.state = JobState::Finished;
            let dependents = std::mem::take(&mut inner.dependents);
            let mut unblocked = 0;
            for &dependent in &dependents {
                let mut dep = self.lock_slot(dependent);
                if dep.state == JobState::Blocked && dep.parent == Some(job) {
                    dep.state = JobState::Unclaimed;
                    dep.parent = None;
                    unblocked += 1;
                }
            }
            // Hand the allocation back so the slot keeps its capacity.
            inner.dependents = dependents;
            inner.dependents.clear();
            unblocked
        };

        log::trace!("finished job #{} ({} dependents released)", job.index, unblocked);
        #[cfg(feature = "metrics")]
        {
            self.metrics.jobs_completed.fetch_add(1, Ordering::Relaxed);
            self.metrics
                .dependents_unblocked
                .fetch_add(unblocked as u64, Ordering::Relaxed);
        }

        if unblocked > 0 {
            self.publish(unblocked);
        }
        self.slot(job.index).done.notify_all();
    }

    /// Executes a claimed job on the calling thread and finishes it.
    pub(crate) fn run_claimed(&self, job: SlotRef, tid: usize) -> Flow {
        let payload = self.lock_owned(job).payload.take();
        let Some(payload) = payload else {
            fatal(SchedulerError::MissingPayload { index: job.index });
        };

        let flow = {
            let _trace = self.trace_jobs.then(|| TraceGuard::new(payload.trace_name(), tid));
            self.execute(payload, job)
        };
        self.finish(job);
        flow
    }

    fn execute(&self, payload: Payload, job: SlotRef) -> Flow {
        let task_type = payload.task_type();
        let result = panic::catch_unwind(AssertUnwindSafe(|| match payload {
            Payload::Task(WorkTask::Terminate) => Flow::Exit,
            Payload::Task(task) => {
                run_task(task);
                Flow::Continue
            }
            Payload::User(work) => {
                work.execute();
                Flow::Continue
            }
            Payload::Fence(handles) => {
                self.join_all(handles, true);
                Flow::Continue
            }
        }));

        result.unwrap_or_else(|_| {
            log::error!("{} job #{} panicked during execution", task_type.name(), job.index);
            Flow::Continue
        })
    }
}

fn run_task(task: WorkTask) {
    match task {
        WorkTask::UpdateSkeleton(target) => target.update_skeleton(),
        WorkTask::UpdateSkeletonNormals(target) => target.update_skeleton_normals(),
        WorkTask::LoadImage(texture) => texture.load_data(),
        WorkTask::OcclusionCalc(target) => target.calculate_occlusion(),
        WorkTask::Func(work) => work(),
        WorkTask::Terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::TaskType;

    fn table() -> JobTable {
        JobTable::new(100, 16, 8, false)
    }

    fn noop() -> Payload {
        Payload::Task(WorkTask::Func(Box::new(|| {})))
    }

    #[test]
    fn test_three_independent_jobs() {
        let table = table();
        let handles: Vec<_> = (0..3).map(|_| table.push(noop(), None)).collect();

        assert_eq!(handles[0].index(), 0);
        assert_eq!(handles[1].index(), 1);
        assert_eq!(handles[2].index(), 2);
        for handle in &handles {
            assert_eq!(table.state(handle), JobState::Unclaimed);
        }
        assert_eq!(table.unclaimed_count(), 3);
    }

    #[test]
    fn test_dependent_on_pending_parent_is_blocked() {
        let table = table();
        let parent = table.push(noop(), None);
        let child = table.push(noop(), Some(&parent));

        assert_eq!(table.state(&child), JobState::Blocked);
        assert_eq!(table.dependents(&parent), vec![child.index()]);
        assert_eq!(table.unclaimed_count(), 1);
    }

    #[test]
    fn test_dependent_on_finished_parent_is_unclaimed() {
        let table = table();
        let parent = table.push(noop(), None);
        let claimed = table.try_pop().unwrap();
        table.run_claimed(claimed, 0);
        assert_eq!(table.state(&parent), JobState::Finished);

        let child = table.push(noop(), Some(&parent));
        assert_eq!(table.state(&child), JobState::Unclaimed);
        assert!(table.dependents(&parent).is_empty());
        assert_eq!(table.unclaimed_count(), 1);
    }

    #[test]
    fn test_finish_releases_exactly_its_dependents() {
        let table = table();
        let a = table.push(noop(), None);
        let other = table.push(noop(), None);
        let b = table.push(noop(), Some(&a));
        let c = table.push(noop(), Some(&a));
        let d = table.push(noop(), Some(&other));
        assert_eq!(table.unclaimed_count(), 2);

        let claimed = table.try_pop().unwrap();
        assert_eq!(claimed.index, a.index());
        assert_eq!(table.unclaimed_count(), 1);
        table.run_claimed(claimed, 0);

        assert_eq!(table.state(&b), JobState::Unclaimed);
        assert_eq!(table.state(&c), JobState::Unclaimed);
        assert_eq!(table.state(&d), JobState::Blocked);
        assert_eq!(table.unclaimed_count(), 3);
    }

    #[test]
    fn test_joined_slot_is_reclaimed() {
        let table = table();
        let first = table.push(noop(), None);
        let index = first.index();
        let claimed = table.try_pop().unwrap();
        table.run_claimed(claimed, 0);
        table.join(first, false);

        let reused = table.push(noop(), None);
        assert_eq!(reused.index(), index);
        assert_eq!(table.state(&reused), JobState::Unclaimed);
    }

    #[test]
    fn test_try_push_reports_full_table() {
        let table = JobTable::new(2, 4, 8, false);
        let _a = table.push(noop(), None);
        let _b = table.push(noop(), None);
        let err = table.try_push(noop(), None).unwrap_err();
        assert!(matches!(err, SchedulerError::TableFull { capacity: 2 }));
    }

    #[test]
    #[should_panic(expected = "Ran out of space for jobs")]
    fn test_push_on_full_table_is_fatal() {
        let table = JobTable::new(1, 4, 8, false);
        let _a = table.push(noop(), None);
        let _b = table.push(noop(), None);
    }

    #[test]
    fn test_dependents_capacity() {
        let table = JobTable::new(8, 2, 8, false);
        let parent = table.push(noop(), None);
        let _b = table.push(noop(), Some(&parent));
        let _c = table.push(noop(), Some(&parent));
        let err = table.try_push(noop(), Some(&parent)).unwrap_err();
        assert!(matches!(err, SchedulerError::DependentsFull { capacity: 2, .. }));
        // The failed submission must not leak a slot.
        assert_eq!(table.live_jobs(), 3);
    }

    #[test]
    fn test_try_pop_skips_termination() {
        let table = table();
        let _stop = table.push(Payload::Task(WorkTask::Terminate), None);
        assert!(table.try_pop().is_none());
        assert_eq!(table.unclaimed_count(), 1);

        let job = table.pop();
        let inner = table.lock_slot(job.index);
        assert_eq!(inner.task_type, TaskType::Terminate);
        assert_eq!(inner.state, JobState::Claimed);
    }

    #[test]
    fn test_terminate_exits_and_panics_continue() {
        let table = table();
        let _stop = table.push(Payload::Task(WorkTask::Terminate), None);
        let job = table.pop();
        assert_eq!(table.run_claimed(job, 0), Flow::Exit);

        let boom = table.push(
            Payload::Task(WorkTask::Func(Box::new(|| panic!("Intentional panic")))),
            None,
        );
        let job = table.try_pop().unwrap();
        assert_eq!(table.run_claimed(job, 0), Flow::Continue);
        assert_eq!(table.state(&boom), JobState::Finished);
    }
}
