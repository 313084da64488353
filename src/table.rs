//! Fixed-capacity job table and its synchronization primitives.
//!
//! The table is an arena of slots indexed by handle. Each slot carries its own
//! mutex and condition variable; joiners sleep on the slot's condvar. Idle
//! workers sleep on a single shared "unclaimed" counter. A table-wide claim
//! lock serializes slot allocation and the scan-and-claim step.
//!
//! Lock order: claim lock, then the unclaimed counter, then slot locks. A
//! thread holding a slot lock may lock one more slot only when walking from a
//! parent to its dependents (finish) or from a new slot to its parent (push).

use crate::error::{SchedulerError, fatal};
use crate::job::{JobHandle, JobState, Payload, SlotRef, TaskType};
#[cfg(feature = "metrics")]
use crate::metrics::Metrics;
use crossbeam::utils::CachePadded;
use std::sync::{Condvar, Mutex, MutexGuard};

/// Mutable part of a slot, guarded by the slot mutex.
#[derive(Default)]
pub(crate) struct SlotInner {
    pub(crate) state: JobState,
    pub(crate) generation: u32,
    pub(crate) task_type: TaskType,
    pub(crate) payload: Option<Payload>,
    /// Valid only while `state == Blocked`.
    pub(crate) parent: Option<SlotRef>,
    pub(crate) dependents: Vec<usize>,
}

impl SlotInner {
    pub(crate) fn slot_ref(&self, index: usize) -> SlotRef {
        SlotRef {
            index,
            generation: self.generation,
        }
    }
}

pub(crate) struct Slot {
    pub(crate) inner: Mutex<SlotInner>,
    /// Signalled when the job reaches FINISHED.
    pub(crate) done: Condvar,
}

/// The job board shared by producers and workers.
pub struct JobTable {
    slots: Box<[CachePadded<Slot>]>,
    pub(crate) claim_lock: Mutex<()>,
    pub(crate) unclaimed: Mutex<usize>,
    pub(crate) work_available: Condvar,
    pub(crate) max_dependents: usize,
    pub(crate) help_attempts: usize,
    pub(crate) trace_jobs: bool,
    #[cfg(feature = "metrics")]
    pub(crate) metrics: Metrics,
}

impl JobTable {
    pub(crate) fn new(
        capacity: usize,
        max_dependents: usize,
        help_attempts: usize,
        trace_jobs: bool,
    ) -> Self {
        let slots = (0..capacity)
            .map(|_| {
                CachePadded::new(Slot {
                    inner: Mutex::new(SlotInner {
                        dependents: Vec::with_capacity(max_dependents),
                        ..SlotInner::default()
                    }),
                    done: Condvar::new(),
                })
            })
            .collect();

        JobTable {
            slots,
            claim_lock: Mutex::new(()),
            unclaimed: Mutex::new(0),
            work_available: Condvar::new(),
            max_dependents,
            help_attempts,
            trace_jobs,
            #[cfg(feature = "metrics")]
            metrics: Metrics::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn slot(&self, index: usize) -> &Slot {
        &self.slots[index]
    }

    pub(crate) fn slots(&self) -> impl Iterator<Item = (usize, &Slot)> {
        self.slots.iter().enumerate().map(|(i, s)| (i, &**s))
    }

    pub(crate) fn lock_slot(&self, index: usize) -> MutexGuard<'_, SlotInner> {
        lock(&self.slots[index].inner, "job slot")
    }

    /// Locks the slot a handle refers to, failing if it was reclaimed.
    pub(crate) fn lock_owned(&self, slot: SlotRef) -> MutexGuard<'_, SlotInner> {
        let inner = self.lock_slot(slot.index);
        if inner.generation != slot.generation {
            drop(inner);
            fatal(SchedulerError::StaleHandle {
                index: slot.index,
                generation: slot.generation,
            });
        }
        inner
    }

    /// Makes `count` more jobs claimable and wakes sleeping workers.
    pub(crate) fn publish(&self, count: usize) {
        let mut unclaimed = lock(&self.unclaimed, "unclaimed counter");
        *unclaimed += count;
        drop(unclaimed);
        if count == 1 {
            self.work_available.notify_one();
        } else {
            self.work_available.notify_all();
        }
    }

    /// Current state of the job behind `handle`.
    pub fn state(&self, handle: &JobHandle) -> JobState {
        self.lock_owned(handle.slot).state
    }

    /// Slot indices currently blocked on `handle`.
    pub fn dependents(&self, handle: &JobHandle) -> Vec<usize> {
        self.lock_owned(handle.slot).dependents.clone()
    }

    /// Number of jobs published and not yet reserved by a worker.
    pub fn unclaimed_count(&self) -> usize {
        *lock(&self.unclaimed, "unclaimed counter")
    }

    /// Number of slots holding a job that has not been reclaimed.
    pub fn live_jobs(&self) -> usize {
        (0..self.capacity())
            .filter(|&i| !matches!(self.lock_slot(i).state, JobState::Dead | JobState::Joined))
            .count()
    }
}

/// Locks `mutex`, treating poisoning as a fatal synchronization failure.
pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, what: &'static str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(_) => fatal(SchedulerError::Poisoned(what)),
    }
}

/// Waits on `cond`, treating poisoning as a fatal synchronization failure.
pub(crate) fn wait<'a, T>(
    cond: &Condvar,
    guard: MutexGuard<'a, T>,
    what: &'static str,
) -> MutexGuard<'a, T> {
    match cond.wait(guard) {
        Ok(guard) => guard,
        Err(_) => fatal(SchedulerError::Poisoned(what)),
    }
}
