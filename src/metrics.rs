//! Optional scheduler counters, compiled in with the `metrics` feature.

#[cfg(feature = "metrics")]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "metrics")]
use std::time::Instant;

/// Running totals kept by the job table.
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct Metrics {
    /// Jobs accepted by push.
    pub jobs_submitted: AtomicU64,
    /// Jobs that reached FINISHED.
    pub jobs_completed: AtomicU64,
    /// BLOCKED jobs released by a parent's finish.
    pub dependents_unblocked: AtomicU64,
    /// Jobs executed by a joining thread while it waited.
    pub help_executions: AtomicU64,
    /// Joins that ended up sleeping on a slot condvar.
    pub blocking_joins: AtomicU64,
    /// `try_join` calls that found the job unfinished.
    pub try_join_misses: AtomicU64,
    pub start_time: Instant,
}

#[cfg(feature = "metrics")]
impl Metrics {
    pub fn new() -> Self {
        Self {
            jobs_submitted: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            dependents_unblocked: AtomicU64::new(0),
            help_executions: AtomicU64::new(0),
            blocking_joins: AtomicU64::new(0),
            try_join_misses: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            dependents_unblocked: self.dependents_unblocked.load(Ordering::Relaxed),
            help_executions: self.help_executions.load(Ordering::Relaxed),
            blocking_joins: self.blocking_joins.load(Ordering::Relaxed),
            try_join_misses: self.try_join_misses.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(feature = "metrics")]
impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`Metrics`].
#[cfg(feature = "metrics")]
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub dependents_unblocked: u64,
    pub help_executions: u64,
    pub blocking_joins: u64,
    pub try_join_misses: u64,
    pub elapsed_seconds: f64,
}

#[cfg(feature = "metrics")]
impl MetricsSnapshot {
    pub fn jobs_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.jobs_completed as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    /// Jobs submitted but not finished at snapshot time.
    pub fn in_flight(&self) -> i64 {
        self.jobs_submitted as i64 - self.jobs_completed as i64
    }
}
