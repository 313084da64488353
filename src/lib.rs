//! # framejobs - Bounded Job Board for a 3D Game Client
//!
//! A small, fixed pool of worker threads draining a fixed-capacity job table.
//! The game's main thread submits per-frame work (model normals, sprite
//! animation, asset loads), optionally chained through parent/dependent
//! edges, and joins the handles before it consumes the results.
//!
//! ## Architecture
//!
//! - **Job Table**: a fixed array of slots, each with its own mutex and
//!   condvar, plus a shared "unclaimed" counter that workers sleep on
//! - **Scheduler**: push, pop and finish; finishing a job releases every job
//!   that was blocked on it
//! - **Join protocol**: blocking join, helping join (the caller executes
//!   pending jobs while it waits) and non-blocking `try_join`
//! - **Workers**: OS threads looping pop → execute → finish until they claim
//!   a termination job
//! - **Producers**: [`assets::model`], [`sprite`] and [`assets::texture`]
//!   split their work into range slices and submit them as jobs
//!
//! ## Example
//!
//! ```no_run
//! use framejobs::JobSystem;
//!
//! let jobs = JobSystem::new(4); // 4 worker threads
//!
//! let first = jobs.submit_fn(|| println!("runs first"));
//! let second = jobs.submit_dependent_fn(&first, || println!("runs after first"));
//!
//! jobs.join(second, true);
//! jobs.join(first, true);
//! jobs.kill_workers();
//! ```

pub mod assets;
pub mod error;
pub mod job;
pub mod job_system;
mod join;
pub mod metrics;
mod scheduler;
pub mod slice;
pub mod sprite;
pub mod table;
pub mod tracing;
pub mod worker;

use serde::{Deserialize, Serialize};

/// Strategy for pinning worker threads to CPU cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinningStrategy {
    /// No pinning (standard OS scheduling).
    #[default]
    None,
    /// Linear pinning (worker i -> logical processor i).
    Linear,
    /// Pin to even-numbered logical processors, avoiding SMT siblings.
    AvoidSMT,
}

pub use error::SchedulerError;
pub use job::{Execute, JobHandle, JobState, OcclusionTarget, SkeletonTarget, TaskType, WorkTask};
pub use job_system::{JobSystem, SchedulerConfig};
