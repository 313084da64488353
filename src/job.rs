//! Job definitions.
//!
//! A job is whatever sits in a table slot: a payload that runs exactly once,
//! a lifecycle [`JobState`] and the bookkeeping that ties it to a parent and
//! to its dependents. Payloads come in two flavours: typed user jobs
//! implementing [`Execute`], and the closed set of built-in [`WorkTask`]s.

use crate::assets::texture::TextureResource;
use std::fmt;
use std::sync::Arc;

/// Lifecycle of a job table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum JobState {
    /// Free slot.
    #[default]
    Dead,
    /// Waiting for its parent to finish.
    Blocked,
    /// Eligible to be claimed by a worker.
    Unclaimed,
    /// Being executed by exactly one thread.
    Claimed,
    /// `execute()` returned; waiting for the producer to join.
    Finished,
    /// Retired by the producer; reclaimed by the next submission.
    Joined,
}

impl JobState {
    pub fn name(self) -> &'static str {
        match self {
            JobState::Dead => "DEAD",
            JobState::Blocked => "BLOCKED",
            JobState::Unclaimed => "UNCLAIMED",
            JobState::Claimed => "CLAIMED",
            JobState::Finished => "FINISHED",
            JobState::Joined => "JOINED",
        }
    }

    /// True once a dependent submitted against this state would start unclaimed.
    pub fn is_settled(self) -> bool {
        matches!(self, JobState::Finished | JobState::Joined | JobState::Dead)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Debug tag describing what kind of payload a slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TaskType {
    #[default]
    None,
    User,
    Func,
    Terminate,
    Fence,
    UpdateSkeleton,
    UpdateSkeletonNormals,
    LoadImage,
    OcclusionCalc,
}

impl TaskType {
    pub fn name(self) -> &'static str {
        match self {
            TaskType::None => "none",
            TaskType::User => "user",
            TaskType::Func => "func",
            TaskType::Terminate => "terminate",
            TaskType::Fence => "fence",
            TaskType::UpdateSkeleton => "update_skeleton",
            TaskType::UpdateSkeletonNormals => "update_skeleton_normals",
            TaskType::LoadImage => "load_image",
            TaskType::OcclusionCalc => "occlusion_calc",
        }
    }
}

/// Identifies one submitted job.
///
/// A handle is not `Clone`: joining consumes it, so a retired job can never be
/// joined or used as a parent again. The generation guards against a slot that
/// was reclaimed behind the handle's back.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct JobHandle {
    pub(crate) slot: SlotRef,
}

impl JobHandle {
    pub(crate) fn new(index: usize, generation: u32) -> Self {
        JobHandle {
            slot: SlotRef { index, generation },
        }
    }

    /// Index of the job's slot in the table.
    pub fn index(&self) -> usize {
        self.slot.index
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.slot.index)
    }
}

/// Copyable internal reference to a slot at a given generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SlotRef {
    pub(crate) index: usize,
    pub(crate) generation: u32,
}

/// A typed unit of work submitted through [`JobSystem::submit`](crate::JobSystem::submit).
pub trait Execute: Send + 'static {
    /// Runs the job. Called exactly once, by whichever thread claims it.
    fn execute(self: Box<Self>);

    /// Name used for execution traces.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Skeleton owner that can be refreshed off the main thread.
pub trait SkeletonTarget: Send + Sync {
    fn update_skeleton(&self);
    fn update_skeleton_normals(&self);
}

/// Object whose occlusion can be computed off the main thread.
pub trait OcclusionTarget: Send + Sync {
    fn calculate_occlusion(&self);
}

/// The closed set of built-in job kinds.
pub enum WorkTask {
    UpdateSkeleton(Arc<dyn SkeletonTarget>),
    UpdateSkeletonNormals(Arc<dyn SkeletonTarget>),
    LoadImage(Arc<TextureResource>),
    OcclusionCalc(Arc<dyn OcclusionTarget>),
    /// Stops the worker that claims it. Submitted by `kill_workers`.
    Terminate,
    Func(Box<dyn FnOnce() + Send + 'static>),
}

impl WorkTask {
    pub fn task_type(&self) -> TaskType {
        match self {
            WorkTask::UpdateSkeleton(_) => TaskType::UpdateSkeleton,
            WorkTask::UpdateSkeletonNormals(_) => TaskType::UpdateSkeletonNormals,
            WorkTask::LoadImage(_) => TaskType::LoadImage,
            WorkTask::OcclusionCalc(_) => TaskType::OcclusionCalc,
            WorkTask::Terminate => TaskType::Terminate,
            WorkTask::Func(_) => TaskType::Func,
        }
    }
}

impl fmt::Debug for WorkTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WorkTask").field(&self.task_type()).finish()
    }
}

/// What a slot actually stores.
pub(crate) enum Payload {
    Task(WorkTask),
    User(Box<dyn Execute>),
    /// Joins every handle, helping while it waits.
    Fence(Vec<JobHandle>),
}

impl Payload {
    pub(crate) fn task_type(&self) -> TaskType {
        match self {
            Payload::Task(task) => task.task_type(),
            Payload::User(_) => TaskType::User,
            Payload::Fence(_) => TaskType::Fence,
        }
    }

    pub(crate) fn trace_name(&self) -> &'static str {
        match self {
            Payload::User(job) => job.name(),
            other => other.task_type().name(),
        }
    }
}

/// Whether the executing thread should keep looping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Exit,
}
