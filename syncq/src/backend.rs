//! The job store boundary.
//!
//! The [`Backend`] is the single source of truth for job state. The queue only ever holds a
//! transient view of the jobs it loaded and writes every transition back through this trait.
//!
//! Implementations must guarantee:
//!
//! - at most one live (`pending`, `running` or `soft_failed`) job per target,
//! - [`Backend::mark_running`] succeeds for exactly one caller per attempt,
//! - terminal jobs are never modified by [`Backend::save`],
//! - a save from a superseded attempt is rejected.
//!
//! The [`test_suite!`](crate::test_suite) macro checks these properties against an
//! implementation.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    job::{Job, JobClass, JobError, JobId, JobState},
    pruner::PruneSpec,
};

pub mod memory;
mod queryable;
#[doc(hidden)]
pub mod testing;

/// Durable storage for jobs.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Inserts a new `pending` job.
    ///
    /// Fails with [`BackendError::Duplicate`] if a live job already exists for the same target.
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError>;
    async fn load(&self, id: JobId) -> Result<Job, BackendError>;
    /// All jobs waiting to run, that is `pending` and `soft_failed` ones, ordered by id.
    async fn load_pending(&self) -> Result<Vec<Job>, BackendError>;
    /// Atomically moves a `pending` job to `running`, incrementing its attempt counter.
    ///
    /// Fails with [`BackendError::AlreadyRunning`] if another dispatcher got there first.
    async fn mark_running(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, BackendError>;
    /// Persists the job's mutable fields.
    ///
    /// The write only applies if the stored job is not terminal and has the same attempt counter
    /// as `job`.
    async fn save(&self, job: &Job) -> Result<(), BackendError>;
    /// Returns every job `running` since at or before `started_before` to `pending`.
    ///
    /// This does not count as a failure of the job.
    async fn requeue_running(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, BackendError>;
    /// Deletes the jobs selected by the pruner, returning how many were removed.
    async fn prune(&self, spec: &PruneSpec, now: DateTime<Utc>) -> Result<u64, BackendError>;
    /// Jobs matching the query, ordered by id.
    async fn query<'a>(&self, query: Query<'a>) -> Result<Vec<Job>, BackendError>;
}

/// A job as submitted, before the store assigns it an id.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueuableJob {
    pub kind: String,
    pub target: String,
    pub class: JobClass,
    pub payload: serde_json::Value,
    pub mutating: bool,
    pub next_eligible_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl EnqueuableJob {
    pub fn into_job(self, id: JobId) -> Job {
        Job {
            id,
            kind: self.kind,
            target: self.target,
            class: self.class,
            payload: self.payload,
            mutating: self.mutating,
            state: JobState::Pending,
            fail_count: 0,
            attempt: 0,
            next_eligible_at: self.next_eligible_at,
            created_at: self.created_at,
            updated_at: self.created_at,
            started_at: None,
            finished_at: None,
            result: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("A live job {existing} already exists for target '{target}'")]
    Duplicate { existing: JobId, target: String },
    #[error("{0} is already running")]
    AlreadyRunning(JobId),
    #[error("{id} cannot be started while {state}")]
    NotReady { id: JobId, state: JobState },
    #[error("{0} not found")]
    JobNotFound(JobId),
    #[error("{0} has finished and can no longer be modified")]
    Immutable(JobId),
    #[error("{id} was started again since attempt {attempt}")]
    Stale { id: JobId, attempt: u32 },
    #[error("Error encoding or decoding data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("Invalid job record")]
    InvalidJob(#[from] JobError),
    #[error("System in bad state")]
    BadState,
    #[error("Job store failure: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl BackendError {
    /// Whether retrying the same operation might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_) | Self::BadState)
    }
}

/// A filter over stored jobs.
#[derive(Debug, Clone, PartialEq)]
pub enum Query<'a> {
    Not(Box<Query<'a>>),
    And(Vec<Query<'a>>),
    Or(Vec<Query<'a>>),
    IdEquals(JobId),
    StateEqual(JobState),
    KindEqual(&'a str),
    TargetEqual(&'a str),
    ClassEqual(JobClass),
}
