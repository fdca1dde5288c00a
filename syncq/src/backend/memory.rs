//! Provides an in memory implementation of [`Backend`].
//!
//! It is a correct, but not optimized, implementation intended for tests and for running the
//! queue without durable storage. Jobs do not survive a restart.
use std::sync::{
    atomic::{AtomicI64, AtomicU32, Ordering},
    Arc, RwLock,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    job::{Job, JobId, JobState},
    pruner::PruneSpec,
};

use super::{queryable::Queryable, Backend, BackendError, EnqueuableJob, Query};

/// An in memory implementation of [`Backend`].
#[derive(Clone, Debug)]
pub struct InMemoryBackend {
    jobs: Arc<RwLock<Vec<Job>>>,
    id_counter: Arc<AtomicI64>,
    failing_saves: Arc<AtomicU32>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self {
            jobs: Default::default(),
            id_counter: Arc::new(AtomicI64::new(1)),
            failing_saves: Default::default(),
        }
    }
}

impl InMemoryBackend {
    /// Creates a new instance of [`InMemoryBackend`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls to [`Backend::save`] fail with a retryable store error.
    ///
    /// Useful to exercise the queue's handling of an unavailable store.
    pub fn fail_next_saves(&self, count: u32) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            })
            .is_ok()
    }

    fn matching_jobs(&self, queryable: &impl Queryable) -> Result<Vec<Job>, BackendError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .map_err(|_| BackendError::BadState)?
            .iter()
            .filter(|job| queryable.matches(job))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.id);
        Ok(jobs)
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError> {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        if let Some(existing) = jobs
            .iter()
            .find(|existing| existing.target == job.target && !existing.state.is_terminal())
        {
            return Err(BackendError::Duplicate {
                existing: existing.id,
                target: job.target,
            });
        }
        let id = JobId::from(self.id_counter.fetch_add(1, Ordering::SeqCst));
        jobs.push(job.into_job(id));
        Ok(id)
    }

    async fn load(&self, id: JobId) -> Result<Job, BackendError> {
        self.jobs
            .read()
            .map_err(|_| BackendError::BadState)?
            .iter()
            .find(|job| job.id == id)
            .cloned()
            .ok_or(BackendError::JobNotFound(id))
    }

    async fn load_pending(&self) -> Result<Vec<Job>, BackendError> {
        self.query(Query::Or(vec![
            Query::StateEqual(JobState::Pending),
            Query::StateEqual(JobState::SoftFailed),
        ]))
        .await
    }

    async fn mark_running(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, BackendError> {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        let job = jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or(BackendError::JobNotFound(id))?;
        match job.state {
            JobState::Pending => {
                job.mark_running(now)?;
                Ok(job.clone())
            }
            JobState::Running => Err(BackendError::AlreadyRunning(id)),
            state => Err(BackendError::NotReady { id, state }),
        }
    }

    async fn save(&self, job: &Job) -> Result<(), BackendError> {
        if self.take_injected_failure() {
            return Err(BackendError::Store("injected save failure".into()));
        }
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        let stored = jobs
            .iter_mut()
            .find(|stored| stored.id == job.id)
            .ok_or(BackendError::JobNotFound(job.id))?;
        if stored.state.is_terminal() {
            return Err(BackendError::Immutable(job.id));
        }
        if stored.attempt != job.attempt {
            return Err(BackendError::Stale {
                id: job.id,
                attempt: job.attempt,
            });
        }
        *stored = job.clone();
        Ok(())
    }

    async fn requeue_running(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, BackendError> {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        let mut requeued = Vec::new();
        for job in jobs.iter_mut().filter(|job| {
            job.state == JobState::Running
                && job.started_at.map_or(true, |started| started <= started_before)
        }) {
            job.requeue(now)?;
            requeued.push(job.id);
        }
        requeued.sort();
        Ok(requeued)
    }

    async fn prune(&self, spec: &PruneSpec, now: DateTime<Utc>) -> Result<u64, BackendError> {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        let before = jobs.len();
        jobs.retain(|job| !spec.matches_at(job, now));
        Ok((before - jobs.len()) as u64)
    }

    async fn query<'a>(&self, query: Query<'a>) -> Result<Vec<Job>, BackendError> {
        self.matching_jobs(&query)
    }
}
