//! The boundary to the code that performs a job against the remote API.
//!
//! Execution is at-least-once: a job that was running when the process died is requeued and
//! executed again. A [`Worker`] must therefore be safe to re-run, or use [`Job::id`] together
//! with [`Job::attempt`] as a fencing token to detect a repeated execution itself.
use std::sync::Arc;

use async_trait::async_trait;
use fxhash::FxHashMap;

use crate::{job::Job, token::Token};

/// The outcome of executing a job once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    Success,
    /// Timeouts, rate limiting and other failures that may succeed later. The job is retried
    /// according to the retry policy.
    TransientFailure { reason: String },
    /// The job can never succeed as submitted. It is hard-failed without retries.
    PermanentFailure { reason: String },
    /// The remote API rejected the access token. The token is dropped from the cache and the job
    /// is retried like a transient failure.
    CredentialFailure { reason: String },
}

impl ExecutionResult {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::TransientFailure {
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::PermanentFailure {
            reason: reason.into(),
        }
    }

    pub fn credential(reason: impl Into<String>) -> Self {
        Self::CredentialFailure {
            reason: reason.into(),
        }
    }
}

/// Executes jobs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Worker: Send + Sync {
    async fn execute(&self, job: &Job, token: &Token) -> ExecutionResult;
}

/// Routes each job to the worker registered for its kind.
///
/// A job of an unknown kind fails permanently unless a fallback worker is set.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: FxHashMap<String, Arc<dyn Worker>>,
    fallback: Option<Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker(mut self, kind: impl Into<String>, worker: Arc<dyn Worker>) -> Self {
        self.workers.insert(kind.into(), worker);
        self
    }

    pub fn with_fallback(mut self, worker: Arc<dyn Worker>) -> Self {
        self.fallback = Some(worker);
        self
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.workers.keys().map(String::as_str)
    }
}

#[async_trait]
impl Worker for WorkerRegistry {
    async fn execute(&self, job: &Job, token: &Token) -> ExecutionResult {
        match self.workers.get(&job.kind).or(self.fallback.as_ref()) {
            Some(worker) => worker.execute(job, token).await,
            None => {
                tracing::warn!(job_id = %job.id, kind = %job.kind, "No worker for job kind {}", job.kind);
                ExecutionResult::permanent(format!("no worker registered for kind '{}'", job.kind))
            }
        }
    }
}
