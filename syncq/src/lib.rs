//! A paced, persistent job queue with a soft-failure retry engine.
//!
//! Jobs describe a change to push to a remote directory. They are stored by a [`Backend`],
//! dispatched at a rate the remote API tolerates by the [`queue::Queue`], executed by a
//! [`worker::Worker`] with an access token from the [`token::TokenManager`], and retried with a
//! growing delay when they fail transiently.
//!
//! [`Syncq`] runs a queue in the background, executing up to
//! [`config::QueueConfig::concurrency`] jobs at the same time, and shuts it down gracefully.
use std::sync::{Arc, Mutex};

use fxhash::FxHashSet;
use thiserror::Error;
use tokio::{
    sync::Semaphore,
    task::{JoinError, JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;

pub mod backend;
pub mod backoff;
pub mod config;
mod cron_runner;
mod error_window;
pub mod events;
pub mod job;
pub mod pacer;
pub mod prelude;
pub mod pruner;
pub mod queue;
pub mod retry;
pub mod testing;
pub mod token;
pub mod worker;

use backend::{Backend, BackendError};
use cron_runner::CronRunner;
use job::{builder::JobBuilder, JobError, JobId};
use pruner::{runner::PrunerRunner, PrunerConfig};
use queue::{Outcome, Queue};

/// Runs a [`Queue`] in the background.
///
/// # Example
///
/// ```no_run
/// # use std::{str::FromStr, sync::Arc};
/// # use syncq::prelude::*;
/// # use syncq::testing::{ScriptedWorker, StaticTokenProvider, token_manager};
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// use syncq::backend::memory::InMemoryBackend;
///
/// let queue = Queue::new(
///     InMemoryBackend::new(),
///     Arc::new(ScriptedWorker::default()),
///     token_manager(Arc::new(StaticTokenProvider::new("token"))),
///     QueueConfig::default(),
/// );
///
/// let syncq = Syncq::new(queue)
///     .with_job_pruner(PrunerConfig::with_defaults(cron::Schedule::from_str("0 0 3 * * *")?))
///     .start()
///     .await?;
///
/// // Wait for a shutdown request.
/// let report = syncq.graceful_shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct Syncq<B: Backend> {
    queue: Arc<Queue<B>>,
    cancellation_token: CancellationToken,
    handle: Option<JoinHandle<(ShutdownReport, Option<QueueError>)>>,
}

/// What a graceful shutdown had to do.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Jobs that finished while the runner was draining.
    pub drained: usize,
    /// Jobs still executing when the grace period ran out, put back in the queue.
    pub requeued: Vec<JobId>,
}

impl<B> Syncq<B>
where
    B: Backend + 'static,
{
    pub fn new(queue: Queue<B>) -> Self {
        Self {
            queue: Arc::new(queue),
            cancellation_token: Default::default(),
            handle: None,
        }
    }

    pub fn queue(&self) -> &Arc<Queue<B>> {
        &self.queue
    }

    /// Removes old terminal jobs on the schedule given by `config`.
    pub fn with_job_pruner(self, config: PrunerConfig) -> Self {
        PrunerRunner::new(self.queue.clone(), config).spawn(self.cancellation_token.clone());
        self
    }

    /// Enqueues the job built by `builder` every time `schedule` fires.
    ///
    /// A firing while the previous job is still queued is skipped.
    pub fn with_cron_job(self, schedule: cron::Schedule, builder: JobBuilder) -> Self {
        CronRunner::new(self.queue.clone(), schedule, builder)
            .spawn(self.cancellation_token.clone());
        self
    }

    /// Requeues jobs left running by a previous process, then starts dispatching.
    pub async fn start(mut self) -> Result<Self, QueueError> {
        self.queue.recover().await?;
        let queue = self.queue.clone();
        let cancellation_token = self.cancellation_token.clone();
        self.handle = Some(tokio::spawn(dispatch_loop(queue, cancellation_token)));
        tracing::info!(
            concurrency = self.queue.config().concurrency,
            "Started job queue runner"
        );
        Ok(self)
    }

    /// Cancelled when a shutdown has been requested or the runner stopped on a fatal error.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Stops dispatching, waits up to the configured grace period for running jobs, then aborts
    /// and requeues whatever is still running.
    ///
    /// Returns the fatal error that stopped the runner, if any.
    pub async fn graceful_shutdown(mut self) -> Result<ShutdownReport, QueueError> {
        tracing::debug!("Shutting down job queue runner");
        self.cancellation_token.cancel();
        let Some(handle) = self.handle.take() else {
            return Ok(ShutdownReport::default());
        };
        let (report, fatal) = handle
            .await
            .map_err(|_| QueueError::GracefulShutdownFailed)?;
        match fatal {
            Some(error) => Err(error),
            None => Ok(report),
        }
    }
}

type InFlight = Arc<Mutex<FxHashSet<JobId>>>;

async fn dispatch_loop<B>(
    queue: Arc<Queue<B>>,
    cancellation_token: CancellationToken,
) -> (ShutdownReport, Option<QueueError>)
where
    B: Backend + 'static,
{
    let config = queue.config().clone();
    let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let in_flight: InFlight = Default::default();
    let mut tasks = JoinSet::new();
    let stats_interval = config.stats_interval.max(std::time::Duration::from_millis(1));
    let poll_interval = config.poll_interval.max(std::time::Duration::from_millis(1));
    let mut stats =
        tokio::time::interval_at(tokio::time::Instant::now() + stats_interval, stats_interval);
    let mut fatal = None;

    while fatal.is_none() {
        tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => break,
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                fatal = fatal_error(joined);
            }
            _ = stats.tick() => queue.log_statistics(),
            permit = permits.clone().acquire_owned() => {
                let Ok(permit) = permit else { break };
                match queue.dispatch().await {
                    Ok(Some(job)) => {
                        let queue = queue.clone();
                        let in_flight = in_flight.clone();
                        if let Ok(mut ids) = in_flight.lock() {
                            ids.insert(job.id);
                        }
                        tasks.spawn(async move {
                            let job_id = job.id;
                            let result = queue.execute(job).await;
                            if let Ok(mut ids) = in_flight.lock() {
                                ids.remove(&job_id);
                            }
                            drop(permit);
                            result
                        });
                    }
                    Ok(None) => {
                        drop(permit);
                        tokio::select! {
                            _ = cancellation_token.cancelled() => {}
                            _ = tokio::time::sleep(poll_interval) => {}
                        }
                    }
                    Err(error) if error.is_fatal() => fatal = Some(error),
                    Err(error) => {
                        drop(permit);
                        tracing::error!(?error, "Failed to dispatch job: {error}");
                        tokio::select! {
                            _ = cancellation_token.cancelled() => {}
                            _ = tokio::time::sleep(poll_interval) => {}
                        }
                    }
                }
            }
        }
    }

    if let Some(error) = &fatal {
        tracing::error!(?error, "Stopping job queue runner: {error}");
        cancellation_token.cancel();
    }

    let mut report = ShutdownReport::default();
    let drain = async {
        while let Some(joined) = tasks.join_next().await {
            report.drained += 1;
            if let Some(error) = fatal_error(joined) {
                fatal.get_or_insert(error);
            }
        }
    };
    if tokio::time::timeout(config.shutdown_grace, drain).await.is_err() {
        tracing::warn!(
            running = tasks.len(),
            "Shutdown grace period elapsed, aborting {} running jobs",
            tasks.len()
        );
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    let unfinished: Vec<JobId> = in_flight
        .lock()
        .map(|ids| {
            let mut ids: Vec<_> = ids.iter().copied().collect();
            ids.sort();
            ids
        })
        .unwrap_or_default();
    if !unfinished.is_empty() {
        match queue.requeue(&unfinished).await {
            Ok(requeued) => report.requeued = requeued,
            Err(error) => {
                tracing::error!(?error, "Failed to requeue interrupted jobs: {error}");
                fatal.get_or_insert(error);
            }
        }
    }

    queue.log_statistics();
    tracing::debug!(?report, "Job queue runner stopped");
    (report, fatal)
}

fn fatal_error(joined: Result<Result<Outcome, QueueError>, JoinError>) -> Option<QueueError> {
    match joined {
        Ok(Ok(outcome)) => {
            tracing::trace!(?outcome, "Job {} finished", outcome.job_id());
            None
        }
        Ok(Err(error)) if error.is_fatal() => Some(error),
        Ok(Err(error)) => {
            tracing::error!(?error, "Failed to execute job: {error}");
            None
        }
        Err(error) => {
            tracing::error!(?error, "Job task failed: {error}");
            None
        }
    }
}

/// A condition under which the queue must stop rather than carry on.
#[derive(Debug, Error)]
pub enum FatalCondition {
    #[error("{failures} credential failures within the error window")]
    CredentialCeiling { failures: usize },
    #[error("job store unavailable while persisting {job_id}")]
    StoreUnavailable {
        job_id: JobId,
        #[source]
        source: BackendError,
    },
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// A job for the same target is already waiting or running.
    #[error("A job for this target is already queued: {existing}")]
    Duplicate { existing: JobId },
    #[error("Error communicating with the backend")]
    Backend(#[source] BackendError),
    #[error("Invalid job")]
    Job(#[from] JobError),
    #[error("Fatal error: {0}")]
    Fatal(FatalCondition),
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
}

impl QueueError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

impl From<BackendError> for QueueError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::Duplicate { existing, .. } => Self::Duplicate { existing },
            error => Self::Backend(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use chrono::TimeDelta;

    use crate::{
        backend::memory::InMemoryBackend,
        config::QueueConfig,
        job::JobState,
        testing::{mock_job, queue_with, token_manager, ScriptedWorker, StaticTokenProvider},
        token::CredentialError,
        worker::ExecutionResult,
    };

    use super::*;

    fn config() -> QueueConfig {
        QueueConfig::default()
            .with_delays(TimeDelta::zero(), TimeDelta::zero(), TimeDelta::zero())
            .with_poll_interval(Duration::from_millis(10))
            .with_concurrency(2)
    }

    async fn wait_for<B: Backend>(backend: &B, ids: &[JobId], state: JobState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let mut all = true;
                for id in ids {
                    all &= backend.load(*id).await.unwrap().state == state;
                }
                if all {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn runs_jobs_to_completion() {
        let backend = InMemoryBackend::new();
        let worker = Arc::new(ScriptedWorker::default());
        let queue = queue_with(backend.clone(), worker.clone(), config());
        let mut ids = Vec::new();
        for target in ["a", "b", "c"] {
            ids.push(queue.enqueue(mock_job(target)).await.unwrap());
        }

        let syncq = Syncq::new(queue).start().await.unwrap();
        wait_for(&backend, &ids, JobState::Done).await;
        let report = syncq.graceful_shutdown().await.unwrap();

        assert!(report.requeued.is_empty());
        let mut executed = worker.executed();
        executed.sort();
        assert_eq!(executed, ids);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let backend = InMemoryBackend::new();
        let worker = Arc::new(ScriptedWorker::default().with_delay(Duration::from_millis(50)));
        let queue = queue_with(backend.clone(), worker.clone(), config());
        let mut ids = Vec::new();
        for target in ["a", "b", "c", "d", "e", "f"] {
            ids.push(queue.enqueue(mock_job(target)).await.unwrap());
        }

        let syncq = Syncq::new(queue).start().await.unwrap();
        wait_for(&backend, &ids, JobState::Done).await;
        syncq.graceful_shutdown().await.unwrap();

        assert_eq!(worker.max_running(), 2);
    }

    #[tokio::test]
    async fn shutdown_requeues_hung_jobs() {
        let backend = InMemoryBackend::new();
        let worker = Arc::new(ScriptedWorker::default().with_delay(Duration::from_secs(3600)));
        let queue = queue_with(
            backend.clone(),
            worker,
            config().with_shutdown_grace(Duration::from_millis(50)),
        );
        let id = queue.enqueue(mock_job("jdoe")).await.unwrap();

        let syncq = Syncq::new(queue).start().await.unwrap();
        wait_for(&backend, &[id], JobState::Running).await;
        let report = syncq.graceful_shutdown().await.unwrap();

        assert_eq!(report.requeued, vec![id]);
        let job = backend.load(id).await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.fail_count, 0);
    }

    #[tokio::test]
    async fn shutdown_waits_for_running_jobs() {
        let backend = InMemoryBackend::new();
        let worker = Arc::new(ScriptedWorker::default().with_delay(Duration::from_millis(100)));
        let queue = queue_with(backend.clone(), worker, config());
        let id = queue.enqueue(mock_job("jdoe")).await.unwrap();

        let syncq = Syncq::new(queue).start().await.unwrap();
        wait_for(&backend, &[id], JobState::Running).await;
        let report = syncq.graceful_shutdown().await.unwrap();

        assert_eq!(report.drained, 1);
        assert_eq!(backend.load(id).await.unwrap().state, JobState::Done);
    }

    #[tokio::test]
    async fn start_recovers_running_jobs() {
        let backend = InMemoryBackend::new();
        let queue = queue_with(
            backend.clone(),
            Arc::new(ScriptedWorker::default()),
            config(),
        );
        let id = queue.enqueue(mock_job("jdoe")).await.unwrap();
        backend.mark_running(id, chrono::Utc::now()).await.unwrap();

        let syncq = Syncq::new(queue).start().await.unwrap();
        wait_for(&backend, &[id], JobState::Done).await;
        syncq.graceful_shutdown().await.unwrap();

        assert_eq!(backend.load(id).await.unwrap().attempt, 2);
    }

    #[tokio::test]
    async fn fatal_error_stops_runner() {
        let backend = InMemoryBackend::new();
        let provider = Arc::new(StaticTokenProvider::failing(CredentialError::Rejected(
            "invalid_client".to_owned(),
        )));
        let queue = Queue::new(
            backend.clone(),
            Arc::new(ScriptedWorker::default()),
            token_manager(provider),
            config().with_error_ceilings(TimeDelta::hours(1), 1, 0),
        );
        let id = queue.enqueue(mock_job("jdoe")).await.unwrap();

        let syncq = Syncq::new(queue).start().await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            syncq.cancellation_token().cancelled(),
        )
        .await
        .unwrap();

        assert_matches!(
            syncq.graceful_shutdown().await,
            Err(QueueError::Fatal(FatalCondition::CredentialCeiling { failures: 1 }))
        );
        assert_eq!(backend.load(id).await.unwrap().state, JobState::SoftFailed);
    }

    #[test]
    fn duplicate_backend_error_maps_to_duplicate() {
        let error = QueueError::from(BackendError::Duplicate {
            existing: JobId::from(7),
            target: "jdoe".to_owned(),
        });

        assert_matches!(error, QueueError::Duplicate { existing } if existing == JobId::from(7));
    }
}
