//! The job queue engine.
//!
//! [`Queue`] ties the pieces together: it asks the [`Pacer`] for the next job, executes it with a
//! token from the [`TokenManager`], feeds the outcome through the [`RetryPolicy`] and writes every
//! transition back to the [`Backend`].
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use chrono::{DateTime, Utc};
use fxhash::FxHashMap;
use tracing::instrument;

use crate::{
    backend::{Backend, BackendError, EnqueuableJob},
    backoff::{Backoff, Curve, Jitter},
    config::QueueConfig,
    error_window::ErrorWindow,
    events::{EventSink, QueueEvent, TracingSink},
    job::{runner::JobRunner, Job, JobClass, JobId, JobState},
    pacer::Pacer,
    pruner::PruneSpec,
    retry::{RetryDecision, RetryPolicy},
    token::TokenManager,
    worker::{ExecutionResult, Worker},
    FatalCondition, QueueError,
};

const READ_ONLY_ANNOTATION: &str = "skipped: read-only mode";

/// What happened to a dispatched job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done { job_id: JobId },
    /// Not executed because the queue is read-only.
    Skipped { job_id: JobId },
    SoftFailed {
        job_id: JobId,
        fail_count: u16,
        retry_at: DateTime<Utc>,
    },
    HardFailed { job_id: JobId, reason: String },
}

impl Outcome {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Done { job_id }
            | Self::Skipped { job_id }
            | Self::SoftFailed { job_id, .. }
            | Self::HardFailed { job_id, .. } => *job_id,
        }
    }
}

#[derive(Debug, Default)]
struct Statistics {
    handled: Mutex<FxHashMap<JobClass, u64>>,
    transient_errors: AtomicU64,
}

impl Statistics {
    fn job_handled(&self, class: JobClass) {
        if let Ok(mut handled) = self.handled.lock() {
            *handled.entry(class).or_default() += 1;
        }
    }

    fn take(&self) -> QueueEvent {
        let handled = self
            .handled
            .lock()
            .map(|mut handled| std::mem::take(&mut *handled))
            .unwrap_or_default();
        QueueEvent::Statistics {
            handled: JobClass::ALL
                .into_iter()
                .map(|class| (class, handled.get(&class).copied().unwrap_or_default()))
                .collect(),
            transient_errors: self.transient_errors.swap(0, Ordering::Relaxed),
        }
    }
}

enum Failure {
    Transient(String),
    Credential(String),
}

pub struct Queue<B> {
    backend: B,
    runner: JobRunner,
    tokens: Arc<TokenManager>,
    config: QueueConfig,
    retry: RetryPolicy,
    store_retry: Backoff,
    pacer: tokio::sync::Mutex<Pacer>,
    errors: Mutex<ErrorWindow>,
    stats: Statistics,
    events: Arc<dyn EventSink>,
}

impl<B> Queue<B>
where
    B: Backend,
{
    pub fn new(
        backend: B,
        worker: Arc<dyn Worker>,
        tokens: Arc<TokenManager>,
        config: QueueConfig,
    ) -> Self {
        Self {
            backend,
            runner: JobRunner::new(worker, config.job_timeout),
            tokens,
            retry: RetryPolicy::new(config.softfail_delay, config.softfail_threshold),
            store_retry: Backoff::exponential(config.store_retry_base)
                .clamped(config.store_retry_base * 32)
                .with_jitter(Jitter::Proportional(0.1)),
            pacer: tokio::sync::Mutex::new(Pacer::new(&config)),
            errors: Mutex::new(ErrorWindow::new(
                config.error_window,
                config.credential_error_ceiling,
                config.transient_error_ceiling,
            )),
            stats: Default::default(),
            events: Arc::new(TracingSink),
            config,
        }
    }

    pub fn with_events(self, events: Arc<dyn EventSink>) -> Self {
        Self { events, ..self }
    }

    pub fn with_retry_policy(self, retry: RetryPolicy) -> Self {
        Self { retry, ..self }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Submits a new job.
    ///
    /// Fails with [`QueueError::Duplicate`] while another job for the same target is waiting or
    /// running.
    pub async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, QueueError> {
        let kind = job.kind.clone();
        let target = job.target.clone();
        match self.backend.enqueue(job).await {
            Ok(job_id) => {
                tracing::info!(%job_id, %kind, %target, "Enqueued {kind} {job_id} for '{target}'");
                Ok(job_id)
            }
            Err(BackendError::Duplicate { existing, .. }) => {
                tracing::debug!(%existing, %kind, %target, "Rejected duplicate {kind} for '{target}'");
                Err(QueueError::Duplicate { existing })
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Puts every job left running by a previous process back in the queue.
    ///
    /// Must be called before dispatching starts.
    pub async fn recover(&self) -> Result<Vec<JobId>, QueueError> {
        let now = Utc::now();
        let job_ids = self.backend.requeue_running(now, now).await?;
        if !job_ids.is_empty() {
            tracing::warn!(
                count = job_ids.len(),
                "Requeued {} jobs interrupted by a restart",
                job_ids.len()
            );
            self.events.emit(QueueEvent::Requeued {
                job_ids: job_ids.clone(),
            });
        }
        Ok(job_ids)
    }

    /// Selects the next job and marks it running.
    ///
    /// Selection and marking happen under a single lock so that two concurrent dispatches can
    /// never pick the same job or both pass the same pacing check. Returns `None` when no job is
    /// ready. Never waits for a job to become ready.
    pub async fn dispatch(&self) -> Result<Option<Job>, QueueError> {
        let mut pacer = self.pacer.lock().await;
        let now = Utc::now();

        let mut candidates = self.backend.load_pending().await?;
        for job in candidates
            .iter_mut()
            .filter(|job| job.state == JobState::SoftFailed && job.next_eligible_at <= now)
        {
            job.rearm(now).map_err(BackendError::from)?;
            self.persist(job).await?;
            tracing::debug!(job_id = %job.id, "Re-armed soft failed job {}", job.id);
        }

        if let Some(event) = pacer.observe_backlog(candidates.len()) {
            self.events.emit(event);
        }

        let Some(job_id) = pacer.next_ready_job(&candidates, now).map(|job| job.id) else {
            return Ok(None);
        };

        match self.backend.mark_running(job_id, now).await {
            Ok(job) => {
                pacer.record_dispatch(job.class, now);
                tracing::debug!(%job_id, class = %job.class, "Dispatched {job}");
                Ok(Some(job))
            }
            Err(error @ (BackendError::AlreadyRunning(_) | BackendError::NotReady { .. })) => {
                tracing::debug!(%job_id, ?error, "Job taken by another dispatcher: {error}");
                Ok(None)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Executes a job returned by [`Queue::dispatch`] and records its outcome.
    #[instrument(skip_all, fields(job_id = %job.id))]
    pub async fn execute(&self, mut job: Job) -> Result<Outcome, QueueError> {
        self.stats.job_handled(job.class);

        if self.config.read_only && job.mutating {
            job.mark_done(Utc::now(), Some(READ_ONLY_ANNOTATION.to_owned()))
                .map_err(BackendError::from)?;
            self.persist(&job).await?;
            tracing::info!(job_id = %job.id, "Skipped {job}: read-only mode");
            self.events.emit(QueueEvent::Skipped {
                job_id: job.id,
                kind: job.kind.clone(),
                target: job.target.clone(),
            });
            return Ok(Outcome::Skipped { job_id: job.id });
        }

        let token = match self.tokens.get_token().await {
            Ok(token) => token,
            Err(error) => {
                return self
                    .fail(job, Failure::Credential(format!("no access token: {error}")))
                    .await
            }
        };

        match self.runner.run(&job, token.clone()).await {
            ExecutionResult::Success => {
                job.mark_done(Utc::now(), None).map_err(BackendError::from)?;
                self.persist(&job).await?;
                tracing::info!(job_id = %job.id, "Completed {job}");
                Ok(Outcome::Done { job_id: job.id })
            }
            ExecutionResult::TransientFailure { reason } => {
                self.fail(job, Failure::Transient(reason)).await
            }
            ExecutionResult::CredentialFailure { reason } => {
                self.tokens.invalidate(&token);
                self.fail(job, Failure::Credential(reason)).await
            }
            ExecutionResult::PermanentFailure { reason } => {
                job.mark_hard_failed(Utc::now(), reason.clone())
                    .map_err(BackendError::from)?;
                self.persist(&job).await?;
                self.hard_failed(&job, reason.clone());
                Ok(Outcome::HardFailed {
                    job_id: job.id,
                    reason,
                })
            }
        }
    }

    /// Dispatches and executes at most one job.
    pub async fn run_once(&self) -> Result<Option<Outcome>, QueueError> {
        match self.dispatch().await? {
            Some(job) => self.execute(job).await.map(Some),
            None => Ok(None),
        }
    }

    /// Returns the given running jobs to `pending` without counting a failure.
    ///
    /// Used for jobs still executing when a shutdown gives up waiting on them.
    pub async fn requeue(&self, job_ids: &[JobId]) -> Result<Vec<JobId>, QueueError> {
        let now = Utc::now();
        let mut requeued = Vec::with_capacity(job_ids.len());
        for job_id in job_ids {
            let mut job = self.backend.load(*job_id).await?;
            if job.state != JobState::Running {
                continue;
            }
            job.requeue(now).map_err(BackendError::from)?;
            self.persist(&job).await?;
            tracing::warn!(%job_id, "Requeued interrupted {job}");
            requeued.push(*job_id);
        }
        Ok(requeued)
    }

    pub async fn prune(&self, spec: &PruneSpec) -> Result<u64, QueueError> {
        Ok(self.backend.prune(spec, Utc::now()).await?)
    }

    /// Emits the statistics gathered since the last call and resets them.
    pub fn log_statistics(&self) {
        self.events.emit(self.stats.take());
    }

    async fn fail(&self, mut job: Job, failure: Failure) -> Result<Outcome, QueueError> {
        let now = Utc::now();
        self.stats.transient_errors.fetch_add(1, Ordering::Relaxed);

        let (reason, fatal) = match failure {
            Failure::Transient(reason) => {
                if let Some(event) = self.record_error(now, ErrorWindow::transient_failure) {
                    self.events.emit(event);
                }
                (reason, None)
            }
            Failure::Credential(reason) => {
                let fatal = self
                    .record_error(now, ErrorWindow::credential_failure)
                    .map(|event| {
                        let failures = match &event {
                            QueueEvent::CredentialCeiling { failures, .. } => *failures,
                            _ => 0,
                        };
                        self.events.emit(event);
                        QueueError::Fatal(FatalCondition::CredentialCeiling { failures })
                    });
                (reason, fatal)
            }
        };

        let decision = self.retry.decide(&job, now);
        job.apply_retry(decision, now, &reason)
            .map_err(BackendError::from)?;
        self.persist(&job).await?;

        let outcome = match decision {
            RetryDecision::Retry {
                fail_count,
                retry_at,
            } => {
                tracing::warn!(
                    job_id = %job.id,
                    fail_count,
                    %retry_at,
                    "Soft failed {job}, retrying at {retry_at}: {reason}"
                );
                Outcome::SoftFailed {
                    job_id: job.id,
                    fail_count,
                    retry_at,
                }
            }
            RetryDecision::GiveUp { .. } => {
                let reason = job.result.clone().unwrap_or(reason);
                self.hard_failed(&job, reason.clone());
                Outcome::HardFailed {
                    job_id: job.id,
                    reason,
                }
            }
        };

        match fatal {
            Some(error) => Err(error),
            None => Ok(outcome),
        }
    }

    fn record_error(
        &self,
        now: DateTime<Utc>,
        record: fn(&mut ErrorWindow, DateTime<Utc>) -> Option<QueueEvent>,
    ) -> Option<QueueEvent> {
        self.errors
            .lock()
            .ok()
            .and_then(|mut errors| record(&mut errors, now))
    }

    fn hard_failed(&self, job: &Job, reason: String) {
        tracing::error!(job_id = %job.id, "Hard failed {job}: {reason}");
        self.events.emit(QueueEvent::HardFailed {
            job_id: job.id,
            kind: job.kind.clone(),
            target: job.target.clone(),
            reason,
        });
    }

    /// Saves a job, retrying with backoff while the store reports a retryable failure.
    ///
    /// A store that stays unavailable is fatal: carrying on would leave the queue's view of the
    /// job inconsistent with the store.
    async fn persist(&self, job: &Job) -> Result<(), QueueError> {
        let mut failures = 0;
        loop {
            match self.backend.save(job).await {
                Ok(()) => return Ok(()),
                Err(error) if error.is_retryable() => {
                    failures += 1;
                    if failures >= self.config.store_retry_attempts {
                        tracing::error!(job_id = %job.id, ?error, "Giving up persisting {job}: {error}");
                        self.events.emit(QueueEvent::StoreFailure {
                            job_id: job.id,
                            error: error.to_string(),
                        });
                        return Err(QueueError::Fatal(FatalCondition::StoreUnavailable {
                            job_id: job.id,
                            source: error,
                        }));
                    }
                    let delay = self.store_retry.delay(failures);
                    tracing::warn!(job_id = %job.id, ?error, "Failed to persist {job}, retrying in {delay}: {error}");
                    tokio::time::sleep(delay.to_std().unwrap_or_default()).await;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }
}
