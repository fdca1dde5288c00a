use std::{sync::Arc, time::Duration};

use tokio::task::{AbortHandle, JoinError};
use tracing::{instrument, Instrument};

use crate::{
    job::Job,
    token::Token,
    worker::{ExecutionResult, Worker},
};

/// Runs a single job on its own task so that a panicking worker cannot take the queue down with
/// it, and a hung one is bounded by the timeout.
pub(crate) struct JobRunner {
    worker: Arc<dyn Worker>,
    timeout: Option<Duration>,
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl JobRunner {
    pub(crate) fn new(worker: Arc<dyn Worker>, timeout: Option<Duration>) -> Self {
        Self { worker, timeout }
    }

    #[instrument(skip_all, fields(job_id = %job.id, kind = %job.kind, attempt = job.attempt))]
    pub(crate) async fn run(&self, job: &Job, token: Arc<Token>) -> ExecutionResult {
        let job_id = job.id;
        let worker = self.worker.clone();
        let timeout = self.timeout;
        let job = job.clone();

        tracing::debug!(%job_id, "Executing job {job_id}");
        let handle = tokio::spawn(
            async move {
                let execution = worker.execute(&job, &token);
                match timeout {
                    Some(timeout) => tokio::time::timeout(timeout, execution)
                        .await
                        .unwrap_or_else(|_elapsed| {
                            ExecutionResult::transient(format!(
                                "Job failed to complete within timeout: {timeout:?}"
                            ))
                        }),
                    None => execution.await,
                }
            }
            .in_current_span(),
        );
        // Dropping the runner, for example when a shutdown gives up waiting, stops the worker.
        let _guard = AbortOnDrop(handle.abort_handle());

        match handle.await {
            Ok(result) => result,
            Err(error) => error.into(),
        }
    }
}

impl From<JoinError> for ExecutionResult {
    fn from(value: JoinError) -> Self {
        if value.is_cancelled() {
            return ExecutionResult::transient("job execution was cancelled");
        }
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        ExecutionResult::permanent(format!("worker panicked: {message}"))
    }
}
