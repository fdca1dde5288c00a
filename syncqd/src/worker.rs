use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use syncq::{
    job::Job,
    token::Token,
    worker::{ExecutionResult, Worker},
};
use tracing::instrument;

/// Pushes a job to the provider API as `POST {api_url}/{kind}`.
///
/// The `Idempotency-Key` header carries the job id and attempt so the provider can recognise a
/// job replayed after a crash.
#[derive(Debug, Clone)]
pub struct HttpWorker {
    client: reqwest::Client,
    api_url: String,
}

impl HttpWorker {
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("syncqd/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.into(),
        })
    }

    fn endpoint(&self, kind: &str) -> String {
        format!("{}/{kind}", self.api_url.trim_end_matches('/'))
    }
}

/// Maps a provider response status onto how the queue should treat the job.
pub fn classify(status: StatusCode) -> ExecutionResult {
    match status {
        status if status.is_success() => ExecutionResult::Success,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ExecutionResult::credential(status.to_string())
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            ExecutionResult::transient(status.to_string())
        }
        status if status.is_server_error() => ExecutionResult::transient(status.to_string()),
        status => ExecutionResult::permanent(status.to_string()),
    }
}

fn classify_error(error: reqwest::Error) -> ExecutionResult {
    if error.is_builder() {
        ExecutionResult::permanent(error.to_string())
    } else if error.is_timeout() {
        ExecutionResult::transient("request timed out")
    } else {
        ExecutionResult::transient(error.to_string())
    }
}

#[async_trait]
impl Worker for HttpWorker {
    #[instrument(skip_all, fields(job_id = %job.id, kind = %job.kind, attempt = job.attempt))]
    async fn execute(&self, job: &Job, token: &Token) -> ExecutionResult {
        let body = json!({
            "id": i64::from(job.id),
            "attempt": job.attempt,
            "target": job.target,
            "payload": job.payload,
        });
        let response = self
            .client
            .post(self.endpoint(&job.kind))
            .bearer_auth(token.value())
            .header("Idempotency-Key", format!("{}-{}", i64::from(job.id), job.attempt))
            .json(&body)
            .send()
            .await;

        match response {
            Ok(response) => {
                let result = classify(response.status());
                if result != ExecutionResult::Success {
                    tracing::debug!(status = %response.status(), "Provider refused job");
                }
                result
            }
            Err(error) => {
                tracing::debug!(?error, "Request to provider failed");
                classify_error(error)
            }
        }
    }
}
