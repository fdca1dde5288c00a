use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    backend::{Backend, EnqueuableJob},
    job::{JobClass, JobId},
    queue::Queue,
    QueueError,
};

/// Builds a job for submission to a [`Queue`].
///
/// Jobs are mutating and of class [`JobClass::Normal`] unless configured otherwise.
///
/// ```
/// # use syncq::prelude::*;
/// let job = JobBuilder::new("user.update", "jdoe")
///     .with_class(JobClass::Immediate)
///     .with_payload(serde_json::json!({ "mail": "jdoe@example.org" }))
///     .build();
/// assert!(job.mutating);
/// ```
#[derive(Debug, Clone)]
pub struct JobBuilder {
    kind: String,
    target: String,
    class: JobClass,
    payload: serde_json::Value,
    mutating: bool,
    scheduled_at: Option<DateTime<Utc>>,
}

impl JobBuilder {
    pub fn new(kind: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            target: target.into(),
            class: JobClass::Normal,
            payload: serde_json::Value::Null,
            mutating: true,
            scheduled_at: None,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn with_class(self, class: JobClass) -> Self {
        Self { class, ..self }
    }

    pub fn with_payload(self, payload: serde_json::Value) -> Self {
        Self { payload, ..self }
    }

    /// Marks the job as read-only with respect to the remote system.
    ///
    /// Non-mutating jobs still run when the queue is in read-only mode.
    pub fn non_mutating(self) -> Self {
        Self {
            mutating: false,
            ..self
        }
    }

    pub fn schedule_at(self, schedule_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at: Some(schedule_at),
            ..self
        }
    }

    pub fn schedule_in(self, schedule_in: TimeDelta) -> Self {
        Self {
            scheduled_at: Some(
                Utc::now()
                    .checked_add_signed(schedule_in)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            ),
            ..self
        }
    }

    pub fn build(self) -> EnqueuableJob {
        let now = Utc::now();
        EnqueuableJob {
            kind: self.kind,
            target: self.target,
            class: self.class,
            payload: self.payload,
            mutating: self.mutating,
            next_eligible_at: self.scheduled_at.unwrap_or(now),
            created_at: now,
        }
    }

    pub async fn enqueue_to<B>(self, queue: &Queue<B>) -> Result<JobId, QueueError>
    where
        B: Backend + 'static,
    {
        queue.enqueue(self.build()).await
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::{
        backend::{memory::InMemoryBackend, Backend},
        job::JobState,
        testing::queue_with_defaults,
    };

    use super::*;

    #[test]
    fn defaults() {
        let job = JobBuilder::new("group.sync", "staff").build();

        assert_eq!(job.kind, "group.sync");
        assert_eq!(job.target, "staff");
        assert_eq!(job.class, JobClass::Normal);
        assert!(job.mutating);
        assert_eq!(job.next_eligible_at, job.created_at);
    }

    #[test]
    fn schedule_in_delays_eligibility() {
        let job = JobBuilder::new("group.sync", "staff")
            .schedule_in(TimeDelta::minutes(10))
            .build();

        assert!(job.next_eligible_at > job.created_at + TimeDelta::minutes(9));
    }

    #[tokio::test]
    async fn enqueue_to_queue() {
        let backend = InMemoryBackend::new();
        let queue = queue_with_defaults(backend.clone());

        let id = JobBuilder::new("report.accounts", "accounts")
            .with_class(JobClass::Offline)
            .non_mutating()
            .enqueue_to(&queue)
            .await
            .unwrap();

        let job = backend.load(id).await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.class, JobClass::Offline);
        assert!(!job.mutating);

        let result = JobBuilder::new("report.accounts", "accounts")
            .enqueue_to(&queue)
            .await;
        assert_matches!(result, Err(QueueError::Duplicate { existing }) if existing == id);
    }
}
