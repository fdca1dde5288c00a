use chrono::{DateTime, Utc};
use sqlx::prelude::FromRow;
use syncq::{backend::BackendError, job::JobId};

pub(crate) fn to_millis(timestamp: DateTime<Utc>) -> i64 {
    timestamp.timestamp_millis()
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, BackendError> {
    DateTime::from_timestamp_millis(millis).ok_or(BackendError::BadState)
}

#[derive(Debug, FromRow)]
pub(crate) struct Job {
    pub id: i64,
    pub kind: String,
    pub target: String,
    pub class: String,
    pub payload: String,
    pub mutating: bool,
    pub state: String,
    pub fail_count: i64,
    pub attempt: i64,
    pub next_eligible_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub result: Option<String>,
}

impl TryFrom<Job> for syncq::job::Job {
    type Error = BackendError;

    fn try_from(value: Job) -> Result<Self, Self::Error> {
        Ok(Self {
            id: JobId::from(value.id),
            kind: value.kind,
            target: value.target,
            class: value.class.parse()?,
            payload: serde_json::from_str(&value.payload)?,
            mutating: value.mutating,
            state: value.state.parse()?,
            fail_count: u16::try_from(value.fail_count).map_err(|_| BackendError::BadState)?,
            attempt: u32::try_from(value.attempt).map_err(|_| BackendError::BadState)?,
            next_eligible_at: from_millis(value.next_eligible_at)?,
            created_at: from_millis(value.created_at)?,
            updated_at: from_millis(value.updated_at)?,
            started_at: value.started_at.map(from_millis).transpose()?,
            finished_at: value.finished_at.map(from_millis).transpose()?,
            result: value.result,
        })
    }
}
