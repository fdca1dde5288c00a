//! The job model: identifiers, pacing classes, and the validated state machine.
use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryDecision;

pub mod builder;
pub(crate) mod runner;

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Clone, Copy, Serialize, Deserialize)]
pub struct JobId(i64);

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<JobId> for i64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// The pacing class of a job.
///
/// Each class has its own minimum spacing between two dispatches, see
/// [`crate::config::QueueConfig::delay_for`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobClass {
    /// Paced by the global minimum delay only.
    Immediate,
    Normal,
    /// Bulk or reporting work that can wait.
    Offline,
}

impl JobClass {
    pub const ALL: [JobClass; 3] = [JobClass::Immediate, JobClass::Normal, JobClass::Offline];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Normal => "normal",
            Self::Offline => "offline",
        }
    }
}

impl Display for JobClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobClass {
    type Err = JobError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "immediate" => Ok(Self::Immediate),
            "normal" => Ok(Self::Normal),
            "offline" => Ok(Self::Offline),
            other => Err(JobError::UnknownClass(other.to_owned())),
        }
    }
}

/// The lifecycle state of a job.
///
/// The legal transitions are:
///
/// ```text
/// pending -> running -> done | soft_failed | hard_failed
/// soft_failed -> pending
/// running -> pending (crash recovery and forced shutdown only)
/// ```
///
/// `done` and `hard_failed` are terminal.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    SoftFailed,
    HardFailed,
    Done,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::SoftFailed => "soft_failed",
            Self::HardFailed => "hard_failed",
            Self::Done => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::HardFailed)
    }

    /// Jobs in these states make up the backlog.
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Pending | Self::SoftFailed)
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Done)
                | (Running, SoftFailed)
                | (Running, HardFailed)
                | (Running, Pending)
                | (SoftFailed, Pending)
        )
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = JobError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "soft_failed" => Ok(Self::SoftFailed),
            "hard_failed" => Ok(Self::HardFailed),
            "done" => Ok(Self::Done),
            other => Err(JobError::UnknownState(other.to_owned())),
        }
    }
}

/// A unit of synchronisation work as recorded in the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Selects the worker, e.g. `user.create`.
    pub kind: String,
    /// The logical remote object the job acts on. At most one live job exists per target.
    pub target: String,
    pub class: JobClass,
    pub payload: serde_json::Value,
    /// Whether running the job changes remote state.
    pub mutating: bool,
    pub state: JobState,
    pub fail_count: u16,
    /// Incremented each time the job is marked running. Together with the id it forms a fencing
    /// token for workers that need to detect re-execution after a requeue.
    pub attempt: u32,
    pub next_eligible_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Result or failure annotation of the last attempt.
    pub result: Option<String>,
}

impl Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "job '{}' {} for '{}', {} ({} soft failures)",
            self.kind, self.id, self.target, self.state, self.fail_count
        )
    }
}

impl Job {
    /// Moves the job to `next`, rejecting transitions the state machine does not allow.
    pub fn transition(&mut self, next: JobState, now: DateTime<Utc>) -> Result<(), JobError> {
        if !self.state.can_transition_to(next) {
            return Err(JobError::IllegalTransition {
                id: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub(crate) fn mark_running(&mut self, now: DateTime<Utc>) -> Result<(), JobError> {
        self.transition(JobState::Running, now)?;
        self.attempt += 1;
        self.started_at = Some(now);
        Ok(())
    }

    pub(crate) fn mark_done(
        &mut self,
        now: DateTime<Utc>,
        annotation: Option<String>,
    ) -> Result<(), JobError> {
        self.transition(JobState::Done, now)?;
        self.finished_at = Some(now);
        self.result = annotation;
        Ok(())
    }

    pub(crate) fn mark_hard_failed(
        &mut self,
        now: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Result<(), JobError> {
        self.transition(JobState::HardFailed, now)?;
        self.finished_at = Some(now);
        self.result = Some(reason.into());
        Ok(())
    }

    pub(crate) fn apply_retry(
        &mut self,
        decision: RetryDecision,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), JobError> {
        match decision {
            RetryDecision::Retry {
                fail_count,
                retry_at,
            } => {
                self.transition(JobState::SoftFailed, now)?;
                self.fail_count = fail_count;
                self.next_eligible_at = retry_at;
                self.result = Some(reason.to_owned());
            }
            RetryDecision::GiveUp { fail_count } => {
                self.mark_hard_failed(now, format!("{reason} [softfail threshold reached]"))?;
                self.fail_count = fail_count;
            }
        }
        Ok(())
    }

    /// A soft-failed job whose backoff has elapsed goes back to pending.
    pub(crate) fn rearm(&mut self, now: DateTime<Utc>) -> Result<(), JobError> {
        self.transition(JobState::Pending, now)
    }

    /// A running job whose execution was lost goes back to pending without counting a failure.
    pub(crate) fn requeue(&mut self, now: DateTime<Utc>) -> Result<(), JobError> {
        self.transition(JobState::Pending, now)?;
        self.next_eligible_at = now;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Illegal transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },
    #[error("Unknown job state '{0}'")]
    UnknownState(String),
    #[error("Unknown job class '{0}'")]
    UnknownClass(String),
    #[error("Invalid job payload")]
    Decode(#[from] serde_json::Error),
}

#[cfg(test)]
pub(crate) mod test {
    use assert_matches::assert_matches;
    use chrono::TimeDelta;

    use super::*;

    impl Job {
        pub(crate) fn raw_job() -> Self {
            let now = Utc::now();
            Self {
                id: JobId(1),
                kind: "user.update".to_owned(),
                target: "jdoe".to_owned(),
                class: JobClass::Normal,
                payload: serde_json::Value::Null,
                mutating: true,
                state: JobState::Pending,
                fail_count: 0,
                attempt: 0,
                next_eligible_at: now,
                created_at: now,
                updated_at: now,
                started_at: None,
                finished_at: None,
                result: None,
            }
        }

        pub(crate) fn with_id(self, id: i64) -> Self {
            Self {
                id: JobId(id),
                ..self
            }
        }

        pub(crate) fn with_state(self, state: JobState) -> Self {
            Self { state, ..self }
        }

        pub(crate) fn with_class(self, class: JobClass) -> Self {
            Self { class, ..self }
        }

        pub(crate) fn with_fail_count(self, fail_count: u16) -> Self {
            Self { fail_count, ..self }
        }

        pub(crate) fn with_created_at(self, created_at: DateTime<Utc>) -> Self {
            Self { created_at, ..self }
        }

        pub(crate) fn with_next_eligible_at(self, next_eligible_at: DateTime<Utc>) -> Self {
            Self {
                next_eligible_at,
                ..self
            }
        }
    }

    #[test]
    fn state_round_trips_through_str() {
        for state in [
            JobState::Pending,
            JobState::Running,
            JobState::SoftFailed,
            JobState::HardFailed,
            JobState::Done,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert_matches!("idle".parse::<JobState>(), Err(JobError::UnknownState(_)));
    }

    #[test]
    fn terminal_states_reject_every_transition() {
        let now = Utc::now();
        for terminal in [JobState::Done, JobState::HardFailed] {
            for next in [
                JobState::Pending,
                JobState::Running,
                JobState::SoftFailed,
                JobState::HardFailed,
                JobState::Done,
            ] {
                let mut job = Job::raw_job().with_state(terminal);
                assert_matches!(
                    job.transition(next, now),
                    Err(JobError::IllegalTransition { .. })
                );
                assert_eq!(job.state, terminal);
            }
        }
    }

    #[test]
    fn pending_cannot_skip_running() {
        let mut job = Job::raw_job();
        assert!(job.mark_done(Utc::now(), None).is_err());
        assert!(job.mark_hard_failed(Utc::now(), "boom").is_err());
        assert_eq!(job.state, JobState::Pending);
    }

    #[test]
    fn mark_running_increments_attempt() {
        let now = Utc::now();
        let mut job = Job::raw_job();

        job.mark_running(now).unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.attempt, 1);
        assert_eq!(job.started_at, Some(now));

        job.requeue(now).unwrap();
        job.mark_running(now).unwrap();
        assert_eq!(job.attempt, 2);
    }

    #[test]
    fn apply_retry_soft_fails_then_gives_up() {
        let now = Utc::now();
        let retry_at = now + TimeDelta::minutes(5);
        let mut job = Job::raw_job().with_state(JobState::Running);

        job.apply_retry(
            RetryDecision::Retry {
                fail_count: 1,
                retry_at,
            },
            now,
            "timeout",
        )
        .unwrap();
        assert_eq!(job.state, JobState::SoftFailed);
        assert_eq!(job.fail_count, 1);
        assert_eq!(job.next_eligible_at, retry_at);

        job.rearm(now).unwrap();
        job.mark_running(now).unwrap();
        job.apply_retry(RetryDecision::GiveUp { fail_count: 2 }, now, "timeout")
            .unwrap();
        assert_eq!(job.state, JobState::HardFailed);
        assert_eq!(job.fail_count, 2);
        assert_eq!(
            job.result.as_deref(),
            Some("timeout [softfail threshold reached]")
        );
        assert_eq!(job.finished_at, Some(now));
    }
}
