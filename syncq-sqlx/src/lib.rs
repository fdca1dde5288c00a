//! A durable [`Backend`] for `syncq`, storing jobs in SQLite.
//!
//! Jobs survive a restart of the daemon. At most one live job per target is enforced by a partial
//! unique index, so the duplicate check holds even if two processes share the database file.
use std::{ops::Deref, str::FromStr};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use syncq::{
    backend::{Backend, BackendError, EnqueuableJob, Query},
    job::{Job, JobId, JobState},
    pruner::PruneSpec,
};
use tracing::instrument;

macro_rules! job_columns {
    () => {
        "id, kind, target, class, payload, mutating, state, fail_count, attempt, \
        next_eligible_at, created_at, updated_at, started_at, finished_at, result"
    };
}

mod query;
mod types;

use query::{prune_query, ToQuery};
use types::to_millis;

fn store_error(error: sqlx::Error) -> BackendError {
    BackendError::Store(Box::new(error))
}

#[derive(Clone, Debug)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl Deref for SqliteBackend {
    type Target = SqlitePool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

/// Wraps a pool whose database has already been migrated.
impl From<SqlitePool> for SqliteBackend {
    fn from(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

impl SqliteBackend {
    /// Wraps `pool`, bringing its schema up to date first.
    pub async fn new(pool: SqlitePool) -> Result<Self, BackendError> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|error| BackendError::Store(Box::new(error)))?;
        Ok(Self { pool })
    }

    /// Opens, creating it if needed, the database at `url`.
    pub async fn connect(url: &str) -> Result<Self, BackendError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(store_error)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(store_error)?;
        Self::new(pool).await
    }

    /// A private in-memory database, mostly useful for tests.
    pub async fn in_memory() -> Result<Self, BackendError> {
        // Every connection to `:memory:` is a separate database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(store_error)?;
        Self::new(pool).await
    }

    async fn load_job(&self, id: JobId) -> Result<Option<Job>, BackendError> {
        sqlx::query_as::<_, types::Job>(concat!(
            "SELECT ",
            job_columns!(),
            " FROM syncq_jobs WHERE id = ?"
        ))
        .bind(i64::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?
        .map(Job::try_from)
        .transpose()
    }

    async fn live_job_for(&self, target: &str) -> Result<Option<JobId>, BackendError> {
        let id: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM syncq_jobs
            WHERE target = ? AND state IN ('pending', 'running', 'soft_failed')
            LIMIT 1",
        )
        .bind(target)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(id.map(JobId::from))
    }

    fn duplicate(existing: JobId, target: String) -> BackendError {
        BackendError::Duplicate { existing, target }
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    #[instrument(skip(self, job), fields(kind = %job.kind, target = %job.target))]
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError> {
        if let Some(existing) = self.live_job_for(&job.target).await? {
            return Err(Self::duplicate(existing, job.target));
        }
        let inserted = sqlx::query_scalar::<_, i64>(
            "INSERT INTO syncq_jobs (
                kind, target, class, payload, mutating, state,
                next_eligible_at, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, 'pending', ?, ?, ?)
            RETURNING id",
        )
        .bind(&job.kind)
        .bind(&job.target)
        .bind(job.class.as_str())
        .bind(serde_json::to_string(&job.payload)?)
        .bind(job.mutating)
        .bind(to_millis(job.next_eligible_at))
        .bind(to_millis(job.created_at))
        .bind(to_millis(job.created_at))
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(id) => Ok(JobId::from(id)),
            // Another writer enqueued for the same target since the check above.
            Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                match self.live_job_for(&job.target).await? {
                    Some(existing) => Err(Self::duplicate(existing, job.target)),
                    None => Err(BackendError::BadState),
                }
            }
            Err(error) => Err(store_error(error)),
        }
    }

    async fn load(&self, id: JobId) -> Result<Job, BackendError> {
        self.load_job(id).await?.ok_or(BackendError::JobNotFound(id))
    }

    async fn load_pending(&self) -> Result<Vec<Job>, BackendError> {
        self.query(Query::Or(vec![
            Query::StateEqual(JobState::Pending),
            Query::StateEqual(JobState::SoftFailed),
        ]))
        .await
    }

    #[instrument(skip(self))]
    async fn mark_running(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, BackendError> {
        let updated = sqlx::query_as::<_, types::Job>(concat!(
            "UPDATE syncq_jobs
            SET state = 'running', attempt = attempt + 1, started_at = ?, updated_at = ?
            WHERE id = ? AND state = 'pending'
            RETURNING ",
            job_columns!()
        ))
        .bind(to_millis(now))
        .bind(to_millis(now))
        .bind(i64::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        if let Some(job) = updated {
            return job.try_into();
        }
        match self.load_job(id).await? {
            None => Err(BackendError::JobNotFound(id)),
            Some(job) if job.state == JobState::Running => Err(BackendError::AlreadyRunning(id)),
            Some(job) => Err(BackendError::NotReady {
                id,
                state: job.state,
            }),
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, state = %job.state))]
    async fn save(&self, job: &Job) -> Result<(), BackendError> {
        let result = sqlx::query(
            "UPDATE syncq_jobs
            SET state = ?, payload = ?, mutating = ?, fail_count = ?, next_eligible_at = ?,
                updated_at = ?, started_at = ?, finished_at = ?, result = ?
            WHERE id = ? AND attempt = ? AND state NOT IN ('done', 'hard_failed')",
        )
        .bind(job.state.as_str())
        .bind(serde_json::to_string(&job.payload)?)
        .bind(job.mutating)
        .bind(i64::from(job.fail_count))
        .bind(to_millis(job.next_eligible_at))
        .bind(to_millis(job.updated_at))
        .bind(job.started_at.map(to_millis))
        .bind(job.finished_at.map(to_millis))
        .bind(job.result.as_deref())
        .bind(i64::from(job.id))
        .bind(i64::from(job.attempt))
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        match self.load_job(job.id).await? {
            None => Err(BackendError::JobNotFound(job.id)),
            Some(stored) if stored.state.is_terminal() => Err(BackendError::Immutable(job.id)),
            Some(_) => Err(BackendError::Stale {
                id: job.id,
                attempt: job.attempt,
            }),
        }
    }

    #[instrument(skip(self))]
    async fn requeue_running(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, BackendError> {
        let mut ids: Vec<i64> = sqlx::query_scalar(
            "UPDATE syncq_jobs
            SET state = 'pending', next_eligible_at = ?, updated_at = ?
            WHERE state = 'running' AND (started_at IS NULL OR started_at <= ?)
            RETURNING id",
        )
        .bind(to_millis(now))
        .bind(to_millis(now))
        .bind(to_millis(started_before))
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;
        ids.sort();
        Ok(ids.into_iter().map(JobId::from).collect())
    }

    #[instrument(skip(self))]
    async fn prune(&self, spec: &PruneSpec, now: DateTime<Utc>) -> Result<u64, BackendError> {
        let result = prune_query(spec, now)
            .build()
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(result.rows_affected())
    }

    async fn query<'a>(&self, query: Query<'a>) -> Result<Vec<Job>, BackendError> {
        query
            .query()
            .build_query_as::<types::Job>()
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?
            .into_iter()
            .map(Job::try_from)
            .collect()
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use syncq::{
        job::JobClass,
        testing::{mock_job, queue_with_defaults},
        QueueError,
    };

    use super::*;

    syncq::test_suite!(for: SqliteBackend::in_memory().await.unwrap());

    #[tokio::test]
    async fn payload_round_trips() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        let job = EnqueuableJob {
            payload: serde_json::json!({ "mail": "jdoe@example.org", "groups": ["staff"] }),
            ..mock_job("jdoe").with_class(JobClass::Immediate).non_mutating()
        };

        let id = backend.enqueue(job.clone()).await.unwrap();

        assert_eq!(backend.load(id).await.unwrap(), job.into_job(id));
    }

    #[tokio::test]
    async fn unique_index_rejects_second_live_job() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        backend.enqueue(mock_job("jdoe")).await.unwrap();

        let inserted = sqlx::query(
            "INSERT INTO syncq_jobs (kind, target, class, next_eligible_at, created_at, updated_at)
            VALUES ('user.update', 'jdoe', 'normal', 0, 0, 0)",
        )
        .execute(&*backend)
        .await;

        assert_matches!(inserted, Err(sqlx::Error::Database(error)) if error.is_unique_violation());
    }

    #[tokio::test]
    async fn queue_reports_duplicates() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        let queue = queue_with_defaults(backend);

        let id = queue.enqueue(mock_job("jdoe")).await.unwrap();

        assert_matches!(
            queue.enqueue(mock_job("jdoe")).await,
            Err(QueueError::Duplicate { existing }) if existing == id
        );
    }

    #[tokio::test]
    async fn jobs_survive_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("jobs.db").display());

        let backend = SqliteBackend::connect(&url).await.unwrap();
        let id = backend.enqueue(mock_job("jdoe")).await.unwrap();
        backend.mark_running(id, Utc::now()).await.unwrap();
        backend.close().await;

        let reopened = SqliteBackend::connect(&url).await.unwrap();
        let requeued = reopened
            .requeue_running(Utc::now(), Utc::now())
            .await
            .unwrap();

        assert_eq!(requeued, vec![id]);
        assert_eq!(reopened.load(id).await.unwrap().state, JobState::Pending);
        reopened.close().await;
    }
}
