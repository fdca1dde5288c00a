//! Helpers for testing.
#![allow(unused)]

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{SubsecRound, TimeDelta, Utc};

use crate::{
    backend::{Backend, EnqueuableJob},
    config::QueueConfig,
    events::{EventSink, QueueEvent},
    job::{Job, JobClass, JobId},
    queue::Queue,
    token::{CredentialError, Credentials, Token, TokenManager, TokenProvider},
    worker::{ExecutionResult, Worker},
};

/// A macro for making assertions about what jobs have been enqueued.
///
/// Assertions can be based on kind, target, class and state.
///
/// # Example
///
/// ```
/// # use syncq::prelude::*;
/// # use syncq::assert_enqueued;
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// use syncq::backend::memory::InMemoryBackend;
/// use syncq::testing::mock_job;
///
/// let backend = InMemoryBackend::new();
/// backend.enqueue(mock_job("jdoe").with_kind("user.create")).await.unwrap();
/// backend
///     .enqueue(mock_job("accounts").with_kind("report.accounts").with_class(JobClass::Offline))
///     .await
///     .unwrap();
///
/// assert_enqueued!(to: backend, with_kind: "user.create", for_target: "jdoe");
///
/// assert_enqueued!(
///     1 job,
///     to: backend,
///     with_class: JobClass::Offline,
///     in_state: JobState::Pending,
/// );
///
/// assert_enqueued!(0 jobs, to: backend, for_target: "asmith");
/// # });
/// ```
#[macro_export]
macro_rules! assert_enqueued {
    (1 job, to: $backend:ident, $($tail:tt)*) => {
        $crate::assert_enqueued!(@internal 1 to: $backend, $($tail)*);
    };
    ($n:literal jobs, to: $backend:ident, $($tail:tt)*) => {
        $crate::assert_enqueued!(@internal $n to: $backend, $($tail)*);
    };
    (to: $backend:ident, $($tail:tt)*) => {{
        use $crate::backend::Query;
        use $crate::backend::Backend;
        let mut queries = Vec::new();
        $crate::assert_enqueued!(@query queries; $($tail)*);
        let jobs = $backend.query(Query::And(queries)).await.unwrap();
        let all_jobs = $backend.query(Query::And(Vec::new())).await.unwrap();
        assert!(
            !jobs.is_empty(),
            "No jobs enqueued {}\n\nAll enqueued jobs:\n{all_jobs:#?}",
            stringify!($($tail)*)
        );
    }};
    (@internal $n:literal to: $backend:ident, $($tail:tt)*) => {{
        use $crate::backend::Query;
        use $crate::backend::Backend;
        let mut queries = Vec::new();
        $crate::assert_enqueued!(@query queries; $($tail)*);
        let jobs = $backend.query(Query::And(queries)).await.unwrap();
        let all_jobs = $backend.query(Query::And(Vec::new())).await.unwrap();
        assert!(
            jobs.len() == $n,
            "Unexpected number of jobs enqueued {},\n\n\
            Expected {} jobs, found {} matching jobs:\n\n\
            Matching jobs:\n\
            {jobs:#?}\n\n\
            All enqueued jobs:\n\
            {all_jobs:#?}",
            stringify!($($tail)*),
            $n,
            jobs.len(),
        );
    }};
    (@query $vec:ident; with_kind: $kind:expr $(, $($tail:tt)*)?) => {
        $vec.push(Query::KindEqual($kind));
        $($crate::assert_enqueued!(@query $vec; $($tail)*))?
    };
    (@query $vec:ident; for_target: $target:expr $(, $($tail:tt)*)?) => {
        $vec.push(Query::TargetEqual($target));
        $($crate::assert_enqueued!(@query $vec; $($tail)*))?
    };
    (@query $vec:ident; with_class: $class:expr $(, $($tail:tt)*)?) => {
        $vec.push(Query::ClassEqual($class));
        $($crate::assert_enqueued!(@query $vec; $($tail)*))?
    };
    (@query $vec:ident; in_state: $state:expr $(, $($tail:tt)*)?) => {
        $vec.push(Query::StateEqual($state));
        $($crate::assert_enqueued!(@query $vec; $($tail)*))?
    };
    (@query $vec:ident;) => {};
}

pub use crate::assert_enqueued;

/// A pending `user.update` job for `target`, eligible now.
///
/// Timestamps are truncated to milliseconds so that they survive a round trip through stores with
/// millisecond precision.
pub fn mock_job(target: &str) -> EnqueuableJob {
    let now = Utc::now().trunc_subsecs(3);
    EnqueuableJob {
        kind: "user.update".to_owned(),
        target: target.to_owned(),
        class: JobClass::Normal,
        payload: serde_json::Value::Null,
        mutating: true,
        next_eligible_at: now,
        created_at: now,
    }
}

impl EnqueuableJob {
    pub fn with_kind(self, kind: &str) -> Self {
        Self {
            kind: kind.to_owned(),
            ..self
        }
    }

    pub fn with_class(self, class: JobClass) -> Self {
        Self { class, ..self }
    }

    pub fn non_mutating(self) -> Self {
        Self {
            mutating: false,
            ..self
        }
    }
}

/// An [`EventSink`] that keeps every event it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<QueueEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<QueueEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: QueueEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// A [`Worker`] returning a scripted sequence of results.
///
/// Once the script is exhausted every job succeeds, or gets the result given to
/// [`ScriptedWorker::always`].
#[derive(Debug, Default)]
pub struct ScriptedWorker {
    script: Mutex<VecDeque<ExecutionResult>>,
    fallback: Option<ExecutionResult>,
    delay: Option<Duration>,
    executed: Mutex<Vec<JobId>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl ScriptedWorker {
    pub fn new(script: impl IntoIterator<Item = ExecutionResult>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn always(result: ExecutionResult) -> Self {
        Self {
            fallback: Some(result),
            ..Default::default()
        }
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..self
        }
    }

    /// Ids of the jobs executed so far, in execution order.
    pub fn executed(&self) -> Vec<JobId> {
        self.executed
            .lock()
            .map(|executed| executed.clone())
            .unwrap_or_default()
    }

    /// The highest number of jobs that were executing at the same time.
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn next_result(&self) -> ExecutionResult {
        self.script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .or_else(|| self.fallback.clone())
            .unwrap_or(ExecutionResult::Success)
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    async fn execute(&self, job: &Job, _token: &Token) -> ExecutionResult {
        if let Ok(mut executed) = self.executed.lock() {
            executed.push(job.id);
        }
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.next_result()
    }
}

/// A [`TokenProvider`] handing out the same token, or the same error, on every refresh.
#[derive(Debug)]
pub struct StaticTokenProvider {
    result: Result<String, CredentialError>,
    delay: Option<Duration>,
    refreshes: AtomicUsize,
}

impl StaticTokenProvider {
    pub fn new(token: &str) -> Self {
        Self {
            result: Ok(token.to_owned()),
            delay: None,
            refreshes: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: CredentialError) -> Self {
        Self {
            result: Err(error),
            delay: None,
            refreshes: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..self
        }
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn refresh(&self, _credentials: &Credentials) -> Result<String, CredentialError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.result.clone()
    }
}

/// A [`TokenManager`] issuing hour-long tokens from `provider`.
pub fn token_manager(provider: Arc<dyn TokenProvider>) -> Arc<TokenManager> {
    Arc::new(TokenManager::new(
        provider,
        Credentials {
            client_id: "syncq-test".to_owned(),
            client_secret: "secret".to_owned(),
        },
        TimeDelta::hours(1),
        TimeDelta::minutes(1),
    ))
}

pub fn queue_with<B: Backend>(
    backend: B,
    worker: Arc<dyn Worker>,
    config: QueueConfig,
) -> Queue<B> {
    Queue::new(
        backend,
        worker,
        token_manager(Arc::new(StaticTokenProvider::new("token"))),
        config,
    )
}

/// A queue whose jobs all succeed, with the default configuration.
pub fn queue_with_defaults<B: Backend>(backend: B) -> Queue<B> {
    queue_with(
        backend,
        Arc::new(ScriptedWorker::default()),
        QueueConfig::default(),
    )
}
