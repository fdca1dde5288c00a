//! Test suite for ensuring a correct implementation of a backend.
use chrono::{SubsecRound, TimeDelta};

use crate::{
    job::JobClass,
    pruner::{KindFilter, PruneSpec},
    retry::RetryDecision,
    testing::mock_job,
};

use super::*;

fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Create test suite for a job store backend.
///
/// For backend implementors, it is useful to include this as part of your test suites.
///
/// # Example
///
/// ```
/// use syncq::test_suite;
/// use syncq::backend::memory::InMemoryBackend;
/// test_suite!(for: InMemoryBackend::new());
/// ```
///
/// If you are using a different async test attribute you can configure the macro to use that
/// instead:
///
/// ```ignore
/// use syncq::test_suite;
/// test_suite!(
///     attr: sqlx::test,
///     args: (pool: SqlitePool),
///     backend: SqliteBackend::from_pool(pool).await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $backend:expr) => {
        $crate::test_suite!(attr: tokio::test, args: (), backend: $backend);
    };
    (attr: $attr:meta, args: $args:tt, backend: $backend:expr) => {
        $crate::test_suite!(@tests attr: $attr, args: $args, backend: $backend, tests: [
            enqueue,
            enqueue_duplicate_target,
            enqueue_duplicate_target_while_running,
            enqueue_duplicate_target_while_soft_failed,
            enqueue_after_terminal,
            load_not_found,
            load_pending,
            mark_running,
            mark_running_twice,
            mark_running_not_found,
            mark_running_not_ready,
            save,
            save_not_found,
            save_terminal,
            save_stale_attempt,
            requeue_running,
            requeue_running_respects_cut_off,
            prune,
            prune_only_kinds,
            query,
        ]);
    };
    (@tests attr: $attr:meta, args: $args:tt, backend: $backend:expr, tests: [$($test:ident),* $(,)?]) => {
        $(
            #[$attr]
            async fn $test $args {
                let backend = $backend;
                $crate::backend::testing::$test(backend).await;
            }
        )*
    };
}

pub async fn enqueue<B: Backend>(backend: B) {
    let job = mock_job("jdoe");

    let id = backend.enqueue(job.clone()).await.unwrap();
    let stored = backend.load(id).await.unwrap();

    assert_eq!(stored, job.into_job(id));
    assert_eq!(stored.state, JobState::Pending);
    assert_eq!(stored.fail_count, 0);
    assert_eq!(stored.attempt, 0);
}

pub async fn enqueue_duplicate_target<B: Backend>(backend: B) {
    let id = backend.enqueue(mock_job("jdoe")).await.unwrap();

    let result = backend
        .enqueue(mock_job("jdoe").with_kind("user.delete"))
        .await;

    match result {
        Err(BackendError::Duplicate { existing, target }) => {
            assert_eq!(existing, id);
            assert_eq!(target, "jdoe");
        }
        other => panic!("expected a duplicate error, got {other:?}"),
    }
    assert_eq!(backend.query(Query::And(vec![])).await.unwrap().len(), 1);
}

pub async fn enqueue_duplicate_target_while_running<B: Backend>(backend: B) {
    let id = backend.enqueue(mock_job("jdoe")).await.unwrap();
    backend.mark_running(id, now()).await.unwrap();

    let result = backend.enqueue(mock_job("jdoe")).await;

    assert!(matches!(result, Err(BackendError::Duplicate { existing, .. }) if existing == id));
}

pub async fn enqueue_duplicate_target_while_soft_failed<B: Backend>(backend: B) {
    let now = now();
    let id = backend.enqueue(mock_job("jdoe")).await.unwrap();
    let mut job = backend.mark_running(id, now).await.unwrap();
    job.apply_retry(
        RetryDecision::Retry {
            fail_count: 1,
            retry_at: now + TimeDelta::minutes(5),
        },
        now,
        "timeout",
    )
    .unwrap();
    backend.save(&job).await.unwrap();

    let result = backend.enqueue(mock_job("jdoe")).await;

    assert!(matches!(result, Err(BackendError::Duplicate { existing, .. }) if existing == id));
}

pub async fn enqueue_after_terminal<B: Backend>(backend: B) {
    let now = now();
    let id = backend.enqueue(mock_job("jdoe")).await.unwrap();
    let mut job = backend.mark_running(id, now).await.unwrap();
    job.mark_done(now, None).unwrap();
    backend.save(&job).await.unwrap();

    let second = backend.enqueue(mock_job("jdoe")).await.unwrap();

    assert_ne!(id, second);
}

pub async fn load_not_found<B: Backend>(backend: B) {
    let result = backend.load(JobId::from(1_000)).await;

    assert!(matches!(result, Err(BackendError::JobNotFound(id)) if id == JobId::from(1_000)));
}

pub async fn load_pending<B: Backend>(backend: B) {
    let now = now();
    let pending = backend.enqueue(mock_job("pending")).await.unwrap();
    let soft_failed = backend.enqueue(mock_job("soft-failed")).await.unwrap();
    let running = backend.enqueue(mock_job("running")).await.unwrap();
    let done = backend.enqueue(mock_job("done")).await.unwrap();

    let mut job = backend.mark_running(soft_failed, now).await.unwrap();
    job.apply_retry(
        RetryDecision::Retry {
            fail_count: 1,
            retry_at: now,
        },
        now,
        "timeout",
    )
    .unwrap();
    backend.save(&job).await.unwrap();

    backend.mark_running(running, now).await.unwrap();

    let mut job = backend.mark_running(done, now).await.unwrap();
    job.mark_done(now, None).unwrap();
    backend.save(&job).await.unwrap();

    let ids: Vec<JobId> = backend
        .load_pending()
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();

    assert_eq!(ids, vec![pending, soft_failed]);
}

pub async fn mark_running<B: Backend>(backend: B) {
    let now = now();
    let id = backend.enqueue(mock_job("jdoe")).await.unwrap();

    let job = backend.mark_running(id, now).await.unwrap();

    assert_eq!(job.state, JobState::Running);
    assert_eq!(job.attempt, 1);
    assert_eq!(job.started_at, Some(now));
    assert_eq!(backend.load(id).await.unwrap(), job);
}

pub async fn mark_running_twice<B: Backend>(backend: B) {
    let id = backend.enqueue(mock_job("jdoe")).await.unwrap();
    backend.mark_running(id, now()).await.unwrap();

    let result = backend.mark_running(id, now()).await;

    assert!(matches!(result, Err(BackendError::AlreadyRunning(running)) if running == id));
    assert_eq!(backend.load(id).await.unwrap().attempt, 1);
}

pub async fn mark_running_not_found<B: Backend>(backend: B) {
    let result = backend.mark_running(JobId::from(1_000), now()).await;

    assert!(matches!(result, Err(BackendError::JobNotFound(_))));
}

pub async fn mark_running_not_ready<B: Backend>(backend: B) {
    let now = now();
    let id = backend.enqueue(mock_job("jdoe")).await.unwrap();
    let mut job = backend.mark_running(id, now).await.unwrap();
    job.mark_hard_failed(now, "rejected").unwrap();
    backend.save(&job).await.unwrap();

    let result = backend.mark_running(id, now).await;

    assert!(matches!(
        result,
        Err(BackendError::NotReady {
            state: JobState::HardFailed,
            ..
        })
    ));
}

pub async fn save<B: Backend>(backend: B) {
    let now = now();
    let retry_at = now + TimeDelta::seconds(300);
    let id = backend.enqueue(mock_job("jdoe")).await.unwrap();
    let mut job = backend.mark_running(id, now).await.unwrap();
    job.apply_retry(
        RetryDecision::Retry {
            fail_count: 1,
            retry_at,
        },
        now,
        "rate limited",
    )
    .unwrap();

    backend.save(&job).await.unwrap();

    let stored = backend.load(id).await.unwrap();
    assert_eq!(stored, job);
    assert_eq!(stored.state, JobState::SoftFailed);
    assert_eq!(stored.next_eligible_at, retry_at);
    assert_eq!(stored.result.as_deref(), Some("rate limited"));
}

pub async fn save_not_found<B: Backend>(backend: B) {
    let job = mock_job("jdoe").into_job(JobId::from(1_000));

    let result = backend.save(&job).await;

    assert!(matches!(result, Err(BackendError::JobNotFound(_))));
}

pub async fn save_terminal<B: Backend>(backend: B) {
    let now = now();
    let id = backend.enqueue(mock_job("jdoe")).await.unwrap();
    let mut job = backend.mark_running(id, now).await.unwrap();
    job.mark_done(now, Some("ok".to_owned())).unwrap();
    backend.save(&job).await.unwrap();

    job.result = Some("changed".to_owned());
    let result = backend.save(&job).await;

    assert!(matches!(result, Err(BackendError::Immutable(_))));
    assert_eq!(backend.load(id).await.unwrap().result.as_deref(), Some("ok"));
}

pub async fn save_stale_attempt<B: Backend>(backend: B) {
    let now = now();
    let id = backend.enqueue(mock_job("jdoe")).await.unwrap();
    let mut stale = backend.mark_running(id, now).await.unwrap();
    backend.requeue_running(now, now).await.unwrap();
    backend.mark_running(id, now).await.unwrap();

    stale.mark_done(now, None).unwrap();
    let result = backend.save(&stale).await;

    assert!(matches!(result, Err(BackendError::Stale { attempt: 1, .. })));
    assert_eq!(backend.load(id).await.unwrap().state, JobState::Running);
}

pub async fn requeue_running<B: Backend>(backend: B) {
    let now = now();
    let running = backend.enqueue(mock_job("running")).await.unwrap();
    let pending = backend.enqueue(mock_job("pending")).await.unwrap();
    backend.mark_running(running, now).await.unwrap();

    let later = now + TimeDelta::seconds(5);
    let requeued = backend.requeue_running(later, later).await.unwrap();

    assert_eq!(requeued, vec![running]);
    let job = backend.load(running).await.unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.fail_count, 0);
    assert_eq!(job.next_eligible_at, later);
    assert_eq!(backend.load(pending).await.unwrap().state, JobState::Pending);
}

pub async fn requeue_running_respects_cut_off<B: Backend>(backend: B) {
    let now = now();
    let old = backend.enqueue(mock_job("old")).await.unwrap();
    let recent = backend.enqueue(mock_job("recent")).await.unwrap();
    backend
        .mark_running(old, now - TimeDelta::hours(2))
        .await
        .unwrap();
    backend.mark_running(recent, now).await.unwrap();

    let requeued = backend
        .requeue_running(now - TimeDelta::hours(1), now)
        .await
        .unwrap();

    assert_eq!(requeued, vec![old]);
    assert_eq!(backend.load(recent).await.unwrap().state, JobState::Running);
}

async fn finish<B: Backend>(backend: &B, job: EnqueuableJob, state: JobState, at: DateTime<Utc>) {
    let id = backend.enqueue(job).await.unwrap();
    let mut job = backend.mark_running(id, at).await.unwrap();
    match state {
        JobState::Done => job.mark_done(at, None).unwrap(),
        _ => job.mark_hard_failed(at, "rejected").unwrap(),
    }
    backend.save(&job).await.unwrap();
}

pub async fn prune<B: Backend>(backend: B) {
    let now = now();
    let old = now - TimeDelta::days(3);
    finish(&backend, mock_job("old-done"), JobState::Done, old).await;
    finish(&backend, mock_job("new-done"), JobState::Done, now).await;
    finish(&backend, mock_job("old-failed"), JobState::HardFailed, old).await;
    backend.enqueue(mock_job("pending")).await.unwrap();

    let spec = PruneSpec {
        state: JobState::Done,
        max_age: TimeDelta::days(1),
        kinds: KindFilter::AllExcept(vec![]),
    };
    let removed = backend.prune(&spec, now).await.unwrap();

    assert_eq!(removed, 1);
    let targets: Vec<String> = backend
        .query(Query::And(vec![]))
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.target)
        .collect();
    assert_eq!(targets, vec!["new-done", "old-failed", "pending"]);
}

pub async fn prune_only_kinds<B: Backend>(backend: B) {
    let now = now();
    let old = now - TimeDelta::days(10);
    finish(
        &backend,
        mock_job("a").with_kind("report.accounts"),
        JobState::HardFailed,
        old,
    )
    .await;
    finish(
        &backend,
        mock_job("b").with_kind("user.update"),
        JobState::HardFailed,
        old,
    )
    .await;

    let spec = PruneSpec {
        state: JobState::HardFailed,
        max_age: TimeDelta::days(7),
        kinds: KindFilter::Only(vec!["report.accounts".to_owned()]),
    };
    let removed = backend.prune(&spec, now).await.unwrap();

    assert_eq!(removed, 1);
    let remaining = backend.query(Query::And(vec![])).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].kind, "user.update");
}

pub async fn query<B: Backend>(backend: B) {
    let a = backend
        .enqueue(mock_job("a").with_class(JobClass::Offline))
        .await
        .unwrap();
    let b = backend
        .enqueue(mock_job("b").with_kind("group.sync"))
        .await
        .unwrap();
    let c = backend.enqueue(mock_job("c")).await.unwrap();
    backend.mark_running(c, now()).await.unwrap();

    let ids = |jobs: Vec<Job>| jobs.into_iter().map(|job| job.id).collect::<Vec<_>>();

    assert_eq!(
        ids(backend.query(Query::And(vec![])).await.unwrap()),
        vec![a, b, c]
    );
    assert_eq!(
        ids(backend
            .query(Query::ClassEqual(JobClass::Offline))
            .await
            .unwrap()),
        vec![a]
    );
    assert_eq!(
        ids(backend.query(Query::KindEqual("group.sync")).await.unwrap()),
        vec![b]
    );
    assert_eq!(
        ids(backend.query(Query::TargetEqual("c")).await.unwrap()),
        vec![c]
    );
    assert_eq!(
        ids(backend
            .query(Query::Not(Box::new(Query::StateEqual(JobState::Running))))
            .await
            .unwrap()),
        vec![a, b]
    );
    assert_eq!(
        ids(backend
            .query(Query::Or(vec![
                Query::IdEquals(a),
                Query::StateEqual(JobState::Running),
            ]))
            .await
            .unwrap()),
        vec![a, c]
    );
    assert_eq!(
        ids(backend
            .query(Query::And(vec![
                Query::StateEqual(JobState::Pending),
                Query::KindEqual("group.sync"),
            ]))
            .await
            .unwrap()),
        vec![b]
    );
}
