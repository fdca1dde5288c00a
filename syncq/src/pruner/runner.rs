use std::sync::Arc;

use futures::{stream::FuturesOrdered, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::{backend::Backend, cron_runner::sleep_until_next, queue::Queue};

use super::PrunerConfig;

pub(crate) struct PrunerRunner<B: Backend> {
    config: PrunerConfig,
    queue: Arc<Queue<B>>,
}

impl<B> PrunerRunner<B>
where
    B: Backend + 'static,
{
    pub(crate) fn new(queue: Arc<Queue<B>>, config: PrunerConfig) -> Self {
        Self { queue, config }
    }

    pub(crate) fn spawn(self, cancellation_token: CancellationToken) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    fired = sleep_until_next(&self.config.schedule) => {
                        if fired.is_none() {
                            tracing::warn!("No future scheduled time for the job pruner");
                            break;
                        }
                        self.prune().await;
                    }
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the job pruner");
                        break;
                    },
                }
            }
        });
    }

    async fn prune(&self) -> u64 {
        self.config
            .pruners
            .iter()
            .map(|spec| async move { (spec, self.queue.prune(spec).await) })
            .collect::<FuturesOrdered<_>>()
            .fold(0, |total, (spec, result)| async move {
                match result {
                    Ok(removed) => {
                        tracing::debug!(state = %spec.state, removed, "Pruned {removed} old {} jobs", spec.state);
                        total + removed
                    }
                    Err(error) => {
                        tracing::error!(?error, "Failed to clean up jobs with error {error}");
                        total
                    }
                }
            })
            .await
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use chrono::{TimeDelta, Utc};

    use crate::{
        backend::memory::InMemoryBackend,
        job::{JobId, JobState},
        pruner::Pruner,
        testing::{mock_job, queue_with_defaults},
    };

    use super::*;

    async fn finish(backend: &InMemoryBackend, target: &str, kind: &str, days_ago: i64) -> JobId {
        let at = Utc::now() - TimeDelta::days(days_ago);
        let id = backend
            .enqueue(mock_job(target).with_kind(kind))
            .await
            .unwrap();
        let mut job = backend.mark_running(id, at).await.unwrap();
        job.mark_done(at, None).unwrap();
        backend.save(&job).await.unwrap();
        id
    }

    #[tokio::test]
    async fn prunes_old_terminal_jobs() {
        let backend = InMemoryBackend::new();
        let old_report = finish(&backend, "accounts", "report.accounts", 3).await;
        let recent_report = finish(&backend, "activity", "report.activity", 0).await;
        let old_update = finish(&backend, "jdoe", "user.update", 3).await;
        let pending = backend.enqueue(mock_job("asmith")).await.unwrap();
        let config = PrunerConfig::new(cron::Schedule::from_str("0 0 3 * * *").unwrap())
            .with_pruner(
                Pruner::max_age(TimeDelta::days(1), JobState::Done)
                    .only("report.accounts")
                    .and("report.activity"),
            );
        let runner = PrunerRunner::new(Arc::new(queue_with_defaults(backend.clone())), config);

        assert_eq!(runner.prune().await, 1);

        assert!(backend.load(old_report).await.is_err());
        assert!(backend.load(recent_report).await.is_ok());
        assert!(backend.load(old_update).await.is_ok());
        assert!(backend.load(pending).await.is_ok());
    }
}
