use std::{str::FromStr, sync::Arc};

use anyhow::Context;
use serde_json::json;
use syncq::{
    events::{EventSink, RateLimitedSink, TracingSink},
    job::{builder::JobBuilder, JobClass},
    pruner::PrunerConfig,
    queue::Queue,
    token::TokenManager,
    worker::WorkerRegistry,
    Syncq,
};
use syncq_sqlx::SqliteBackend;
use tokio::signal::unix::{signal, SignalKind};

use crate::{config::DaemonConfig, provider::HttpTokenProvider, worker::HttpWorker};

/// Runs the queue until SIGTERM or SIGINT, or until it stops on a fatal error.
pub async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    let provider = config
        .provider
        .as_ref()
        .context("the [provider] section is required to run the daemon")?;
    let credentials = provider.credentials()?;
    let token_provider = HttpTokenProvider::new(&provider.token_url, provider.request_timeout())
        .context("failed to build the token client")?;
    let worker = HttpWorker::new(&provider.api_url, provider.request_timeout())
        .context("failed to build the provider client")?;

    let backend = SqliteBackend::connect(&config.database.url)
        .await
        .with_context(|| format!("failed to open job store {}", config.database.url))?;
    let tokens = Arc::new(TokenManager::new(
        Arc::new(token_provider),
        credentials,
        config.token_lifetime(),
        config.token_safety_margin(),
    ));
    let registry = WorkerRegistry::new().with_fallback(Arc::new(worker));
    let queue = Queue::new(backend, Arc::new(registry), tokens, config.queue_config())
        .with_events(event_sink(TracingSink, &config));

    let mut syncq = Syncq::new(queue)
        .with_job_pruner(PrunerConfig::with_defaults(schedule(&config.syncqd.prune_schedule)?));
    let report_schedule = schedule(&config.syncqd.report_schedule)?;
    for job in report_jobs(config.syncqd.activity_backlog) {
        syncq = syncq.with_cron_job(report_schedule.clone(), job);
    }

    let syncq = syncq.start().await.context("failed to start the job queue")?;
    if config.syncqd.read_only {
        tracing::warn!("Running in read-only mode, mutating jobs will be skipped");
    }

    let stopped = syncq.cancellation_token();
    tokio::select! {
        result = shutdown_signal() => result.context("failed to listen for shutdown signals")?,
        _ = stopped.cancelled() => tracing::warn!("Job queue runner stopped"),
    }

    let report = syncq.graceful_shutdown().await?;
    tracing::info!(
        drained = report.drained,
        requeued = report.requeued.len(),
        "Shut down"
    );
    Ok(())
}

/// With `logmail` set, repeats of a notice within `logmail-delay` are suppressed.
fn event_sink<S: EventSink + 'static>(sink: S, config: &DaemonConfig) -> Arc<dyn EventSink> {
    if config.syncqd.logmail {
        Arc::new(RateLimitedSink::new(sink, config.logmail_delay()))
    } else {
        Arc::new(sink)
    }
}

fn schedule(expression: &str) -> anyhow::Result<cron::Schedule> {
    cron::Schedule::from_str(expression)
        .with_context(|| format!("invalid cron schedule '{expression}'"))
}

/// The offline reports enqueued on the report schedule.
fn report_jobs(activity_backlog: u32) -> [JobBuilder; 2] {
    [
        JobBuilder::new("report.accounts", "report:accounts")
            .with_class(JobClass::Offline)
            .non_mutating(),
        JobBuilder::new("report.activity", "report:activity")
            .with_class(JobClass::Offline)
            .with_payload(json!({ "backlog_days": activity_backlog }))
            .non_mutating(),
    ]
}

async fn shutdown_signal() -> std::io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Received SIGINT, starting graceful shutdown");
        }
        _ = terminate.recv() => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use syncq::{events::QueueEvent, job::JobId, testing::RecordingSink};

    use super::*;

    #[test]
    fn reports_are_offline_and_read_only() {
        let [accounts, activity] = report_jobs(14).map(JobBuilder::build);

        assert_eq!(accounts.kind, "report.accounts");
        assert_eq!(activity.kind, "report.activity");
        for job in [&accounts, &activity] {
            assert_eq!(job.class, JobClass::Offline);
            assert!(!job.mutating);
        }
        assert_eq!(activity.payload["backlog_days"], 14);
    }

    #[test]
    fn default_schedules_are_valid() {
        let config = DaemonConfig::default();

        assert!(schedule(&config.syncqd.prune_schedule).is_ok());
        assert!(schedule(&config.syncqd.report_schedule).is_ok());
        assert!(schedule("every night").is_err());
    }

    fn hard_failed() -> QueueEvent {
        QueueEvent::HardFailed {
            job_id: JobId::from(1),
            kind: "user.update".to_owned(),
            target: "jdoe".to_owned(),
            reason: "404 Not Found".to_owned(),
        }
    }

    #[test]
    fn logmail_suppresses_repeated_notices() {
        let mut config = DaemonConfig::default();
        let recorded = Arc::new(RecordingSink::default());
        let sink = event_sink(recorded.clone(), &config);
        sink.emit(hard_failed());
        sink.emit(hard_failed());
        assert_eq!(recorded.events().len(), 2);

        config.syncqd.logmail = true;
        let recorded = Arc::new(RecordingSink::default());
        let sink = event_sink(recorded.clone(), &config);
        sink.emit(hard_failed());
        sink.emit(hard_failed());
        assert_eq!(recorded.events(), vec![hard_failed()]);
    }

    #[tokio::test]
    async fn run_requires_provider_section() {
        let error = run(DaemonConfig::default()).await.unwrap_err();

        assert!(error.to_string().contains("[provider]"));
    }
}
