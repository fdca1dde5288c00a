use std::{ops::Sub, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use cron::Schedule;
use tokio_util::sync::CancellationToken;

use crate::{backend::Backend, job::builder::JobBuilder, queue::Queue, QueueError};

/// Sleeps until the next time `schedule` fires and returns that time, or `None` if it never
/// fires again.
pub(crate) async fn sleep_until_next(schedule: &Schedule) -> Option<DateTime<Utc>> {
    let next = schedule.upcoming(Utc).next()?;
    let delay = next
        .sub(Utc::now())
        .sub(TimeDelta::milliseconds(10))
        .to_std()
        .unwrap_or(Duration::ZERO);
    tokio::time::sleep(delay).await;
    // Do not return early enough for `upcoming` to yield the same time twice.
    if let Ok(delay) = (next - Utc::now()).to_std() {
        tokio::time::sleep(delay).await;
    }
    Some(next)
}

/// Enqueues a job each time a cron schedule fires.
pub(crate) struct CronRunner<B: Backend> {
    queue: Arc<Queue<B>>,
    schedule: Schedule,
    builder: JobBuilder,
}

impl<B> CronRunner<B>
where
    B: Backend + 'static,
{
    pub(crate) fn new(queue: Arc<Queue<B>>, schedule: Schedule, builder: JobBuilder) -> Self {
        Self {
            queue,
            schedule,
            builder,
        }
    }

    pub(crate) fn spawn(self, cancellation_token: CancellationToken) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    fired = sleep_until_next(&self.schedule) => match fired {
                        Some(scheduled_at) => self.enqueue_job(scheduled_at).await,
                        None => {
                            tracing::warn!(kind = %self.builder.kind(), "No future scheduled time for cron job");
                            break;
                        }
                    },
                    _ = cancellation_token.cancelled() => break,
                }
            }
            tracing::debug!("Shutting down cron scheduler for {}", self.builder.kind());
        });
    }

    async fn enqueue_job(&self, scheduled_at: DateTime<Utc>) {
        match self
            .builder
            .clone()
            .schedule_at(scheduled_at)
            .enqueue_to(&self.queue)
            .await
        {
            Ok(_) => {}
            Err(QueueError::Duplicate { existing }) => {
                tracing::debug!(%existing, "Cron job {} is still queued, skipping", self.builder.kind());
            }
            Err(error) => {
                tracing::error!(?error, "Failed to enqueue cron job {} with {error}", self.builder.kind());
            }
        }
    }
}
