//! Operator-visible conditions raised by the queue.
//!
//! The queue never delivers notices itself. It hands [`QueueEvent`]s to an [`EventSink`], which
//! decides how they reach an operator. [`TracingSink`] logs them, and [`RateLimitedSink`] can be
//! wrapped around any sink to stop a recurring condition from flooding the operator channel.
use std::{
    fmt::Display,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, TimeDelta, Utc};
use fxhash::FxHashMap;

use crate::job::{JobClass, JobId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// The backlog exceeded the configured capacity. Raised once per overflow episode.
    Overflow { backlog: usize, capacity: usize },
    /// A job was hard-failed and will not be retried automatically.
    HardFailed {
        job_id: JobId,
        kind: String,
        target: String,
        reason: String,
    },
    /// A mutating job was not executed because the queue is in read-only mode.
    Skipped {
        job_id: JobId,
        kind: String,
        target: String,
    },
    /// Too many credential failures within the error window.
    CredentialCeiling { failures: usize, window: TimeDelta },
    /// Too many transient failures within the error window. Raised once per episode.
    TransientCeiling { failures: usize, window: TimeDelta },
    /// A job state transition could not be persisted.
    StoreFailure { job_id: JobId, error: String },
    /// Jobs left running by a previous process were put back in the queue.
    Requeued { job_ids: Vec<JobId> },
    /// Periodic throughput summary.
    Statistics {
        handled: Vec<(JobClass, u64)>,
        transient_errors: u64,
    },
}

impl QueueEvent {
    pub fn severity(&self) -> Severity {
        match self {
            Self::Overflow { .. }
            | Self::Skipped { .. }
            | Self::TransientCeiling { .. }
            | Self::Requeued { .. }
            | Self::Statistics { .. } => Severity::Warning,
            Self::HardFailed { .. } => Severity::Error,
            Self::CredentialCeiling { .. } | Self::StoreFailure { .. } => Severity::Fatal,
        }
    }

    /// A short summary of the condition, used to recognise repeats of the same notice.
    pub fn subject(&self) -> String {
        match self {
            Self::Overflow { .. } => "job queue overflow".to_owned(),
            Self::HardFailed { kind, target, .. } => format!("job {kind} failed for {target}"),
            Self::Skipped { kind, .. } => format!("job {kind} skipped in read-only mode"),
            Self::CredentialCeiling { .. } => "cannot obtain access token".to_owned(),
            Self::TransientCeiling { .. } => "too many transient job failures".to_owned(),
            Self::StoreFailure { .. } => "job store unavailable".to_owned(),
            Self::Requeued { .. } => "jobs requeued after restart".to_owned(),
            Self::Statistics { .. } => "job queue statistics".to_owned(),
        }
    }
}

impl Display for QueueEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Overflow { backlog, capacity } => {
                write!(f, "{backlog} jobs waiting, capacity is {capacity}")
            }
            Self::HardFailed {
                job_id,
                kind,
                target,
                reason,
            } => write!(f, "{kind} {job_id} for '{target}' hard failed: {reason}"),
            Self::Skipped {
                job_id,
                kind,
                target,
            } => write!(f, "{kind} {job_id} for '{target}' skipped: read-only mode"),
            Self::CredentialCeiling { failures, window } => write!(
                f,
                "{failures} credential errors in the last {}s",
                window.num_seconds()
            ),
            Self::TransientCeiling { failures, window } => write!(
                f,
                "{failures} transient errors in the last {}s",
                window.num_seconds()
            ),
            Self::StoreFailure { job_id, error } => {
                write!(f, "failed to persist {job_id}: {error}")
            }
            Self::Requeued { job_ids } => write!(f, "{} running jobs requeued", job_ids.len()),
            Self::Statistics {
                handled,
                transient_errors,
            } => {
                for (class, count) in handled {
                    write!(f, "{class}: {count}, ")?;
                }
                write!(f, "transient errors: {transient_errors}")
            }
        }
    }
}

/// Receives operator-visible events from the queue.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: QueueEvent);
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn emit(&self, event: QueueEvent) {
        (**self).emit(event)
    }
}

/// Logs every event with `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: QueueEvent) {
        let subject = event.subject();
        match event.severity() {
            Severity::Warning => tracing::warn!(%subject, "{event}"),
            Severity::Error => tracing::error!(%subject, "{event}"),
            Severity::Fatal => tracing::error!(%subject, fatal = true, "{event}"),
        }
    }
}

/// Suppresses an event whose subject was already emitted within `delay`.
///
/// Statistics are part of normal operation and are never suppressed.
pub struct RateLimitedSink<S> {
    inner: S,
    delay: TimeDelta,
    last_sent: Mutex<FxHashMap<String, DateTime<Utc>>>,
}

impl<S: EventSink> RateLimitedSink<S> {
    pub fn new(inner: S, delay: TimeDelta) -> Self {
        Self {
            inner,
            delay,
            last_sent: Default::default(),
        }
    }

    fn should_send(&self, subject: &str, now: DateTime<Utc>) -> bool {
        let Ok(mut last_sent) = self.last_sent.lock() else {
            return true;
        };
        last_sent.retain(|_, sent_at| now - *sent_at < self.delay);
        match last_sent.get(subject) {
            Some(sent_at) if now - *sent_at < self.delay => false,
            _ => {
                last_sent.insert(subject.to_owned(), now);
                true
            }
        }
    }

    pub(crate) fn emit_at(&self, event: QueueEvent, now: DateTime<Utc>) {
        if matches!(event, QueueEvent::Statistics { .. }) {
            return self.inner.emit(event);
        }
        let subject = event.subject();
        if self.should_send(&subject, now) {
            self.inner.emit(event);
        } else {
            tracing::warn!(%subject, "Suppressed repeated notice: {event}");
        }
    }
}

impl<S: EventSink> EventSink for RateLimitedSink<S> {
    fn emit(&self, event: QueueEvent) {
        self.emit_at(event, Utc::now())
    }
}

#[cfg(test)]
mod test {
    use crate::testing::RecordingSink;

    use super::*;

    fn hard_failed(target: &str) -> QueueEvent {
        QueueEvent::HardFailed {
            job_id: JobId::from(1),
            kind: "user.update".to_owned(),
            target: target.to_owned(),
            reason: "rejected".to_owned(),
        }
    }

    #[test]
    fn severity() {
        assert_eq!(hard_failed("jdoe").severity(), Severity::Error);
        assert_eq!(
            QueueEvent::StoreFailure {
                job_id: JobId::from(1),
                error: "locked".to_owned()
            }
            .severity(),
            Severity::Fatal
        );
        assert!(Severity::Fatal > Severity::Warning);
    }

    #[test]
    fn rate_limited_sink_suppresses_same_subject() {
        let recorder = Arc::new(RecordingSink::default());
        let sink = RateLimitedSink::new(recorder.clone(), TimeDelta::seconds(1800));
        let now = Utc::now();

        sink.emit_at(hard_failed("jdoe"), now);
        sink.emit_at(hard_failed("jdoe"), now + TimeDelta::seconds(60));
        sink.emit_at(hard_failed("asmith"), now + TimeDelta::seconds(60));

        assert_eq!(recorder.events().len(), 2);

        sink.emit_at(hard_failed("jdoe"), now + TimeDelta::seconds(1800));

        assert_eq!(recorder.events().len(), 3);
    }

    #[test]
    fn rate_limited_sink_forgets_expired_subjects() {
        let recorder = Arc::new(RecordingSink::default());
        let sink = RateLimitedSink::new(recorder.clone(), TimeDelta::seconds(1800));
        let now = Utc::now();
        let tracked = || sink.last_sent.lock().unwrap().len();

        for target in ["jdoe", "asmith", "bwayne"] {
            sink.emit_at(hard_failed(target), now);
        }
        assert_eq!(tracked(), 3);

        sink.emit_at(hard_failed("ckent"), now + TimeDelta::seconds(1800));

        assert_eq!(tracked(), 1);
        assert_eq!(recorder.events().len(), 4);
    }

    #[test]
    fn rate_limited_sink_passes_statistics() {
        let recorder = Arc::new(RecordingSink::default());
        let sink = RateLimitedSink::new(recorder.clone(), TimeDelta::seconds(1800));
        let statistics = QueueEvent::Statistics {
            handled: vec![(JobClass::Normal, 3)],
            transient_errors: 0,
        };

        sink.emit(statistics.clone());
        sink.emit(statistics);

        assert_eq!(recorder.events().len(), 2);
    }

    #[test]
    fn statistics_display() {
        let statistics = QueueEvent::Statistics {
            handled: vec![(JobClass::Immediate, 1), (JobClass::Normal, 3)],
            transient_errors: 2,
        };

        assert_eq!(
            statistics.to_string(),
            "immediate: 1, normal: 3, transient errors: 2"
        );
    }
}
