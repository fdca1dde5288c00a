use std::time::Duration;

use chrono::TimeDelta;

use crate::job::JobClass;

/// Process-wide queue configuration.
///
/// Loaded once at startup and read-only afterwards. The defaults match a daemon started without
/// a configuration file.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Floor on the time between any two dispatches.
    pub min_delay: TimeDelta,
    /// Minimum spacing between two dispatches of normal jobs.
    pub delay_normal: TimeDelta,
    /// Minimum spacing between two dispatches of offline jobs.
    pub delay_offline: TimeDelta,
    /// When set, a class whose backlog would take longer than this to drain is dispatched faster,
    /// though never faster than `min_delay`.
    pub max_delay: Option<TimeDelta>,
    /// Base delay before a soft-failed job is retried.
    pub softfail_delay: TimeDelta,
    /// Failure count at which a job is hard-failed.
    pub softfail_threshold: u16,
    pub warn_overflow: bool,
    /// Number of waiting jobs above which the queue is considered overflowing.
    pub capacity: usize,
    /// Skip mutating jobs instead of executing them.
    pub read_only: bool,
    /// Maximum number of jobs executing at the same time.
    pub concurrency: usize,
    pub job_timeout: Option<Duration>,
    pub shutdown_grace: Duration,
    pub poll_interval: Duration,
    pub stats_interval: Duration,
    pub error_window: TimeDelta,
    /// Credential failures within `error_window` that make the queue stop. `0` disables the check.
    pub credential_error_ceiling: usize,
    /// Transient failures within `error_window` that raise an operator notice. `0` disables it.
    pub transient_error_ceiling: usize,
    /// Attempts at persisting a job state transition before the store is considered unavailable.
    pub store_retry_attempts: u16,
    pub store_retry_base: TimeDelta,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            min_delay: TimeDelta::seconds(2),
            delay_normal: TimeDelta::seconds(10),
            delay_offline: TimeDelta::seconds(30),
            max_delay: None,
            softfail_delay: TimeDelta::seconds(300),
            softfail_threshold: 4,
            warn_overflow: true,
            capacity: 500,
            read_only: false,
            concurrency: 4,
            job_timeout: Some(Duration::from_secs(600)),
            shutdown_grace: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            stats_interval: Duration::from_secs(1800),
            error_window: TimeDelta::hours(1),
            credential_error_ceiling: 2,
            transient_error_ceiling: 4,
            store_retry_attempts: 5,
            store_retry_base: TimeDelta::milliseconds(200),
        }
    }
}

impl QueueConfig {
    /// The configured minimum spacing for a class, never less than `min_delay`.
    pub fn delay_for(&self, class: JobClass) -> TimeDelta {
        let delay = match class {
            JobClass::Immediate => self.min_delay,
            JobClass::Normal => self.delay_normal,
            JobClass::Offline => self.delay_offline,
        };
        delay.max(self.min_delay)
    }

    pub fn with_delays(self, min: TimeDelta, normal: TimeDelta, offline: TimeDelta) -> Self {
        Self {
            min_delay: min,
            delay_normal: normal,
            delay_offline: offline,
            ..self
        }
    }

    pub fn with_max_delay(self, max_delay: Option<TimeDelta>) -> Self {
        Self { max_delay, ..self }
    }

    pub fn with_softfail(self, delay: TimeDelta, threshold: u16) -> Self {
        Self {
            softfail_delay: delay,
            softfail_threshold: threshold,
            ..self
        }
    }

    pub fn with_capacity(self, capacity: usize, warn_overflow: bool) -> Self {
        Self {
            capacity,
            warn_overflow,
            ..self
        }
    }

    pub fn with_read_only(self, read_only: bool) -> Self {
        Self { read_only, ..self }
    }

    pub fn with_concurrency(self, concurrency: usize) -> Self {
        Self {
            concurrency,
            ..self
        }
    }

    pub fn with_job_timeout(self, job_timeout: Option<Duration>) -> Self {
        Self {
            job_timeout,
            ..self
        }
    }

    pub fn with_shutdown_grace(self, shutdown_grace: Duration) -> Self {
        Self {
            shutdown_grace,
            ..self
        }
    }

    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..self
        }
    }

    pub fn with_error_ceilings(
        self,
        window: TimeDelta,
        credential_error_ceiling: usize,
        transient_error_ceiling: usize,
    ) -> Self {
        Self {
            error_window: window,
            credential_error_ceiling,
            transient_error_ceiling,
            ..self
        }
    }

    pub fn with_store_retry(self, attempts: u16, base: TimeDelta) -> Self {
        Self {
            store_retry_attempts: attempts,
            store_retry_base: base,
            ..self
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn class_delays() {
        let config = QueueConfig::default();

        assert_eq!(config.delay_for(JobClass::Immediate), TimeDelta::seconds(2));
        assert_eq!(config.delay_for(JobClass::Normal), TimeDelta::seconds(10));
        assert_eq!(config.delay_for(JobClass::Offline), TimeDelta::seconds(30));
    }

    #[test]
    fn class_delay_is_at_least_min_delay() {
        let config = QueueConfig::default().with_delays(
            TimeDelta::seconds(5),
            TimeDelta::seconds(1),
            TimeDelta::seconds(30),
        );

        assert_eq!(config.delay_for(JobClass::Normal), TimeDelta::seconds(5));
    }
}
