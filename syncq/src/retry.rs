//! The soft-failure retry policy.
use std::{fmt, sync::Arc};

use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    backoff::{Backoff, Curve},
    job::Job,
};

/// What to do with a job that just failed transiently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Soft-fail the job and make it eligible again at `retry_at`.
    Retry {
        fail_count: u16,
        retry_at: DateTime<Utc>,
    },
    /// The threshold has been reached, the job is hard-failed.
    GiveUp { fail_count: u16 },
}

impl RetryDecision {
    pub fn fail_count(&self) -> u16 {
        match self {
            Self::Retry { fail_count, .. } | Self::GiveUp { fail_count } => *fail_count,
        }
    }
}

/// Decides between soft and hard failure.
///
/// The n-th soft failure delays the job by `curve.delay(n)`, by default `n * softfail_delay`.
/// A job whose failure count reaches `softfail_threshold` is given up on.
#[derive(Clone)]
pub struct RetryPolicy {
    softfail_threshold: u16,
    curve: Arc<dyn Curve + Send + Sync>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("softfail_threshold", &self.softfail_threshold)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    pub fn new(softfail_delay: TimeDelta, softfail_threshold: u16) -> Self {
        Self {
            softfail_threshold,
            curve: Arc::new(Backoff::linear(softfail_delay)),
        }
    }

    /// Replaces the default linear curve.
    ///
    /// The curve must be monotonically non-decreasing in the failure count.
    pub fn with_curve(self, curve: impl Curve + Send + Sync + 'static) -> Self {
        Self {
            curve: Arc::new(curve),
            ..self
        }
    }

    pub fn softfail_threshold(&self) -> u16 {
        self.softfail_threshold
    }

    /// Pure function of the job's failure count, the configuration and `now`.
    pub fn decide(&self, job: &Job, now: DateTime<Utc>) -> RetryDecision {
        let fail_count = job.fail_count.saturating_add(1);
        if fail_count >= self.softfail_threshold {
            RetryDecision::GiveUp { fail_count }
        } else {
            RetryDecision::Retry {
                fail_count,
                retry_at: now
                    .checked_add_signed(self.curve.delay(fail_count))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            }
        }
    }
}
