use std::collections::VecDeque;

use chrono::{DateTime, TimeDelta, Utc};

use crate::events::QueueEvent;

/// Sliding window of recent job failures.
#[derive(Debug)]
pub(crate) struct ErrorWindow {
    window: TimeDelta,
    credential_ceiling: usize,
    transient_ceiling: usize,
    credential: VecDeque<DateTime<Utc>>,
    transient: VecDeque<DateTime<Utc>>,
    transient_notified: bool,
}

impl ErrorWindow {
    pub(crate) fn new(window: TimeDelta, credential_ceiling: usize, transient_ceiling: usize) -> Self {
        Self {
            window,
            credential_ceiling,
            transient_ceiling,
            credential: VecDeque::new(),
            transient: VecDeque::new(),
            transient_notified: false,
        }
    }

    fn expire(errors: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>, window: TimeDelta) {
        let Some(cut_off) = now.checked_sub_signed(window) else {
            return;
        };
        while errors.front().is_some_and(|at| *at <= cut_off) {
            errors.pop_front();
        }
    }

    /// Returns the ceiling event each time the ceiling is reached or exceeded.
    pub(crate) fn credential_failure(&mut self, now: DateTime<Utc>) -> Option<QueueEvent> {
        Self::expire(&mut self.credential, now, self.window);
        self.credential.push_back(now);
        (self.credential_ceiling > 0 && self.credential.len() >= self.credential_ceiling).then(
            || QueueEvent::CredentialCeiling {
                failures: self.credential.len(),
                window: self.window,
            },
        )
    }

    /// Returns the ceiling event once per episode. The episode ends when enough failures have
    /// left the window to drop below the ceiling.
    pub(crate) fn transient_failure(&mut self, now: DateTime<Utc>) -> Option<QueueEvent> {
        Self::expire(&mut self.transient, now, self.window);
        if self.transient.len() < self.transient_ceiling {
            self.transient_notified = false;
        }
        self.transient.push_back(now);
        if self.transient_ceiling == 0
            || self.transient.len() < self.transient_ceiling
            || self.transient_notified
        {
            return None;
        }
        self.transient_notified = true;
        Some(QueueEvent::TransientCeiling {
            failures: self.transient.len(),
            window: self.window,
        })
    }
}
