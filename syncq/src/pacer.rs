//! Dispatch pacing and overflow detection.
//!
//! The remote API is rate limited, so the queue never dispatches two jobs closer together than
//! the global minimum delay, nor two jobs of the same class closer together than that class's
//! delay. Pacing throttles the dispatch rate only. How many dispatched jobs execute at the same
//! time is bounded separately by the runner's concurrency limit.
use chrono::{DateTime, TimeDelta, Utc};
use fxhash::FxHashMap;

use crate::{
    config::QueueConfig,
    events::QueueEvent,
    job::{Job, JobClass, JobState},
};

#[derive(Debug, Clone)]
pub struct Pacer {
    min_delay: TimeDelta,
    delays: FxHashMap<JobClass, TimeDelta>,
    max_delay: Option<TimeDelta>,
    capacity: usize,
    warn_overflow: bool,
    last_dispatch_at: Option<DateTime<Utc>>,
    last_dispatch_by_class: FxHashMap<JobClass, DateTime<Utc>>,
    overflowing: bool,
}

impl Pacer {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            min_delay: config.min_delay,
            delays: JobClass::ALL
                .into_iter()
                .map(|class| (class, config.delay_for(class)))
                .collect(),
            max_delay: config.max_delay,
            capacity: config.capacity,
            warn_overflow: config.warn_overflow,
            last_dispatch_at: None,
            last_dispatch_by_class: Default::default(),
            overflowing: false,
        }
    }

    /// The spacing currently enforced between two dispatches of `class`, given how many jobs of
    /// that class are waiting.
    pub fn delay_for(&self, class: JobClass, backlog: usize) -> TimeDelta {
        let delay = self.delays.get(&class).copied().unwrap_or(self.min_delay);
        let Some(max_delay) = self.max_delay else {
            return delay;
        };
        let Ok(backlog) = i32::try_from(backlog) else {
            return self.min_delay;
        };
        if backlog == 0 {
            return delay;
        }
        match delay.checked_mul(backlog) {
            Some(drain_time) if drain_time <= max_delay => delay,
            _ => (max_delay / backlog).max(self.min_delay),
        }
    }

    /// Selects the oldest pending job that may be dispatched at `now`, if any.
    ///
    /// Ties on creation time are broken by id. Soft-failed candidates are ignored: they have to
    /// be re-armed to pending first.
    pub fn next_ready_job<'a>(&self, candidates: &'a [Job], now: DateTime<Utc>) -> Option<&'a Job> {
        if self
            .last_dispatch_at
            .is_some_and(|last| now - last < self.min_delay)
        {
            return None;
        }

        let mut backlog: FxHashMap<JobClass, usize> = Default::default();
        for job in candidates.iter().filter(|job| job.state.is_waiting()) {
            *backlog.entry(job.class).or_default() += 1;
        }

        candidates
            .iter()
            .filter(|job| job.state == JobState::Pending && job.next_eligible_at <= now)
            .filter(|job| {
                let backlog = backlog.get(&job.class).copied().unwrap_or_default();
                self.class_ready(job.class, backlog, now)
            })
            .min_by_key(|job| (job.created_at, job.id))
    }

    fn class_ready(&self, class: JobClass, backlog: usize, now: DateTime<Utc>) -> bool {
        match self.last_dispatch_by_class.get(&class) {
            Some(last) => now - *last >= self.delay_for(class, backlog),
            None => true,
        }
    }

    /// Records that a job of `class` was dispatched. Only called for jobs actually dispatched.
    pub fn record_dispatch(&mut self, class: JobClass, now: DateTime<Utc>) {
        self.last_dispatch_at = Some(now);
        self.last_dispatch_by_class.insert(class, now);
    }

    /// Tracks overflow episodes, returning an event when one begins.
    ///
    /// An episode begins when the backlog exceeds the capacity and ends once it drops below it.
    pub fn observe_backlog(&mut self, backlog: usize) -> Option<QueueEvent> {
        if backlog < self.capacity {
            self.overflowing = false;
            return None;
        }
        if backlog == self.capacity || self.overflowing {
            return None;
        }
        self.overflowing = true;
        self.warn_overflow.then_some(QueueEvent::Overflow {
            backlog,
            capacity: self.capacity,
        })
    }
}
