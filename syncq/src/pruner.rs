//! The queue cleaner.
//!
//! Terminal jobs are kept for a while so that an operator can see what happened to them, then
//! removed. [`PrunerConfig`] holds a [`cron::Schedule`] saying when the cleaner runs and a list of
//! [`Pruner`]s, each removing the jobs in one terminal state older than a maximum age.
//!
//! ```
//! # use syncq::prelude::*;
//! # use std::str::FromStr;
//! # use chrono::{DateTime, TimeDelta, Utc};
//! // Reports are noise after a day, other completed jobs are kept for a week and hard failures
//! // for a month.
//! let config = PrunerConfig::new(cron::Schedule::from_str("0 0 3 * * *").unwrap())
//!     .with_pruner(
//!         Pruner::max_age(TimeDelta::days(1), JobState::Done)
//!             .only("report.accounts")
//!             .and("report.activity"),
//!     )
//!     .with_pruner(
//!         Pruner::max_age(TimeDelta::days(7), JobState::Done)
//!             .except("report.accounts")
//!             .and("report.activity"),
//!     )
//!     .with_pruner(Pruner::max_age(TimeDelta::days(31), JobState::HardFailed));
//!
//! assert_eq!(config.pruners().len(), 3);
//! ```
use chrono::{DateTime, TimeDelta, Utc};

pub(crate) mod runner;

use crate::job::JobState;

/// When to clean up the queue, and what to remove.
///
/// Pass it to [`crate::Syncq::with_job_pruner`].
#[derive(Debug, Clone)]
pub struct PrunerConfig {
    schedule: cron::Schedule,
    pruners: Vec<PruneSpec>,
}

impl PrunerConfig {
    pub fn new(schedule: cron::Schedule) -> Self {
        Self {
            schedule,
            pruners: Vec::new(),
        }
    }

    /// Removes hard failed jobs after a week and completed jobs after a day.
    pub fn with_defaults(schedule: cron::Schedule) -> Self {
        Self::new(schedule).with_pruners([
            Pruner::max_age(TimeDelta::days(7), JobState::HardFailed),
            Pruner::max_age(TimeDelta::days(1), JobState::Done),
        ])
    }

    /// Adds a pruner. A pruner for a waiting or running state is ignored.
    #[allow(private_bounds)]
    pub fn with_pruner<K: IntoKindFilter>(mut self, pruner: Pruner<K>) -> Self {
        self.push(pruner.into());
        self
    }

    #[allow(private_bounds)]
    pub fn with_pruners<K: IntoKindFilter>(
        mut self,
        pruners: impl IntoIterator<Item = Pruner<K>>,
    ) -> Self {
        for pruner in pruners {
            self.push(pruner.into());
        }
        self
    }

    fn push(&mut self, spec: PruneSpec) {
        if spec.state.is_terminal() {
            self.pruners.push(spec);
        } else {
            tracing::warn!(state = %spec.state, "Ignoring pruner for non-terminal state {}", spec.state);
        }
    }

    pub fn schedule(&self) -> &cron::Schedule {
        &self.schedule
    }

    pub fn pruners(&self) -> &[PruneSpec] {
        &self.pruners
    }
}

/// A single pruner as handed to [`crate::backend::Backend::prune`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneSpec {
    /// Always a terminal state.
    pub state: JobState,
    /// Jobs that finished longer ago than this are removed.
    pub max_age: TimeDelta,
    pub kinds: KindFilter,
}

impl PruneSpec {
    /// Jobs that finished before this instant are removed.
    pub fn cut_off(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Whether `kind` is affected by this pruner.
    pub fn applies_to(&self, kind: &str) -> bool {
        match &self.kinds {
            KindFilter::AllExcept(kinds) => !kinds.iter().any(|excluded| excluded == kind),
            KindFilter::Only(kinds) => kinds.iter().any(|included| included == kind),
        }
    }
}

impl<K: IntoKindFilter> From<Pruner<K>> for PruneSpec {
    fn from(pruner: Pruner<K>) -> Self {
        Self {
            state: pruner.state,
            max_age: pruner.max_age,
            kinds: pruner.kinds.into_kind_filter(),
        }
    }
}

/// Removes the jobs in one terminal state once they are older than a maximum age.
///
/// Jobs of every kind are removed unless the pruner is narrowed down with [`Pruner::only`] or
/// [`Pruner::except`], each of which can be followed by [`Pruner::and`].
///
/// ```
/// # use syncq::prelude::*;
/// # use chrono::TimeDelta;
/// let pruner = Pruner::max_age(TimeDelta::days(14), JobState::HardFailed)
///     .except("user.delete");
/// ```
#[allow(private_bounds)]
pub struct Pruner<K: IntoKindFilter> {
    state: JobState,
    max_age: TimeDelta,
    kinds: K,
}

impl Pruner<AnyKind> {
    pub const fn max_age(age: TimeDelta, state: JobState) -> Self {
        Self {
            state,
            max_age: age,
            kinds: AnyKind,
        }
    }

    pub fn only(self, kind: &str) -> Pruner<OnlyKinds> {
        self.narrow(OnlyKinds(vec![kind.to_owned()]))
    }

    pub fn except(self, kind: &str) -> Pruner<ExceptKinds> {
        self.narrow(ExceptKinds(vec![kind.to_owned()]))
    }

    fn narrow<K: IntoKindFilter>(self, kinds: K) -> Pruner<K> {
        Pruner {
            state: self.state,
            max_age: self.max_age,
            kinds,
        }
    }
}

impl Pruner<OnlyKinds> {
    pub fn and(mut self, kind: &str) -> Self {
        self.kinds.0.push(kind.to_owned());
        self
    }
}

impl Pruner<ExceptKinds> {
    pub fn and(mut self, kind: &str) -> Self {
        self.kinds.0.push(kind.to_owned());
        self
    }
}

/// The job kinds a pruner applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KindFilter {
    /// Every kind but the ones listed. An empty list means every kind.
    AllExcept(Vec<String>),
    /// Only the kinds listed.
    Only(Vec<String>),
}

trait IntoKindFilter {
    fn into_kind_filter(self) -> KindFilter;
}

#[doc(hidden)]
pub struct AnyKind;

#[doc(hidden)]
pub struct OnlyKinds(Vec<String>);

#[doc(hidden)]
pub struct ExceptKinds(Vec<String>);

impl IntoKindFilter for AnyKind {
    fn into_kind_filter(self) -> KindFilter {
        KindFilter::AllExcept(Vec::new())
    }
}

impl IntoKindFilter for OnlyKinds {
    fn into_kind_filter(self) -> KindFilter {
        KindFilter::Only(self.0)
    }
}

impl IntoKindFilter for ExceptKinds {
    fn into_kind_filter(self) -> KindFilter {
        KindFilter::AllExcept(self.0)
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;

    fn nightly() -> cron::Schedule {
        cron::Schedule::from_str("0 0 3 * * *").unwrap()
    }

    #[test]
    fn narrowed_pruners() {
        let config = PrunerConfig::new(nightly())
            .with_pruner(
                Pruner::max_age(TimeDelta::days(1), JobState::Done)
                    .only("report.accounts")
                    .and("report.activity"),
            )
            .with_pruner(Pruner::max_age(TimeDelta::days(7), JobState::Done).except("user.delete"));

        assert_eq!(
            config.pruners(),
            &[
                PruneSpec {
                    state: JobState::Done,
                    max_age: TimeDelta::days(1),
                    kinds: KindFilter::Only(vec![
                        "report.accounts".to_owned(),
                        "report.activity".to_owned()
                    ]),
                },
                PruneSpec {
                    state: JobState::Done,
                    max_age: TimeDelta::days(7),
                    kinds: KindFilter::AllExcept(vec!["user.delete".to_owned()]),
                },
            ]
        );
    }

    #[test]
    fn defaults_keep_failures_longer() {
        let config = PrunerConfig::with_defaults(nightly());

        assert_eq!(
            config
                .pruners()
                .iter()
                .map(|spec| (spec.state, spec.max_age))
                .collect::<Vec<_>>(),
            vec![
                (JobState::HardFailed, TimeDelta::days(7)),
                (JobState::Done, TimeDelta::days(1)),
            ]
        );
        assert!(config.pruners().iter().all(|spec| spec.applies_to("user.create")));
    }

    #[test]
    fn live_states_are_never_pruned() {
        let config = PrunerConfig::new(nightly()).with_pruners([
            Pruner::max_age(TimeDelta::days(1), JobState::Pending),
            Pruner::max_age(TimeDelta::days(1), JobState::SoftFailed),
            Pruner::max_age(TimeDelta::days(1), JobState::Running),
            Pruner::max_age(TimeDelta::days(1), JobState::Done),
        ]);

        assert_eq!(config.pruners().len(), 1);
        assert_eq!(config.pruners()[0].state, JobState::Done);
    }

    #[test]
    fn cut_off_saturates() {
        let now = Utc::now();
        let week: PruneSpec = Pruner::max_age(TimeDelta::days(7), JobState::Done).into();
        let forever: PruneSpec = Pruner::max_age(TimeDelta::MAX, JobState::Done).into();

        assert_eq!(week.cut_off(now), now - TimeDelta::days(7));
        assert_eq!(forever.cut_off(now), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn applies_to_kinds() {
        let only: PruneSpec = Pruner::max_age(TimeDelta::days(1), JobState::Done)
            .only("report.accounts")
            .into();
        let except: PruneSpec = Pruner::max_age(TimeDelta::days(1), JobState::Done)
            .except("user.delete")
            .and("user.create")
            .into();

        assert!(only.applies_to("report.accounts"));
        assert!(!only.applies_to("user.update"));
        assert!(except.applies_to("user.update"));
        assert!(!except.applies_to("user.delete"));
        assert!(!except.applies_to("user.create"));
    }
}
