use chrono::{DateTime, Utc};

use crate::{job::Job, pruner::PruneSpec};

use super::Query;

pub(super) trait Queryable {
    fn matches(&self, job: &Job) -> bool;
}

impl<'a> Queryable for Query<'a> {
    fn matches(&self, job: &Job) -> bool {
        match self {
            Query::Not(inner) => !inner.matches(job),
            Query::And(inner) => inner.iter().all(|query| query.matches(job)),
            Query::Or(inner) => inner.iter().any(|query| query.matches(job)),
            Query::IdEquals(id) => job.id == *id,
            Query::StateEqual(state) => job.state == *state,
            Query::KindEqual(kind) => job.kind == *kind,
            Query::TargetEqual(target) => job.target == *target,
            Query::ClassEqual(class) => job.class == *class,
        }
    }
}

impl PruneSpec {
    pub(super) fn matches_at(&self, job: &Job, now: DateTime<Utc>) -> bool {
        job.state == self.state
            && self.applies_to(&job.kind)
            && job.finished_at.unwrap_or(job.updated_at) < self.cut_off(now)
    }
}
