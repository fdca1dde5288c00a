use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite};
use syncq::{
    backend::Query,
    pruner::{KindFilter, PruneSpec},
};

use crate::types::to_millis;

pub(crate) trait ToQuery {
    fn query(&self) -> QueryBuilder<'_, Sqlite>;
}

impl ToQuery for Query<'_> {
    fn query(&self) -> QueryBuilder<'_, Sqlite> {
        let mut builder =
            QueryBuilder::new(concat!("SELECT ", job_columns!(), " FROM syncq_jobs WHERE"));
        handle_query(&mut builder, self);
        builder.push(" ORDER BY id");
        builder
    }
}

pub(crate) fn prune_query(spec: &PruneSpec, now: DateTime<Utc>) -> QueryBuilder<'_, Sqlite> {
    let mut builder = QueryBuilder::new("DELETE FROM syncq_jobs WHERE state = ");
    builder.push_bind(spec.state.as_str());
    builder.push(" AND COALESCE(finished_at, updated_at) < ");
    builder.push_bind(to_millis(spec.cut_off(now)));
    match &spec.kinds {
        KindFilter::AllExcept(kinds) if kinds.is_empty() => {}
        KindFilter::Only(kinds) if kinds.is_empty() => {
            builder.push(" AND 0");
        }
        KindFilter::AllExcept(kinds) => {
            builder.push(" AND kind NOT IN ");
            push_list(&mut builder, kinds);
        }
        KindFilter::Only(kinds) => {
            builder.push(" AND kind IN ");
            push_list(&mut builder, kinds);
        }
    }
    builder
}

fn push_list<'a>(builder: &mut QueryBuilder<'a, Sqlite>, values: &'a [String]) {
    builder.push("(");
    let mut separated = builder.separated(", ");
    for value in values {
        separated.push_bind(value.as_str());
    }
    builder.push(")");
}

fn handle_query<'a>(builder: &mut QueryBuilder<'a, Sqlite>, query: &'a Query<'_>) {
    match query {
        Query::Not(inner) => {
            builder.push(" NOT (");
            handle_query(builder, inner);
            builder.push(")");
        }
        Query::And(queries) => join(builder, queries, " AND", " 1"),
        Query::Or(queries) => join(builder, queries, " OR", " 0"),
        Query::IdEquals(id) => {
            builder.push(" id = ");
            builder.push_bind(i64::from(*id));
        }
        Query::StateEqual(state) => {
            builder.push(" state = ");
            builder.push_bind(state.as_str());
        }
        Query::KindEqual(kind) => {
            builder.push(" kind = ");
            builder.push_bind(kind.to_string());
        }
        Query::TargetEqual(target) => {
            builder.push(" target = ");
            builder.push_bind(target.to_string());
        }
        Query::ClassEqual(class) => {
            builder.push(" class = ");
            builder.push_bind(class.as_str());
        }
    }
}

fn join<'a>(
    builder: &mut QueryBuilder<'a, Sqlite>,
    queries: &'a [Query<'_>],
    separator: &str,
    empty: &str,
) {
    let Some((last, elements)) = queries.split_last() else {
        builder.push(empty);
        return;
    };
    builder.push(" (");
    for query in elements {
        handle_query(builder, query);
        builder.push(separator);
    }
    handle_query(builder, last);
    builder.push(")");
}
