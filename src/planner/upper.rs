//! Grouping, ordering, limit and projection on top of the joined
//! relations, and the choice between the local and the cluster plan.

use std::rc::Rc;

use crate::errors::PlannerError;
use crate::ir::expression::{ColumnRef, Expr};
use crate::ir::query::{Query, RangeEntry, TargetEntry};
use crate::path::cost::{self, clamp_rows};
use crate::path::pathkeys::{from_sort_clause, pathkeys_contained_in, PathKey};
use crate::path::{AggPhase, AggStrategy, Path, PathKind, ReduceValidity};
use crate::tlog;

use super::context::PlannerContext;
use super::join::sorted;
use super::redistribute::reduce_to_coordinator;
use super::rel::{add_path_to, RelSearchNode};
use super::QueryLevel;

/// Result of planning one query level.
#[derive(Clone, Debug)]
pub struct UpperRel {
    /// Best local-only plan.
    pub local: Rc<Path>,
    /// Non-dominated cluster plans, each with its own distribution.
    pub cluster: Vec<Rc<Path>>,
    /// Output columns of the level.
    pub target: Vec<TargetEntry>,
}

impl UpperRel {
    /// Cheapest cluster plan including the cost of streaming its rows to
    /// the coordinator.
    #[must_use]
    pub fn cheapest_cluster(&self, ctx: &PlannerContext<'_>) -> Option<(Rc<Path>, f64)> {
        self.cluster
            .iter()
            .map(|p| (Rc::clone(p), p.total_cost + delivery_cost(ctx, p)))
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    }
}

/// Cost of sending the final rows of `path` to the client connection.
#[must_use]
pub fn delivery_cost(ctx: &PlannerContext<'_>, path: &Path) -> f64 {
    match &path.reduce {
        None => 0.0,
        Some(r) if r.is_coordinator() => 0.0,
        Some(r) => {
            let senders = if r.is_replicated_like() { 1.0 } else { r.degree() };
            cost::reduce_to_coordinator(
                ctx.cost(),
                path.rows,
                path.width,
                senders,
                !path.pathkeys.is_empty() && senders > 1.0,
            )
        }
    }
}

/// Output columns of `query`: its target list, or every column of its
/// catalog relations when the list is empty.
///
/// # Errors
/// - catalog lookup failed
pub fn output_target(
    ctx: &PlannerContext<'_>,
    query: &Query,
) -> Result<Vec<TargetEntry>, PlannerError> {
    if !query.target.is_empty() {
        return Ok(query.target.clone());
    }
    let mut target = Vec::new();
    for rel in query.base_rels() {
        let rel_id = match query.range_table.get(rel) {
            Some(RangeEntry::Relation { rel_id, .. }) => *rel_id,
            Some(RangeEntry::AppendParent { .. }) => {
                let first = query
                    .append_rel(rel)
                    .and_then(|info| info.children.first())
                    .and_then(|c| query.range_table.get(*c));
                match first {
                    Some(RangeEntry::Relation { rel_id, .. }) => *rel_id,
                    _ => continue,
                }
            }
            _ => continue,
        };
        for (pos, column) in ctx.catalog.columns(rel_id)?.iter().enumerate() {
            let Ok(attno) = u16::try_from(pos + 1) else {
                break;
            };
            target.push(TargetEntry::new(Expr::col(rel, attno), &column.name));
        }
    }
    Ok(target)
}

fn group_count(input_rows: f64, group_by: &[ColumnRef]) -> f64 {
    if group_by.is_empty() {
        1.0
    } else {
        clamp_rows(input_rows / 10.0).min(input_rows.max(1.0))
    }
}

fn aggregate(
    ctx: &PlannerContext<'_>,
    input: &Rc<Path>,
    phase: AggPhase,
    group_by: &[ColumnRef],
    rows: f64,
) -> Path {
    let group_keys: Vec<PathKey> = group_by.iter().map(|c| PathKey::asc(*c)).collect();
    let strategy = if group_by.is_empty() {
        AggStrategy::Plain
    } else if pathkeys_contained_in(&group_keys, &input.pathkeys) {
        AggStrategy::Sorted
    } else {
        AggStrategy::Hashed
    };
    let degree = input.reduce.as_ref().map_or(1.0, |r| r.degree());
    let c = cost::aggregate(
        ctx.cost(),
        strategy,
        input.cost(),
        input.rows_per_node(),
        (rows / degree).max(1.0),
        group_by.len(),
    );
    let mut path = Path::wrap(
        PathKind::Aggregate {
            phase,
            strategy,
            group_by: group_by.to_vec(),
            input: Rc::clone(input),
        },
        input,
    )
    .with_cost(c);
    path.rows = rows;
    if strategy != AggStrategy::Sorted {
        path.pathkeys.clear();
    }
    path
}

fn limit(input: &Rc<Path>, limit: Option<u64>, offset: Option<u64>) -> Path {
    let (c, rows) = cost::limit(input.cost(), input.rows, offset, limit);
    let mut path = Path::wrap(
        PathKind::Limit {
            limit,
            offset,
            input: Rc::clone(input),
        },
        input,
    )
    .with_cost(c);
    path.rows = rows;
    path
}

fn projection(ctx: &PlannerContext<'_>, input: &Rc<Path>, target: &[TargetEntry]) -> Rc<Path> {
    if target.is_empty() {
        return Rc::clone(input);
    }
    let c = cost::projection(ctx.cost(), input.cost(), input.rows_per_node(), target.len());
    Path::wrap(
        PathKind::Projection {
            target: target.to_vec(),
            input: Rc::clone(input),
        },
        input,
    )
    .with_cost(c)
    .rc()
}

fn needs_grouping(query: &Query) -> bool {
    query.has_aggregates || !query.group_by.is_empty()
}

fn finish_local(ctx: &PlannerContext<'_>, level: &QueryLevel<'_>, input: Rc<Path>) -> Rc<Path> {
    let query = level.query;
    let mut path = input;
    if needs_grouping(query) {
        let groups = group_count(path.rows, &query.group_by);
        path = aggregate(ctx, &path, AggPhase::Simple, &query.group_by, groups).rc();
    }
    path = sorted(ctx, &path, &from_sort_clause(&query.sort));
    if query.has_limit() {
        path = limit(&path, query.limit, query.offset).rc();
    }
    projection(ctx, &path, &query.target)
}

/// Grouping by every distribution key keeps each group on one node.
fn groups_collocated(level: &QueryLevel<'_>, path: &Path) -> bool {
    let group_by = &level.query.group_by;
    path.reduce
        .as_ref()
        .and_then(|r| r.keys())
        .is_some_and(|keys| {
            keys.iter()
                .all(|k| group_by.iter().any(|g| level.ecs.are_equal(*g, *k)))
        })
}

/// Rows of this path are complete where they are: a single stream, or a
/// copy of the whole result on each node.
fn is_whole(path: &Path) -> bool {
    path.reduce.as_ref().is_some_and(|r| {
        r.is_coordinator() || r.is_replicated_like() || r.single_node().is_some()
    })
}

fn finish_cluster(
    ctx: &PlannerContext<'_>,
    level: &QueryLevel<'_>,
    input: &Rc<Path>,
) -> Option<Rc<Path>> {
    let query = level.query;
    let mut path = Rc::clone(input);
    if needs_grouping(query) {
        let groups = group_count(path.rows, &query.group_by);
        path = if is_whole(&path) || groups_collocated(level, &path) {
            aggregate(ctx, &path, AggPhase::Simple, &query.group_by, groups).rc()
        } else {
            let degree = path.reduce.as_ref().map_or(1.0, |r| r.degree());
            let partial_rows = (groups * degree).min(path.rows.max(1.0));
            let partial =
                aggregate(ctx, &path, AggPhase::Partial, &query.group_by, partial_rows).rc();
            let gathered = reduce_to_coordinator(ctx, &partial)?;
            aggregate(ctx, &gathered, AggPhase::Final, &query.group_by, groups).rc()
        };
    }
    path = sorted(ctx, &path, &from_sort_clause(&query.sort));
    if query.has_limit() {
        if !is_whole(&path) {
            path = reduce_to_coordinator(ctx, &path)?;
        }
        path = limit(&path, query.limit, query.offset).rc();
    }
    Some(projection(ctx, &path, &query.target))
}

/// Apply the upper stages of `level` to the local join inputs (the
/// cheapest path and the ordered ones) keeping the cheapest result, and to
/// every cluster path of the joined relation.
///
/// # Errors
/// - the joined relation has no local path
/// - out of memory
pub fn plan_upper(
    ctx: &PlannerContext<'_>,
    level: &QueryLevel<'_>,
    final_rel: &RelSearchNode,
) -> Result<UpperRel, PlannerError> {
    let cheapest = final_rel.cheapest_total.clone().ok_or_else(|| {
        PlannerError::NoPlan(smol_str::format_smolstr!(
            "no unparameterized path for {}",
            final_rel.relids
        ))
    })?;
    let mut local = finish_local(ctx, level, Rc::clone(&cheapest));
    for candidate in final_rel.local_candidates() {
        if Rc::ptr_eq(&candidate, &cheapest) {
            continue;
        }
        let finished = finish_local(ctx, level, candidate);
        if finished.total_cost < local.total_cost {
            local = finished;
        }
    }

    let mut cluster = Vec::new();
    if ctx.cluster_ok() {
        for candidate in final_rel.cluster_candidates() {
            if let Some(path) = finish_cluster(ctx, level, &candidate) {
                add_path_to(&mut cluster, path)?;
            }
        }
        if cluster.is_empty() {
            tlog!(Debug, "query level has no cluster plan"; "relids" => %final_rel.relids);
            ctx.disable_cluster("no distributed plan for the query level");
        }
    }
    Ok(UpperRel {
        local,
        cluster,
        target: output_target(ctx, level.query)?,
    })
}

/// Validity of the distribution of a finished cluster plan: provisional
/// as soon as some part of it depends on run-time pruning.
#[must_use]
pub fn plan_validity(path: &Path) -> ReduceValidity {
    if path.any(&mut |p| p.validity == ReduceValidity::Provisional) {
        ReduceValidity::Provisional
    } else {
        ReduceValidity::Computed
    }
}
