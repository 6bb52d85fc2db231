//! Relations whose rows come from a nested query level or from the
//! executor's working storage.

use smol_str::SmolStr;
use std::rc::Rc;

use crate::distribution::reduce::ReduceInfo;
use crate::errors::PlannerError;
use crate::errors::Entity;
use crate::ir::query::{Query, RangeEntry, TargetEntry};
use crate::ir::relids::{RelIndex, Relids};
use crate::path::cost::{clamp_rows, Cost};
use crate::path::pathkeys::remap_through;
use crate::path::{Path, PathKind, ReduceValidity};
use crate::topology::{NodeList, NodeOid};
use crate::tlog;

use super::context::PlannerContext;
use super::rel::RelSearchNode;
use super::{plan_query_level, QueryLevel};

/// Fraction of rows kept by a qualifier evaluated over subquery output.
const FILTER_SELECTIVITY: f64 = 1.0 / 3.0;

fn filtered_rows(rows: f64, nquals: usize) -> f64 {
    let n = i32::try_from(nquals).unwrap_or(i32::MAX);
    clamp_rows(rows * FILTER_SELECTIVITY.powi(n))
}

/// Scan of the output of `input`: a subquery scan or a CTE scan.
fn boundary_scan(
    ctx: &PlannerContext<'_>,
    node: &RelSearchNode,
    rel: RelIndex,
    cte: Option<&SmolStr>,
    input: &Rc<Path>,
    upper_target: &[TargetEntry],
) -> Path {
    let p = ctx.cost();
    #[allow(clippy::cast_precision_loss)]
    let per_row = p.cpu_tuple_cost + p.cpu_operator_cost * node.restrictions.len() as f64;
    let kind = match cte {
        Some(name) => PathKind::CteScan {
            rel,
            name: name.clone(),
            input: Rc::clone(input),
        },
        None => PathKind::SubqueryScan {
            rel,
            input: Rc::clone(input),
        },
    };
    let mut path = Path::wrap(kind, input).with_cost(
        input
            .cost()
            .add(0.0, input.rows_per_node() * per_row),
    );
    path.parent = node.relids;
    path.rows = node.rows;
    path.width = node.width;
    path.pathkeys = remap_through(&input.pathkeys, upper_target, rel);
    path
}

/// Plan `sub` as its own query level and expose it as relation `rel` of
/// the enclosing level. `cte` names the common table expression when the
/// relation is one.
///
/// # Errors
/// - the nested level can't be planned
/// - recursion is too deep, interrupts, out of memory
pub fn build_subquery_rel(
    ctx: &PlannerContext<'_>,
    level: &QueryLevel<'_>,
    rel: RelIndex,
    sub: &Query,
    cte: Option<&SmolStr>,
) -> Result<RelSearchNode, PlannerError> {
    let mut node = RelSearchNode::new(Relids::single(rel));
    node.restrictions = level.restrictions(rel).to_vec();
    if node
        .restrictions
        .iter()
        .any(|q| q.is_constant_false(&level.query.params))
    {
        node.set_dummy(ctx.dummy_reduce());
        return Ok(node);
    }

    let upper = plan_query_level(ctx, sub)?;
    node.rows = filtered_rows(upper.local.rows, node.restrictions.len());
    node.width = upper.local.width;

    node.add_path(boundary_scan(ctx, &node, rel, cte, &upper.local, &upper.target))?;

    if ctx.cluster_ok() {
        for inner in &upper.cluster {
            let Some(reduce) = &inner.reduce else {
                continue;
            };
            let outer_reduce = reduce.remap_through(&upper.target, rel);
            tlog!(Trace, "subquery distribution adopted";
                "rel" => rel, "inner" => %reduce, "outer" => %outer_reduce);
            let path = boundary_scan(ctx, &node, rel, cte, inner, &upper.target)
                .with_reduce(outer_reduce, ReduceValidity::Computed);
            node.add_cluster_path(path)?;
        }
        if !node.has_cluster_paths() {
            ctx.disable_cluster("subquery has no distributed plan");
        }
    }
    node.set_cheapest();
    Ok(node)
}

/// Distribution of executor-owned storage: local to the coordinator
/// unless the execution context pins identical copies to known nodes.
/// Identical copies are replicated placement, so readers take one copy.
#[must_use]
pub fn executor_reduce(pinned: Option<&[NodeOid]>) -> ReduceInfo {
    match pinned {
        Some(nodes) if !nodes.is_empty() => {
            ReduceInfo::replicated(nodes.iter().copied().collect::<NodeList>())
        }
        _ => ReduceInfo::coordinator(),
    }
}

/// Relation over a recursive CTE's working table or a named tuplestore.
///
/// # Errors
/// - `entry` is not executor-owned storage
/// - out of memory
pub fn build_executor_rel(
    ctx: &PlannerContext<'_>,
    level: &QueryLevel<'_>,
    rel: RelIndex,
    entry: &RangeEntry,
) -> Result<RelSearchNode, PlannerError> {
    let (name, rows, width, pinned, worktable) = match entry {
        RangeEntry::WorkTable { name, rows, width } => (name, *rows, *width, None, true),
        RangeEntry::Tuplestore {
            name,
            rows,
            width,
            pinned,
        } => (name, *rows, *width, pinned.as_deref(), false),
        other => {
            return Err(PlannerError::Invalid(
                Entity::RangeEntry,
                Some(smol_str::format_smolstr!("{} is not executor storage", other.name())),
            ))
        }
    };
    let mut node = RelSearchNode::new(Relids::single(rel));
    node.restrictions = level.restrictions(rel).to_vec();
    node.rows = filtered_rows(rows, node.restrictions.len());
    node.width = width;

    let p = ctx.cost();
    #[allow(clippy::cast_precision_loss)]
    let run = rows * (p.cpu_tuple_cost + p.cpu_operator_cost * node.restrictions.len() as f64);
    let kind = if worktable {
        PathKind::WorkTableScan {
            rel,
            name: name.clone(),
        }
    } else {
        PathKind::TuplestoreScan {
            rel,
            name: name.clone(),
        }
    };
    let mut path = Path::dummy(node.relids, width, None).with_cost(Cost::new(0.0, run));
    path.kind = kind;
    path.rows = node.rows;
    node.add_path(path.clone())?;

    if ctx.cluster_ok() {
        let reduce = if worktable {
            ReduceInfo::coordinator()
        } else {
            executor_reduce(pinned)
        };
        path.validity = ReduceValidity::Computed;
        path.reduce = Some(reduce);
        node.add_cluster_path(path)?;
    }
    node.set_cheapest();
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::reduce::ReduceKind;
    use pretty_assertions::assert_eq;

    #[test]
    fn pinned_tuplestore_stays_on_its_nodes() {
        let r = executor_reduce(Some(&[3, 5]));
        assert_eq!(r.kind, ReduceKind::Replicated);
        assert_eq!(r.effective_nodes().as_slice(), &[3, 5]);
        assert!(executor_reduce(Some(&[])).is_coordinator());
        assert!(executor_reduce(None).is_coordinator());
    }

    #[test]
    fn filters_shrink_subquery_rows() {
        assert_eq!(filtered_rows(90.0, 0), 90.0);
        assert_eq!(filtered_rows(90.0, 2), 10.0);
        assert_eq!(filtered_rows(0.5, 1), 1.0);
    }
}
