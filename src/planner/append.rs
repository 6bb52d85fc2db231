//! Append relations: UNION ALL members and table partitions.

use smol_str::format_smolstr;
use std::rc::Rc;

use crate::distribution::reduce::{ReduceInfo, ReduceKind};
use crate::errors::PlannerError;
use crate::ir::query::AppendRelInfo;
use crate::ir::relids::{RelIndex, Relids};
use crate::path::cost;
use crate::path::pathkeys::{self, from_sort_clause};
use crate::path::{Path, PathKind, ReduceValidity};
use crate::tlog;

use super::context::PlannerContext;
use super::join::sorted;
use super::propagate::append_reduce;
use super::redistribute::{reduce_to_coordinator, restrict_replicated};
use super::rel::{PartitionedRel, RelSearchNode};
use super::QueryLevel;

/// Append of `children` producing the rows of `parent`.
#[must_use]
pub fn append_path(
    parent: &RelSearchNode,
    children: Vec<Rc<Path>>,
    reduce: Option<ReduceInfo>,
) -> Path {
    let costs: Vec<_> = children.iter().map(|c| c.cost()).collect();
    let c = cost::append(&costs);
    let rows = children.iter().map(|c| c.rows).sum();
    let validity = if reduce.is_some() {
        ReduceValidity::Computed
    } else {
        ReduceValidity::NotComputed
    };
    Path {
        kind: PathKind::Append { children },
        parent: parent.relids,
        rows,
        width: parent.width,
        startup_cost: c.startup,
        total_cost: c.total,
        pathkeys: Vec::new(),
        param_rels: Relids::empty(),
        reduce,
        validity,
    }
}

/// Cluster append of children whose own distributions are expressed in
/// child relation columns; `moves` renames them to the parent's. Children
/// that can't be combined where they are are collected on the coordinator.
#[must_use]
pub fn combine_cluster_children(
    ctx: &PlannerContext<'_>,
    parent: &RelSearchNode,
    parts: Vec<(Rc<Path>, Vec<(RelIndex, RelIndex)>)>,
) -> Option<Path> {
    let mut renamed = Vec::with_capacity(parts.len());
    for (path, moves) in &parts {
        let reduce = path.reduce.as_ref()?;
        renamed.push(
            moves
                .iter()
                .fold(reduce.clone(), |acc, (from, to)| acc.rename_rel(*from, *to)),
        );
    }
    let refs: Vec<&ReduceInfo> = renamed.iter().collect();
    let children: Vec<Rc<Path>> = parts.into_iter().map(|(p, _)| p).collect();
    match append_reduce(&refs) {
        Some(reduce) if matches!(reduce.kind, ReduceKind::Random) => {
            // every replicated child contributes its rows once
            let children = children
                .iter()
                .map(|c| match &c.reduce {
                    Some(r) if r.is_replicated_like() => ctx
                        .topology
                        .preferred_node(&r.effective_nodes())
                        .map_or_else(|| Rc::clone(c), |node| restrict_replicated(c, node)),
                    _ => Rc::clone(c),
                })
                .collect();
            Some(append_path(parent, children, Some(reduce)))
        }
        Some(reduce) => Some(append_path(parent, children, Some(reduce))),
        None => {
            let gathered = children
                .iter()
                .map(|c| reduce_to_coordinator(ctx, c))
                .collect::<Option<Vec<_>>>()?;
            Some(append_path(
                parent,
                gathered,
                Some(ReduceInfo::coordinator()),
            ))
        }
    }
}

/// The child evaluates a qualifier with a volatile function and an
/// executor parameter: all its rows must see the same function result.
fn has_volatile_hazard(child: &RelSearchNode) -> bool {
    child
        .restrictions
        .iter()
        .any(|q| q.contains_exec_param() && q.contains_volatile())
}

/// Build the append relation `parent` from its children.
///
/// # Errors
/// - a child can't be planned
/// - interrupts, out of memory
pub fn build_append_rel(
    ctx: &PlannerContext<'_>,
    level: &QueryLevel<'_>,
    parent: RelIndex,
    info: &AppendRelInfo,
) -> Result<RelSearchNode, PlannerError> {
    let _guard = ctx.enter()?;
    let mut node = RelSearchNode::new(Relids::single(parent));
    node.restrictions = level.restrictions(parent).to_vec();

    let mut children = Vec::with_capacity(info.children.len());
    for child in &info.children {
        children.push(super::build_rel(ctx, level, *child)?);
    }
    let live: Vec<(RelIndex, &RelSearchNode)> = info
        .children
        .iter()
        .copied()
        .zip(&children)
        .filter(|(_, c)| !c.is_dummy)
        .collect();
    node.width = children.iter().map(|c| c.width).fold(0.0, f64::max);
    node.rows = live.iter().map(|(_, c)| c.rows).sum();
    if live.is_empty() {
        node.set_dummy(ctx.dummy_reduce());
        return Ok(node);
    }

    let cheapest = live
        .iter()
        .map(|(_, c)| c.cheapest_total.clone())
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| {
            PlannerError::NoPlan(format_smolstr!("append relation {parent} has a child without paths"))
        })?;
    node.add_path(append_path(&node, cheapest.clone(), None))?;

    // Ordered append for ORDER BY on the parent's columns.
    let wanted = from_sort_clause(&level.query.sort);
    if !wanted.is_empty() && wanted.iter().all(|k| k.column.rel == parent) {
        let sorted_children: Vec<Rc<Path>> = live
            .iter()
            .zip(&cheapest)
            .map(|((child, _), path)| sorted(ctx, path, &pathkeys::rename_rel(&wanted, parent, *child)))
            .collect();
        let costs: Vec<_> = sorted_children.iter().map(|c| c.cost()).collect();
        let c = cost::merge_append(ctx.cost(), &costs, node.rows);
        let mut merged = append_path(&node, sorted_children, None).with_cost(c);
        if let PathKind::Append { children } = merged.kind {
            merged.kind = PathKind::MergeAppend { children };
        }
        merged.pathkeys = wanted;
        node.add_path(merged)?;
    }

    if ctx.cluster_ok() {
        let mut parts = Vec::with_capacity(live.len());
        for (child, c) in &live {
            let Some(best) = c.cheapest_cluster_total.clone() else {
                ctx.disable_cluster("append child has no distributed path");
                break;
            };
            let best = if has_volatile_hazard(c) {
                let single = best
                    .reduce
                    .as_ref()
                    .filter(|r| r.is_replicated_like())
                    .and_then(|r| ctx.topology.preferred_node(&r.effective_nodes()));
                match single {
                    Some(target) => {
                        tlog!(Info, "volatile qualifier: append child pinned to one node";
                            "rel" => child, "node" => target);
                        restrict_replicated(&best, target)
                    }
                    None => {
                        tlog!(Warning, "volatile qualifier over a distributed append child";
                            "rel" => child);
                        ctx.disable_cluster("volatile qualifier can't be evaluated on one node");
                        break;
                    }
                }
            } else {
                best
            };
            parts.push((best, vec![(*child, parent)]));
        }
        if ctx.cluster_ok() {
            match combine_cluster_children(ctx, &node, parts) {
                Some(path) => node.add_cluster_path(path)?,
                None => ctx.disable_cluster("append children can't be combined"),
            }
        }
    }

    if let Some(scheme) = &info.partition_scheme {
        node.partitioned = Some(PartitionedRel {
            scheme: scheme.clone(),
            children,
        });
    }
    node.set_cheapest();
    Ok(node)
}
