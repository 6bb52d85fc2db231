//! Redistribution operators: the path nodes that move rows between nodes.

use std::rc::Rc;

use crate::distribution::reduce::{KeyColumns, PartitionMethod, ReduceInfo};
use crate::ir::expression::Expr;
use crate::path::cost;
use crate::path::visitor::map_tree;
use crate::path::{Path, PathKind, ReduceValidity, Redistribution};
use crate::topology::{NodeList, NodeOid};

use super::context::PlannerContext;

/// Make every replicated part of the tree run on `node` only.
#[must_use]
pub fn restrict_replicated(path: &Rc<Path>, node: NodeOid) -> Rc<Path> {
    map_tree(path, &mut |p| match &p.reduce {
        Some(r) if r.is_replicated_like() && r.effective_nodes().contains(&node) => {
            let mut copy = p.clone();
            copy.reduce = Some(r.restrict_to(node));
            Some(copy)
        }
        _ => None,
    })
}

/// A replicated input is read from a single node before it is shipped
/// anywhere, otherwise every replica would send the same rows.
fn single_source(ctx: &PlannerContext<'_>, input: &Rc<Path>) -> (Rc<Path>, f64) {
    match &input.reduce {
        Some(r) if r.is_replicated_like() => {
            let nodes = r.effective_nodes();
            match ctx.topology.preferred_node(&nodes) {
                Some(node) if nodes.len() > 1 => (restrict_replicated(input, node), 1.0),
                _ => (Rc::clone(input), 1.0),
            }
        }
        Some(r) => (Rc::clone(input), r.degree()),
        None => (Rc::clone(input), 1.0),
    }
}

fn moved(input: &Rc<Path>, op: Redistribution, reduce: ReduceInfo, run: f64) -> Path {
    Path::wrap(
        PathKind::Redistribute {
            op,
            input: Rc::clone(input),
        },
        input,
    )
    .with_cost(input.cost().add(0.0, run))
    .with_reduce(reduce, ReduceValidity::Computed)
}

/// Collect all rows on the coordinator. An ordered input is merged so the
/// ordering survives. Returns the input itself when it is already there,
/// and `None` for local or parameterized inputs that can't be moved.
#[must_use]
pub fn reduce_to_coordinator(ctx: &PlannerContext<'_>, input: &Rc<Path>) -> Option<Rc<Path>> {
    let reduce = input.reduce.as_ref()?;
    if reduce.is_coordinator() {
        return Some(Rc::clone(input));
    }
    if input.is_parameterized() {
        return None;
    }
    let (source, senders) = single_source(ctx, input);
    let merge = !source.pathkeys.is_empty();
    let run = cost::reduce_to_coordinator(ctx.cost(), source.rows, source.width, senders, merge);
    let mut path = moved(
        &source,
        Redistribution::ToCoordinator { merge },
        ReduceInfo::coordinator(),
        run,
    );
    if !merge {
        path.pathkeys.clear();
    }
    Some(path.rc())
}

/// Broadcast the rows to every node of `targets`.
#[must_use]
pub fn reduce_to_replicate(
    ctx: &PlannerContext<'_>,
    input: &Rc<Path>,
    targets: &NodeList,
) -> Option<Rc<Path>> {
    let reduce = input.reduce.as_ref()?;
    if targets.is_empty() {
        return None;
    }
    if reduce.is_replicated_like() {
        let have = reduce.effective_nodes();
        if targets.iter().all(|n| have.contains(n)) {
            return Some(Rc::clone(input));
        }
    }
    if input.is_parameterized() {
        return None;
    }
    let (source, _) = single_source(ctx, input);
    #[allow(clippy::cast_precision_loss)]
    let run = cost::broadcast(ctx.cost(), source.rows, source.width, targets.len() as f64);
    let mut path = moved(
        &source,
        Redistribution::ToReplicate,
        ReduceInfo::final_replicate(targets.clone()),
        run,
    );
    path.pathkeys.clear();
    Some(path.rc())
}

/// Re-place the rows by `method(keys)` over `nodes`. A no-op when the
/// input already follows that rule, whatever nodes it has pruned.
#[must_use]
pub fn reduce_to_value(
    ctx: &PlannerContext<'_>,
    input: &Rc<Path>,
    method: PartitionMethod,
    keys: KeyColumns,
    nodes: NodeList,
) -> Option<Rc<Path>> {
    let reduce = input.reduce.as_ref()?;
    if nodes.is_empty() || keys.is_empty() {
        return None;
    }
    if reduce.method() == Some(method)
        && reduce.keys() == Some(keys.as_slice())
        && reduce.nodes == nodes
    {
        return Some(Rc::clone(input));
    }
    if input.is_parameterized() {
        return None;
    }
    let (source, _) = single_source(ctx, input);
    #[allow(clippy::cast_precision_loss)]
    let run = cost::repartition(ctx.cost(), source.rows, source.width, nodes.len() as f64);
    let mut path = moved(
        &source,
        Redistribution::ToValue,
        ReduceInfo::by_value(method, keys, nodes),
        run,
    );
    path.pathkeys.clear();
    Some(path.rc())
}

/// Runs `input` on its full node set and defers the pruning that depends
/// on executor parameters to run time. The distribution is provisional.
#[must_use]
pub fn reduce_by_param(ctx: &PlannerContext<'_>, input: Path, deferred: Vec<Expr>) -> Path {
    let nodes = input
        .reduce
        .as_ref()
        .map_or(1, |r| r.effective_nodes().len());
    let input = input.rc();
    #[allow(clippy::cast_precision_loss)]
    let run = cost::reduce_by_param(ctx.cost(), input.rows_per_node(), nodes as f64);
    let mut path = Path::wrap(
        PathKind::Redistribute {
            op: Redistribution::ByParam { deferred },
            input: Rc::clone(&input),
        },
        &input,
    )
    .with_cost(input.cost().add(0.0, run));
    if path.reduce.is_some() {
        path.validity = ReduceValidity::Provisional;
    }
    path
}

/// Collect the workers of a partial path into one stream on each node.
#[must_use]
pub fn gather(ctx: &PlannerContext<'_>, partial: &Rc<Path>, workers: u32, merge: bool) -> Path {
    let cost = cost::gather(
        ctx.cost(),
        partial.cost(),
        partial.rows_per_node(),
        workers,
        merge,
    );
    let mut path = Path::wrap(
        PathKind::Gather {
            workers,
            merge,
            input: Rc::clone(partial),
        },
        partial,
    )
    .with_cost(cost);
    if !merge {
        path.pathkeys.clear();
    }
    path
}
