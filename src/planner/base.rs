//! Access paths of catalog relations.

use std::cmp::Ordering;
use std::rc::Rc;

use crate::catalog::{RelId, RelSize};
use crate::distribution::locator::{LocatorKind, RelationLocInfo};
use crate::distribution::qualifier::extract_key_bindings;
use crate::distribution::reduce::ReduceInfo;
use crate::distribution::resolver::AccessType;
use crate::errors::PlannerError;
use crate::ir::expression::{AttrNumber, ColumnRef, Expr};
use crate::ir::relids::{RelIndex, Relids};
use crate::ir::value::Type;
use crate::path::cost::{self, Cost};
use crate::path::pathkeys::{from_sort_clause, PathKey};
use crate::path::{Path, PathKind, ReduceValidity, ScanMethod};
use crate::tlog;

use super::context::PlannerContext;
use super::join::sorted;
use super::redistribute;
use super::rel::RelSearchNode;
use super::QueryLevel;

/// One way to read the relation, before it is given a distribution.
struct ScanCandidate {
    method: ScanMethod,
    quals: Vec<Expr>,
    cost: Cost,
    rows: f64,
    pathkeys: Vec<PathKey>,
    param_rels: Relids,
}

/// Restrictions an index on `attno` can evaluate: equalities and ranges
/// comparing the column with something that doesn't read the relation.
fn usable_quals(rel: RelIndex, attno: AttrNumber, quals: &[Expr]) -> Vec<Expr> {
    let key = ColumnRef::new(rel, attno);
    quals
        .iter()
        .filter(|q| {
            let Expr::Op { op, args } = q else {
                return false;
            };
            if args.len() != 2 || !(op.is_joinable_equality() || op.is_range()) {
                return false;
            }
            match (args[0].as_column(), args[1].as_column()) {
                (Some(c), _) if c == key => !args[1].referenced_rels().contains(rel),
                (_, Some(c)) if c == key => !args[0].referenced_rels().contains(rel),
                _ => false,
            }
        })
        .cloned()
        .collect()
}

/// Join clause `rel.attno = other.col` usable as a parameterized index
/// condition, with the relation providing the parameter.
fn param_clause(rel: RelIndex, attno: AttrNumber, clause: &Expr) -> Option<RelIndex> {
    let (l, r) = clause.as_joinable_equality()?;
    let key = ColumnRef::new(rel, attno);
    let other = match (l.as_column(), r.as_column()) {
        (Some(c), _) if c == key => r,
        (_, Some(c)) if c == key => l,
        _ => return None,
    };
    other.referenced_rels().singleton_member().filter(|o| *o != rel)
}

fn selectivity(part: f64, whole: f64) -> f64 {
    if whole <= 0.0 {
        1.0
    } else {
        (part / whole).min(1.0)
    }
}

fn scan_candidates(
    ctx: &PlannerContext<'_>,
    level: &QueryLevel<'_>,
    node: &RelSearchNode,
    rel: RelIndex,
    rel_id: RelId,
    full: &RelSize,
) -> Result<Vec<ScanCandidate>, PlannerError> {
    let p = ctx.cost();
    let quals = &node.restrictions;
    let mut out = vec![ScanCandidate {
        method: ScanMethod::Seq,
        quals: quals.clone(),
        cost: cost::seq_scan(p, full.pages, full.rows, quals.len()),
        rows: node.rows,
        pathkeys: Vec::new(),
        param_rels: Relids::empty(),
    }];

    for index in ctx.catalog.indexes(rel_id)? {
        let Some(&attno) = index.columns.first() else {
            continue;
        };
        let key = ColumnRef::new(rel, attno);
        let pathkeys = vec![PathKey::asc(key)];
        let index_quals = usable_quals(rel, attno, quals);
        let ordered_output_useful = level
            .query
            .sort
            .first()
            .is_some_and(|k| k.column == key && !k.descending);
        if !index_quals.is_empty() || ordered_output_useful {
            let matched = ctx.catalog.estimate_rows_and_width(rel_id, &index_quals)?;
            out.push(ScanCandidate {
                method: ScanMethod::Index {
                    index: index.name.clone(),
                    index_quals: index_quals.clone(),
                },
                quals: quals.clone(),
                cost: cost::index_scan(
                    p,
                    full.pages,
                    full.rows,
                    selectivity(matched.rows, full.rows),
                    quals.len() - index_quals.len(),
                ),
                rows: node.rows,
                pathkeys: pathkeys.clone(),
                param_rels: Relids::empty(),
            });
        }

        // Nested loop inner sides: the other relation's value is passed in
        // as a parameter.
        for other in level.query.base_rels() {
            if other == rel {
                continue;
            }
            let clauses = level.join_clauses(Relids::single(rel), Relids::single(other));
            for clause in clauses {
                if param_clause(rel, attno, &clause) != Some(other) {
                    continue;
                }
                let param_eq = Expr::eq(
                    Expr::Column(key),
                    Expr::exec_param(u16::try_from(other).unwrap_or(u16::MAX), Type::Any),
                );
                let mut est_quals = quals.clone();
                est_quals.push(param_eq);
                let rows = ctx.catalog.estimate_rows_and_width(rel_id, &est_quals)?.rows;
                let mut all_index_quals = index_quals.clone();
                all_index_quals.push(clause.clone());
                let mut all_quals = quals.clone();
                all_quals.push(clause);
                out.push(ScanCandidate {
                    method: ScanMethod::Index {
                        index: index.name.clone(),
                        index_quals: all_index_quals,
                    },
                    cost: cost::index_scan(
                        p,
                        full.pages,
                        full.rows,
                        selectivity(rows, full.rows),
                        quals.len() - index_quals.len(),
                    ),
                    quals: all_quals,
                    rows,
                    pathkeys: pathkeys.clone(),
                    param_rels: Relids::single(other),
                });
            }
        }
    }
    Ok(out)
}

fn scan_path(node: &RelSearchNode, rel: RelIndex, rel_id: RelId, c: &ScanCandidate) -> Path {
    Path {
        kind: PathKind::Scan {
            rel,
            rel_id,
            method: c.method.clone(),
            quals: c.quals.clone(),
        },
        parent: node.relids,
        rows: c.rows,
        width: node.width,
        startup_cost: c.cost.startup,
        total_cost: c.cost.total,
        pathkeys: c.pathkeys.clone(),
        param_rels: c.param_rels,
        reduce: None,
        validity: ReduceValidity::NotComputed,
    }
}

/// Complete paths over the partial scans of `node`: a Gather of each
/// partial path, and for the query ordering a Gather Merge of the cheapest
/// partial path sorted by each worker.
fn gather_partial_paths(
    ctx: &PlannerContext<'_>,
    level: &QueryLevel<'_>,
    node: &mut RelSearchNode,
    rel: RelIndex,
    workers: u32,
) -> Result<(), PlannerError> {
    let order = from_sort_clause(&level.query.sort);
    let order_is_local = !order.is_empty() && order.iter().all(|k| k.column.rel == rel);
    let complete = |partial: &[Rc<Path>]| {
        let mut out: Vec<Path> = partial
            .iter()
            .map(|p| redistribute::gather(ctx, p, workers, false))
            .collect();
        let cheapest = partial.iter().min_by(|a, b| {
            a.total_cost
                .partial_cmp(&b.total_cost)
                .unwrap_or(Ordering::Equal)
        });
        if let Some(cheapest) = cheapest.filter(|_| order_is_local) {
            let ordered = sorted(ctx, cheapest, &order);
            out.push(redistribute::gather(ctx, &ordered, workers, true));
        }
        out
    };
    for path in complete(&node.partial_pathlist) {
        node.add_path(path)?;
    }
    for path in complete(&node.cluster_partial_pathlist) {
        node.add_cluster_path(path)?;
    }
    Ok(())
}

/// Distribution of a scan of `rel` after pruning by its own restrictions,
/// and the key equalities that can only be checked at run time.
///
/// # Errors
/// - catalog lookup or node resolution failed
pub fn scan_distribution(
    ctx: &PlannerContext<'_>,
    level: &QueryLevel<'_>,
    rel: RelIndex,
    loc: &RelationLocInfo,
    quals: &[Expr],
) -> Result<(ReduceInfo, Vec<Expr>), PlannerError> {
    let columns = ctx.catalog.columns(loc.rel_id)?;
    let keys = loc
        .partition_attrs
        .iter()
        .map(|attno| {
            let ty = columns
                .get(usize::from(*attno).wrapping_sub(1))
                .map_or(Type::Any, |c| c.ty);
            (*attno, ty)
        })
        .collect::<Vec<_>>();
    let bindings = extract_key_bindings(
        rel,
        &keys,
        quals,
        &level.query.params,
        loc.kind == LocatorKind::UserDefined,
    );
    let access = if level.query.for_update {
        AccessType::ReadForUpdate
    } else {
        AccessType::Read
    };
    let exec = ctx
        .topology
        .resolve_nodes(loc, access, &bindings.values, ctx.functions)?;
    Ok((ReduceInfo::from_exec_nodes(loc, rel, &exec), bindings.deferred))
}

/// Build the search node of catalog relation `rel` with its local and
/// cluster access paths.
///
/// # Errors
/// - catalog lookups failed or returned inconsistent data
/// - out of memory
pub fn build_base_rel(
    ctx: &PlannerContext<'_>,
    level: &QueryLevel<'_>,
    rel: RelIndex,
    rel_id: RelId,
) -> Result<RelSearchNode, PlannerError> {
    ctx.check_for_interrupts()?;
    let mut node = RelSearchNode::new(Relids::single(rel));
    node.restrictions = level.restrictions(rel).to_vec();

    if ctx.catalog.is_temp(rel_id)? {
        ctx.disable_cluster("query reads a temporary relation");
    }
    let loc = ctx.topology.locator(ctx.catalog, rel_id)?;
    let full = ctx.catalog.estimate_rows_and_width(rel_id, &[])?;
    let size = ctx.catalog.estimate_rows_and_width(rel_id, &node.restrictions)?;
    node.rows = size.rows;
    node.width = size.width;

    let params = &level.query.params;
    if node.restrictions.iter().any(|q| q.is_constant_false(params)) {
        tlog!(Debug, "relation is empty by its qualifiers"; "rel" => rel);
        node.set_dummy(ctx.dummy_reduce());
        return Ok(node);
    }

    let distribution = match &loc {
        Some(loc) => Some(scan_distribution(ctx, level, rel, loc, &node.restrictions)?),
        None => None,
    };
    if let Some((reduce, _)) = &distribution {
        if reduce.is_empty() {
            tlog!(Debug, "relation pruned to no nodes"; "rel" => rel, "relation" => rel_id);
            node.set_dummy(ctx.dummy_reduce());
            return Ok(node);
        }
    }

    let candidates = scan_candidates(ctx, level, &node, rel, rel_id, &full)?;
    let p = ctx.cost();

    for c in &candidates {
        let mut path = scan_path(&node, rel, rel_id, c);
        if loc.is_some() {
            path = path.with_cost(c.cost.add(0.0, cost::transfer(p, c.rows, node.width)));
        }
        node.add_path(path)?;
    }

    let workers = ctx.config.max_parallel_workers_per_gather;
    let parallel = workers > 0 && full.pages >= ctx.config.min_parallel_table_pages;
    let partial = |node: &RelSearchNode| ScanCandidate {
        method: ScanMethod::PartialSeq { workers },
        quals: node.restrictions.clone(),
        cost: cost::partial_seq_scan(p, full.pages, full.rows, node.restrictions.len(), workers),
        rows: node.rows,
        pathkeys: Vec::new(),
        param_rels: Relids::empty(),
    };
    if parallel && loc.is_none() {
        node.add_partial_path(scan_path(&node, rel, rel_id, &partial(&node)))?;
    }

    if ctx.cluster_ok() {
        let (reduce, deferred) = distribution.unwrap_or_else(|| (ReduceInfo::coordinator(), Vec::new()));
        let share = match &loc {
            Some(loc) if loc.kind != LocatorKind::Replicated => loc.nodes.len(),
            _ => 1,
        };
        #[allow(clippy::cast_precision_loss)]
        let share = share as f64;
        for c in &candidates {
            let path = scan_path(&node, rel, rel_id, c)
                .with_cost(c.cost.per_node(share))
                .with_reduce(reduce.clone(), ReduceValidity::Computed);
            let path = if deferred.is_empty() || path.is_parameterized() {
                path
            } else {
                redistribute::reduce_by_param(ctx, path, deferred.clone())
            };
            node.add_cluster_path(path)?;
        }
        if parallel {
            let c = partial(&node);
            node.add_cluster_partial_path(
                scan_path(&node, rel, rel_id, &c)
                    .with_cost(c.cost.per_node(share))
                    .with_reduce(reduce.clone(), ReduceValidity::Computed),
            )?;
        }
        tlog!(Trace, "base relation distribution";
            "rel" => rel, "reduce" => %reduce, "deferred" => deferred.len());
    }

    if parallel {
        gather_partial_paths(ctx, level, &mut node, rel, workers)?;
    }
    node.set_cheapest();
    Ok(node)
}
