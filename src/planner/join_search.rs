//! Bottom-up join order search.

use ahash::AHashMap;
use smol_str::format_smolstr;
use std::rc::Rc;

use crate::errors::{Entity, PlannerError};
use crate::ir::expression::{AttrNumber, ColumnRef, Expr};
use crate::ir::query::JoinKind;
use crate::ir::relids::{RelIndex, Relids};
use crate::path::Path;
use crate::tlog;

use super::append::{append_path, combine_cluster_children};
use super::context::PlannerContext;
use super::join::{join_rows, populate_join_rel, JoinSpec};
use super::rel::RelSearchNode;
use super::QueryLevel;

type RelMap = AHashMap<Relids, RelSearchNode>;

fn get(rels: &RelMap, relids: Relids) -> Result<&RelSearchNode, PlannerError> {
    rels.get(&relids)
        .ok_or_else(|| PlannerError::NotFound(Entity::JoinLevel, format_smolstr!("{relids}")))
}

/// Ways to join `a` with `b` as `(outer, inner, spec)`: both orders for an
/// inner join, the one order the special join allows otherwise, nothing
/// when the pair would break a special join's boundaries.
fn join_orders(level: &QueryLevel<'_>, a: Relids, b: Relids) -> Vec<(Relids, Relids, JoinSpec)> {
    let joined = a.union(b);
    let mut matched = None;
    for sj in &level.query.special_joins {
        if !sj.rhs.overlaps(joined) || joined.is_subset_of(sj.rhs) {
            continue;
        }
        let whole = sj.lhs.union(sj.rhs);
        if whole.is_subset_of(a) || whole.is_subset_of(b) {
            continue;
        }
        let order = if sj.lhs.is_subset_of(a) && sj.rhs == b {
            (a, b, sj)
        } else if sj.lhs.is_subset_of(b) && sj.rhs == a {
            (b, a, sj)
        } else {
            return Vec::new();
        };
        if matched.is_some() {
            return Vec::new();
        }
        matched = Some(order);
    }
    match matched {
        Some((outer, inner, sj)) => vec![(
            outer,
            inner,
            JoinSpec {
                kind: sj.kind,
                clauses: sj.clauses.clone(),
                filters: level.join_clauses(outer, inner),
            },
        )],
        None => {
            let spec = |o, i| JoinSpec {
                kind: JoinKind::Inner,
                clauses: level.join_clauses(o, i),
                filters: Vec::new(),
            };
            vec![(a, b, spec(a, b)), (b, a, spec(b, a))]
        }
    }
}

fn connected(level: &QueryLevel<'_>, a: Relids, b: Relids) -> bool {
    !level.join_clauses(a, b).is_empty()
        || level.query.special_joins.iter().any(|sj| {
            let whole = sj.lhs.union(sj.rhs);
            whole.overlaps(a) && whole.overlaps(b)
        })
}

/// Partition keys of both append relations are equated by the join.
fn partition_keys_joined(
    level: &QueryLevel<'_>,
    spec: &JoinSpec,
    key: &[AttrNumber],
    outer: RelIndex,
    inner: RelIndex,
) -> bool {
    !key.is_empty()
        && key.iter().all(|attno| {
            let (o, i) = (ColumnRef::new(outer, *attno), ColumnRef::new(inner, *attno));
            let in_clauses = spec.clauses.iter().any(|c| {
                matches!(
                    c.as_joinable_equality().and_then(|(l, r)| Some((l.as_column()?, r.as_column()?))),
                    Some((l, r)) if (l == o && r == i) || (l == i && r == o)
                )
            });
            in_clauses || (spec.kind == JoinKind::Inner && level.ecs.are_equal(o, i))
        })
}

fn translate(exprs: &[Expr], moves: &[(RelIndex, RelIndex)]) -> Vec<Expr> {
    exprs
        .iter()
        .map(|e| {
            moves
                .iter()
                .fold(e.clone(), |acc, (from, to)| acc.replace_rel(*from, *to))
        })
        .collect()
}

/// Join two identically partitioned append relations child by child and
/// append the per-partition joins.
fn try_partitionwise(
    ctx: &PlannerContext<'_>,
    level: &QueryLevel<'_>,
    joinrel: &mut RelSearchNode,
    outer: &RelSearchNode,
    inner: &RelSearchNode,
    spec: &JoinSpec,
) -> Result<(), PlannerError> {
    let (Some(op), Some(ip)) = (&outer.partitioned, &inner.partitioned) else {
        return Ok(());
    };
    let (Some(opar), Some(ipar)) = (
        outer.relids.singleton_member(),
        inner.relids.singleton_member(),
    ) else {
        return Ok(());
    };
    if op.scheme != ip.scheme
        || op.children.len() != ip.children.len()
        || !partition_keys_joined(level, spec, &op.scheme.key, opar, ipar)
    {
        return Ok(());
    }
    let _guard = ctx.enter()?;
    tlog!(Debug, "partition-wise join"; "outer" => %outer.relids, "inner" => %inner.relids,
        "partitions" => op.children.len());

    let mut local = Vec::new();
    let mut cluster: Option<Vec<(Rc<Path>, Vec<(RelIndex, RelIndex)>)>> =
        ctx.cluster_ok().then(Vec::new);
    for (oc, ic) in op.children.iter().zip(&ip.children) {
        let (Some(ochild), Some(ichild)) =
            (oc.relids.singleton_member(), ic.relids.singleton_member())
        else {
            return Ok(());
        };
        let moves = [(opar, ochild), (ipar, ichild)];
        let child_spec = JoinSpec {
            kind: spec.kind,
            clauses: translate(&spec.clauses, &moves),
            filters: translate(&spec.filters, &moves),
        };
        let mut child = RelSearchNode::new(oc.relids.union(ic.relids));
        child.width = joinrel.width;
        child.rows = join_rows(spec.kind, oc.rows, ic.rows, &child_spec.all_quals());
        populate_join_rel(ctx, level, &mut child, oc, ic, &child_spec)?;
        child.set_cheapest();
        if child.is_dummy {
            continue;
        }
        let Some(best) = child.cheapest_total.clone() else {
            return Ok(());
        };
        local.push(best);
        cluster = cluster.and_then(|mut parts| {
            let best = child.cheapest_cluster_total.clone()?;
            parts.push((best, vec![(ochild, opar), (ichild, ipar)]));
            Some(parts)
        });
    }
    if local.is_empty() {
        return Ok(());
    }
    joinrel.add_path(append_path(joinrel, local, None))?;
    if let Some(parts) = cluster {
        if let Some(path) = combine_cluster_children(ctx, joinrel, parts) {
            joinrel.add_cluster_path(path)?;
        }
    }
    Ok(())
}

fn make_join_rel(
    ctx: &PlannerContext<'_>,
    level: &QueryLevel<'_>,
    rels: &mut RelMap,
    a: Relids,
    b: Relids,
) -> Result<Option<Relids>, PlannerError> {
    let orders = join_orders(level, a, b);
    let Some((first_outer, first_inner, first_spec)) = orders.first() else {
        return Ok(None);
    };
    let joined = a.union(b);
    let mut joinrel = match rels.remove(&joined) {
        Some(existing) => existing,
        None => {
            let (o, i) = (get(rels, *first_outer)?, get(rels, *first_inner)?);
            let mut fresh = RelSearchNode::new(joined);
            fresh.rows = join_rows(first_spec.kind, o.rows, i.rows, &first_spec.all_quals());
            fresh.width = match first_spec.kind {
                JoinKind::Semi | JoinKind::Anti => o.width,
                _ => o.width + i.width,
            };
            fresh
        }
    };
    for (outer, inner, spec) in &orders {
        let (o, i) = (get(rels, *outer)?, get(rels, *inner)?);
        populate_join_rel(ctx, level, &mut joinrel, o, i, spec)?;
    }
    if !joinrel.is_dummy {
        let (o, i) = (get(rels, *first_outer)?, get(rels, *first_inner)?);
        try_partitionwise(ctx, level, &mut joinrel, o, i, first_spec)?;
    }
    joinrel.set_cheapest();
    rels.insert(joined, joinrel);
    Ok(Some(joined))
}

fn join_level(
    ctx: &PlannerContext<'_>,
    level: &QueryLevel<'_>,
    rels: &mut RelMap,
    levels: &[Vec<Relids>],
    k: usize,
    cartesian: bool,
) -> Result<Vec<Relids>, PlannerError> {
    let mut built: Vec<Relids> = Vec::new();
    for j in 1..=k / 2 {
        for (ai, a) in levels[j].iter().enumerate() {
            for (bi, b) in levels[k - j].iter().enumerate() {
                if (j == k - j && bi <= ai) || a.overlaps(*b) {
                    continue;
                }
                if !cartesian && !connected(level, *a, *b) {
                    continue;
                }
                if let Some(joined) = make_join_rel(ctx, level, rels, *a, *b)? {
                    if !built.contains(&joined) {
                        built.try_reserve(1)?;
                        built.push(joined);
                    }
                }
            }
        }
    }
    Ok(built)
}

/// Find the cheapest ways to join all the relations of the level.
///
/// # Errors
/// - no legal join order exists for some level
/// - interrupts, out of memory
pub fn make_rel_from_joinlist(
    ctx: &PlannerContext<'_>,
    level: &QueryLevel<'_>,
    mut base: Vec<RelSearchNode>,
) -> Result<RelSearchNode, PlannerError> {
    let n = base.len();
    if n <= 1 {
        return base
            .pop()
            .ok_or_else(|| PlannerError::NoPlan("no relations to join".into()));
    }
    let mut rels = RelMap::with_capacity(1 << n.min(10));
    let mut levels: Vec<Vec<Relids>> = vec![Vec::new(); n + 1];
    for rel in base {
        levels[1].push(rel.relids);
        rels.insert(rel.relids, rel);
    }
    for k in 2..=n {
        ctx.check_for_interrupts()?;
        let mut built = join_level(ctx, level, &mut rels, &levels, k, false)?;
        if built.is_empty() {
            built = join_level(ctx, level, &mut rels, &levels, k, true)?;
        }
        if built.is_empty() {
            return Err(PlannerError::NoPlan(format_smolstr!(
                "no legal join order at level {k}"
            )));
        }
        if ctx.cluster_ok() {
            for relids in &built {
                if !get(&rels, *relids)?.has_cluster_paths() {
                    tlog!(Debug, "join relation withholds cluster paths"; "relids" => %relids);
                    ctx.disable_cluster("no distributed path for a join relation");
                }
            }
        }
        levels[k] = built;
    }
    let all = levels[1].iter().fold(Relids::empty(), |acc, r| acc.union(*r));
    rels.remove(&all)
        .ok_or_else(|| PlannerError::NoPlan(format_smolstr!("relations {all} can't be joined")))
}
