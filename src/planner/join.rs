//! Join paths: local methods and the cluster variants that move inputs
//! until matching rows meet on one node.

use std::rc::Rc;

use crate::distribution::reduce::{KeyColumns, PartitionMethod, ReduceInfo};
use crate::errors::PlannerError;
use crate::ir::expression::{ColumnRef, Expr};
use crate::ir::query::JoinKind;
use crate::ir::relids::Relids;
use crate::path::cost::{self, clamp_rows};
use crate::path::pathkeys::{pathkeys_contained_in, PathKey};
use crate::path::{JoinMethod, Path, PathKind, ReduceValidity};
use crate::topology::NodeList;

use super::context::PlannerContext;
use super::propagate::join_reduce;
use super::redistribute;
use super::rel::RelSearchNode;
use super::QueryLevel;

const DEFAULT_QUAL_SELECTIVITY: f64 = 1.0 / 3.0;

/// How two relations are joined.
#[derive(Clone, Debug)]
pub struct JoinSpec {
    pub kind: JoinKind,
    /// Join conditions. For outer, semi and anti joins these are the ON
    /// clauses only.
    pub clauses: Vec<Expr>,
    /// Qualifiers of the enclosing level evaluated over the join result.
    pub filters: Vec<Expr>,
}

impl JoinSpec {
    #[must_use]
    pub fn all_quals(&self) -> Vec<Expr> {
        self.clauses.iter().chain(&self.filters).cloned().collect()
    }
}

/// Column pair `(outer, inner)` of an equality between the two sides.
fn split_equality(clause: &Expr, outer: Relids, inner: Relids) -> Option<(ColumnRef, ColumnRef)> {
    let (l, r) = clause.as_joinable_equality()?;
    let (l, r) = (l.as_column()?, r.as_column()?);
    if outer.contains(l.rel) && inner.contains(r.rel) {
        Some((l, r))
    } else if outer.contains(r.rel) && inner.contains(l.rel) {
        Some((r, l))
    } else {
        None
    }
}

fn is_hashable(clause: &Expr) -> bool {
    matches!(clause, Expr::Op { op, .. } if op.hashjoinable) && clause.as_joinable_equality().is_some()
}

fn is_mergeable(clause: &Expr) -> bool {
    matches!(clause, Expr::Op { op, .. } if op.mergejoinable) && clause.as_joinable_equality().is_some()
}

/// Estimated output rows of the join.
#[must_use]
pub fn join_rows(kind: JoinKind, outer_rows: f64, inner_rows: f64, quals: &[Expr]) -> f64 {
    if outer_rows <= 0.0 && !matches!(kind, JoinKind::Full) {
        return 0.0;
    }
    let sel: f64 = quals
        .iter()
        .map(|q| {
            if q.as_joinable_equality().is_some() {
                1.0 / outer_rows.max(inner_rows).max(1.0)
            } else {
                DEFAULT_QUAL_SELECTIVITY
            }
        })
        .product();
    let matched = outer_rows * inner_rows * sel;
    let rows = match kind {
        JoinKind::Inner => matched,
        JoinKind::Left => matched.max(outer_rows),
        JoinKind::Full => matched.max(outer_rows).max(inner_rows),
        JoinKind::Semi => outer_rows * (inner_rows * sel).min(1.0),
        JoinKind::Anti => outer_rows * (1.0 - (inner_rows * sel).min(1.0)),
    };
    if rows <= 0.0 {
        0.0
    } else {
        clamp_rows(rows)
    }
}

/// Explicit sort of `input` unless it is already ordered that way.
#[must_use]
pub fn sorted(ctx: &PlannerContext<'_>, input: &Rc<Path>, keys: &[PathKey]) -> Rc<Path> {
    if keys.is_empty() || pathkeys_contained_in(keys, &input.pathkeys) {
        return Rc::clone(input);
    }
    let cost = cost::sort(ctx.cost(), input.cost(), input.rows_per_node());
    let mut path = Path::wrap(
        PathKind::Sort {
            keys: keys.to_vec(),
            input: Rc::clone(input),
        },
        input,
    )
    .with_cost(cost);
    path.pathkeys = keys.to_vec();
    path.rc()
}

struct JoinBuilder<'a, 'c> {
    ctx: &'a PlannerContext<'c>,
    joinrel: &'a RelSearchNode,
    spec: &'a JoinSpec,
    quals: Vec<Expr>,
}

impl JoinBuilder<'_, '_> {
    fn make(
        &self,
        method: JoinMethod,
        outer: &Rc<Path>,
        inner: &Rc<Path>,
        pathkeys: Vec<PathKey>,
        reduce: Option<ReduceInfo>,
    ) -> Path {
        let p = self.ctx.cost();
        let (orows, irows) = (outer.rows_per_node(), inner.rows_per_node());
        let degree = reduce.as_ref().map_or(1.0, ReduceInfo::degree);
        let out_rows = self.joinrel.rows / degree;
        let nclauses = self.quals.len();
        let cost = match method {
            JoinMethod::NestLoop => cost::nestloop(
                p,
                outer.cost(),
                orows,
                inner.cost(),
                irows,
                out_rows,
                nclauses,
                inner.is_parameterized(),
            ),
            JoinMethod::Hash => {
                cost::hashjoin(p, outer.cost(), orows, inner.cost(), irows, out_rows, nclauses)
            }
            JoinMethod::Merge => {
                cost::mergejoin(p, outer.cost(), orows, inner.cost(), irows, out_rows)
            }
        };
        let validity = if reduce.is_some() {
            ReduceValidity::Computed
        } else {
            ReduceValidity::NotComputed
        };
        Path {
            kind: PathKind::Join {
                method,
                kind: self.spec.kind,
                outer: Rc::clone(outer),
                inner: Rc::clone(inner),
                clauses: self.quals.clone(),
            },
            parent: self.joinrel.relids,
            rows: self.joinrel.rows,
            width: self.joinrel.width,
            startup_cost: cost.startup,
            total_cost: cost.total,
            pathkeys,
            param_rels: outer
                .param_rels
                .union(inner.param_rels)
                .difference(self.joinrel.relids),
            reduce,
            validity,
        }
    }

    /// Every local join method applicable to the input pair.
    fn methods(&self, outer: &Rc<Path>, inner: &Rc<Path>, reduce: Option<&ReduceInfo>) -> Vec<Path> {
        let kind = self.spec.kind;
        let mut out = Vec::new();
        let param_inner = inner.is_parameterized();
        if kind != JoinKind::Full {
            out.push(self.make(
                JoinMethod::NestLoop,
                outer,
                inner,
                outer.pathkeys.clone(),
                reduce.cloned(),
            ));
        }
        if param_inner {
            return out;
        }
        if self.spec.clauses.iter().any(is_hashable) {
            out.push(self.make(JoinMethod::Hash, outer, inner, Vec::new(), reduce.cloned()));
        }
        let merge_key = self
            .spec
            .clauses
            .iter()
            .filter(|c| is_mergeable(c))
            .find_map(|c| split_equality(c, outer.parent, inner.parent));
        if let Some((ok, ik)) = merge_key {
            let outer_keys = vec![PathKey::asc(ok)];
            let o = sorted(self.ctx, outer, &outer_keys);
            let i = sorted(self.ctx, inner, &[PathKey::asc(ik)]);
            out.push(self.make(JoinMethod::Merge, &o, &i, outer_keys, reduce.cloned()));
        }
        out
    }
}

/// Column of `side` the join makes equal to `col`.
fn matching_column(
    level: &QueryLevel<'_>,
    spec: &JoinSpec,
    col: ColumnRef,
    side: Relids,
) -> Option<ColumnRef> {
    let from_clauses = spec.clauses.iter().find_map(|c| {
        let (l, r) = c.as_joinable_equality()?;
        match (l.as_column()?, r.as_column()?) {
            (a, b) if a == col && side.contains(b.rel) => Some(b),
            (a, b) if b == col && side.contains(a.rel) => Some(a),
            _ => None,
        }
    });
    if from_clauses.is_some() || spec.kind != JoinKind::Inner {
        return from_clauses;
    }
    let class = level.ecs.class_of(col)?;
    level.ecs.classes()[class]
        .members
        .iter()
        .find(|m| side.contains(m.rel))
        .copied()
}

/// Move `mover` to the placement rule of `anchor` keyed by the columns
/// the join equates with the anchor's keys.
fn follow_placement(
    ctx: &PlannerContext<'_>,
    level: &QueryLevel<'_>,
    spec: &JoinSpec,
    anchor: &Path,
    mover: &Rc<Path>,
) -> Option<Rc<Path>> {
    let reduce = anchor.reduce.as_ref()?;
    let method = reduce.method()?;
    let keys = reduce
        .keys()?
        .iter()
        .map(|k| matching_column(level, spec, *k, mover.parent))
        .collect::<Option<KeyColumns>>()?;
    redistribute::reduce_to_value(ctx, mover, method, keys, reduce.nodes.clone())
}

fn replicated_targets(path: &Path) -> Option<NodeList> {
    let reduce = path.reduce.as_ref()?;
    if reduce.is_coordinator() {
        return None;
    }
    Some(reduce.effective_nodes())
}

/// Input pairs for a cluster join, moved as needed, with the resulting
/// distribution.
fn cluster_inputs(
    ctx: &PlannerContext<'_>,
    level: &QueryLevel<'_>,
    spec: &JoinSpec,
    outer: &Rc<Path>,
    inner: &Rc<Path>,
) -> Vec<(Rc<Path>, Rc<Path>, ReduceInfo)> {
    let (Some(oreduce), Some(ireduce)) = (&outer.reduce, &inner.reduce) else {
        return Vec::new();
    };
    // An empty side never has to move: the join result lives where the
    // other side is, or nowhere.
    if inner.is_dummy() {
        return vec![(Rc::clone(outer), Rc::clone(inner), oreduce.clone())];
    }
    if outer.is_dummy() {
        return vec![(Rc::clone(outer), Rc::clone(inner), ireduce.clone())];
    }
    if let Some(r) = join_reduce(oreduce, ireduce, spec.kind, &spec.clauses, &level.ecs) {
        return vec![(Rc::clone(outer), Rc::clone(inner), r)];
    }
    if outer.is_parameterized() || inner.is_parameterized() {
        return Vec::new();
    }

    let mut moved: Vec<(Rc<Path>, Rc<Path>)> = Vec::new();
    if let Some(i) = follow_placement(ctx, level, spec, outer, inner) {
        moved.push((Rc::clone(outer), i));
    }
    if let Some(o) = follow_placement(ctx, level, spec, inner, outer) {
        moved.push((o, Rc::clone(inner)));
    }
    // Neither side is placed by the join key: hash both over all nodes.
    if let Some((ok, ik)) = spec
        .clauses
        .iter()
        .find_map(|c| split_equality(c, outer.parent, inner.parent))
    {
        let nodes = ctx.data_nodes.clone();
        let o = redistribute::reduce_to_value(
            ctx,
            outer,
            PartitionMethod::Hash,
            std::iter::once(ok).collect(),
            nodes.clone(),
        );
        let i = redistribute::reduce_to_value(
            ctx,
            inner,
            PartitionMethod::Hash,
            std::iter::once(ik).collect(),
            nodes,
        );
        if let (Some(o), Some(i)) = (o, i) {
            moved.push((o, i));
        }
    }
    if spec.kind != JoinKind::Full {
        if let Some(targets) = replicated_targets(outer) {
            if let Some(i) = redistribute::reduce_to_replicate(ctx, inner, &targets) {
                moved.push((Rc::clone(outer), i));
            }
        }
    }
    if spec.kind == JoinKind::Inner {
        if let Some(targets) = replicated_targets(inner) {
            if let Some(o) = redistribute::reduce_to_replicate(ctx, outer, &targets) {
                moved.push((o, Rc::clone(inner)));
            }
        }
    }
    if let (Some(o), Some(i)) = (
        redistribute::reduce_to_coordinator(ctx, outer),
        redistribute::reduce_to_coordinator(ctx, inner),
    ) {
        moved.push((o, i));
    }

    moved
        .into_iter()
        .filter_map(|(o, i)| {
            let (or, ir) = (o.reduce.as_ref()?, i.reduce.as_ref()?);
            let r = join_reduce(or, ir, spec.kind, &spec.clauses, &level.ecs)?;
            Some((o, i, r))
        })
        .collect()
}

/// Join is empty whatever the inputs hold.
#[must_use]
pub fn join_is_empty(kind: JoinKind, outer: &RelSearchNode, inner: &RelSearchNode) -> bool {
    match kind {
        JoinKind::Inner | JoinKind::Semi => outer.is_dummy || inner.is_dummy,
        JoinKind::Left | JoinKind::Anti => outer.is_dummy,
        JoinKind::Full => outer.is_dummy && inner.is_dummy,
    }
}

/// Add the paths joining `outer` with `inner` to `joinrel`: local paths
/// from every method and, while cluster planning is on, cluster paths
/// whose inputs were moved as needed.
///
/// # Errors
/// - out of memory
pub fn populate_join_rel(
    ctx: &PlannerContext<'_>,
    level: &QueryLevel<'_>,
    joinrel: &mut RelSearchNode,
    outer: &RelSearchNode,
    inner: &RelSearchNode,
    spec: &JoinSpec,
) -> Result<(), PlannerError> {
    if joinrel.is_dummy {
        return Ok(());
    }
    if join_is_empty(spec.kind, outer, inner) {
        joinrel.set_dummy(ctx.dummy_reduce());
        return Ok(());
    }

    let mut local = Vec::new();
    let mut cluster = Vec::new();
    {
        let builder = JoinBuilder {
            ctx,
            joinrel,
            spec,
            quals: spec.all_quals(),
        };

        let mut inner_local = inner.local_candidates();
        inner_local.extend(
            inner
                .parameterized_paths(false)
                .into_iter()
                .filter(|p| p.param_rels.is_subset_of(outer.relids)),
        );
        for o in outer.local_candidates() {
            for i in &inner_local {
                if i.is_parameterized() && spec.kind == JoinKind::Full {
                    continue;
                }
                local.extend(builder.methods(&o, i, None));
            }
        }

        if ctx.cluster_ok() {
            let mut inner_cluster = inner.cluster_candidates();
            inner_cluster.extend(
                inner
                    .parameterized_paths(true)
                    .into_iter()
                    .filter(|p| p.param_rels.is_subset_of(outer.relids)),
            );
            for o in outer.cluster_candidates() {
                for i in &inner_cluster {
                    if i.is_parameterized() && spec.kind == JoinKind::Full {
                        continue;
                    }
                    for (mo, mi, reduce) in cluster_inputs(ctx, level, spec, &o, i) {
                        cluster.extend(builder.methods(&mo, &mi, Some(&reduce)));
                    }
                }
            }
        }
    }
    for path in local {
        joinrel.add_path(path)?;
    }
    for path in cluster {
        joinrel.add_cluster_path(path)?;
    }
    Ok(())
}
