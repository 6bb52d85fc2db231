//! Distribution of join and append outputs computed from their inputs.

use itertools::Itertools;

use crate::distribution::reduce::{ReduceInfo, ReduceKind};
use crate::ir::equivalence::EquivalenceClasses;
use crate::ir::expression::{ColumnRef, Expr};
use crate::ir::query::JoinKind;
use crate::topology::{NodeList, NodeOid};

fn intersect(a: &[NodeOid], b: &[NodeOid]) -> NodeList {
    a.iter().copied().filter(|n| b.contains(n)).collect()
}

fn covers(outer: &ReduceInfo, inner: &ReduceInfo) -> bool {
    let have = outer.effective_nodes();
    inner.effective_nodes().iter().all(|n| have.contains(n))
}

/// Column equality `a = b` present among the join clauses.
fn clause_links(clauses: &[Expr], a: ColumnRef, b: ColumnRef) -> bool {
    clauses.iter().any(|c| {
        let Some((l, r)) = c.as_joinable_equality() else {
            return false;
        };
        matches!(
            (l.as_column(), r.as_column()),
            (Some(x), Some(y)) if (x == a && y == b) || (x == b && y == a)
        )
    })
}

/// Both sides are placed by the same rule over the same node list and the
/// join equates their keys pairwise, so matching rows meet on one node.
fn keys_collocated(
    outer: &ReduceInfo,
    inner: &ReduceInfo,
    kind: JoinKind,
    clauses: &[Expr],
    ecs: &EquivalenceClasses,
) -> bool {
    let (Some(om), Some(im)) = (outer.method(), inner.method()) else {
        return false;
    };
    let (Some(ok), Some(ik)) = (outer.keys(), inner.keys()) else {
        return false;
    };
    if om != im || outer.nodes != inner.nodes || ok.len() != ik.len() {
        return false;
    }
    ok.iter().zip(ik).all(|(o, i)| {
        clause_links(clauses, *o, *i) || (kind == JoinKind::Inner && ecs.are_equal(*o, *i))
    })
}

/// Distribution of a join executed where its inputs already are, or `None`
/// when matching rows may live on different nodes and one side has to
/// move. Dummy inputs are handled by the caller.
#[must_use]
pub fn join_reduce(
    outer: &ReduceInfo,
    inner: &ReduceInfo,
    kind: JoinKind,
    clauses: &[Expr],
    ecs: &EquivalenceClasses,
) -> Option<ReduceInfo> {
    if outer.is_coordinator() || inner.is_coordinator() {
        return (outer.is_coordinator() && inner.is_coordinator())
            .then(ReduceInfo::coordinator);
    }

    if outer.is_replicated_like() && inner.is_replicated_like() {
        let common = intersect(&outer.effective_nodes(), &inner.effective_nodes());
        if common.is_empty() {
            return None;
        }
        let both_static = matches!(outer.kind, ReduceKind::Replicated)
            && matches!(inner.kind, ReduceKind::Replicated);
        return Some(if both_static {
            ReduceInfo::replicated(common)
        } else {
            ReduceInfo::final_replicate(common)
        });
    }

    if keys_collocated(outer, inner, kind, clauses, ecs) {
        let exclude: NodeList = match kind {
            JoinKind::Inner | JoinKind::Semi => {
                outer.exclude.iter().chain(&inner.exclude).copied().collect()
            }
            JoinKind::Left | JoinKind::Anti => outer.exclude.clone(),
            JoinKind::Full => intersect(&outer.exclude, &inner.exclude),
        };
        let mut reduce = outer.clone().with_exclude(exclude);
        if kind == JoinKind::Full {
            // null-extended rows of the inner side break the placement rule
            reduce.kind = ReduceKind::Random;
        }
        return Some(reduce);
    }

    // Replicated inner: every node sees the whole inner side.
    if inner.is_replicated_like() && kind != JoinKind::Full && covers(inner, outer) {
        return Some(outer.clone());
    }
    if outer.is_replicated_like() && kind == JoinKind::Inner && covers(outer, inner) {
        return Some(inner.clone());
    }

    if let (Some(o), Some(i)) = (outer.single_node(), inner.single_node()) {
        if o == i && !outer.is_replicated_like() && !inner.is_replicated_like() {
            return Some(if kind == JoinKind::Full {
                ReduceInfo::random(std::iter::once(o).collect())
            } else {
                outer.clone()
            });
        }
    }
    None
}

/// Distribution of an append of children with the given distributions.
/// `None` means the children can't be combined where they are: some of
/// them sit on the coordinator while others don't. A `Random` result over
/// replicated children is only correct once each of them is restricted to
/// one node, which the caller does.
#[must_use]
pub fn append_reduce(children: &[&ReduceInfo]) -> Option<ReduceInfo> {
    let (first, rest) = children.split_first()?;
    if children.iter().all(|c| c.is_coordinator()) {
        return Some(ReduceInfo::coordinator());
    }
    if children.iter().any(|c| c.is_coordinator()) {
        return None;
    }

    if let ReduceKind::ByValue { method, keys } = &first.kind {
        let same_rule = rest.iter().all(|c| {
            c.method() == Some(*method) && c.keys() == Some(keys.as_slice()) && c.nodes == first.nodes
        });
        if same_rule {
            let exclude = rest
                .iter()
                .fold(first.exclude.clone(), |acc, c| intersect(&acc, &c.exclude));
            return Some((*first).clone().with_exclude(exclude));
        }
    }

    if children.iter().all(|c| matches!(c.kind, ReduceKind::Replicated)) {
        let common = rest
            .iter()
            .fold(first.effective_nodes(), |acc, c| intersect(&acc, &c.effective_nodes()));
        if !common.is_empty() {
            return Some(ReduceInfo::replicated(common));
        }
    }

    let nodes: NodeList = children
        .iter()
        .flat_map(|c| c.effective_nodes())
        .unique()
        .collect();
    Some(ReduceInfo::random(nodes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::reduce::PartitionMethod;
    use crate::ir::expression::ParamValues;
    use pretty_assertions::assert_eq;
    use smallvec::smallvec;

    fn hashed(rel: usize, attno: u16) -> ReduceInfo {
        ReduceInfo::by_value(
            PartitionMethod::Hash,
            smallvec![ColumnRef::new(rel, attno)],
            smallvec![1, 2, 3],
        )
    }

    #[test]
    fn collocated_only_on_partition_keys() {
        let on_keys = vec![Expr::eq(Expr::col(0, 1), Expr::col(1, 1))];
        let ecs = EquivalenceClasses::build(&on_keys, &ParamValues::new());
        let joined = join_reduce(&hashed(0, 1), &hashed(1, 1), JoinKind::Inner, &[], &ecs);
        assert_eq!(joined, Some(hashed(0, 1)));

        // same placement, but the join isn't on the partition columns
        let off_keys = vec![Expr::eq(Expr::col(0, 2), Expr::col(1, 1))];
        let ecs = EquivalenceClasses::build(&off_keys, &ParamValues::new());
        assert_eq!(
            join_reduce(&hashed(0, 1), &hashed(1, 1), JoinKind::Inner, &off_keys, &ecs),
            None
        );

        // outer joins need the equality in their own clauses
        let ecs = EquivalenceClasses::default();
        assert_eq!(
            join_reduce(&hashed(0, 1), &hashed(1, 1), JoinKind::Left, &on_keys, &ecs),
            Some(hashed(0, 1))
        );
        assert_eq!(
            join_reduce(&hashed(0, 1), &hashed(1, 1), JoinKind::Left, &[], &ecs),
            None
        );
    }

    #[test]
    fn replicated_side_stays() {
        let ecs = EquivalenceClasses::default();
        let rep = ReduceInfo::replicated(smallvec![3, 2, 1]);
        assert_eq!(
            join_reduce(&hashed(0, 1), &rep, JoinKind::Left, &[], &ecs),
            Some(hashed(0, 1))
        );
        // replicated outer of a left join would null-extend on every node
        assert_eq!(join_reduce(&rep, &hashed(0, 1), JoinKind::Left, &[], &ecs), None);
        assert_eq!(
            join_reduce(&rep, &hashed(0, 1), JoinKind::Inner, &[], &ecs),
            Some(hashed(0, 1))
        );
        // a replica that misses some node of the other side doesn't help
        let partial = ReduceInfo::replicated(smallvec![1, 2]);
        assert_eq!(join_reduce(&hashed(0, 1), &partial, JoinKind::Inner, &[], &ecs), None);
        assert_eq!(
            join_reduce(&rep, &partial, JoinKind::Inner, &[], &ecs),
            Some(ReduceInfo::replicated(smallvec![2, 1]))
        );
    }

    #[test]
    fn coordinator_joins_only_coordinator() {
        let ecs = EquivalenceClasses::default();
        let coord = ReduceInfo::coordinator();
        assert_eq!(
            join_reduce(&coord, &coord, JoinKind::Full, &[], &ecs),
            Some(ReduceInfo::coordinator())
        );
        assert_eq!(join_reduce(&coord, &hashed(0, 1), JoinKind::Inner, &[], &ecs), None);
    }

    #[test]
    fn append_children() {
        let a = hashed(0, 1);
        let b = hashed(0, 1).with_exclude(smallvec![2]);
        assert_eq!(append_reduce(&[&a, &b]), Some(a.clone()));

        let c = hashed(0, 2);
        assert_eq!(
            append_reduce(&[&b, &c]),
            Some(ReduceInfo::random(smallvec![1, 3, 2]))
        );

        let r1 = ReduceInfo::replicated(smallvec![1, 2]);
        let r2 = ReduceInfo::replicated(smallvec![2, 3]);
        assert_eq!(
            append_reduce(&[&r1, &r2]),
            Some(ReduceInfo::replicated(smallvec![2]))
        );
        assert_eq!(append_reduce(&[&a, &ReduceInfo::coordinator()]), None);
        assert_eq!(append_reduce(&[]), None);
    }
}
