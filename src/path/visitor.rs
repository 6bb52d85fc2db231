//! Generic traversal of path trees.

use smallvec::SmallVec;
use std::rc::Rc;

use super::{Path, PathKind};

impl Path {
    /// Direct inputs in execution order (outer before inner).
    #[must_use]
    pub fn children(&self) -> SmallVec<[&Rc<Path>; 2]> {
        let mut out = SmallVec::new();
        match &self.kind {
            PathKind::Dummy
            | PathKind::Scan { .. }
            | PathKind::WorkTableScan { .. }
            | PathKind::TuplestoreScan { .. } => {}
            PathKind::Join { outer, inner, .. } => {
                out.push(outer);
                out.push(inner);
            }
            PathKind::Append { children } | PathKind::MergeAppend { children } => {
                out.extend(children.iter());
            }
            PathKind::SubqueryScan { input, .. }
            | PathKind::CteScan { input, .. }
            | PathKind::Redistribute { input, .. }
            | PathKind::Gather { input, .. }
            | PathKind::Sort { input, .. }
            | PathKind::Projection { input, .. }
            | PathKind::Aggregate { input, .. }
            | PathKind::Limit { input, .. } => out.push(input),
        }
        out
    }

    /// Post-order fold: `f` receives a node and the folded values of its
    /// children.
    pub fn fold<T>(&self, f: &mut impl FnMut(&Path, Vec<T>) -> T) -> T {
        let folded = self.children().iter().map(|c| c.fold(f)).collect();
        f(self, folded)
    }

    /// Number of nodes matching `pred`.
    pub fn count(&self, pred: &mut impl FnMut(&Path) -> bool) -> usize {
        self.fold(&mut |p, children: Vec<usize>| {
            children.into_iter().sum::<usize>() + usize::from(pred(p))
        })
    }

    /// Pre-order search.
    pub fn any(&self, pred: &mut impl FnMut(&Path) -> bool) -> bool {
        if pred(self) {
            return true;
        }
        self.children().iter().any(|c| c.any(pred))
    }

    /// Copy of the node with its inputs replaced, in [`Path::children`]
    /// order. Missing replacements keep the old input.
    #[must_use]
    pub fn with_children(&self, children: Vec<Rc<Path>>) -> Path {
        let mut copy = self.clone();
        let mut it = children.into_iter();
        let mut replace = |slot: &mut Rc<Path>| {
            if let Some(c) = it.next() {
                *slot = c;
            }
        };
        match &mut copy.kind {
            PathKind::Dummy
            | PathKind::Scan { .. }
            | PathKind::WorkTableScan { .. }
            | PathKind::TuplestoreScan { .. } => {}
            PathKind::Join { outer, inner, .. } => {
                replace(outer);
                replace(inner);
            }
            PathKind::Append { children } | PathKind::MergeAppend { children } => {
                children.iter_mut().for_each(&mut replace);
            }
            PathKind::SubqueryScan { input, .. }
            | PathKind::CteScan { input, .. }
            | PathKind::Redistribute { input, .. }
            | PathKind::Gather { input, .. }
            | PathKind::Sort { input, .. }
            | PathKind::Projection { input, .. }
            | PathKind::Aggregate { input, .. }
            | PathKind::Limit { input, .. } => replace(input),
        }
        copy
    }
}

/// Rebuild the tree bottom-up. `f` may return a replacement for a node
/// (after its inputs were rebuilt); untouched subtrees are shared.
pub fn map_tree(path: &Rc<Path>, f: &mut impl FnMut(&Path) -> Option<Path>) -> Rc<Path> {
    let old_children = path.children();
    let new_children: Vec<Rc<Path>> = old_children.iter().map(|c| map_tree(c, f)).collect();
    let changed = old_children
        .iter()
        .zip(&new_children)
        .any(|(old, new)| !Rc::ptr_eq(old, new));
    let node = if changed {
        Rc::new(path.with_children(new_children))
    } else {
        Rc::clone(path)
    };
    match f(&node) {
        Some(replacement) => Rc::new(replacement),
        None => node,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::reduce::ReduceInfo;
    use crate::ir::relids::Relids;
    use crate::path::{Redistribution, ReduceValidity};
    use pretty_assertions::assert_eq;

    fn leaf(rel: usize) -> Rc<Path> {
        Path::dummy(Relids::single(rel), 8.0, None).rc()
    }

    #[test]
    fn fold_and_rebuild() {
        let append = Path {
            kind: PathKind::Append {
                children: vec![leaf(0), leaf(1)],
            },
            ..Path::dummy(Relids::from_slice(&[0, 1]), 8.0, None)
        }
        .rc();
        let gather = Path::wrap(
            PathKind::Redistribute {
                op: Redistribution::ToCoordinator { merge: false },
                input: Rc::clone(&append),
            },
            &append,
        )
        .rc();
        assert_eq!(gather.count(&mut |_| true), 4);
        assert_eq!(gather.network_round_trips(), 1);

        // nothing replaced: the very same tree comes back
        let same = map_tree(&gather, &mut |_| None);
        assert!(Rc::ptr_eq(&same, &gather));

        // replace leaves: every ancestor is copied
        let marked = map_tree(&gather, &mut |p| {
            p.is_dummy().then(|| {
                p.clone()
                    .with_reduce(ReduceInfo::coordinator(), ReduceValidity::Computed)
            })
        });
        assert!(!Rc::ptr_eq(&marked, &gather));
        let marked_leaves = marked.count(&mut |p| p.is_dummy() && p.reduce.is_some());
        assert_eq!(marked_leaves, 2);
    }
}
