//! Sort orderings of path outputs.

use crate::ir::expression::{ColumnRef, Expr};
use crate::ir::query::{SortKey, TargetEntry};
use crate::ir::relids::RelIndex;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PathKey {
    pub column: ColumnRef,
    pub descending: bool,
}

impl PathKey {
    #[must_use]
    pub fn asc(column: ColumnRef) -> Self {
        PathKey {
            column,
            descending: false,
        }
    }
}

impl std::fmt::Display for PathKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.descending {
            write!(f, "{} DESC", self.column)
        } else {
            write!(f, "{}", self.column)
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PathKeysComparison {
    Equal,
    /// The first ordering is a strict extension of the second one.
    Better1,
    Better2,
    Different,
}

#[must_use]
pub fn compare_pathkeys(a: &[PathKey], b: &[PathKey]) -> PathKeysComparison {
    let common = a.len().min(b.len());
    if a[..common] != b[..common] {
        return PathKeysComparison::Different;
    }
    match a.len().cmp(&b.len()) {
        std::cmp::Ordering::Equal => PathKeysComparison::Equal,
        std::cmp::Ordering::Greater => PathKeysComparison::Better1,
        std::cmp::Ordering::Less => PathKeysComparison::Better2,
    }
}

/// `have` satisfies the `needed` ordering.
#[must_use]
pub fn pathkeys_contained_in(needed: &[PathKey], have: &[PathKey]) -> bool {
    matches!(
        compare_pathkeys(needed, have),
        PathKeysComparison::Equal | PathKeysComparison::Better2
    )
}

#[must_use]
pub fn from_sort_clause(sort: &[SortKey]) -> Vec<PathKey> {
    sort.iter()
        .map(|s| PathKey {
            column: s.column,
            descending: s.descending,
        })
        .collect()
}

#[must_use]
pub fn rename_rel(keys: &[PathKey], from: RelIndex, to: RelIndex) -> Vec<PathKey> {
    keys.iter()
        .map(|k| {
            let mut k = *k;
            if k.column.rel == from {
                k.column.rel = to;
            }
            k
        })
        .collect()
}

/// Ordering of a subquery output scanned as `rel`. The ordering is cut at
/// the first key that is not projected.
#[must_use]
pub fn remap_through(keys: &[PathKey], target: &[TargetEntry], rel: RelIndex) -> Vec<PathKey> {
    let mut remapped = Vec::with_capacity(keys.len());
    for key in keys {
        let pos = target
            .iter()
            .position(|t| matches!(&t.expr, Expr::Column(c) if *c == key.column));
        let Some(attno) = pos.and_then(|p| u16::try_from(p + 1).ok()) else {
            break;
        };
        remapped.push(PathKey {
            column: ColumnRef::new(rel, attno),
            descending: key.descending,
        });
    }
    remapped
}
