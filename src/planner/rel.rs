//! Relation search nodes and their path lists.

use std::cmp::Ordering;
use std::rc::Rc;

use crate::distribution::reduce::ReduceInfo;
use crate::errors::PlannerError;
use crate::ir::expression::Expr;
use crate::ir::query::PartitionScheme;
use crate::ir::relids::Relids;
use crate::path::pathkeys::pathkeys_contained_in;
use crate::path::Path;

/// Relative cost difference below which two paths cost the same.
const FUZZ_FACTOR: f64 = 1.01;

/// Children of a partitioned relation, in partition bound order.
#[derive(Debug, Clone)]
pub struct PartitionedRel {
    pub scheme: PartitionScheme,
    pub children: Vec<RelSearchNode>,
}

/// Everything the search knows about one relation or join relation: its
/// size estimate and two parallel path lists, one with local-only paths
/// and one with paths carrying a distribution descriptor.
#[derive(Debug, Clone, Default)]
pub struct RelSearchNode {
    pub relids: Relids,
    pub rows: f64,
    pub width: f64,
    pub restrictions: Vec<Expr>,
    pub pathlist: Vec<Rc<Path>>,
    pub partial_pathlist: Vec<Rc<Path>>,
    pub cluster_pathlist: Vec<Rc<Path>>,
    pub cluster_partial_pathlist: Vec<Rc<Path>>,
    pub cheapest_total: Option<Rc<Path>>,
    pub cheapest_cluster_total: Option<Rc<Path>>,
    pub is_dummy: bool,
    pub partitioned: Option<PartitionedRel>,
}

fn fuzzy_cmp(a: f64, b: f64) -> Ordering {
    if a > b * FUZZ_FACTOR {
        Ordering::Greater
    } else if b > a * FUZZ_FACTOR {
        Ordering::Less
    } else {
        Ordering::Equal
    }
}

/// `a` is at least as good as `b` in every dimension the search cares
/// about. Paths with different distributions never dominate each other.
fn dominates(a: &Path, b: &Path) -> bool {
    fuzzy_cmp(a.total_cost, b.total_cost) != Ordering::Greater
        && fuzzy_cmp(a.startup_cost, b.startup_cost) != Ordering::Greater
        && pathkeys_contained_in(&b.pathkeys, &a.pathkeys)
        && a.param_rels.is_subset_of(b.param_rels)
        && a.rows <= b.rows
        && match (&a.reduce, &b.reduce) {
            (None, None) => true,
            (Some(x), Some(y)) => x.equal(y),
            _ => false,
        }
}

/// Of two mutually dominating paths, the cheaper one wins; on an exact
/// cost tie the one with fewer network round trips does.
fn prefer_first(a: &Path, b: &Path) -> bool {
    match a.total_cost.partial_cmp(&b.total_cost) {
        Some(Ordering::Less) => true,
        Some(Ordering::Greater) => false,
        _ => a.network_round_trips() <= b.network_round_trips(),
    }
}

/// Insert `path` into `list` unless some path there dominates it; drop the
/// paths it dominates.
///
/// # Errors
/// - out of memory
pub fn add_path_to(list: &mut Vec<Rc<Path>>, path: Rc<Path>) -> Result<(), PlannerError> {
    let mut i = 0;
    while i < list.len() {
        let old = &list[i];
        let new_wins = dominates(&path, old);
        let old_wins = dominates(old, &path);
        match (new_wins, old_wins) {
            (true, true) => {
                if prefer_first(&path, old) {
                    list.remove(i);
                    continue;
                }
                return Ok(());
            }
            (true, false) => {
                list.remove(i);
                continue;
            }
            (false, true) => return Ok(()),
            (false, false) => {}
        }
        i += 1;
    }
    list.try_reserve(1)?;
    list.push(path);
    Ok(())
}

fn cheapest(list: &[Rc<Path>]) -> Option<Rc<Path>> {
    list.iter()
        .filter(|p| !p.is_parameterized())
        .min_by(|a, b| {
            a.total_cost
                .partial_cmp(&b.total_cost)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.network_round_trips().cmp(&b.network_round_trips()))
        })
        .cloned()
}

impl RelSearchNode {
    #[must_use]
    pub fn new(relids: Relids) -> Self {
        RelSearchNode {
            relids,
            ..RelSearchNode::default()
        }
    }

    /// # Errors
    /// - out of memory
    pub fn add_path(&mut self, path: Path) -> Result<(), PlannerError> {
        add_path_to(&mut self.pathlist, path.rc())
    }

    /// Partial paths produce a share of the rows per worker and only become
    /// usable under a Gather.
    ///
    /// # Errors
    /// - out of memory
    pub fn add_partial_path(&mut self, path: Path) -> Result<(), PlannerError> {
        add_path_to(&mut self.partial_pathlist, path.rc())
    }

    /// # Errors
    /// - out of memory
    pub fn add_cluster_path(&mut self, path: Path) -> Result<(), PlannerError> {
        debug_assert!(path.reduce.is_some(), "cluster path without distribution");
        add_path_to(&mut self.cluster_pathlist, path.rc())
    }

    /// # Errors
    /// - out of memory
    pub fn add_cluster_partial_path(&mut self, path: Path) -> Result<(), PlannerError> {
        add_path_to(&mut self.cluster_partial_pathlist, path.rc())
    }

    /// Pick the cheapest paths of both lists.
    pub fn set_cheapest(&mut self) {
        self.cheapest_total = cheapest(&self.pathlist);
        self.cheapest_cluster_total = cheapest(&self.cluster_pathlist);
    }

    /// The relation is proven empty: both path lists collapse to a single
    /// zero-row path. `cluster_reduce` is `None` when cluster planning is
    /// off.
    pub fn set_dummy(&mut self, cluster_reduce: Option<ReduceInfo>) {
        self.is_dummy = true;
        self.rows = 0.0;
        self.pathlist = vec![Path::dummy(self.relids, self.width, None).rc()];
        self.partial_pathlist.clear();
        self.cluster_partial_pathlist.clear();
        self.cluster_pathlist = cluster_reduce
            .map(|r| Path::dummy(self.relids, self.width, Some(r)).rc())
            .into_iter()
            .collect();
        self.partitioned = None;
        self.set_cheapest();
    }

    #[must_use]
    pub fn has_cluster_paths(&self) -> bool {
        !self.cluster_pathlist.is_empty()
    }

    /// Unparameterized cluster paths: the cheapest one per distribution and
    /// ordering survives pruning, so this is the whole useful set.
    #[must_use]
    pub fn cluster_candidates(&self) -> Vec<Rc<Path>> {
        self.cluster_pathlist
            .iter()
            .filter(|p| !p.is_parameterized())
            .cloned()
            .collect()
    }

    /// Local join inputs: the cheapest path and every ordered path.
    #[must_use]
    pub fn local_candidates(&self) -> Vec<Rc<Path>> {
        let mut out: Vec<Rc<Path>> = self.cheapest_total.iter().cloned().collect();
        for p in &self.pathlist {
            if !p.is_parameterized()
                && !p.pathkeys.is_empty()
                && !out.iter().any(|o| Rc::ptr_eq(o, p))
            {
                out.push(Rc::clone(p));
            }
        }
        out
    }

    #[must_use]
    pub fn parameterized_paths(&self, cluster: bool) -> Vec<Rc<Path>> {
        let list = if cluster {
            &self.cluster_pathlist
        } else {
            &self.pathlist
        };
        list.iter()
            .filter(|p| p.is_parameterized())
            .cloned()
            .collect()
    }
}
