//! Reduce descriptors: where the output rows of a candidate path live.

use smallvec::SmallVec;
use std::fmt::{self, Display, Formatter};

use crate::ir::expression::{ColumnRef, Expr, FuncId};
use crate::ir::query::TargetEntry;
use crate::ir::relids::RelIndex;
use crate::topology::{NodeList, NodeOid};

use super::locator::{LocatorKind, RelationLocInfo};
use super::resolver::ExecNodes;

/// Function mapping key values to a node position.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PartitionMethod {
    Hash,
    Modulo,
    UserDefined(FuncId),
}

impl PartitionMethod {
    #[must_use]
    pub fn from_locator(loc: &RelationLocInfo) -> Option<Self> {
        match loc.kind {
            LocatorKind::Hash => Some(PartitionMethod::Hash),
            LocatorKind::Modulo => Some(PartitionMethod::Modulo),
            LocatorKind::UserDefined => loc.partition_func.map(PartitionMethod::UserDefined),
            LocatorKind::Replicated | LocatorKind::RoundRobin | LocatorKind::None => None,
        }
    }
}

impl Display for PartitionMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PartitionMethod::Hash => write!(f, "hash"),
            PartitionMethod::Modulo => write!(f, "modulo"),
            PartitionMethod::UserDefined(func) => write!(f, "func{func}"),
        }
    }
}

pub type KeyColumns = SmallVec<[ColumnRef; 2]>;

#[derive(Clone, PartialEq, Debug)]
pub enum ReduceKind {
    /// A full copy on every node.
    Replicated,
    /// Rows sent identically to every node of the set by a broadcast.
    FinalReplicate,
    /// Rows placed by `method(keys)` over the node list.
    ByValue {
        method: PartitionMethod,
        keys: KeyColumns,
    },
    /// Rows spread over the nodes with no known placement rule.
    Random,
    /// Rows already collected on the coordinator.
    Coordinator,
}

/// Distribution of a path's output.
#[derive(Clone, PartialEq, Debug)]
pub struct ReduceInfo {
    pub kind: ReduceKind,
    /// Ordered node set. Empty for [`ReduceKind::Coordinator`].
    pub nodes: NodeList,
    /// Nodes of `nodes` known to produce no rows.
    pub exclude: NodeList,
}

impl ReduceInfo {
    #[must_use]
    pub fn coordinator() -> Self {
        ReduceInfo {
            kind: ReduceKind::Coordinator,
            nodes: NodeList::new(),
            exclude: NodeList::new(),
        }
    }

    #[must_use]
    pub fn replicated(nodes: NodeList) -> Self {
        ReduceInfo {
            kind: ReduceKind::Replicated,
            nodes,
            exclude: NodeList::new(),
        }
    }

    #[must_use]
    pub fn final_replicate(nodes: NodeList) -> Self {
        ReduceInfo {
            kind: ReduceKind::FinalReplicate,
            nodes,
            exclude: NodeList::new(),
        }
    }

    #[must_use]
    pub fn random(nodes: NodeList) -> Self {
        ReduceInfo {
            kind: ReduceKind::Random,
            nodes,
            exclude: NodeList::new(),
        }
    }

    #[must_use]
    pub fn by_value(method: PartitionMethod, keys: KeyColumns, nodes: NodeList) -> Self {
        ReduceInfo {
            kind: ReduceKind::ByValue { method, keys },
            nodes,
            exclude: NodeList::new(),
        }
    }

    #[must_use]
    pub fn with_exclude(mut self, exclude: NodeList) -> Self {
        self.exclude = exclude
            .into_iter()
            .filter(|n| self.nodes.contains(n))
            .collect();
        self.exclude.sort_unstable();
        self.exclude.dedup();
        self
    }

    /// Descriptor of a scan of `rel` whose locator resolved to `exec`.
    #[must_use]
    pub fn from_exec_nodes(loc: &RelationLocInfo, rel: RelIndex, exec: &ExecNodes) -> Self {
        let visited = exec.all_nodes();
        let exclude: NodeList = loc
            .nodes
            .iter()
            .copied()
            .filter(|n| !visited.contains(n))
            .collect();
        let base = match PartitionMethod::from_locator(loc) {
            Some(method) => ReduceInfo::by_value(
                method,
                loc.partition_attrs
                    .iter()
                    .map(|a| ColumnRef::new(rel, *a))
                    .collect(),
                loc.nodes.clone(),
            ),
            None if loc.kind == LocatorKind::Replicated => {
                ReduceInfo::replicated(loc.nodes.clone())
            }
            None => ReduceInfo::random(loc.nodes.clone()),
        };
        base.with_exclude(exclude)
    }

    /// Nodes that actually produce rows, in node list order.
    #[must_use]
    pub fn effective_nodes(&self) -> NodeList {
        self.nodes
            .iter()
            .copied()
            .filter(|n| !self.exclude.contains(n))
            .collect()
    }

    /// Every node was pruned away: the path produces no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.is_coordinator() && self.effective_nodes().is_empty()
    }

    #[must_use]
    pub fn is_coordinator(&self) -> bool {
        matches!(self.kind, ReduceKind::Coordinator)
    }

    #[must_use]
    pub fn is_replicated_like(&self) -> bool {
        matches!(
            self.kind,
            ReduceKind::Replicated | ReduceKind::FinalReplicate
        )
    }

    #[must_use]
    pub fn keys(&self) -> Option<&[ColumnRef]> {
        match &self.kind {
            ReduceKind::ByValue { keys, .. } => Some(keys),
            _ => None,
        }
    }

    #[must_use]
    pub fn method(&self) -> Option<PartitionMethod> {
        match &self.kind {
            ReduceKind::ByValue { method, .. } => Some(*method),
            _ => None,
        }
    }

    /// The only node producing rows, if there is exactly one.
    #[must_use]
    pub fn single_node(&self) -> Option<NodeOid> {
        if self.is_coordinator() {
            return None;
        }
        match self.effective_nodes().as_slice() {
            [node] => Some(*node),
            _ => None,
        }
    }

    /// Number of nodes sharing the rows between them. Replicated data is
    /// not shared: every node holds all the rows.
    #[must_use]
    pub fn degree(&self) -> f64 {
        match self.kind {
            ReduceKind::ByValue { .. } | ReduceKind::Random => {
                #[allow(clippy::cast_precision_loss)]
                let n = self.effective_nodes().len() as f64;
                n.max(1.0)
            }
            ReduceKind::Replicated | ReduceKind::FinalReplicate | ReduceKind::Coordinator => 1.0,
        }
    }

    /// Same kind, same effective node set and, for value-based placement,
    /// the same method and key columns. Node order matters for value-based
    /// placement only.
    #[must_use]
    pub fn equal(&self, other: &ReduceInfo) -> bool {
        match (&self.kind, &other.kind) {
            (ReduceKind::Coordinator, ReduceKind::Coordinator) => true,
            (
                ReduceKind::ByValue { method, keys },
                ReduceKind::ByValue {
                    method: other_method,
                    keys: other_keys,
                },
            ) => {
                method == other_method
                    && keys == other_keys
                    && self.nodes == other.nodes
                    && self.effective_nodes() == other.effective_nodes()
            }
            (ReduceKind::Replicated, ReduceKind::Replicated)
            | (ReduceKind::FinalReplicate, ReduceKind::FinalReplicate)
            | (ReduceKind::Random, ReduceKind::Random) => {
                let mut mine = self.effective_nodes();
                let mut theirs = other.effective_nodes();
                mine.sort_unstable();
                theirs.sort_unstable();
                mine == theirs
            }
            _ => false,
        }
    }

    /// Rename key columns of relation `from` into relation `to`.
    #[must_use]
    pub fn rename_rel(&self, from: RelIndex, to: RelIndex) -> Self {
        let mut renamed = self.clone();
        if let ReduceKind::ByValue { keys, .. } = &mut renamed.kind {
            for key in keys.iter_mut().filter(|k| k.rel == from) {
                key.rel = to;
            }
        }
        renamed
    }

    /// Express the descriptor in terms of the output columns of a
    /// subquery scanned as relation `rel`. If some key column is not
    /// projected as is, the placement rule is lost and the rows become
    /// [`ReduceKind::Random`] over the same nodes.
    #[must_use]
    pub fn remap_through(&self, target: &[TargetEntry], rel: RelIndex) -> Self {
        let ReduceKind::ByValue { method, keys } = &self.kind else {
            return self.clone();
        };
        let mut remapped = KeyColumns::new();
        for key in keys {
            let pos = target
                .iter()
                .position(|t| matches!(&t.expr, Expr::Column(c) if c == key));
            match pos.and_then(|p| u16::try_from(p + 1).ok()) {
                Some(attno) => remapped.push(ColumnRef::new(rel, attno)),
                None => {
                    return ReduceInfo {
                        kind: ReduceKind::Random,
                        nodes: self.nodes.clone(),
                        exclude: self.exclude.clone(),
                    }
                }
            }
        }
        ReduceInfo {
            kind: ReduceKind::ByValue {
                method: *method,
                keys: remapped,
            },
            nodes: self.nodes.clone(),
            exclude: self.exclude.clone(),
        }
    }

    /// Keep only `node` of the node set.
    #[must_use]
    pub fn restrict_to(&self, node: NodeOid) -> Self {
        let exclude = self.nodes.iter().copied().filter(|n| *n != node).collect();
        self.clone().with_exclude(exclude)
    }
}

fn write_nodes(f: &mut Formatter<'_>, nodes: &[NodeOid]) -> fmt::Result {
    write!(f, "[")?;
    for (i, n) in nodes.iter().enumerate() {
        if i > 0 {
            write!(f, " ")?;
        }
        write!(f, "{n}")?;
    }
    write!(f, "]")
}

impl Display for ReduceInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ReduceKind::Coordinator => return write!(f, "coordinator"),
            ReduceKind::Replicated => write!(f, "replicated on ")?,
            ReduceKind::FinalReplicate => write!(f, "broadcast on ")?,
            ReduceKind::Random => write!(f, "random on ")?,
            ReduceKind::ByValue { method, keys } => {
                write!(f, "{method}(")?;
                for (i, k) in keys.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}")?;
                }
                write!(f, ") on ")?;
            }
        }
        write_nodes(f, &self.effective_nodes())
    }
}
