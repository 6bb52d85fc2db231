use rand::Rng;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use smol_str::format_smolstr;
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::catalog::RelId;
use crate::errors::PlannerError;
use crate::ir::expression::{AttrNumber, FuncId};
use crate::topology::{NodeList, NodeOid};

/// How rows of a relation are assigned to nodes.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum LocatorKind {
    /// Every node holds a full copy.
    Replicated,
    /// `murmur3(key) mod |nodes|`.
    Hash,
    /// `key mod |nodes|` on the raw integer key.
    Modulo,
    /// Inserts rotate over the node list.
    RoundRobin,
    /// A user-defined function of the key columns picks the node.
    UserDefined,
    /// Local, unsharded relation.
    None,
}

impl TryFrom<char> for LocatorKind {
    type Error = PlannerError;

    fn try_from(code: char) -> Result<Self, Self::Error> {
        match code {
            'R' => Ok(LocatorKind::Replicated),
            'H' => Ok(LocatorKind::Hash),
            'M' => Ok(LocatorKind::Modulo),
            'N' => Ok(LocatorKind::RoundRobin),
            'U' => Ok(LocatorKind::UserDefined),
            'L' => Ok(LocatorKind::None),
            _ => Err(PlannerError::Configuration(format_smolstr!(
                "unknown locator type '{code}'"
            ))),
        }
    }
}

impl Display for LocatorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            LocatorKind::Replicated => "replicated",
            LocatorKind::Hash => "hash",
            LocatorKind::Modulo => "modulo",
            LocatorKind::RoundRobin => "round robin",
            LocatorKind::UserDefined => "user-defined",
            LocatorKind::None => "local",
        };
        write!(f, "{s}")
    }
}

impl LocatorKind {
    #[must_use]
    pub fn is_value_based(&self) -> bool {
        matches!(
            self,
            LocatorKind::Hash | LocatorKind::Modulo | LocatorKind::UserDefined
        )
    }
}

/// Static distribution descriptor of a relation.
#[derive(Debug)]
pub struct RelationLocInfo {
    pub rel_id: RelId,
    pub kind: LocatorKind,
    /// Partition key columns, in function argument order.
    pub partition_attrs: SmallVec<[AttrNumber; 2]>,
    pub partition_func: Option<FuncId>,
    /// Ordered: modulo arithmetic and the round-robin cursor index into it.
    pub nodes: NodeList,
    rr_cursor: AtomicUsize,
}

impl RelationLocInfo {
    /// Build a descriptor and seed its round-robin cursor at a random node.
    ///
    /// # Errors
    /// - empty node list
    /// - partition columns or function inconsistent with the kind
    pub fn new(
        rel_id: RelId,
        kind: LocatorKind,
        partition_attrs: SmallVec<[AttrNumber; 2]>,
        partition_func: Option<FuncId>,
        nodes: NodeList,
    ) -> Result<Self, PlannerError> {
        let inconsistent = |what: &str| {
            Err(PlannerError::Configuration(format_smolstr!(
                "{kind} relation {rel_id}: {what}"
            )))
        };
        if nodes.is_empty() {
            return inconsistent("empty node list");
        }
        match kind {
            LocatorKind::None => return inconsistent("local relation has no node set"),
            LocatorKind::Replicated | LocatorKind::RoundRobin => {
                if !partition_attrs.is_empty() || partition_func.is_some() {
                    return inconsistent("unexpected partition key");
                }
            }
            LocatorKind::Hash | LocatorKind::Modulo => {
                if partition_attrs.len() != 1 {
                    return inconsistent("exactly one partition column is required");
                }
            }
            LocatorKind::UserDefined => {
                if partition_attrs.is_empty() {
                    return inconsistent("partition columns are required");
                }
                if partition_func.is_none() {
                    return inconsistent("partition function is required");
                }
            }
        }
        let start = rand::thread_rng().gen_range(0..nodes.len());
        Ok(RelationLocInfo {
            rel_id,
            kind,
            partition_attrs,
            partition_func,
            nodes,
            rr_cursor: AtomicUsize::new(start),
        })
    }

    /// Next node for a round-robin insert. A single atomic step, so
    /// concurrent planners never observe the same cursor value.
    pub fn next_round_robin(&self) -> NodeOid {
        let pos = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % self.nodes.len();
        self.nodes[pos]
    }

    #[must_use]
    pub fn is_partition_attr(&self, attno: AttrNumber) -> bool {
        self.partition_attrs.contains(&attno)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn locator_codes() {
        assert_eq!(LocatorKind::try_from('H').unwrap(), LocatorKind::Hash);
        assert_eq!(LocatorKind::try_from('L').unwrap(), LocatorKind::None);
        let err = LocatorKind::try_from('X').unwrap_err();
        assert!(err.is_catalog_inconsistency());
        assert_eq!(
            err.to_string(),
            "catalog inconsistency: unknown locator type 'X'"
        );
    }

    #[test]
    fn descriptor_invariants() {
        let err = RelationLocInfo::new(1, LocatorKind::Hash, smallvec![], None, smallvec![1, 2])
            .unwrap_err();
        assert!(err.is_catalog_inconsistency());
        assert!(
            RelationLocInfo::new(1, LocatorKind::Replicated, smallvec![], None, smallvec![])
                .is_err()
        );
        assert!(RelationLocInfo::new(
            1,
            LocatorKind::UserDefined,
            smallvec![1, 2],
            None,
            smallvec![1]
        )
        .is_err());
    }

    #[test]
    fn round_robin_visits_every_node() {
        let loc = RelationLocInfo::new(
            1,
            LocatorKind::RoundRobin,
            smallvec![],
            None,
            smallvec![10, 20, 30],
        )
        .unwrap();
        let mut seen: Vec<NodeOid> = (0..3).map(|_| loc.next_round_robin()).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![10, 20, 30]);
    }
}
