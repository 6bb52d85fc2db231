//! Cluster topology: the node registry, the distribution descriptor cache
//! and the knobs that route replicated writes and reads.
//!
//! A single [`ClusterTopology`] is shared by every planning call. The
//! descriptor cache is read concurrently and rebuilt under the write lock
//! when node catalog DDL commits.

use ahash::AHashMap;
use smallvec::SmallVec;
use smol_str::format_smolstr;
use std::sync::{Arc, PoisonError, RwLock};

use crate::catalog::{Catalog, FunctionRegistry, RelId};
use crate::config::PlannerConfig;
use crate::distribution::locator::{LocatorKind, RelationLocInfo};
use crate::distribution::resolver::{self, AccessType, BoundValue, ExecNodes};
use crate::errors::PlannerError;
use crate::ir::expression::AttrNumber;
use crate::tlog;

/// Object identifier of a cluster node.
pub type NodeOid = u32;

/// Ordered list of nodes.
pub type NodeList = SmallVec<[NodeOid; 8]>;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum NodeKind {
    Coordinator,
    DataNode,
}

/// Node catalog lookups.
pub trait NodeRegistry {
    /// # Errors
    /// - the node catalog can't be read
    fn list_nodes(&self, kind: NodeKind) -> Result<Vec<NodeOid>, PlannerError>;

    /// Position of the node in [`NodeRegistry::list_nodes`] of the same
    /// kind. Stable for the duration of one planning call.
    ///
    /// # Errors
    /// - the node catalog can't be read
    fn node_position(&self, node: NodeOid, kind: NodeKind) -> Result<Option<usize>, PlannerError>;
}

pub struct ClusterTopology {
    registry: Arc<dyn NodeRegistry + Send + Sync>,
    primary_node: Option<NodeOid>,
    preferred_nodes: Vec<NodeOid>,
    cache: RwLock<AHashMap<RelId, Arc<RelationLocInfo>>>,
}

impl std::fmt::Debug for ClusterTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterTopology")
            .field("primary_node", &self.primary_node)
            .field("preferred_nodes", &self.preferred_nodes)
            .finish_non_exhaustive()
    }
}

impl ClusterTopology {
    /// # Errors
    /// - the configured primary node is not a data node
    pub fn new(
        registry: Arc<dyn NodeRegistry + Send + Sync>,
        config: &PlannerConfig,
    ) -> Result<Self, PlannerError> {
        if let Some(primary) = config.primary_node {
            if registry
                .node_position(primary, NodeKind::DataNode)?
                .is_none()
            {
                return Err(PlannerError::Configuration(format_smolstr!(
                    "primary node {primary} is not a data node"
                )));
            }
        }
        Ok(ClusterTopology {
            registry,
            primary_node: config.primary_node,
            preferred_nodes: config.preferred_nodes.clone(),
            cache: RwLock::new(AHashMap::new()),
        })
    }

    #[must_use]
    pub fn primary_node(&self) -> Option<NodeOid> {
        self.primary_node
    }

    /// # Errors
    /// - the node catalog can't be read
    pub fn data_nodes(&self) -> Result<NodeList, PlannerError> {
        Ok(self
            .registry
            .list_nodes(NodeKind::DataNode)?
            .into_iter()
            .collect())
    }

    /// # Errors
    /// - the node catalog can't be read
    pub fn node_position(&self, node: NodeOid, kind: NodeKind) -> Result<Option<usize>, PlannerError> {
        self.registry.node_position(node, kind)
    }

    /// The node replicated data is read from: the first preferred node
    /// among `candidates`, otherwise the first candidate.
    #[must_use]
    pub fn preferred_node(&self, candidates: &[NodeOid]) -> Option<NodeOid> {
        self.preferred_nodes
            .iter()
            .find(|n| candidates.contains(n))
            .or_else(|| candidates.first())
            .copied()
    }

    /// Distribution descriptor of a relation, `None` for local relations.
    ///
    /// # Errors
    /// - unknown locator code, unknown node or partition column in the
    ///   catalog record
    pub fn locator(
        &self,
        catalog: &dyn Catalog,
        rel: RelId,
    ) -> Result<Option<Arc<RelationLocInfo>>, PlannerError> {
        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(loc) = cache.get(&rel) {
                return Ok(Some(Arc::clone(loc)));
            }
        }
        let Some(loc) = self.load_locator(catalog, rel)? else {
            return Ok(None);
        };
        let loc = Arc::new(loc);
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        // Another planner could have loaded it meanwhile, keep the first one
        // so that the round-robin cursor is not split.
        let loc = Arc::clone(cache.entry(rel).or_insert(loc));
        tlog!(Debug, "distribution descriptor loaded";
            "relation" => rel, "kind" => %loc.kind, "nodes" => loc.nodes.len());
        Ok(Some(loc))
    }

    fn load_locator(
        &self,
        catalog: &dyn Catalog,
        rel: RelId,
    ) -> Result<Option<RelationLocInfo>, PlannerError> {
        let Some(record) = catalog.locator_record(rel)? else {
            return Ok(None);
        };
        let kind = LocatorKind::try_from(record.kind_code)?;
        if kind == LocatorKind::None {
            return Ok(None);
        }
        for node in &record.nodes {
            if self
                .registry
                .node_position(*node, NodeKind::DataNode)?
                .is_none()
            {
                return Err(PlannerError::Configuration(format_smolstr!(
                    "node {node} referenced by relation {rel} not found"
                )));
            }
        }
        let columns = catalog.columns(rel)?;
        let attrs = record
            .partition_columns
            .iter()
            .map(|name| {
                columns
                    .iter()
                    .position(|c| &c.name == name)
                    .and_then(|pos| AttrNumber::try_from(pos + 1).ok())
                    .ok_or_else(|| {
                        PlannerError::Configuration(format_smolstr!(
                            "partition column {name} of relation {rel} not found"
                        ))
                    })
            })
            .collect::<Result<SmallVec<[AttrNumber; 2]>, _>>()?;
        let loc = RelationLocInfo::new(
            rel,
            kind,
            attrs,
            record.partition_func,
            record.nodes.iter().copied().collect(),
        )?;
        Ok(Some(loc))
    }

    /// Drop the cached descriptor of a relation.
    pub fn invalidate(&self, rel: RelId) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if cache.remove(&rel).is_some() {
            tlog!(Info, "distribution descriptor invalidated"; "relation" => rel);
        }
    }

    /// Drop every cached descriptor, e.g. after node catalog DDL.
    pub fn invalidate_all(&self) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let dropped = cache.len();
        cache.clear();
        tlog!(Info, "distribution descriptor cache cleared"; "dropped" => dropped);
    }

    /// Nodes that must be visited to access `loc` with the given bound
    /// partition key values.
    ///
    /// # Errors
    /// - user-defined distribution function fails or returns garbage
    /// - a bound value can't be coerced to the key type
    pub fn resolve_nodes(
        &self,
        loc: &RelationLocInfo,
        access: AccessType,
        values: &[BoundValue],
        functions: &dyn FunctionRegistry,
    ) -> Result<ExecNodes, PlannerError> {
        resolver::resolve_nodes(loc, access, values, self.primary_node, functions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::LocatorRecord;
    use crate::mock::{MockCatalog, MockRegistry};
    use pretty_assertions::assert_eq;

    fn registry() -> Arc<MockRegistry> {
        Arc::new(MockRegistry::new(&[1], &[11, 12, 13]))
    }

    #[test]
    fn cached_descriptor() {
        let catalog = MockCatalog::new()
            .with_table(100, &[("id", crate::ir::value::Type::Integer)], 1000.0)
            .with_locator(100, 'H', &["id"], &[11, 12, 13]);
        let topology = ClusterTopology::new(registry(), &PlannerConfig::default()).unwrap();

        let first = topology.locator(&catalog, 100).unwrap().unwrap();
        assert_eq!(first.kind, LocatorKind::Hash);
        assert_eq!(first.partition_attrs.as_slice(), &[1]);
        let second = topology.locator(&catalog, 100).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        topology.invalidate(100);
        let third = topology.locator(&catalog, 100).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&first, &third));

        topology.invalidate_all();
        let fourth = topology.locator(&catalog, 100).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&third, &fourth));
    }

    #[test]
    fn catalog_inconsistencies() {
        let topology = ClusterTopology::new(registry(), &PlannerConfig::default()).unwrap();
        let catalog = MockCatalog::new()
            .with_table(1, &[("id", crate::ir::value::Type::Integer)], 10.0) // unknown_node
            .with_locator(1, 'H', &["id"], &[11, 99])
            .with_table(2, &[("id", crate::ir::value::Type::Integer)], 10.0) // bad_code
            .with_locator_record(
                2,
                LocatorRecord {
                    kind_code: 'Z',
                    partition_columns: vec![],
                    partition_func: None,
                    nodes: vec![11],
                },
            )
            .with_table(3, &[("id", crate::ir::value::Type::Integer)], 10.0) // bad_column
            .with_locator(3, 'M', &["missing"], &[11])
            .with_table(4, &[("id", crate::ir::value::Type::Integer)], 10.0) // local
            .with_locator(4, 'L', &[], &[]);

        let err = topology.locator(&catalog, 1).unwrap_err();
        assert_eq!(
            err.to_string(),
            "catalog inconsistency: node 99 referenced by relation 1 not found"
        );
        assert!(topology.locator(&catalog, 2).unwrap_err().is_catalog_inconsistency());
        assert!(topology.locator(&catalog, 3).unwrap_err().is_catalog_inconsistency());
        assert!(topology.locator(&catalog, 4).unwrap().is_none());
    }

    #[test]
    fn primary_must_be_data_node() {
        let config = PlannerConfig {
            primary_node: Some(1),
            ..PlannerConfig::default()
        };
        assert!(ClusterTopology::new(registry(), &config).is_err());
    }

    #[test]
    fn preferred_node() {
        let config = PlannerConfig {
            preferred_nodes: vec![13, 12],
            ..PlannerConfig::default()
        };
        let topology = ClusterTopology::new(registry(), &config).unwrap();
        assert_eq!(topology.preferred_node(&[11, 12]), Some(12));
        assert_eq!(topology.preferred_node(&[11]), Some(11));
        assert_eq!(topology.preferred_node(&[]), None);
    }
}
