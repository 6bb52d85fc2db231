//! Node resolution: which nodes must be visited to access a relation.

use smallvec::smallvec;
use smol_str::format_smolstr;

use crate::catalog::FunctionRegistry;
use crate::errors::{Entity, PlannerError};
use crate::ir::expression::AttrNumber;
use crate::ir::value::{Type, Value};
use crate::topology::{NodeList, NodeOid};

use super::locator::{LocatorKind, RelationLocInfo};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum AccessType {
    Read,
    /// Locking read (`SELECT ... FOR UPDATE`).
    ReadForUpdate,
    Insert,
    Update,
}

/// A partition key column bound to a value by an equality qualifier.
/// A null value is kept: it routes inserts but never prunes reads.
#[derive(Clone, PartialEq, Debug)]
pub struct BoundValue {
    pub attno: AttrNumber,
    pub value: Value,
}

impl BoundValue {
    #[must_use]
    pub fn new(attno: AttrNumber, value: Value) -> Self {
        BoundValue { attno, value }
    }
}

/// Result of node resolution. Writes to replicated relations go to
/// `primary_nodes` first, then to `nodes`.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct ExecNodes {
    pub nodes: NodeList,
    pub primary_nodes: NodeList,
}

impl ExecNodes {
    fn all(loc: &RelationLocInfo) -> Self {
        ExecNodes {
            nodes: loc.nodes.clone(),
            primary_nodes: NodeList::new(),
        }
    }

    fn single(node: NodeOid) -> Self {
        ExecNodes {
            nodes: smallvec![node],
            primary_nodes: NodeList::new(),
        }
    }

    /// Every node to visit, primary nodes first.
    #[must_use]
    pub fn all_nodes(&self) -> NodeList {
        self.primary_nodes
            .iter()
            .chain(self.nodes.iter())
            .copied()
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.primary_nodes.is_empty()
    }
}

/// Murmur3 hash of the canonical value encoding.
#[must_use]
pub fn hash_value(value: &Value) -> u32 {
    let mut hasher = hash32::Murmur3Hasher::default();
    hash32::Hasher::write(&mut hasher, &value.hash_bytes());
    hash32::Hasher::finish(&hasher)
}

fn modulo_position(key: i128, len: usize) -> usize {
    // rem_euclid keeps negative keys in [0, len)
    let len = i128::try_from(len).unwrap_or(i128::MAX);
    usize::try_from(key.rem_euclid(len)).unwrap_or_default()
}

fn integer_key(value: &Value) -> Result<i128, PlannerError> {
    if let Some(v) = value.as_i128() {
        return Ok(v);
    }
    value.cast(Type::Integer)?.as_i128().ok_or_else(|| {
        PlannerError::Invalid(
            Entity::Value,
            Some(format_smolstr!("modulo distribution key {value} is not an integer")),
        )
    })
}

/// Node holding rows with the given (non-null) partition key value.
///
/// # Errors
/// - modulo key is not an integer
pub fn node_for_value(loc: &RelationLocInfo, value: &Value) -> Result<NodeOid, PlannerError> {
    let pos = match loc.kind {
        LocatorKind::Modulo => modulo_position(integer_key(value)?, loc.nodes.len()),
        _ => hash_value(value) as usize % loc.nodes.len(),
    };
    Ok(loc.nodes[pos])
}

/// Resolve the nodes to visit for `access` given the partition key values
/// bound by qualifiers.
///
/// For hash and modulo relations every bound value of the key column is
/// resolved and the results are intersected: contradicting equalities give
/// an empty result. User-defined functions use the first bound value of
/// each argument column.
///
/// # Errors
/// - local relation passed in
/// - bound value can't be coerced, distribution function fails or returns
///   a non-integer
pub fn resolve_nodes(
    loc: &RelationLocInfo,
    access: AccessType,
    values: &[BoundValue],
    primary: Option<NodeOid>,
    functions: &dyn FunctionRegistry,
) -> Result<ExecNodes, PlannerError> {
    match loc.kind {
        LocatorKind::Replicated => Ok(resolve_replicated(loc, access, primary)),
        LocatorKind::Hash | LocatorKind::Modulo => resolve_by_value(loc, access, values),
        LocatorKind::RoundRobin => {
            if access == AccessType::Insert {
                Ok(ExecNodes::single(loc.next_round_robin()))
            } else {
                Ok(ExecNodes::all(loc))
            }
        }
        LocatorKind::UserDefined => resolve_user_defined(loc, access, values, functions),
        LocatorKind::None => Err(PlannerError::Unsupported(
            Entity::Locator,
            Some(format_smolstr!("relation {} is local", loc.rel_id)),
        )),
    }
}

fn resolve_replicated(
    loc: &RelationLocInfo,
    access: AccessType,
    primary: Option<NodeOid>,
) -> ExecNodes {
    let primary = primary.filter(|p| loc.nodes.contains(p));
    match (access, primary) {
        (AccessType::Read, _) => ExecNodes::all(loc),
        (AccessType::Insert | AccessType::Update, Some(p)) => ExecNodes {
            nodes: loc.nodes.iter().copied().filter(|n| *n != p).collect(),
            primary_nodes: smallvec![p],
        },
        (AccessType::Insert | AccessType::Update, None) => ExecNodes::all(loc),
        (AccessType::ReadForUpdate, Some(p)) => ExecNodes::single(p),
        (AccessType::ReadForUpdate, None) => ExecNodes::single(loc.nodes[0]),
    }
}

fn resolve_by_value(
    loc: &RelationLocInfo,
    access: AccessType,
    values: &[BoundValue],
) -> Result<ExecNodes, PlannerError> {
    let attno = loc.partition_attrs[0];
    let mut found: Option<NodeOid> = None;
    let mut has_null = false;
    for bound in values.iter().filter(|b| b.attno == attno) {
        if bound.value.is_null() {
            has_null = true;
            continue;
        }
        let node = node_for_value(loc, &bound.value)?;
        match found {
            None => found = Some(node),
            Some(prev) if prev != node => return Ok(ExecNodes::default()),
            Some(_) => {}
        }
    }
    Ok(match found {
        Some(node) => ExecNodes::single(node),
        None if has_null && access == AccessType::Insert => ExecNodes::single(loc.nodes[0]),
        None => ExecNodes::all(loc),
    })
}

fn resolve_user_defined(
    loc: &RelationLocInfo,
    access: AccessType,
    values: &[BoundValue],
    functions: &dyn FunctionRegistry,
) -> Result<ExecNodes, PlannerError> {
    let fallback = || {
        if access == AccessType::Insert {
            ExecNodes::single(loc.nodes[0])
        } else {
            ExecNodes::all(loc)
        }
    };
    let func = loc.partition_func.ok_or_else(|| {
        PlannerError::Configuration(format_smolstr!(
            "relation {} has no partition function",
            loc.rel_id
        ))
    })?;
    let params = functions.param_types(func)?;
    if params.len() != loc.partition_attrs.len() {
        return Err(PlannerError::Configuration(format_smolstr!(
            "partition function {func} takes {} arguments, relation {} has {} partition columns",
            params.len(),
            loc.rel_id,
            loc.partition_attrs.len()
        )));
    }
    let mut args = Vec::with_capacity(params.len());
    for (attno, ty) in loc.partition_attrs.iter().zip(params) {
        match values.iter().find(|b| b.attno == *attno) {
            Some(bound) if !bound.value.is_null() => args.push(bound.value.cast(ty)?),
            _ => return Ok(fallback()),
        }
    }
    let result = functions.call(func, &args)?;
    if result.is_null() {
        return Ok(fallback());
    }
    let key = result.as_i128().ok_or_else(|| {
        PlannerError::Invalid(
            Entity::Function,
            Some(format_smolstr!(
                "partition function {func} returned non-integer {result}"
            )),
        )
    })?;
    Ok(ExecNodes::single(
        loc.nodes[modulo_position(key, loc.nodes.len())],
    ))
}
