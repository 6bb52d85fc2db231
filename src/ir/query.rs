use serde::{Deserialize, Serialize};
use smol_str::{format_smolstr, SmolStr};

use crate::catalog::RelId;
use crate::errors::{Entity, PlannerError};
use crate::topology::NodeOid;

use super::expression::{AttrNumber, ColumnRef, Expr, ParamValues};
use super::relids::{RelIndex, Relids, MAX_RELIDS};

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub enum RangeEntry {
    /// Catalog relation. It may be sharded, replicated or local.
    Relation { rel_id: RelId, alias: SmolStr },
    /// Parent of an append relation (UNION ALL or a partitioned table).
    /// Its rows are produced by the children listed in the matching
    /// [`AppendRelInfo`].
    AppendParent { alias: SmolStr },
    Subquery { query: Box<Query>, alias: SmolStr },
    Cte { name: SmolStr, query: Box<Query> },
    /// Working table of a recursive CTE.
    WorkTable { name: SmolStr, rows: f64, width: f64 },
    /// Named tuplestore filled by the executor. `pinned` lists the nodes
    /// that hold an identical copy of it, when the execution context
    /// knows them.
    Tuplestore {
        name: SmolStr,
        rows: f64,
        width: f64,
        pinned: Option<Vec<NodeOid>>,
    },
}

impl RangeEntry {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            RangeEntry::Relation { alias, .. }
            | RangeEntry::AppendParent { alias }
            | RangeEntry::Subquery { alias, .. } => alias,
            RangeEntry::Cte { name, .. }
            | RangeEntry::WorkTable { name, .. }
            | RangeEntry::Tuplestore { name, .. } => name,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum JoinKind {
    Inner,
    Left,
    Full,
    Semi,
    Anti,
}

impl std::fmt::Display for JoinKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JoinKind::Inner => "Inner",
            JoinKind::Left => "Left",
            JoinKind::Full => "Full",
            JoinKind::Semi => "Semi",
            JoinKind::Anti => "Anti",
        };
        write!(f, "{s}")
    }
}

/// A non-inner join. `lhs` and `rhs` are the minimal relation sets that
/// must be joined before this join may be formed; `rhs` is the nullable
/// (or filtered, for semi/anti joins) side.
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct SpecialJoin {
    pub kind: JoinKind,
    pub lhs: Relids,
    pub rhs: Relids,
    pub clauses: Vec<Expr>,
}

/// Partitioning of an append relation. Children of two append relations
/// with the same scheme are ordered by partition bound, so child `i` of
/// one holds the same key range as child `i` of the other.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct PartitionScheme {
    pub id: u32,
    pub key: Vec<AttrNumber>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct AppendRelInfo {
    pub parent: RelIndex,
    pub children: Vec<RelIndex>,
    pub partition_scheme: Option<PartitionScheme>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct TargetEntry {
    pub expr: Expr,
    pub name: SmolStr,
}

impl TargetEntry {
    #[must_use]
    pub fn new(expr: Expr, name: &str) -> Self {
        TargetEntry {
            expr,
            name: SmolStr::from(name),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct SortKey {
    pub column: ColumnRef,
    pub descending: bool,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
pub struct Query {
    pub range_table: Vec<RangeEntry>,
    /// WHERE conjuncts and inner join clauses.
    pub quals: Vec<Expr>,
    pub special_joins: Vec<SpecialJoin>,
    pub append_rels: Vec<AppendRelInfo>,
    /// Empty target means all columns of all relations.
    pub target: Vec<TargetEntry>,
    pub sort: Vec<SortKey>,
    pub group_by: Vec<ColumnRef>,
    pub has_aggregates: bool,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// SELECT ... FOR UPDATE.
    pub for_update: bool,
    pub params: ParamValues,
    /// The query touches session-local state (temporary tables, session
    /// variables) and must not be shipped to other nodes.
    pub uses_temp_state: bool,
}

impl Query {
    #[must_use]
    pub fn has_limit(&self) -> bool {
        self.limit.is_some() || self.offset.is_some()
    }

    /// Append relation whose parent is `rel`.
    #[must_use]
    pub fn append_rel(&self, rel: RelIndex) -> Option<&AppendRelInfo> {
        self.append_rels.iter().find(|a| a.parent == rel)
    }

    #[must_use]
    pub fn is_append_child(&self, rel: RelIndex) -> bool {
        self.append_rels.iter().any(|a| a.children.contains(&rel))
    }

    /// Range table indexes that take part in the join search.
    #[must_use]
    pub fn base_rels(&self) -> Vec<RelIndex> {
        (0..self.range_table.len())
            .filter(|r| !self.is_append_child(*r))
            .collect()
    }

    /// Check the structural invariants the planner relies on.
    ///
    /// # Errors
    /// - more range table entries than a relation set can hold
    /// - an expression or a join references a missing range table entry
    /// - malformed append relation
    pub fn validate(&self) -> Result<(), PlannerError> {
        if self.range_table.len() > MAX_RELIDS {
            return Err(PlannerError::Unsupported(
                Entity::Query,
                Some(format_smolstr!(
                    "too many range table entries: {} (max {MAX_RELIDS})",
                    self.range_table.len()
                )),
            ));
        }
        if self.range_table.is_empty() {
            return Err(PlannerError::Invalid(
                Entity::Query,
                Some("empty range table".into()),
            ));
        }
        let len = self.range_table.len();
        let missing = |rel: RelIndex, what: &dyn std::fmt::Display| {
            PlannerError::NotFound(
                Entity::RangeEntry,
                format_smolstr!("{what} references relation {rel}"),
            )
        };
        let check_expr = |e: &Expr| -> Result<(), PlannerError> {
            let mut bad = None;
            e.any(&mut |x| match x {
                Expr::Column(c) if c.rel >= len => {
                    bad = Some(c.rel);
                    true
                }
                _ => false,
            });
            match bad {
                Some(rel) => Err(missing(rel, &format_smolstr!("expression {e}"))),
                None => Ok(()),
            }
        };
        for q in &self.quals {
            check_expr(q)?;
        }
        for t in &self.target {
            check_expr(&t.expr)?;
        }
        let keys = self.sort.iter().map(|k| &k.column).chain(&self.group_by);
        for c in keys {
            if c.rel >= len {
                return Err(missing(c.rel, &"sort or grouping key"));
            }
        }
        for sj in &self.special_joins {
            if sj.lhs.is_empty() || sj.rhs.is_empty() || sj.lhs.overlaps(sj.rhs) {
                return Err(PlannerError::Invalid(
                    Entity::Query,
                    Some(format_smolstr!(
                        "{} join with sides {} and {}",
                        sj.kind,
                        sj.lhs,
                        sj.rhs
                    )),
                ));
            }
            if let Some(rel) = sj.lhs.union(sj.rhs).iter().find(|r| *r >= len) {
                return Err(missing(rel, &format_smolstr!("{} join", sj.kind)));
            }
            for c in &sj.clauses {
                check_expr(c)?;
            }
        }
        for info in &self.append_rels {
            let parent_ok = matches!(
                self.range_table.get(info.parent),
                Some(RangeEntry::AppendParent { .. })
            );
            if !parent_ok || info.children.is_empty() {
                return Err(PlannerError::Invalid(
                    Entity::AppendRel,
                    Some(format_smolstr!("append relation rooted at {}", info.parent)),
                ));
            }
            for child in &info.children {
                if *child >= self.range_table.len() || *child == info.parent {
                    return Err(PlannerError::NotFound(
                        Entity::RangeEntry,
                        format_smolstr!("append child {child}"),
                    ));
                }
            }
        }
        Ok(())
    }
}
