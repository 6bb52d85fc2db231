//! Candidate paths: the closed set of operators the search builds,
//! each annotated with cost, ordering and distribution.

pub mod cost;
pub mod pathkeys;
pub mod visitor;

use smol_str::SmolStr;
use std::rc::Rc;

use crate::catalog::RelId;
use crate::distribution::reduce::ReduceInfo;
use crate::ir::expression::{ColumnRef, Expr};
use crate::ir::query::{JoinKind, TargetEntry};
use crate::ir::relids::{RelIndex, Relids};

use self::cost::Cost;
use self::pathkeys::PathKey;

/// State of a path's distribution descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReduceValidity {
    NotComputed,
    Computed,
    /// Taken over from the single input without recomputation.
    Inherited,
    /// Valid, but the executor narrows the node set at run time once
    /// parameter values are known.
    Provisional,
}

#[derive(Clone, PartialEq, Debug)]
pub enum ScanMethod {
    Seq,
    Index {
        index: SmolStr,
        index_quals: Vec<Expr>,
    },
    /// One participant of a parallel scan.
    PartialSeq { workers: u32 },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum JoinMethod {
    NestLoop,
    Hash,
    Merge,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AggPhase {
    /// Complete aggregation in one step.
    Simple,
    /// Per-node partial states.
    Partial,
    /// Combine partial states.
    Final,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AggStrategy {
    Plain,
    Hashed,
    Sorted,
}

/// Network data movement.
#[derive(Clone, PartialEq, Debug)]
pub enum Redistribution {
    /// Collect all rows on the coordinator, merging sorted streams when
    /// `merge` is set.
    ToCoordinator { merge: bool },
    /// Broadcast the rows to every node of the target set.
    ToReplicate,
    /// Re-hash the rows by the target key columns.
    ToValue,
    /// Execute on the full node set and prune at run time with the
    /// parameter values of the deferred qualifiers.
    ByParam { deferred: Vec<Expr> },
}

#[derive(Clone, PartialEq, Debug)]
pub enum PathKind {
    /// Proven empty result.
    Dummy,
    Scan {
        rel: RelIndex,
        rel_id: RelId,
        method: ScanMethod,
        quals: Vec<Expr>,
    },
    Join {
        method: JoinMethod,
        kind: JoinKind,
        outer: Rc<Path>,
        inner: Rc<Path>,
        clauses: Vec<Expr>,
    },
    Append {
        children: Vec<Rc<Path>>,
    },
    MergeAppend {
        children: Vec<Rc<Path>>,
    },
    SubqueryScan {
        rel: RelIndex,
        input: Rc<Path>,
    },
    CteScan {
        rel: RelIndex,
        name: SmolStr,
        input: Rc<Path>,
    },
    WorkTableScan {
        rel: RelIndex,
        name: SmolStr,
    },
    TuplestoreScan {
        rel: RelIndex,
        name: SmolStr,
    },
    Redistribute {
        op: Redistribution,
        input: Rc<Path>,
    },
    Gather {
        workers: u32,
        merge: bool,
        input: Rc<Path>,
    },
    Sort {
        keys: Vec<PathKey>,
        input: Rc<Path>,
    },
    Projection {
        target: Vec<TargetEntry>,
        input: Rc<Path>,
    },
    Aggregate {
        phase: AggPhase,
        strategy: AggStrategy,
        group_by: Vec<ColumnRef>,
        input: Rc<Path>,
    },
    Limit {
        limit: Option<u64>,
        offset: Option<u64>,
        input: Rc<Path>,
    },
}

#[derive(Clone, PartialEq, Debug)]
pub struct Path {
    pub kind: PathKind,
    /// Relations whose rows the path produces.
    pub parent: Relids,
    pub rows: f64,
    pub width: f64,
    pub startup_cost: f64,
    pub total_cost: f64,
    pub pathkeys: Vec<PathKey>,
    /// Outer relations that must supply parameters to this path.
    pub param_rels: Relids,
    /// Distribution of the output. `None` on local-only paths.
    pub reduce: Option<ReduceInfo>,
    pub validity: ReduceValidity,
}

impl Path {
    #[must_use]
    pub fn dummy(parent: Relids, width: f64, reduce: Option<ReduceInfo>) -> Self {
        let validity = if reduce.is_some() {
            ReduceValidity::Computed
        } else {
            ReduceValidity::NotComputed
        };
        Path {
            kind: PathKind::Dummy,
            parent,
            rows: 0.0,
            width,
            startup_cost: 0.0,
            total_cost: 0.0,
            pathkeys: Vec::new(),
            param_rels: Relids::empty(),
            reduce,
            validity,
        }
    }

    /// A unary operator over `input` that keeps its rows, ordering and
    /// distribution; the caller adjusts what the operator changes.
    #[must_use]
    pub fn wrap(kind: PathKind, input: &Path) -> Self {
        let validity = if input.reduce.is_some() {
            ReduceValidity::Inherited
        } else {
            ReduceValidity::NotComputed
        };
        Path {
            kind,
            parent: input.parent,
            rows: input.rows,
            width: input.width,
            startup_cost: input.startup_cost,
            total_cost: input.total_cost,
            pathkeys: input.pathkeys.clone(),
            param_rels: input.param_rels,
            reduce: input.reduce.clone(),
            validity,
        }
    }

    #[must_use]
    pub fn with_cost(mut self, cost: Cost) -> Self {
        self.startup_cost = cost.startup;
        self.total_cost = cost.total;
        self
    }

    #[must_use]
    pub fn with_reduce(mut self, reduce: ReduceInfo, validity: ReduceValidity) -> Self {
        self.reduce = Some(reduce);
        self.validity = validity;
        self
    }

    #[must_use]
    pub fn cost(&self) -> Cost {
        Cost::new(self.startup_cost, self.total_cost)
    }

    #[must_use]
    pub fn is_dummy(&self) -> bool {
        matches!(self.kind, PathKind::Dummy)
    }

    #[must_use]
    pub fn is_parameterized(&self) -> bool {
        !self.param_rels.is_empty()
    }

    #[must_use]
    pub fn is_partial(&self) -> bool {
        matches!(
            self.kind,
            PathKind::Scan {
                method: ScanMethod::PartialSeq { .. },
                ..
            }
        )
    }

    /// Rows each producing node handles.
    #[must_use]
    pub fn rows_per_node(&self) -> f64 {
        match &self.reduce {
            Some(r) => self.rows / r.degree(),
            None => self.rows,
        }
    }

    /// Number of network data movements in the tree.
    #[must_use]
    pub fn network_round_trips(&self) -> usize {
        self.count(&mut |p| matches!(p.kind, PathKind::Redistribute { .. }))
    }

    #[must_use]
    pub fn rc(self) -> Rc<Path> {
        Rc::new(self)
    }
}
