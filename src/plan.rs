//! Finished plan handed to the executor.

use itertools::Itertools;
use smol_str::SmolStr;
use std::fmt::Write as _;

use crate::catalog::RelId;
use crate::distribution::reduce::ReduceInfo;
use crate::ir::expression::{ColumnRef, Expr};
use crate::ir::query::{JoinKind, TargetEntry};
use crate::ir::relids::RelIndex;
use crate::path::pathkeys::PathKey;
use crate::path::{
    AggPhase, AggStrategy, JoinMethod, Path, PathKind, Redistribution, ReduceValidity, ScanMethod,
};
use crate::topology::NodeList;

#[derive(Clone, PartialEq, Debug)]
pub enum PlanOp {
    /// Produces no rows.
    Empty,
    SeqScan {
        rel: RelIndex,
        relation: RelId,
        quals: Vec<Expr>,
    },
    ParallelSeqScan {
        rel: RelIndex,
        relation: RelId,
        workers: u32,
        quals: Vec<Expr>,
    },
    IndexScan {
        rel: RelIndex,
        relation: RelId,
        index: SmolStr,
        index_quals: Vec<Expr>,
        quals: Vec<Expr>,
    },
    Join {
        method: JoinMethod,
        kind: JoinKind,
        clauses: Vec<Expr>,
    },
    Append,
    MergeAppend,
    SubqueryScan {
        rel: RelIndex,
    },
    CteScan {
        rel: RelIndex,
        name: SmolStr,
    },
    WorkTableScan {
        rel: RelIndex,
        name: SmolStr,
    },
    TuplestoreScan {
        rel: RelIndex,
        name: SmolStr,
    },
    ReduceToCoordinator {
        merge: bool,
    },
    ReduceToReplicate,
    ReduceToValue,
    /// Executed on every node of its distribution; the executor drops the
    /// nodes excluded by `deferred` once parameter values are known.
    ReduceByParam {
        deferred: Vec<Expr>,
    },
    Gather {
        workers: u32,
        merge: bool,
    },
    Sort {
        keys: Vec<PathKey>,
    },
    Projection {
        target: Vec<TargetEntry>,
    },
    Aggregate {
        phase: AggPhase,
        strategy: AggStrategy,
        group_by: Vec<ColumnRef>,
    },
    Limit {
        limit: Option<u64>,
        offset: Option<u64>,
    },
}

impl PlanOp {
    fn from_kind(kind: &PathKind) -> Self {
        match kind {
            PathKind::Dummy => PlanOp::Empty,
            PathKind::Scan {
                rel,
                rel_id,
                method,
                quals,
            } => match method {
                ScanMethod::Seq => PlanOp::SeqScan {
                    rel: *rel,
                    relation: *rel_id,
                    quals: quals.clone(),
                },
                ScanMethod::PartialSeq { workers } => PlanOp::ParallelSeqScan {
                    rel: *rel,
                    relation: *rel_id,
                    workers: *workers,
                    quals: quals.clone(),
                },
                ScanMethod::Index { index, index_quals } => PlanOp::IndexScan {
                    rel: *rel,
                    relation: *rel_id,
                    index: index.clone(),
                    index_quals: index_quals.clone(),
                    quals: quals.clone(),
                },
            },
            PathKind::Join {
                method,
                kind,
                clauses,
                ..
            } => PlanOp::Join {
                method: *method,
                kind: *kind,
                clauses: clauses.clone(),
            },
            PathKind::Append { .. } => PlanOp::Append,
            PathKind::MergeAppend { .. } => PlanOp::MergeAppend,
            PathKind::SubqueryScan { rel, .. } => PlanOp::SubqueryScan { rel: *rel },
            PathKind::CteScan { rel, name, .. } => PlanOp::CteScan {
                rel: *rel,
                name: name.clone(),
            },
            PathKind::WorkTableScan { rel, name } => PlanOp::WorkTableScan {
                rel: *rel,
                name: name.clone(),
            },
            PathKind::TuplestoreScan { rel, name } => PlanOp::TuplestoreScan {
                rel: *rel,
                name: name.clone(),
            },
            PathKind::Redistribute { op, .. } => match op {
                Redistribution::ToCoordinator { merge } => {
                    PlanOp::ReduceToCoordinator { merge: *merge }
                }
                Redistribution::ToReplicate => PlanOp::ReduceToReplicate,
                Redistribution::ToValue => PlanOp::ReduceToValue,
                Redistribution::ByParam { deferred } => PlanOp::ReduceByParam {
                    deferred: deferred.clone(),
                },
            },
            PathKind::Gather { workers, merge, .. } => PlanOp::Gather {
                workers: *workers,
                merge: *merge,
            },
            PathKind::Sort { keys, .. } => PlanOp::Sort { keys: keys.clone() },
            PathKind::Projection { target, .. } => PlanOp::Projection {
                target: target.clone(),
            },
            PathKind::Aggregate {
                phase,
                strategy,
                group_by,
                ..
            } => PlanOp::Aggregate {
                phase: *phase,
                strategy: *strategy,
                group_by: group_by.clone(),
            },
            PathKind::Limit { limit, offset, .. } => PlanOp::Limit {
                limit: *limit,
                offset: *offset,
            },
        }
    }
}

fn write_exprs(out: &mut String, label: &str, exprs: &[Expr]) {
    if exprs.is_empty() {
        return;
    }
    let _ = write!(out, " {label}: {}", exprs.iter().join(" AND "));
}

impl std::fmt::Display for PlanOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = String::new();
        match self {
            PlanOp::Empty => s.push_str("Result (empty)"),
            PlanOp::SeqScan {
                rel,
                relation,
                quals,
            } => {
                let _ = write!(s, "Seq Scan on {relation} as r{rel}");
                write_exprs(&mut s, "filter", quals);
            }
            PlanOp::ParallelSeqScan {
                rel,
                relation,
                workers,
                quals,
            } => {
                let _ = write!(s, "Parallel Seq Scan on {relation} as r{rel} workers: {workers}");
                write_exprs(&mut s, "filter", quals);
            }
            PlanOp::IndexScan {
                rel,
                relation,
                index,
                index_quals,
                quals,
            } => {
                let _ = write!(s, "Index Scan using {index} on {relation} as r{rel}");
                write_exprs(&mut s, "cond", index_quals);
                let rest: Vec<Expr> = quals
                    .iter()
                    .filter(|q| !index_quals.contains(q))
                    .cloned()
                    .collect();
                write_exprs(&mut s, "filter", &rest);
            }
            PlanOp::Join {
                method,
                kind,
                clauses,
            } => {
                let name = match method {
                    JoinMethod::NestLoop => "Nested Loop",
                    JoinMethod::Hash => "Hash Join",
                    JoinMethod::Merge => "Merge Join",
                };
                let _ = write!(s, "{name} {kind}");
                write_exprs(&mut s, "on", clauses);
            }
            PlanOp::Append => s.push_str("Append"),
            PlanOp::MergeAppend => s.push_str("Merge Append"),
            PlanOp::SubqueryScan { rel } => {
                let _ = write!(s, "Subquery Scan as r{rel}");
            }
            PlanOp::CteScan { rel, name } => {
                let _ = write!(s, "CTE Scan on {name} as r{rel}");
            }
            PlanOp::WorkTableScan { rel, name } => {
                let _ = write!(s, "WorkTable Scan on {name} as r{rel}");
            }
            PlanOp::TuplestoreScan { rel, name } => {
                let _ = write!(s, "Tuplestore Scan on {name} as r{rel}");
            }
            PlanOp::ReduceToCoordinator { merge } => {
                s.push_str(if *merge {
                    "Reduce to coordinator (merge)"
                } else {
                    "Reduce to coordinator"
                });
            }
            PlanOp::ReduceToReplicate => s.push_str("Reduce to replicate"),
            PlanOp::ReduceToValue => s.push_str("Reduce by value"),
            PlanOp::ReduceByParam { deferred } => {
                s.push_str("Reduce by param");
                write_exprs(&mut s, "deferred", deferred);
            }
            PlanOp::Gather { workers, merge } => {
                let name = if *merge { "Gather Merge" } else { "Gather" };
                let _ = write!(s, "{name} workers: {workers}");
            }
            PlanOp::Sort { keys } => {
                let _ = write!(s, "Sort by {}", keys.iter().join(", "));
            }
            PlanOp::Projection { target } => {
                s.push_str("Projection ");
                for (i, t) in target.iter().enumerate() {
                    if i > 0 {
                        s.push_str(", ");
                    }
                    let _ = write!(s, "{} AS {}", t.expr, t.name);
                }
            }
            PlanOp::Aggregate {
                phase,
                strategy,
                group_by,
            } => {
                let _ = write!(s, "{strategy:?} Aggregate");
                if *phase != AggPhase::Simple {
                    let _ = write!(s, " ({phase:?})");
                }
                if !group_by.is_empty() {
                    let _ = write!(s, " group by {}", group_by.iter().join(", "));
                }
            }
            PlanOp::Limit { limit, offset } => {
                s.push_str("Limit");
                if let Some(l) = limit {
                    let _ = write!(s, " {l}");
                }
                if let Some(o) = offset {
                    let _ = write!(s, " offset {o}");
                }
            }
        }
        f.write_str(&s)
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct PlanNode {
    pub op: PlanOp,
    pub rows: f64,
    pub width: f64,
    pub startup_cost: f64,
    pub total_cost: f64,
    /// Where the node runs and how its output rows are placed. `None` in
    /// local-only plans.
    pub reduce: Option<ReduceInfo>,
    /// The executor narrows the node set at run time.
    pub provisional: bool,
    pub children: Vec<PlanNode>,
}

impl PlanNode {
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        path.fold(&mut |p: &Path, children: Vec<PlanNode>| PlanNode {
            op: PlanOp::from_kind(&p.kind),
            rows: p.rows,
            width: p.width,
            startup_cost: p.startup_cost,
            total_cost: p.total_cost,
            reduce: p.reduce.clone(),
            provisional: p.validity == ReduceValidity::Provisional,
            children,
        })
    }

    /// Nodes the operator is executed on.
    #[must_use]
    pub fn exec_nodes(&self) -> NodeList {
        self.reduce
            .as_ref()
            .map(ReduceInfo::effective_nodes)
            .unwrap_or_default()
    }

    /// Pre-order walk.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a PlanNode)) {
        f(self);
        for child in &self.children {
            child.walk(f);
        }
    }

    /// Number of network data movements in the tree.
    #[must_use]
    pub fn redistributions(&self) -> usize {
        let mut n = 0;
        self.walk(&mut |node| {
            if matches!(
                node.op,
                PlanOp::ReduceToCoordinator { .. }
                    | PlanOp::ReduceToReplicate
                    | PlanOp::ReduceToValue
            ) {
                n += 1;
            }
        });
        n
    }
}

/// Delivery of the final rows to the client connection.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct Dispatch {
    /// Nodes the plan is shipped to. Empty when it runs on the
    /// coordinator alone.
    pub nodes: NodeList,
    /// Sorted streams from several nodes are merged.
    pub merge_sorted: bool,
    pub cost: f64,
}

#[derive(Clone, PartialEq, Debug)]
pub struct FinalPlan {
    pub root: PlanNode,
    pub dispatch: Dispatch,
    /// The plan is distributed; `false` means pure local execution.
    pub cluster_plan_ok: bool,
    pub total_cost: f64,
    pub rows: f64,
}

#[derive(Clone, Copy, Debug)]
pub struct ExplainOptions {
    pub costs: bool,
}

impl Default for ExplainOptions {
    fn default() -> Self {
        ExplainOptions { costs: true }
    }
}

fn explain_node(out: &mut String, node: &PlanNode, depth: usize, opts: ExplainOptions) {
    for _ in 0..depth {
        out.push_str("    ");
    }
    let _ = write!(out, "{}", node.op);
    if opts.costs {
        let _ = write!(
            out,
            " (cost={:.2}..{:.2} rows={:.0} width={:.0})",
            node.startup_cost, node.total_cost, node.rows, node.width
        );
    }
    if let Some(r) = &node.reduce {
        let _ = write!(out, " [{r}]");
        if node.provisional {
            out.push_str(" provisional");
        }
    }
    out.push('\n');
    for child in &node.children {
        explain_node(out, child, depth + 1, opts);
    }
}

impl FinalPlan {
    #[must_use]
    pub fn explain(&self) -> String {
        self.explain_with(ExplainOptions::default())
    }

    #[must_use]
    pub fn explain_with(&self, opts: ExplainOptions) -> String {
        let mut out = String::new();
        if self.cluster_plan_ok {
            let _ = write!(out, "Dispatch to [{}]", self.dispatch.nodes.iter().join(" "));
            if self.dispatch.merge_sorted {
                out.push_str(" merge sorted");
            }
            if opts.costs {
                let _ = write!(out, " (cost={:.2})", self.dispatch.cost);
            }
            out.push('\n');
            explain_node(&mut out, &self.root, 1, opts);
        } else {
            explain_node(&mut out, &self.root, 0, opts);
        }
        out
    }
}
