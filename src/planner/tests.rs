use pretty_assertions::assert_eq;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use super::base::build_base_rel;
use super::context::PlannerContext;
use super::redistribute::reduce_to_coordinator;
use super::{plan_query_level, Planner, QueryLevel};
use crate::config::PlannerConfig;
use crate::distribution::reduce::{ReduceInfo, ReduceKind};
use crate::errors::PlannerError;
use crate::ir::expression::{ColumnRef, Expr, FuncExpr, Operator, OperatorKind, Volatility};
use crate::ir::query::{
    AppendRelInfo, PartitionScheme, Query, RangeEntry, SortKey, TargetEntry,
};
use crate::ir::relids::Relids;
use crate::ir::value::Type;
use crate::mock::{MockCatalog, MockRegistry};
use crate::path::pathkeys::PathKey;
use crate::path::{Path, PathKind, Redistribution};
use crate::plan::{ExplainOptions, FinalPlan, PlanNode, PlanOp};
use crate::topology::{ClusterTopology, NodeOid};

const NODES: [NodeOid; 4] = [11, 12, 13, 14];
const COLUMNS: [(&str, Type); 2] = [("id", Type::Integer), ("val", Type::Integer)];

fn catalog() -> MockCatalog {
    MockCatalog::new()
        .with_table(1, &COLUMNS, 100_000.0) // a
        .with_locator(1, 'H', &["id"], &NODES)
        .with_table(2, &COLUMNS, 100_000.0) // b
        .with_locator(2, 'H', &["id"], &NODES)
        .with_table(3, &COLUMNS, 100_000.0) // c
        .with_locator(3, 'M', &["val"], &NODES)
        .with_table(4, &COLUMNS, 1_000.0) // r
        .with_locator(4, 'R', &[], &NODES)
        .with_table(5, &COLUMNS, 1_000.0) // l
}

fn registry() -> Arc<MockRegistry> {
    Arc::new(MockRegistry::new(&[1], &NODES))
}

fn planner_with(catalog: MockCatalog, config: PlannerConfig) -> Planner {
    let catalog = Arc::new(catalog);
    Planner::new(catalog.clone(), registry(), catalog, config).unwrap()
}

fn planner() -> Planner {
    planner_with(catalog(), PlannerConfig::default())
}

fn relation(rel_id: u32, alias: &str) -> RangeEntry {
    RangeEntry::Relation {
        rel_id,
        alias: alias.into(),
    }
}

fn query(range_table: Vec<RangeEntry>, quals: Vec<Expr>) -> Query {
    Query {
        range_table,
        quals,
        ..Query::default()
    }
}

fn find<'a>(node: &'a PlanNode, pred: &mut impl FnMut(&PlanNode) -> bool) -> Vec<&'a PlanNode> {
    let mut found = Vec::new();
    node.walk(&mut |n| {
        if pred(n) {
            found.push(n);
        }
    });
    found
}

fn scans(plan: &FinalPlan) -> Vec<&PlanNode> {
    find(&plan.root, &mut |n| matches!(n.op, PlanOp::SeqScan { .. } | PlanOp::IndexScan { .. }))
}

/// Run `f` with a planning context over the default catalog.
fn with_context<T>(catalog: &MockCatalog, config: &PlannerConfig, f: impl FnOnce(&PlannerContext<'_>) -> T) -> T {
    let topology = ClusterTopology::new(registry(), config).unwrap();
    let ctx = PlannerContext::new(catalog, catalog, &topology, config, None).unwrap();
    f(&ctx)
}

fn volatile_random() -> Expr {
    Expr::Func(FuncExpr {
        func: 99,
        name: "random".into(),
        args: vec![Expr::exec_param(1, Type::Integer)],
        volatility: Volatility::Volatile,
    })
}

fn order_by_first_column() -> Vec<SortKey> {
    vec![SortKey {
        column: ColumnRef::new(0, 1),
        descending: false,
    }]
}

#[test]
fn collocated_join_pruned_to_one_node() {
    // SELECT * FROM a JOIN b ON a.id = b.id WHERE a.id = 7
    let q = query(
        vec![relation(1, "a"), relation(2, "b")],
        vec![
            Expr::eq(Expr::col(0, 1), Expr::val(7)),
            Expr::eq(Expr::col(0, 1), Expr::col(1, 1)),
        ],
    );
    let plan = planner().plan(&q).unwrap();
    assert!(plan.cluster_plan_ok);
    assert_eq!(plan.root.redistributions(), 0);
    assert_eq!(plan.dispatch.nodes.len(), 1);
    let node = plan.dispatch.nodes[0];
    // both scans are pruned to the node holding id = 7
    for scan in scans(&plan) {
        assert_eq!(scan.exec_nodes().as_slice(), &[node]);
    }
}

#[test]
fn replicated_side_stays_in_place() {
    // SELECT * FROM a JOIN r ON a.id = r.val
    let q = query(
        vec![relation(1, "a"), relation(4, "r")],
        vec![Expr::eq(Expr::col(0, 1), Expr::col(1, 2))],
    );
    let plan = planner().plan(&q).unwrap();
    assert!(plan.cluster_plan_ok);
    assert_eq!(plan.root.redistributions(), 0);
    let reduce = plan.root.reduce.as_ref().unwrap();
    assert!(matches!(reduce.kind, ReduceKind::ByValue { .. }));
    assert_eq!(plan.dispatch.nodes.as_slice(), &NODES);
}

#[test]
fn mismatched_placement_moves_one_side() {
    // SELECT * FROM a JOIN c ON a.id = c.val
    // c is spread by modulo of val, a by hash of id: equal join values
    // live on different nodes.
    let q = query(
        vec![relation(1, "a"), relation(3, "c")],
        vec![Expr::eq(Expr::col(0, 1), Expr::col(1, 2))],
    );
    let plan = planner().plan(&q).unwrap();
    assert!(plan.cluster_plan_ok);
    assert_eq!(plan.root.redistributions(), 1);
    assert!(plan.root.reduce.is_some());
}

#[test]
fn exec_param_defers_pruning() {
    // correlated: SELECT * FROM a WHERE a.id = $exec1
    let q = query(
        vec![relation(1, "a")],
        vec![Expr::eq(Expr::col(0, 1), Expr::exec_param(1, Type::Integer))],
    );
    let plan = planner().plan(&q).unwrap();
    assert!(plan.cluster_plan_ok);
    let by_param = find(&plan.root, &mut |n| matches!(n.op, PlanOp::ReduceByParam { .. }));
    assert_eq!(by_param.len(), 1);
    assert!(by_param[0].provisional);
    let PlanOp::ReduceByParam { deferred } = &by_param[0].op else {
        unreachable!();
    };
    assert_eq!(deferred.len(), 1);
    assert!(deferred[0].contains_exec_param());
}

#[test]
fn contradiction_gives_empty_plan() {
    let q = query(
        vec![relation(1, "a"), relation(2, "b")],
        vec![
            Expr::eq(Expr::col(0, 1), Expr::val(7)),
            Expr::eq(Expr::col(0, 1), Expr::val(8)),
            Expr::eq(Expr::col(0, 1), Expr::col(1, 1)),
        ],
    );
    let plan = planner().plan(&q).unwrap();
    assert_eq!(plan.rows, 0.0);
    assert!(find(&plan.root, &mut |n| n.op == PlanOp::Empty).len() == 1);
}

#[test]
fn constant_false_qualifier_empties_every_relation() {
    let q = query(
        vec![relation(1, "a"), relation(4, "r")],
        vec![
            Expr::val(false),
            Expr::eq(Expr::col(0, 1), Expr::col(1, 1)),
        ],
    );
    let plan = planner().plan(&q).unwrap();
    assert_eq!(plan.rows, 0.0);
    assert!(scans(&plan).is_empty());
}

#[test]
fn temp_relation_forces_local_plan() {
    let catalog = catalog().with_temp(2);
    let q = query(
        vec![relation(1, "a"), relation(2, "b")],
        vec![Expr::eq(Expr::col(0, 1), Expr::col(1, 1))],
    );
    let plan = planner_with(catalog, PlannerConfig::default()).plan(&q).unwrap();
    assert!(!plan.cluster_plan_ok);
    assert!(plan.dispatch.nodes.is_empty());
    assert!(find(&plan.root, &mut |n| n.reduce.is_some()).is_empty());
}

#[test]
fn session_state_forces_local_plan() {
    let mut q = query(vec![relation(1, "a")], vec![]);
    q.uses_temp_state = true;
    let plan = planner().plan(&q).unwrap();
    assert!(!plan.cluster_plan_ok);
}

#[test]
fn disabled_cluster_planning() {
    let config = PlannerConfig {
        enable_cluster_plan: false,
        ..PlannerConfig::default()
    };
    let q = query(
        vec![relation(1, "a")],
        vec![Expr::eq(Expr::col(0, 1), Expr::val(7))],
    );
    let plan = planner_with(catalog(), config).plan(&q).unwrap();
    assert!(!plan.cluster_plan_ok);
    assert_eq!(plan.root.redistributions(), 0);
}

#[test]
fn volatile_append_child_abandons_cluster_plan() {
    // SELECT * FROM (a UNION ALL b) p WHERE p.id > random($exec1)
    let mut q = query(
        vec![
            RangeEntry::AppendParent { alias: "p".into() },
            relation(1, "a"),
            relation(2, "b"),
        ],
        vec![Expr::binary(
            Operator::new(">", OperatorKind::Gt),
            Expr::col(0, 1),
            volatile_random(),
        )],
    );
    q.append_rels.push(AppendRelInfo {
        parent: 0,
        children: vec![1, 2],
        partition_scheme: None,
    });
    let plan = planner().plan(&q).unwrap();
    assert!(!plan.cluster_plan_ok);
    assert!(matches!(plan.root.op, PlanOp::Append));
    assert_eq!(plan.root.children.len(), 2);
}

#[test]
fn append_of_collocated_children_keeps_placement() {
    let mut q = query(
        vec![
            RangeEntry::AppendParent { alias: "p".into() },
            relation(1, "a"),
            relation(2, "b"),
        ],
        vec![],
    );
    q.append_rels.push(AppendRelInfo {
        parent: 0,
        children: vec![1, 2],
        partition_scheme: None,
    });
    with_context(&catalog(), &PlannerConfig::default(), |ctx| {
        let upper = plan_query_level(ctx, &q).unwrap();
        assert!(!upper.cluster.is_empty());
        for path in &upper.cluster {
            let reduce = path.reduce.as_ref().unwrap();
            // both children hash by their first column over the same nodes
            assert!(matches!(reduce.kind, ReduceKind::ByValue { .. }));
            assert_eq!(reduce.keys().unwrap()[0].rel, 0);
        }
    });
}

#[test]
fn limit_in_subquery_collects_rows_first() {
    let inner = Query {
        limit: Some(10),
        ..query(vec![relation(1, "a")], vec![])
    };
    with_context(&catalog(), &PlannerConfig::default(), |ctx| {
        let upper = plan_query_level(ctx, &inner).unwrap();
        assert!(!upper.cluster.is_empty());
        for path in &upper.cluster {
            let PathKind::Limit { input, .. } = &path.kind else {
                panic!("expected a limit on top, got {:?}", path.kind);
            };
            assert!(matches!(
                input.kind,
                PathKind::Redistribute {
                    op: Redistribution::ToCoordinator { .. },
                    ..
                }
            ));
            assert!(path.reduce.as_ref().unwrap().is_coordinator());
        }
    });

    let outer = query(
        vec![RangeEntry::Subquery {
            query: Box::new(inner),
            alias: "s".into(),
        }],
        vec![],
    );
    let plan = planner().plan(&outer).unwrap();
    assert_eq!(plan.rows, 10.0);
}

#[test]
fn subquery_placement_follows_projection() {
    // SELECT * FROM (SELECT val, id FROM a) s
    let inner = Query {
        target: vec![
            TargetEntry::new(Expr::col(0, 2), "val"),
            TargetEntry::new(Expr::col(0, 1), "id"),
        ],
        ..query(vec![relation(1, "a")], vec![])
    };
    let outer = query(
        vec![RangeEntry::Subquery {
            query: Box::new(inner),
            alias: "s".into(),
        }],
        vec![],
    );
    with_context(&catalog(), &PlannerConfig::default(), |ctx| {
        let upper = plan_query_level(ctx, &outer).unwrap();
        assert!(!upper.cluster.is_empty());
        for path in &upper.cluster {
            let keys = path.reduce.as_ref().unwrap().keys().unwrap().to_vec();
            // a.id is the second output column of the subquery
            assert_eq!(keys.len(), 1);
            assert_eq!((keys[0].rel, keys[0].attno), (0, 2));
        }
    });
}

#[test]
fn partitioned_join_plans() {
    let scheme = PartitionScheme { id: 1, key: vec![1] };
    let mut q = query(
        vec![
            RangeEntry::AppendParent { alias: "p".into() },
            relation(1, "a"),
            relation(2, "b"),
            RangeEntry::AppendParent { alias: "q".into() },
            relation(1, "a2"),
            relation(2, "b2"),
        ],
        vec![Expr::eq(Expr::col(0, 1), Expr::col(3, 1))],
    );
    q.append_rels.push(AppendRelInfo {
        parent: 0,
        children: vec![1, 2],
        partition_scheme: Some(scheme.clone()),
    });
    q.append_rels.push(AppendRelInfo {
        parent: 3,
        children: vec![4, 5],
        partition_scheme: Some(scheme),
    });
    let plan = planner().plan(&q).unwrap();
    assert!(plan.rows > 0.0);
    assert_eq!(scans(&plan).len(), 4);
}

#[test]
fn select_for_update_on_replicated_goes_to_primary() {
    let config = PlannerConfig {
        primary_node: Some(12),
        ..PlannerConfig::default()
    };
    let q = Query {
        for_update: true,
        ..query(vec![relation(4, "r")], vec![])
    };
    with_context(&catalog(), &config, |ctx| {
        let upper = plan_query_level(ctx, &q).unwrap();
        assert!(!upper.cluster.is_empty());
        for path in &upper.cluster {
            assert_eq!(path.reduce.as_ref().unwrap().effective_nodes().as_slice(), &[12]);
        }
    });
}

#[test]
fn to_coordinator_is_a_no_op_on_collected_rows() {
    with_context(&catalog(), &PlannerConfig::default(), |ctx| {
        let collected = Path::dummy(Relids::single(0), 8.0, Some(ReduceInfo::coordinator())).rc();
        let same = reduce_to_coordinator(ctx, &collected).unwrap();
        assert!(Rc::ptr_eq(&same, &collected));

        let spread = Path::dummy(
            Relids::single(0),
            8.0,
            Some(ReduceInfo::random(NODES.iter().copied().collect())),
        )
        .rc();
        let moved = reduce_to_coordinator(ctx, &spread).unwrap();
        assert_eq!(moved.network_round_trips(), 1);
        assert!(moved.reduce.as_ref().unwrap().is_coordinator());
    });
}

#[test]
fn canceled_planning() {
    let cancel = Arc::new(AtomicBool::new(true));
    let q = query(vec![relation(1, "a")], vec![]);
    let err = planner().plan_with_cancel(&q, cancel).unwrap_err();
    assert_eq!(err, PlannerError::Canceled);
}

#[test]
fn recursion_limit() {
    let config = PlannerConfig {
        max_recursion_depth: 2,
        ..PlannerConfig::default()
    };
    let mut q = query(vec![relation(1, "a")], vec![]);
    for _ in 0..3 {
        q = query(
            vec![RangeEntry::Subquery {
                query: Box::new(q),
                alias: "s".into(),
            }],
            vec![],
        );
    }
    let err = planner_with(catalog(), config).plan(&q).unwrap_err();
    assert!(matches!(err, PlannerError::StackDepthExceeded(_)));
}

#[test]
fn unknown_relation_is_error() {
    let q = query(vec![relation(42, "x")], vec![]);
    let err = planner().plan(&q).unwrap_err();
    assert!(matches!(err, PlannerError::NotFound(..)));
}

#[test]
fn local_relation_plans_on_coordinator() {
    let q = query(vec![relation(5, "l")], vec![]);
    let plan = planner().plan(&q).unwrap();
    assert!(!plan.cluster_plan_ok);
    assert_eq!(plan.rows, 1000.0);
}

#[test]
fn explain_single_node_scan() {
    let catalog = MockCatalog::new()
        .with_table(1, &[("id", Type::Integer), ("name", Type::String)], 1000.0)
        .with_locator(1, 'M', &["id"], &NODES);
    let q = query(
        vec![relation(1, "t")],
        vec![Expr::eq(Expr::col(0, 1), Expr::val(7))],
    );
    let plan = planner_with(catalog, PlannerConfig::default()).plan(&q).unwrap();
    insta::assert_snapshot!(plan.explain_with(ExplainOptions { costs: false }), @r###"
    Dispatch to [14]
        Seq Scan on 1 as r0 filter: r0.c1 = 7 [modulo(r0.c1) on [14]]
    "###);
}

#[test]
fn coerced_key_still_prunes_to_owner() {
    // SELECT * FROM a WHERE CAST(a.id AS string) = '7'
    let direct = query(
        vec![relation(1, "a")],
        vec![Expr::eq(Expr::col(0, 1), Expr::val(7))],
    );
    let coerced = query(
        vec![relation(1, "a")],
        vec![Expr::eq(
            Expr::cast(Expr::col(0, 1), Type::String),
            Expr::val("7"),
        )],
    );
    let direct = planner().plan(&direct).unwrap();
    let coerced = planner().plan(&coerced).unwrap();
    assert!(coerced.cluster_plan_ok);
    assert_eq!(coerced.dispatch.nodes.len(), 1);
    assert_eq!(coerced.dispatch.nodes, direct.dispatch.nodes);
}

#[test]
fn pinned_tuplestore_is_read_once() {
    // SELECT * FROM ts JOIN a ON ts.c1 = a.id, ts copied on 11 and 12
    let q = query(
        vec![
            RangeEntry::Tuplestore {
                name: "ts".into(),
                rows: 1000.0,
                width: 16.0,
                pinned: Some(vec![11, 12]),
            },
            relation(1, "a"),
        ],
        vec![Expr::eq(Expr::col(0, 1), Expr::col(1, 1))],
    );
    with_context(&catalog(), &PlannerConfig::default(), |ctx| {
        let upper = plan_query_level(ctx, &q).unwrap();
        assert!(!upper.cluster.is_empty());
        for path in &upper.cluster {
            path.any(&mut |n| {
                match &n.kind {
                    PathKind::TuplestoreScan { .. } => {
                        let reduce = n.reduce.as_ref().unwrap();
                        assert_eq!(reduce.kind, ReduceKind::Replicated);
                    }
                    // shipped copies come from a single node
                    PathKind::Redistribute { input, .. } => {
                        if let Some(r) = input.reduce.as_ref().filter(|r| r.is_replicated_like()) {
                            assert_eq!(r.effective_nodes().len(), 1, "{:?}", input.kind);
                        }
                    }
                    _ => {}
                }
                false
            });
        }
    });
}

#[test]
fn column_of_missing_relation_is_error() {
    let q = query(
        vec![relation(1, "a")],
        vec![Expr::eq(Expr::col(70, 1), Expr::val(1))],
    );
    let err = planner().plan(&q).unwrap_err();
    assert!(matches!(err, PlannerError::NotFound(..)), "{err}");

    let q = Query {
        group_by: vec![ColumnRef::new(3, 1)],
        ..query(vec![relation(1, "a")], vec![])
    };
    let err = planner().plan(&q).unwrap_err();
    assert!(matches!(err, PlannerError::NotFound(..)), "{err}");
}

#[test]
fn ordered_parallel_scan_uses_gather_merge() {
    let config = PlannerConfig {
        min_parallel_table_pages: 0.0,
        ..PlannerConfig::default()
    };
    let merged = |list: &[Rc<Path>]| -> Vec<Rc<Path>> {
        list.iter()
            .filter(|p| {
                matches!(&p.kind, PathKind::Gather { merge: true, input, .. }
                    if matches!(input.kind, PathKind::Sort { .. }))
            })
            .cloned()
            .collect()
    };

    // SELECT * FROM l ORDER BY id
    let q = Query {
        sort: order_by_first_column(),
        ..query(vec![relation(5, "l")], vec![])
    };
    with_context(&catalog(), &config, |ctx| {
        let level = QueryLevel::new(&q);
        let node = build_base_rel(ctx, &level, 0, 5).unwrap();
        assert!(!node.partial_pathlist.is_empty());
        let gm = merged(&node.pathlist);
        assert_eq!(gm.len(), 1);
        assert_eq!(gm[0].pathkeys, vec![PathKey::asc(ColumnRef::new(0, 1))]);
    });

    // SELECT * FROM a ORDER BY id: each node merges its own workers
    let q = Query {
        sort: order_by_first_column(),
        ..query(vec![relation(1, "a")], vec![])
    };
    with_context(&catalog(), &config, |ctx| {
        let level = QueryLevel::new(&q);
        let node = build_base_rel(ctx, &level, 0, 1).unwrap();
        assert!(node.partial_pathlist.is_empty());
        let gm = merged(&node.cluster_pathlist);
        assert_eq!(gm.len(), 1);
        assert_eq!(gm[0].reduce.as_ref().unwrap().effective_nodes().as_slice(), &NODES);
    });

    // no ordering asked for: plain gathers only
    let q = query(vec![relation(5, "l")], vec![]);
    with_context(&catalog(), &config, |ctx| {
        let level = QueryLevel::new(&q);
        let node = build_base_rel(ctx, &level, 0, 5).unwrap();
        assert!(merged(&node.pathlist).is_empty());
    });
}

#[test]
fn ordered_index_scan_feeds_limit() {
    // SELECT * FROM l ORDER BY id LIMIT 10
    let catalog = catalog().with_index(5, "l_id", &[1], true);
    let q = Query {
        sort: order_by_first_column(),
        limit: Some(10),
        ..query(vec![relation(5, "l")], vec![])
    };
    let plan = planner_with(catalog, PlannerConfig::default()).plan(&q).unwrap();
    assert!(!plan.cluster_plan_ok);
    assert_eq!(plan.rows, 10.0);
    assert!(matches!(plan.root.op, PlanOp::Limit { .. }));
    assert!(find(&plan.root, &mut |n| matches!(n.op, PlanOp::Sort { .. })).is_empty());
    assert_eq!(
        find(&plan.root, &mut |n| matches!(n.op, PlanOp::IndexScan { .. })).len(),
        1
    );
}

#[test]
fn distinct_values_drive_equality_estimates() {
    // SELECT * FROM l WHERE id = 5
    let q = query(
        vec![relation(5, "l")],
        vec![Expr::eq(Expr::col(0, 1), Expr::val(5))],
    );
    let plan = planner().plan(&q).unwrap();
    assert_eq!(plan.rows, 5.0);

    let catalog = catalog().with_distinct(5, 1, 1000.0);
    let plan = planner_with(catalog, PlannerConfig::default()).plan(&q).unwrap();
    assert_eq!(plan.rows, 1.0);
}

#[test]
fn volatile_replicated_child_pinned_to_one_node() {
    // SELECT * FROM (r UNION ALL r) p WHERE p.id > random($exec1)
    let mut q = query(
        vec![
            RangeEntry::AppendParent { alias: "p".into() },
            relation(4, "r1"),
            relation(4, "r2"),
        ],
        vec![Expr::binary(
            Operator::new(">", OperatorKind::Gt),
            Expr::col(0, 1),
            volatile_random(),
        )],
    );
    q.append_rels.push(AppendRelInfo {
        parent: 0,
        children: vec![1, 2],
        partition_scheme: None,
    });
    with_context(&catalog(), &PlannerConfig::default(), |ctx| {
        let upper = plan_query_level(ctx, &q).unwrap();
        assert!(ctx.cluster_ok());
        assert!(!upper.cluster.is_empty());
        for path in &upper.cluster {
            let scans = path.count(&mut |n| {
                if let PathKind::Scan { .. } = n.kind {
                    assert_eq!(n.reduce.as_ref().unwrap().effective_nodes().len(), 1);
                    true
                } else {
                    false
                }
            });
            assert_eq!(scans, 2);
        }
    });
}
