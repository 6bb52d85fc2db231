use pretty_assertions::assert_eq;
use smallvec::smallvec;

use super::locator::{LocatorKind, RelationLocInfo};
use super::qualifier::extract_key_bindings;
use super::reduce::{PartitionMethod, ReduceInfo, ReduceKind};
use super::resolver::{resolve_nodes, AccessType, BoundValue, ExecNodes};
use crate::errors::PlannerError;
use crate::ir::expression::{ColumnRef, Expr, FuncExpr, ParamValues, Volatility};
use crate::ir::query::TargetEntry;
use crate::ir::value::{Type, Value};
use crate::mock::MockCatalog;
use crate::topology::{NodeList, NodeOid};

const NODES: [NodeOid; 4] = [11, 12, 13, 14];

fn loc(kind: LocatorKind) -> RelationLocInfo {
    let attrs = if kind.is_value_based() {
        smallvec![1]
    } else {
        smallvec![]
    };
    let func = (kind == LocatorKind::UserDefined).then_some(7);
    RelationLocInfo::new(100, kind, attrs, func, NODES.iter().copied().collect()).unwrap()
}

fn bound(v: impl Into<Value>) -> Vec<BoundValue> {
    vec![BoundValue::new(1, v.into())]
}

fn functions() -> MockCatalog {
    MockCatalog::new().with_function(7, &[Type::Integer], |args| match args {
        [Value::Integer(v)] => Ok(Value::Integer(v * 3)),
        _ => Ok(Value::Null),
    })
}

#[test]
fn resolver_is_deterministic() {
    let f = functions();
    for kind in [LocatorKind::Hash, LocatorKind::Modulo, LocatorKind::UserDefined] {
        let loc = loc(kind);
        for v in [0, 7, -3, 1_000_000] {
            let first = resolve_nodes(&loc, AccessType::Read, &bound(v), None, &f).unwrap();
            let second = resolve_nodes(&loc, AccessType::Read, &bound(v), None, &f).unwrap();
            assert_eq!(first, second);
            assert_eq!(first.nodes.len(), 1);
        }
    }
}

#[test]
fn hash_covers_every_node() {
    let f = functions();
    let loc = loc(LocatorKind::Hash);
    let mut hit = vec![0usize; NODES.len()];
    for v in 0..1000i64 {
        let exec = resolve_nodes(&loc, AccessType::Read, &bound(v), None, &f).unwrap();
        assert_eq!(exec.nodes.len(), 1);
        let pos = NODES.iter().position(|n| *n == exec.nodes[0]).unwrap();
        hit[pos] += 1;
    }
    assert!(hit.iter().all(|h| *h > 0), "unreachable node: {hit:?}");
}

#[test]
fn modulo_arithmetic() {
    let f = functions();
    let loc = loc(LocatorKind::Modulo);
    let exec = resolve_nodes(&loc, AccessType::Read, &bound(7), None, &f).unwrap();
    assert_eq!(exec.nodes.as_slice(), &[14]);
    // negative keys stay within the node list
    let exec = resolve_nodes(&loc, AccessType::Read, &bound(-1), None, &f).unwrap();
    assert_eq!(exec.nodes.as_slice(), &[14]);
    // unsigned and string keys coerce to integers
    let exec = resolve_nodes(&loc, AccessType::Read, &bound("6"), None, &f).unwrap();
    assert_eq!(exec.nodes.as_slice(), &[13]);
    let err = resolve_nodes(&loc, AccessType::Read, &bound("x"), None, &f).unwrap_err();
    assert!(matches!(err, PlannerError::FailedTo(..)));
}

#[test]
fn null_insert_routes_to_first_node() {
    let f = functions();
    for kind in [LocatorKind::Hash, LocatorKind::Modulo] {
        let loc = loc(kind);
        for _ in 0..10 {
            let exec = resolve_nodes(&loc, AccessType::Insert, &bound(Value::Null), None, &f)
                .unwrap();
            assert_eq!(exec.nodes.as_slice(), &[11]);
        }
        // a null qualifier never prunes a read
        let exec = resolve_nodes(&loc, AccessType::Read, &bound(Value::Null), None, &f).unwrap();
        assert_eq!(exec.nodes.as_slice(), &NODES);
    }
}

#[test]
fn contradicting_equalities_prune_everything() {
    let f = functions();
    let loc = loc(LocatorKind::Modulo);
    let values = vec![
        BoundValue::new(1, Value::Integer(1)),
        BoundValue::new(1, Value::Integer(2)),
    ];
    let exec = resolve_nodes(&loc, AccessType::Read, &values, None, &f).unwrap();
    assert!(exec.is_empty());

    // redundant but consistent equalities keep the single node
    let values = vec![
        BoundValue::new(1, Value::Integer(1)),
        BoundValue::new(1, Value::Integer(5)),
    ];
    let exec = resolve_nodes(&loc, AccessType::Read, &values, None, &f).unwrap();
    assert_eq!(exec.nodes.as_slice(), &[12]);
}

#[test]
fn replicated_access() {
    let f = functions();
    let loc = loc(LocatorKind::Replicated);

    let exec = resolve_nodes(&loc, AccessType::Read, &[], Some(13), &f).unwrap();
    assert_eq!(exec.nodes.as_slice(), &NODES);

    let exec = resolve_nodes(&loc, AccessType::ReadForUpdate, &[], Some(13), &f).unwrap();
    assert_eq!(
        exec,
        ExecNodes {
            nodes: smallvec![13],
            primary_nodes: smallvec![],
        }
    );

    let exec = resolve_nodes(&loc, AccessType::Insert, &[], Some(13), &f).unwrap();
    assert_eq!(exec.primary_nodes.as_slice(), &[13]);
    assert_eq!(exec.nodes.as_slice(), &[11, 12, 14]);
    assert_eq!(exec.all_nodes().as_slice(), &[13, 11, 12, 14]);

    // primary outside the node set is ignored
    let exec = resolve_nodes(&loc, AccessType::Update, &[], Some(99), &f).unwrap();
    assert!(exec.primary_nodes.is_empty());
    assert_eq!(exec.nodes.as_slice(), &NODES);
}

#[test]
fn round_robin_access() {
    let f = functions();
    let loc = loc(LocatorKind::RoundRobin);
    let exec = resolve_nodes(&loc, AccessType::Read, &[], None, &f).unwrap();
    assert_eq!(exec.nodes.as_slice(), &NODES);

    let first = resolve_nodes(&loc, AccessType::Insert, &[], None, &f).unwrap();
    let second = resolve_nodes(&loc, AccessType::Insert, &[], None, &f).unwrap();
    assert_eq!(first.nodes.len(), 1);
    assert_ne!(first.nodes, second.nodes);
}

#[test]
fn user_defined_function() {
    let f = functions();
    let loc = loc(LocatorKind::UserDefined);
    // func7(5) = 15, 15 mod 4 = 3
    let exec = resolve_nodes(&loc, AccessType::Read, &bound(5), None, &f).unwrap();
    assert_eq!(exec.nodes.as_slice(), &[14]);
    // arguments are coerced to the declared parameter types
    let exec = resolve_nodes(&loc, AccessType::Read, &bound("5"), None, &f).unwrap();
    assert_eq!(exec.nodes.as_slice(), &[14]);

    let exec = resolve_nodes(&loc, AccessType::Read, &[], None, &f).unwrap();
    assert_eq!(exec.nodes.as_slice(), &NODES);
    let exec = resolve_nodes(&loc, AccessType::Insert, &[], None, &f).unwrap();
    assert_eq!(exec.nodes.as_slice(), &[11]);
    let exec = resolve_nodes(&loc, AccessType::Insert, &bound(Value::Null), None, &f).unwrap();
    assert_eq!(exec.nodes.as_slice(), &[11]);

    let err = resolve_nodes(&loc, AccessType::Read, &bound(5), None, &MockCatalog::new())
        .unwrap_err();
    assert_eq!(err.to_string(), "function not found: 7");
}

#[test]
fn key_bindings_from_qualifiers() {
    let mut params = ParamValues::new();
    params.insert(1, Value::Integer(42));
    let random = Expr::Func(FuncExpr {
        func: 99,
        name: "random".into(),
        args: vec![],
        volatility: Volatility::Volatile,
    });
    let quals = vec![
        Expr::eq(Expr::val(3), Expr::cast(Expr::col(0, 1), Type::Integer)),
        Expr::eq(Expr::col(0, 1), Expr::extern_param(1, Type::Integer)),
        Expr::eq(Expr::col(0, 1), random),
        Expr::eq(Expr::col(0, 1), Expr::exec_param(0, Type::Integer)),
        Expr::eq(Expr::col(0, 1), Expr::col(1, 1)),
        Expr::eq(Expr::col(0, 2), Expr::val(5)),
        Expr::eq(Expr::col(1, 1), Expr::val(5)),
    ];
    let b = extract_key_bindings(0, &[(1, Type::Integer)], &quals, &params, false);
    assert_eq!(
        b.values,
        vec![
            BoundValue::new(1, Value::Integer(3)),
            BoundValue::new(1, Value::Integer(42)),
        ]
    );
    assert_eq!(b.deferred, vec![quals[3].clone()]);

    let b = extract_key_bindings(0, &[(1, Type::Integer)], &quals, &params, true);
    assert_eq!(b.values, vec![BoundValue::new(1, Value::Integer(3))]);
}

#[test]
fn coerced_key_binds_in_column_type() {
    let params = ParamValues::new();
    let keys = [(1, Type::Integer)];
    // CAST(t.id AS string) = '7' binds the integer 7
    let quals = vec![Expr::eq(
        Expr::cast(Expr::col(0, 1), Type::String),
        Expr::val("7"),
    )];
    let b = extract_key_bindings(0, &keys, &quals, &params, false);
    assert_eq!(b.values, vec![BoundValue::new(1, Value::Integer(7))]);

    let f = functions();
    let l = loc(LocatorKind::Hash);
    let direct = resolve_nodes(&l, AccessType::Read, &bound(7), None, &f).unwrap();
    let coerced = resolve_nodes(&l, AccessType::Read, &b.values, None, &f).unwrap();
    assert_eq!(coerced, direct);
    assert_eq!(coerced.nodes.len(), 1);

    // a constant that isn't a valid key value leaves the key unbound
    let quals = vec![Expr::eq(
        Expr::cast(Expr::col(0, 1), Type::String),
        Expr::val("seven"),
    )];
    let b = extract_key_bindings(0, &keys, &quals, &params, false);
    assert!(b.values.is_empty());

    // CAST(t.code AS integer) = 7 matches both '7' and '07': no pruning
    let quals = vec![Expr::eq(
        Expr::cast(Expr::col(0, 1), Type::Integer),
        Expr::val(7),
    )];
    let b = extract_key_bindings(0, &[(1, Type::String)], &quals, &params, false);
    assert!(b.values.is_empty());
}

#[test]
fn descriptor_equality() {
    let nodes: NodeList = NODES.iter().copied().collect();
    let key = smallvec![ColumnRef::new(0, 1)];
    let a = ReduceInfo::by_value(PartitionMethod::Hash, key, nodes.clone());
    let b = a.clone().with_exclude(smallvec![12]);
    let c = ReduceInfo::replicated(nodes.clone());
    let d = ReduceInfo::replicated(smallvec![14, 13, 12, 11]);
    let all = [
        a.clone(),
        b.clone(),
        c.clone(),
        d.clone(),
        ReduceInfo::coordinator(),
        ReduceInfo::random(nodes.clone()),
        ReduceInfo::final_replicate(nodes),
    ];
    for x in &all {
        assert!(x.equal(x), "{x} is not equal to itself");
        for y in &all {
            assert_eq!(x.equal(y), y.equal(x), "{x} vs {y}");
        }
    }
    assert!(!a.equal(&b));
    assert!(c.equal(&d));
    assert!(!c.equal(&ReduceInfo::final_replicate(c.nodes.clone())));
    assert_eq!(b.effective_nodes().as_slice(), &[11, 13, 14]);
    assert_eq!(b.to_string(), "hash(r0.c1) on [11 13 14]");
    assert_eq!(a.restrict_to(13).single_node(), Some(13));
    assert!(a.with_exclude(NODES.iter().copied().collect()).is_empty());
    assert!(!ReduceInfo::coordinator().is_empty());
}

#[test]
fn remap_through_subquery_target() {
    let nodes: NodeList = NODES.iter().copied().collect();
    let by_value = ReduceInfo::by_value(
        PartitionMethod::Modulo,
        smallvec![ColumnRef::new(0, 2)],
        nodes,
    );
    let target = vec![
        TargetEntry::new(Expr::col(0, 1), "a"),
        TargetEntry::new(Expr::col(0, 2), "b"),
    ];
    let remapped = by_value.remap_through(&target, 5);
    assert_eq!(remapped.keys(), Some(&[ColumnRef::new(5, 2)][..]));

    let lost = by_value.remap_through(&target[..1], 5);
    assert_eq!(lost.kind, ReduceKind::Random);
    assert!(lost.equal(&ReduceInfo::random(by_value.nodes.clone())));
}
