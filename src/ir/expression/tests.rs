use super::*;
use pretty_assertions::assert_eq;

fn plus(l: Expr, r: Expr) -> Expr {
    Expr::binary(Operator::new("+", OperatorKind::Plus), l, r)
}

fn random_fn() -> Expr {
    Expr::Func(FuncExpr {
        func: 1,
        name: "random".into(),
        args: vec![],
        volatility: Volatility::Volatile,
    })
}

#[test]
fn fold_arithmetic_and_casts() {
    let params = ParamValues::new();
    let e = Expr::cast(plus(Expr::val(3), Expr::val(4)), Type::Unsigned);
    assert_eq!(e.fold_constant(&params), Some(Value::Unsigned(7)));

    let e = plus(Expr::val(3), Expr::col(0, 1));
    assert_eq!(e.fold_constant(&params), None);

    let overflow = plus(Expr::val(i64::MAX), Expr::val(1));
    assert_eq!(overflow.fold_constant(&params), None);

    let with_null = plus(Expr::val(3), Expr::Const(Value::Null));
    assert_eq!(with_null.fold_constant(&params), Some(Value::Null));
}

#[test]
fn fold_extern_params() {
    let mut params = ParamValues::new();
    params.insert(1, Value::from("12"));
    let e = Expr::extern_param(1, Type::Integer);
    assert_eq!(e.fold_constant(&params), Some(Value::Integer(12)));

    // unbound parameter is not a constant
    let e = Expr::extern_param(2, Type::Integer);
    assert_eq!(e.fold_constant(&params), None);

    // exec parameters are never constants at plan time
    let e = Expr::exec_param(1, Type::Integer);
    assert_eq!(e.fold_constant(&params), None);
}

#[test]
fn constant_false_qualifiers() {
    let params = ParamValues::new();
    assert!(Expr::val(false).is_constant_false(&params));
    assert!(Expr::eq(Expr::val(1), Expr::val(2)).is_constant_false(&params));
    assert!(!Expr::eq(Expr::val(1), Expr::val(1)).is_constant_false(&params));
    let and = Expr::Bool {
        op: BoolOp::And,
        args: vec![Expr::val(true), Expr::val(false)],
    };
    assert!(and.is_constant_false(&params));
    assert!(!Expr::eq(Expr::col(0, 1), Expr::val(2)).is_constant_false(&params));
}

#[test]
fn hazards() {
    let q = Expr::eq(Expr::col(0, 1), plus(Expr::exec_param(0, Type::Integer), random_fn()));
    assert!(q.contains_exec_param());
    assert!(q.contains_volatile());
    assert_eq!(q.referenced_rels(), Relids::single(0));

    let q = Expr::eq(Expr::col(0, 1), Expr::val(1));
    assert!(!q.contains_exec_param());
    assert!(!q.contains_volatile());
}

#[test]
fn equality_recognition() {
    let q = Expr::eq(Expr::col(1, 2), Expr::val(5));
    let (l, r) = q.as_joinable_equality().unwrap();
    assert_eq!(l.as_column(), Some(ColumnRef::new(1, 2)));
    assert_eq!(r.as_column(), None);

    // '07' and '7' are equal as integers: the coerced column is opaque
    let q = Expr::eq(Expr::cast(Expr::col(1, 2), Type::Integer), Expr::val(5));
    let (l, _) = q.as_joinable_equality().unwrap();
    assert_eq!(l.as_column(), None);

    let opaque = Expr::binary(Operator::opaque_eq(), Expr::col(1, 2), Expr::val(5));
    assert!(opaque.as_joinable_equality().is_none());
}

#[test]
fn replace_rel_and_display() {
    let q = Expr::eq(Expr::col(0, 1), plus(Expr::col(0, 2), Expr::extern_param(1, Type::Integer)));
    let moved = q.replace_rel(0, 4);
    assert_eq!(moved.to_string(), "r4.c1 = r4.c2 + $1");
    assert_eq!(moved.referenced_rels(), Relids::single(4));
}
