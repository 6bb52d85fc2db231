//! Extraction of partition key values from restriction qualifiers.

use crate::ir::expression::{AttrNumber, BoolOp, ColumnRef, Expr, ParamValues};
use crate::ir::relids::RelIndex;
use crate::ir::value::Type;

use super::resolver::BoundValue;

/// Partition key bindings found among the qualifiers of one relation.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct KeyBindings {
    pub values: Vec<BoundValue>,
    /// Equalities on a key column whose other side is only known at run
    /// time (it references an executor parameter).
    pub deferred: Vec<Expr>,
}

fn flatten_and<'e>(qual: &'e Expr, out: &mut Vec<&'e Expr>) {
    match qual {
        Expr::Bool {
            op: BoolOp::And,
            args,
        } => args.iter().for_each(|a| flatten_and(a, out)),
        _ => out.push(qual),
    }
}

/// Partition column of `rel` under `expr` and its catalog type. Coercions
/// wrapped around the column are looked through only while each of them is
/// lossless.
fn key_column(
    expr: &Expr,
    rel: RelIndex,
    keys: &[(AttrNumber, Type)],
) -> Option<(ColumnRef, Type)> {
    let mut coercions = Vec::new();
    let mut e = expr;
    while let Expr::Cast { child, to } = e {
        coercions.push(*to);
        e = child;
    }
    let Expr::Column(col) = e else {
        return None;
    };
    if col.rel != rel {
        return None;
    }
    let (_, ty) = keys.iter().find(|(attno, _)| *attno == col.attno)?;
    let mut from = *ty;
    for to in coercions.into_iter().rev() {
        if !from.casts_losslessly_to(to) {
            return None;
        }
        from = to;
    }
    Some((*col, *ty))
}

/// Match `key = expr` (or `expr = key`) conjuncts where `key` is a
/// partition column of relation `rel` (given with its column type) and
/// `expr` folds to a constant. The constant is coerced to the column type
/// before it is bound. Only merge or hash joinable equalities qualify;
/// expressions that don't fold or don't coerce leave the key unbound. With
/// `first_match_only` a key column is bound at most once.
#[must_use]
pub fn extract_key_bindings(
    rel: RelIndex,
    keys: &[(AttrNumber, Type)],
    quals: &[Expr],
    params: &ParamValues,
    first_match_only: bool,
) -> KeyBindings {
    let mut conjuncts = Vec::new();
    for q in quals {
        flatten_and(q, &mut conjuncts);
    }
    let mut bindings = KeyBindings::default();
    for qual in conjuncts {
        let Some((l, r)) = qual.as_joinable_equality() else {
            continue;
        };
        let ((col, ty), other) = match (key_column(l, rel, keys), key_column(r, rel, keys)) {
            (Some(k), _) => (k, r),
            (_, Some(k)) => (k, l),
            _ => continue,
        };
        if other.contains_column() {
            continue;
        }
        if other.contains_exec_param() {
            bindings.deferred.push(qual.clone());
            continue;
        }
        if first_match_only && bindings.values.iter().any(|b| b.attno == col.attno) {
            continue;
        }
        let Some(value) = other.fold_constant(params) else {
            continue;
        };
        if let Ok(value) = value.cast(ty) {
            bindings.values.push(BoundValue::new(col.attno, value));
        }
    }
    bindings
}
