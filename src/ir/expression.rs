//! Normalized expression trees.
//!
//! The planner never evaluates general expressions: it only needs to fold
//! constants out of partition-key qualifiers, recognize equality operators
//! and detect hazards (volatile functions, correlated parameters).

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt::{self, Display, Formatter};

use super::relids::{RelIndex, Relids};
use super::value::{Type, Value};

/// One-based column number inside a relation.
pub type AttrNumber = u16;

pub type FuncId = u32;

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct ColumnRef {
    pub rel: RelIndex,
    pub attno: AttrNumber,
}

impl ColumnRef {
    #[must_use]
    pub fn new(rel: RelIndex, attno: AttrNumber) -> Self {
        ColumnRef { rel, attno }
    }
}

impl Display for ColumnRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "r{}.c{}", self.rel, self.attno)
    }
}

/// `Extern` parameters are supplied by the client when the statement is
/// bound. `Exec` parameters are produced by an outer plan node at run time
/// (correlated subqueries, lateral references).
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ParamKind {
    Extern,
    Exec,
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Param {
    pub id: u16,
    pub kind: ParamKind,
    pub ty: Type,
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum OperatorKind {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Multiply,
    Other,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Operator {
    pub name: SmolStr,
    pub kind: OperatorKind,
    /// The operator is the equality of some btree opfamily.
    pub mergejoinable: bool,
    /// The operator is the equality of some hash opfamily.
    pub hashjoinable: bool,
}

impl Operator {
    #[must_use]
    pub fn new(name: &str, kind: OperatorKind) -> Self {
        let equality = kind == OperatorKind::Eq;
        Operator {
            name: SmolStr::from(name),
            kind,
            mergejoinable: equality,
            hashjoinable: equality,
        }
    }

    #[must_use]
    pub fn eq() -> Self {
        Self::new("=", OperatorKind::Eq)
    }

    /// Equality that can't be used for merge or hash joins
    /// (e.g. a cross-type comparison without an opfamily).
    #[must_use]
    pub fn opaque_eq() -> Self {
        Operator {
            name: SmolStr::from("=="),
            kind: OperatorKind::Eq,
            mergejoinable: false,
            hashjoinable: false,
        }
    }

    #[must_use]
    pub fn is_joinable_equality(&self) -> bool {
        self.kind == OperatorKind::Eq && (self.mergejoinable || self.hashjoinable)
    }

    #[must_use]
    pub fn is_range(&self) -> bool {
        matches!(
            self.kind,
            OperatorKind::Lt | OperatorKind::LtEq | OperatorKind::Gt | OperatorKind::GtEq
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum Volatility {
    Immutable,
    Stable,
    Volatile,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct FuncExpr {
    pub func: FuncId,
    pub name: SmolStr,
    pub args: Vec<Expr>,
    pub volatility: Volatility,
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BoolOp {
    And,
    Or,
    Not,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub enum Expr {
    Column(ColumnRef),
    Const(Value),
    Param(Param),
    /// Type coercion wrapper.
    Cast { child: Box<Expr>, to: Type },
    Op { op: Operator, args: Vec<Expr> },
    Func(FuncExpr),
    Bool { op: BoolOp, args: Vec<Expr> },
}

/// Values of extern parameters known at bind time.
pub type ParamValues = AHashMap<u16, Value>;

impl Expr {
    #[must_use]
    pub fn col(rel: RelIndex, attno: AttrNumber) -> Self {
        Expr::Column(ColumnRef::new(rel, attno))
    }

    #[must_use]
    pub fn val(v: impl Into<Value>) -> Self {
        Expr::Const(v.into())
    }

    #[must_use]
    pub fn eq(left: Expr, right: Expr) -> Self {
        Expr::Op {
            op: Operator::eq(),
            args: vec![left, right],
        }
    }

    #[must_use]
    pub fn binary(op: Operator, left: Expr, right: Expr) -> Self {
        Expr::Op {
            op,
            args: vec![left, right],
        }
    }

    #[must_use]
    pub fn exec_param(id: u16, ty: Type) -> Self {
        Expr::Param(Param {
            id,
            kind: ParamKind::Exec,
            ty,
        })
    }

    #[must_use]
    pub fn extern_param(id: u16, ty: Type) -> Self {
        Expr::Param(Param {
            id,
            kind: ParamKind::Extern,
            ty,
        })
    }

    #[must_use]
    pub fn cast(child: Expr, to: Type) -> Self {
        Expr::Cast {
            child: Box::new(child),
            to,
        }
    }

    #[must_use]
    pub fn children(&self) -> &[Expr] {
        match self {
            Expr::Column(_) | Expr::Const(_) | Expr::Param(_) => &[],
            Expr::Cast { child, .. } => std::slice::from_ref(child.as_ref()),
            Expr::Op { args, .. } | Expr::Bool { args, .. } => args,
            Expr::Func(f) => &f.args,
        }
    }

    /// Pre-order search. Returns `true` as soon as `pred` matches.
    pub fn any(&self, pred: &mut impl FnMut(&Expr) -> bool) -> bool {
        if pred(self) {
            return true;
        }
        self.children().iter().any(|c| c.any(pred))
    }

    #[must_use]
    pub fn contains_volatile(&self) -> bool {
        self.any(&mut |e| matches!(e, Expr::Func(f) if f.volatility == Volatility::Volatile))
    }

    #[must_use]
    pub fn contains_exec_param(&self) -> bool {
        self.any(&mut |e| {
            matches!(
                e,
                Expr::Param(Param {
                    kind: ParamKind::Exec,
                    ..
                })
            )
        })
    }

    #[must_use]
    pub fn contains_column(&self) -> bool {
        self.any(&mut |e| matches!(e, Expr::Column(_)))
    }

    #[must_use]
    pub fn referenced_rels(&self) -> Relids {
        let mut rels = Relids::empty();
        self.any(&mut |e| {
            if let Expr::Column(c) = e {
                rels = rels.union(Relids::single(c.rel));
            }
            false
        });
        rels
    }

    /// A bare column reference. A coerced column compares in another value
    /// space, so it is not one.
    #[must_use]
    pub fn as_column(&self) -> Option<ColumnRef> {
        match self {
            Expr::Column(c) => Some(*c),
            _ => None,
        }
    }

    /// Operands of a merge/hash-joinable equality.
    #[must_use]
    pub fn as_joinable_equality(&self) -> Option<(&Expr, &Expr)> {
        match self {
            Expr::Op { op, args } if op.is_joinable_equality() && args.len() == 2 => {
                Some((&args[0], &args[1]))
            }
            _ => None,
        }
    }

    /// Fold the expression into a constant. Constants, coercions, bound
    /// extern parameters, integer arithmetic, equality and boolean
    /// connectives fold; anything else is not a constant.
    #[must_use]
    pub fn fold_constant(&self, params: &ParamValues) -> Option<Value> {
        match self {
            Expr::Const(v) => Some(v.clone()),
            Expr::Param(Param {
                id,
                kind: ParamKind::Extern,
                ty,
            }) => params.get(id).and_then(|v| v.cast(*ty).ok()),
            Expr::Param(_) | Expr::Column(_) | Expr::Func(_) => None,
            Expr::Cast { child, to } => child.fold_constant(params)?.cast(*to).ok(),
            Expr::Op { op, args } if args.len() == 2 => {
                let l = args[0].fold_constant(params)?;
                let r = args[1].fold_constant(params)?;
                fold_binary(op.kind, &l, &r)
            }
            Expr::Op { .. } => None,
            Expr::Bool { op, args } => {
                let vals: Option<Vec<Value>> =
                    args.iter().map(|a| a.fold_constant(params)).collect();
                let vals = vals?;
                match op {
                    BoolOp::Not => {
                        let v = vals.first()?;
                        if v.is_null() {
                            return Some(Value::Null);
                        }
                        Some(Value::Boolean(!v.as_bool()?))
                    }
                    BoolOp::And => {
                        let mut null = false;
                        for v in &vals {
                            match v {
                                Value::Null => null = true,
                                Value::Boolean(false) => return Some(Value::Boolean(false)),
                                Value::Boolean(true) => {}
                                _ => return None,
                            }
                        }
                        Some(if null { Value::Null } else { Value::Boolean(true) })
                    }
                    BoolOp::Or => {
                        let mut null = false;
                        for v in &vals {
                            match v {
                                Value::Null => null = true,
                                Value::Boolean(true) => return Some(Value::Boolean(true)),
                                Value::Boolean(false) => {}
                                _ => return None,
                            }
                        }
                        Some(if null { Value::Null } else { Value::Boolean(false) })
                    }
                }
            }
        }
    }

    /// Qualifier that is constant false or null (filters out every row).
    #[must_use]
    pub fn is_constant_false(&self, params: &ParamValues) -> bool {
        if self.contains_column() || self.contains_exec_param() {
            return false;
        }
        matches!(
            self.fold_constant(params),
            Some(Value::Boolean(false) | Value::Null)
        )
    }

    /// Rewrite column references of relation `from` into `to`.
    #[must_use]
    pub fn replace_rel(&self, from: RelIndex, to: RelIndex) -> Expr {
        match self {
            Expr::Column(c) if c.rel == from => Expr::Column(ColumnRef::new(to, c.attno)),
            Expr::Column(_) | Expr::Const(_) | Expr::Param(_) => self.clone(),
            Expr::Cast { child, to: ty } => Expr::Cast {
                child: Box::new(child.replace_rel(from, to)),
                to: *ty,
            },
            Expr::Op { op, args } => Expr::Op {
                op: op.clone(),
                args: args.iter().map(|a| a.replace_rel(from, to)).collect(),
            },
            Expr::Func(f) => Expr::Func(FuncExpr {
                func: f.func,
                name: f.name.clone(),
                args: f.args.iter().map(|a| a.replace_rel(from, to)).collect(),
                volatility: f.volatility,
            }),
            Expr::Bool { op, args } => Expr::Bool {
                op: *op,
                args: args.iter().map(|a| a.replace_rel(from, to)).collect(),
            },
        }
    }
}

fn fold_binary(kind: OperatorKind, l: &Value, r: &Value) -> Option<Value> {
    if l.is_null() || r.is_null() {
        return Some(Value::Null);
    }
    match kind {
        OperatorKind::Plus | OperatorKind::Minus | OperatorKind::Multiply => {
            let (a, b) = (l.as_i128()?, r.as_i128()?);
            let res = match kind {
                OperatorKind::Plus => a.checked_add(b)?,
                OperatorKind::Minus => a.checked_sub(b)?,
                _ => a.checked_mul(b)?,
            };
            Some(Value::Integer(i64::try_from(res).ok()?))
        }
        OperatorKind::Eq | OperatorKind::NotEq => {
            let equal = match (l.as_i128(), r.as_i128()) {
                (Some(a), Some(b)) => a == b,
                _ => l == r,
            };
            Some(Value::Boolean(equal == (kind == OperatorKind::Eq)))
        }
        _ => None,
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(c) => write!(f, "{c}"),
            Expr::Const(v) => write!(f, "{v}"),
            Expr::Param(p) => match p.kind {
                ParamKind::Extern => write!(f, "${}", p.id),
                ParamKind::Exec => write!(f, "$exec{}", p.id),
            },
            Expr::Cast { child, to } => write!(f, "{child}::{to}"),
            Expr::Op { op, args } => match args.as_slice() {
                [l, r] => write!(f, "{l} {} {r}", op.name),
                _ => {
                    write!(f, "{}(", op.name)?;
                    write_list(f, args)?;
                    write!(f, ")")
                }
            },
            Expr::Func(func) => {
                write!(f, "{}(", func.name)?;
                write_list(f, &func.args)?;
                write!(f, ")")
            }
            Expr::Bool { op, args } => match op {
                BoolOp::Not => {
                    write!(f, "NOT (")?;
                    write_list(f, args)?;
                    write!(f, ")")
                }
                BoolOp::And | BoolOp::Or => {
                    let sep = if *op == BoolOp::And { " AND " } else { " OR " };
                    write!(f, "(")?;
                    for (i, a) in args.iter().enumerate() {
                        if i > 0 {
                            write!(f, "{sep}")?;
                        }
                        write!(f, "{a}")?;
                    }
                    write!(f, ")")
                }
            },
        }
    }
}

fn write_list(f: &mut Formatter<'_>, args: &[Expr]) -> fmt::Result {
    for (i, a) in args.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{a}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests;
