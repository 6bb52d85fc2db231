//! Equivalence classes of columns known to be equal after the inner joins
//! of a query level are applied.

use smallvec::SmallVec;

use super::expression::{ColumnRef, Expr, ParamValues};
use super::relids::{RelIndex, Relids};
use super::value::Value;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EqClass {
    pub members: SmallVec<[ColumnRef; 4]>,
    /// Constants the class is equal to, with the column of the qualifier
    /// each one came from.
    pub constants: Vec<(Value, ColumnRef)>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EquivalenceClasses {
    classes: Vec<EqClass>,
}

impl EquivalenceClasses {
    /// Collect classes from mergejoinable equalities among `quals`.
    /// Qualifiers with volatile functions or run-time parameters never
    /// contribute.
    #[must_use]
    pub fn build(quals: &[Expr], params: &ParamValues) -> Self {
        let mut ecs = EquivalenceClasses::default();
        for q in quals {
            if q.contains_volatile() || q.contains_exec_param() {
                continue;
            }
            let Some((l, r)) = q.as_joinable_equality() else {
                continue;
            };
            if !matches!(q, Expr::Op { op, .. } if op.mergejoinable) {
                continue;
            }
            match (l.as_column(), r.as_column()) {
                (Some(a), Some(b)) => ecs.merge(a, b),
                (Some(c), None) | (None, Some(c)) => {
                    let other = if l.as_column().is_some() { r } else { l };
                    if other.contains_column() {
                        continue;
                    }
                    if let Some(v) = other.fold_constant(params) {
                        if !v.is_null() {
                            let idx = ecs.class_for(c);
                            ecs.classes[idx].constants.push((v, c));
                        }
                    }
                }
                (None, None) => {}
            }
        }
        ecs
    }

    fn class_for(&mut self, c: ColumnRef) -> usize {
        if let Some(idx) = self.class_of(c) {
            return idx;
        }
        let mut class = EqClass::default();
        class.members.push(c);
        self.classes.push(class);
        self.classes.len() - 1
    }

    fn merge(&mut self, a: ColumnRef, b: ColumnRef) {
        let ia = self.class_for(a);
        let ib = self.class_for(b);
        if ia == ib {
            return;
        }
        let (keep, drop) = if ia < ib { (ia, ib) } else { (ib, ia) };
        let dropped = self.classes.remove(drop);
        let kept = &mut self.classes[keep];
        kept.members.extend(dropped.members);
        kept.constants.extend(dropped.constants);
    }

    #[must_use]
    pub fn class_of(&self, c: ColumnRef) -> Option<usize> {
        self.classes.iter().position(|ec| ec.members.contains(&c))
    }

    #[must_use]
    pub fn classes(&self) -> &[EqClass] {
        &self.classes
    }

    #[must_use]
    pub fn are_equal(&self, a: ColumnRef, b: ColumnRef) -> bool {
        a == b || matches!((self.class_of(a), self.class_of(b)), (Some(x), Some(y)) if x == y)
    }

    /// `column = constant` restrictions implied for relation `rel` by
    /// classes holding a constant. Qualifiers already present in the query
    /// (the constant's own column) are not repeated.
    #[must_use]
    pub fn derived_restrictions(&self, rel: RelIndex) -> Vec<Expr> {
        let mut derived = Vec::new();
        for ec in &self.classes {
            for member in ec.members.iter().filter(|m| m.rel == rel) {
                for (value, origin) in &ec.constants {
                    if origin != member {
                        derived.push(Expr::eq(
                            Expr::Column(*member),
                            Expr::Const(value.clone()),
                        ));
                    }
                }
            }
        }
        derived
    }

    /// One equality per class linking a member inside `outer` with a
    /// member inside `inner`.
    #[must_use]
    pub fn join_clauses(&self, outer: Relids, inner: Relids) -> Vec<Expr> {
        let mut clauses = Vec::new();
        for ec in &self.classes {
            let o = ec.members.iter().find(|m| outer.contains(m.rel));
            let i = ec.members.iter().find(|m| inner.contains(m.rel));
            if let (Some(o), Some(i)) = (o, i) {
                clauses.push(Expr::eq(Expr::Column(*o), Expr::Column(*i)));
            }
        }
        clauses
    }

    /// Qualifier absorbed into a class: a mergejoinable equality of two
    /// columns. The join search takes such clauses from the classes instead.
    #[must_use]
    pub fn absorbs(&self, qual: &Expr) -> bool {
        if qual.contains_volatile() || qual.contains_exec_param() {
            return false;
        }
        let Some((l, r)) = qual.as_joinable_equality() else {
            return false;
        };
        if !matches!(qual, Expr::Op { op, .. } if op.mergejoinable) {
            return false;
        }
        matches!((l.as_column(), r.as_column()), (Some(a), Some(b)) if self.are_equal(a, b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::expression::{Operator, OperatorKind};
    use pretty_assertions::assert_eq;

    #[test]
    fn transitive_classes_and_constants() {
        let quals = vec![
            Expr::eq(Expr::col(0, 1), Expr::col(1, 1)),
            Expr::eq(Expr::col(1, 1), Expr::col(2, 3)),
            Expr::eq(Expr::col(0, 1), Expr::val(7)),
            Expr::binary(
                Operator::new(">", OperatorKind::Gt),
                Expr::col(0, 2),
                Expr::val(1),
            ),
        ];
        let ecs = EquivalenceClasses::build(&quals, &ParamValues::new());
        assert_eq!(ecs.classes().len(), 1);
        assert!(ecs.are_equal(ColumnRef::new(0, 1), ColumnRef::new(2, 3)));
        assert!(!ecs.are_equal(ColumnRef::new(0, 1), ColumnRef::new(0, 2)));

        // the constant's own column doesn't get a duplicate restriction
        assert!(ecs.derived_restrictions(0).is_empty());
        assert_eq!(
            ecs.derived_restrictions(2),
            vec![Expr::eq(Expr::col(2, 3), Expr::val(7))]
        );

        let clauses = ecs.join_clauses(Relids::single(0), Relids::from_slice(&[1, 2]));
        assert_eq!(clauses, vec![Expr::eq(Expr::col(0, 1), Expr::col(1, 1))]);
        assert!(ecs.absorbs(&quals[1]));
        assert!(!ecs.absorbs(&quals[3]));
    }

    #[test]
    fn coerced_column_stays_out_of_classes() {
        // a.id = CAST(b.s AS integer) AND a.id = 7 says nothing about b.s
        let quals = vec![
            Expr::eq(
                Expr::col(0, 1),
                Expr::cast(Expr::col(1, 1), crate::ir::value::Type::Integer),
            ),
            Expr::eq(Expr::col(0, 1), Expr::val(7)),
        ];
        let ecs = EquivalenceClasses::build(&quals, &ParamValues::new());
        assert!(!ecs.are_equal(ColumnRef::new(0, 1), ColumnRef::new(1, 1)));
        assert!(ecs.derived_restrictions(1).is_empty());
        assert!(!ecs.absorbs(&quals[0]));
    }

    #[test]
    fn opaque_equality_is_ignored() {
        let quals = vec![Expr::binary(
            Operator::opaque_eq(),
            Expr::col(0, 1),
            Expr::col(1, 1),
        )];
        let ecs = EquivalenceClasses::build(&quals, &ParamValues::new());
        assert!(!ecs.are_equal(ColumnRef::new(0, 1), ColumnRef::new(1, 1)));
    }
}
