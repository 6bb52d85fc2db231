//! Normalized query representation consumed by the planner.
//!
//! The parser and rewriter live elsewhere: by the time a query reaches the
//! planner its expressions are already type-checked, outer joins are reduced
//! where possible and the WHERE clause is split into conjuncts.

pub mod equivalence;
pub mod expression;
pub mod query;
pub mod relids;
pub mod value;
