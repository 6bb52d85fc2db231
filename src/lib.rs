//! Distribution-aware query planner for a sharded SQL cluster.
//!
//! Given a normalized [`Query`], the planner searches access paths and join
//! orders twice: once for execution on the coordinator alone and once for
//! execution where the data lives. Each distributed path tracks the nodes
//! holding its rows ([`ReduceInfo`]); mismatched inputs are reconciled by
//! explicit redistribution steps. The cheaper plan wins.
//!
//! ```ignore
//! // needs the `mock` feature
//! use std::sync::Arc;
//! use cluster_planner::config::PlannerConfig;
//! use cluster_planner::ir::expression::Expr;
//! use cluster_planner::ir::query::{Query, RangeEntry};
//! use cluster_planner::ir::value::Type;
//! use cluster_planner::mock::{MockCatalog, MockRegistry};
//! use cluster_planner::Planner;
//!
//! let catalog = Arc::new(
//!     MockCatalog::new()
//!         .with_table(1, &[("id", Type::Integer)], 10_000.0)
//!         .with_locator(1, 'H', &["id"], &[11, 12, 13, 14]),
//! );
//! let registry = Arc::new(MockRegistry::new(&[1], &[11, 12, 13, 14]));
//! let planner = Planner::new(catalog.clone(), registry, catalog, PlannerConfig::default()).unwrap();
//!
//! let query = Query {
//!     range_table: vec![RangeEntry::Relation { rel_id: 1, alias: "t".into() }],
//!     quals: vec![Expr::eq(Expr::col(0, 1), Expr::val(7))],
//!     ..Query::default()
//! };
//! let plan = planner.plan(&query).unwrap();
//! assert!(plan.cluster_plan_ok);
//! assert_eq!(plan.dispatch.nodes.len(), 1);
//! ```

pub mod catalog;
pub mod config;
pub mod distribution;
pub mod errors;
pub mod ir;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod path;
pub mod plan;
pub mod planner;
pub mod tlog;
pub mod topology;

pub use crate::distribution::reduce::ReduceInfo;
pub use crate::errors::PlannerError;
pub use crate::ir::query::Query;
pub use crate::plan::FinalPlan;
pub use crate::planner::Planner;
