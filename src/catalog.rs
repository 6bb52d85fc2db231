//! Interfaces of the catalog and function collaborators.
//!
//! The planner never touches storage: relation metadata, statistics and
//! user-defined distribution functions are reached through these traits.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::errors::PlannerError;
use crate::ir::expression::{AttrNumber, Expr, FuncId};
use crate::ir::value::{Type, Value};
use crate::topology::NodeOid;

/// Catalog identifier of a relation.
pub type RelId = u32;

/// Raw distribution record as stored in the node catalog.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct LocatorRecord {
    /// `R` replicated, `H` hash, `M` modulo, `N` round robin,
    /// `U` user-defined function, `L` local.
    pub kind_code: char,
    pub partition_columns: Vec<SmolStr>,
    pub partition_func: Option<FuncId>,
    pub nodes: Vec<NodeOid>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct ColumnDef {
    pub name: SmolStr,
    pub ty: Type,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct IndexDef {
    pub name: SmolStr,
    pub columns: Vec<AttrNumber>,
    pub unique: bool,
}

/// Size estimate of a relation after applying restriction qualifiers.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct RelSize {
    pub rows: f64,
    /// Average row width in bytes.
    pub width: f64,
    /// Pages of the whole relation (qualifiers don't change it).
    pub pages: f64,
}

pub trait Catalog {
    /// # Errors
    /// - relation doesn't exist
    fn columns(&self, rel: RelId) -> Result<Vec<ColumnDef>, PlannerError>;

    /// Distribution record of the relation; `None` means a local,
    /// unsharded relation.
    ///
    /// # Errors
    /// - relation doesn't exist
    fn locator_record(&self, rel: RelId) -> Result<Option<LocatorRecord>, PlannerError>;

    /// Estimate the rows passing `quals` (all of them reference only
    /// `rel`) and their average width.
    ///
    /// # Errors
    /// - relation doesn't exist
    fn estimate_rows_and_width(&self, rel: RelId, quals: &[Expr]) -> Result<RelSize, PlannerError>;

    /// # Errors
    /// - relation doesn't exist
    fn indexes(&self, rel: RelId) -> Result<Vec<IndexDef>, PlannerError>;

    /// Session-local temporary relation.
    ///
    /// # Errors
    /// - relation doesn't exist
    fn is_temp(&self, rel: RelId) -> Result<bool, PlannerError>;
}

/// Access to user-defined distribution functions.
pub trait FunctionRegistry {
    /// # Errors
    /// - function doesn't exist
    fn param_types(&self, func: FuncId) -> Result<Vec<Type>, PlannerError>;

    /// # Errors
    /// - function doesn't exist or fails
    fn call(&self, func: FuncId, args: &[Value]) -> Result<Value, PlannerError>;
}
