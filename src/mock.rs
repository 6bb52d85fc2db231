//! In-memory catalog, node registry and function registry used by tests
//! and by embedders that want to plan without a running cluster.

use ahash::AHashMap;
use smol_str::{format_smolstr, SmolStr};

use crate::catalog::{
    Catalog, ColumnDef, FunctionRegistry, IndexDef, LocatorRecord, RelId, RelSize,
};
use crate::errors::{Entity, PlannerError};
use crate::ir::expression::{AttrNumber, Expr, FuncId, ParamValues};
use crate::ir::value::{Type, Value};
use crate::topology::{NodeKind, NodeOid, NodeRegistry};

const DEFAULT_EQ_SEL: f64 = 0.005;
const DEFAULT_INEQ_SEL: f64 = 1.0 / 3.0;
const PAGE_SIZE: f64 = 8192.0;

pub type MockFunction = fn(&[Value]) -> Result<Value, PlannerError>;

#[derive(Clone, Debug)]
struct MockTable {
    columns: Vec<ColumnDef>,
    rows: f64,
    locator: Option<LocatorRecord>,
    indexes: Vec<IndexDef>,
    distinct: AHashMap<AttrNumber, f64>,
    temp: bool,
}

#[derive(Clone, Debug, Default)]
pub struct MockCatalog {
    tables: AHashMap<RelId, MockTable>,
    functions: AHashMap<FuncId, (Vec<Type>, MockFunction)>,
}

impl MockCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_table(mut self, rel: RelId, columns: &[(&str, Type)], rows: f64) -> Self {
        let columns = columns
            .iter()
            .map(|(name, ty)| ColumnDef {
                name: SmolStr::from(*name),
                ty: *ty,
            })
            .collect();
        self.tables.insert(
            rel,
            MockTable {
                columns,
                rows,
                locator: None,
                indexes: Vec::new(),
                distinct: AHashMap::new(),
                temp: false,
            },
        );
        self
    }

    /// # Panics
    /// - the table was not added first
    #[must_use]
    pub fn with_locator(self, rel: RelId, code: char, columns: &[&str], nodes: &[NodeOid]) -> Self {
        self.with_locator_record(
            rel,
            LocatorRecord {
                kind_code: code,
                partition_columns: columns.iter().map(|c| SmolStr::from(*c)).collect(),
                partition_func: None,
                nodes: nodes.to_vec(),
            },
        )
    }

    /// # Panics
    /// - the table was not added first
    #[must_use]
    pub fn with_udf_locator(
        self,
        rel: RelId,
        columns: &[&str],
        func: FuncId,
        nodes: &[NodeOid],
    ) -> Self {
        self.with_locator_record(
            rel,
            LocatorRecord {
                kind_code: 'U',
                partition_columns: columns.iter().map(|c| SmolStr::from(*c)).collect(),
                partition_func: Some(func),
                nodes: nodes.to_vec(),
            },
        )
    }

    /// # Panics
    /// - the table was not added first
    #[must_use]
    pub fn with_locator_record(mut self, rel: RelId, record: LocatorRecord) -> Self {
        self.table_mut(rel).locator = Some(record);
        self
    }

    /// # Panics
    /// - the table was not added first
    #[must_use]
    pub fn with_index(mut self, rel: RelId, name: &str, columns: &[AttrNumber], unique: bool) -> Self {
        self.table_mut(rel).indexes.push(IndexDef {
            name: SmolStr::from(name),
            columns: columns.to_vec(),
            unique,
        });
        self
    }

    /// # Panics
    /// - the table was not added first
    #[must_use]
    pub fn with_distinct(mut self, rel: RelId, attno: AttrNumber, ndistinct: f64) -> Self {
        self.table_mut(rel).distinct.insert(attno, ndistinct);
        self
    }

    /// # Panics
    /// - the table was not added first
    #[must_use]
    pub fn with_temp(mut self, rel: RelId) -> Self {
        self.table_mut(rel).temp = true;
        self
    }

    #[must_use]
    pub fn with_function(mut self, func: FuncId, params: &[Type], body: MockFunction) -> Self {
        self.functions.insert(func, (params.to_vec(), body));
        self
    }

    fn table_mut(&mut self, rel: RelId) -> &mut MockTable {
        self.tables
            .get_mut(&rel)
            .unwrap_or_else(|| panic!("mock table {rel} is not defined"))
    }

    fn table(&self, rel: RelId) -> Result<&MockTable, PlannerError> {
        self.tables
            .get(&rel)
            .ok_or_else(|| PlannerError::NotFound(Entity::Relation, format_smolstr!("{rel}")))
    }

    fn selectivity(table: &MockTable, qual: &Expr) -> f64 {
        if qual.is_constant_false(&ParamValues::new()) {
            return 0.0;
        }
        if let Some((l, r)) = qual.as_joinable_equality() {
            let col = l.as_column().or_else(|| r.as_column());
            return match col.and_then(|c| table.distinct.get(&c.attno)) {
                Some(nd) if *nd >= 1.0 => 1.0 / nd,
                _ => DEFAULT_EQ_SEL,
            };
        }
        DEFAULT_INEQ_SEL
    }
}

impl Catalog for MockCatalog {
    fn columns(&self, rel: RelId) -> Result<Vec<ColumnDef>, PlannerError> {
        Ok(self.table(rel)?.columns.clone())
    }

    fn locator_record(&self, rel: RelId) -> Result<Option<LocatorRecord>, PlannerError> {
        Ok(self.table(rel)?.locator.clone())
    }

    fn estimate_rows_and_width(&self, rel: RelId, quals: &[Expr]) -> Result<RelSize, PlannerError> {
        let table = self.table(rel)?;
        let width: f64 = table.columns.iter().map(|c| c.ty.default_width()).sum();
        let sel: f64 = quals.iter().map(|q| Self::selectivity(table, q)).product();
        let rows = table.rows * sel;
        let rows = if sel == 0.0 {
            0.0
        } else if rows <= 1.0 {
            1.0
        } else {
            rows.round()
        };
        let pages = (table.rows * width / PAGE_SIZE).ceil().max(1.0);
        Ok(RelSize { rows, width, pages })
    }

    fn indexes(&self, rel: RelId) -> Result<Vec<IndexDef>, PlannerError> {
        Ok(self.table(rel)?.indexes.clone())
    }

    fn is_temp(&self, rel: RelId) -> Result<bool, PlannerError> {
        Ok(self.table(rel)?.temp)
    }
}

impl FunctionRegistry for MockCatalog {
    fn param_types(&self, func: FuncId) -> Result<Vec<Type>, PlannerError> {
        self.functions
            .get(&func)
            .map(|(params, _)| params.clone())
            .ok_or_else(|| PlannerError::NotFound(Entity::Function, format_smolstr!("{func}")))
    }

    fn call(&self, func: FuncId, args: &[Value]) -> Result<Value, PlannerError> {
        let (_, body) = self
            .functions
            .get(&func)
            .ok_or_else(|| PlannerError::NotFound(Entity::Function, format_smolstr!("{func}")))?;
        body(args)
    }
}

#[derive(Clone, Debug, Default)]
pub struct MockRegistry {
    coordinators: Vec<NodeOid>,
    data_nodes: Vec<NodeOid>,
}

impl MockRegistry {
    #[must_use]
    pub fn new(coordinators: &[NodeOid], data_nodes: &[NodeOid]) -> Self {
        MockRegistry {
            coordinators: coordinators.to_vec(),
            data_nodes: data_nodes.to_vec(),
        }
    }

    fn nodes(&self, kind: NodeKind) -> &[NodeOid] {
        match kind {
            NodeKind::Coordinator => &self.coordinators,
            NodeKind::DataNode => &self.data_nodes,
        }
    }
}

impl NodeRegistry for MockRegistry {
    fn list_nodes(&self, kind: NodeKind) -> Result<Vec<NodeOid>, PlannerError> {
        Ok(self.nodes(kind).to_vec())
    }

    fn node_position(&self, node: NodeOid, kind: NodeKind) -> Result<Option<usize>, PlannerError> {
        Ok(self.nodes(kind).iter().position(|n| *n == node))
    }
}
