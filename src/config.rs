use crate::errors::PlannerError;
use crate::topology::NodeOid;
use serde::{Deserialize, Serialize};
use smol_str::format_smolstr;

pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 256;

////////////////////////////////////////////////////////////////////////////////
// PlannerConfig
////////////////////////////////////////////////////////////////////////////////

#[derive(PartialEq, Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlannerConfig {
    /// Global switch for distributed (cluster) planning.
    pub enable_cluster_plan: bool,

    /// Writes to replicated tables go through this node first.
    pub primary_node: Option<NodeOid>,

    /// Replicated reads are served by the first reachable node of this list.
    pub preferred_nodes: Vec<NodeOid>,

    pub max_parallel_workers_per_gather: u32,

    /// Tables smaller than this don't get partial paths.
    pub min_parallel_table_pages: f64,

    /// Zero disables the timeout.
    pub statement_timeout_ms: u64,

    pub max_recursion_depth: usize,

    pub log_level: LogLevel,

    pub cost: CostParams,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            enable_cluster_plan: true,
            primary_node: None,
            preferred_nodes: Vec::new(),
            max_parallel_workers_per_gather: 2,
            min_parallel_table_pages: 1024.0,
            statement_timeout_ms: 0,
            max_recursion_depth: DEFAULT_MAX_RECURSION_DEPTH,
            log_level: LogLevel::Info,
            cost: CostParams::default(),
        }
    }
}

impl PlannerConfig {
    #[inline]
    pub fn read_yaml_file(path: &str) -> Result<Self, PlannerError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PlannerError::InvalidConfiguration(format_smolstr!("can't read from '{path}': {e}"))
        })?;
        Self::read_yaml_contents(&contents)
    }

    #[inline]
    pub fn read_yaml_contents(contents: &str) -> Result<Self, PlannerError> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// - negative cost coefficient
    /// - zero recursion depth
    pub fn validate(&self) -> Result<(), PlannerError> {
        if self.max_recursion_depth == 0 {
            return Err(PlannerError::InvalidConfiguration(
                "max_recursion_depth must be greater than zero".into(),
            ));
        }
        if self.min_parallel_table_pages < 0.0 {
            return Err(PlannerError::InvalidConfiguration(
                "min_parallel_table_pages must not be negative".into(),
            ));
        }
        for (name, value) in self.cost.named_values() {
            if value.is_nan() || value.is_infinite() || value < 0.0 {
                return Err(PlannerError::InvalidConfiguration(format_smolstr!(
                    "cost.{name} must be a non-negative number, got {value}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for slog::Level {
    fn from(l: LogLevel) -> slog::Level {
        match l {
            LogLevel::Critical => slog::Level::Critical,
            LogLevel::Error => slog::Level::Error,
            LogLevel::Warning => slog::Level::Warning,
            LogLevel::Info => slog::Level::Info,
            LogLevel::Debug => slog::Level::Debug,
            LogLevel::Trace => slog::Level::Trace,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// CostParams
////////////////////////////////////////////////////////////////////////////////

/// Cost model coefficients. The network coefficients arbitrate between
/// broadcasting, repartitioning and gathering; there is no fixed row
/// threshold for broadcast joins.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CostParams {
    pub seq_page_cost: f64,
    pub random_page_cost: f64,
    pub cpu_tuple_cost: f64,
    pub cpu_index_tuple_cost: f64,
    pub cpu_operator_cost: f64,
    pub parallel_setup_cost: f64,
    pub parallel_tuple_cost: f64,
    /// Per row moved between two nodes.
    pub network_tuple_cost: f64,
    /// Per byte moved between two nodes.
    pub network_byte_cost: f64,
    /// Per participating node, per reduce step.
    pub reduce_setup_cost: f64,
}

impl Default for CostParams {
    fn default() -> Self {
        Self {
            seq_page_cost: 1.0,
            random_page_cost: 4.0,
            cpu_tuple_cost: 0.01,
            cpu_index_tuple_cost: 0.005,
            cpu_operator_cost: 0.0025,
            parallel_setup_cost: 1000.0,
            parallel_tuple_cost: 0.1,
            network_tuple_cost: 0.02,
            network_byte_cost: 0.0001,
            reduce_setup_cost: 10.0,
        }
    }
}

impl CostParams {
    fn named_values(&self) -> [(&'static str, f64); 10] {
        [
            ("seq_page_cost", self.seq_page_cost),
            ("random_page_cost", self.random_page_cost),
            ("cpu_tuple_cost", self.cpu_tuple_cost),
            ("cpu_index_tuple_cost", self.cpu_index_tuple_cost),
            ("cpu_operator_cost", self.cpu_operator_cost),
            ("parallel_setup_cost", self.parallel_setup_cost),
            ("parallel_tuple_cost", self.parallel_tuple_cost),
            ("network_tuple_cost", self.network_tuple_cost),
            ("network_byte_cost", self.network_byte_cost),
            ("reduce_setup_cost", self.reduce_setup_cost),
        ]
    }
}
