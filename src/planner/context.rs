//! Per-statement planning state shared by every query level.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::catalog::{Catalog, FunctionRegistry};
use crate::config::{CostParams, PlannerConfig};
use crate::distribution::reduce::ReduceInfo;
use crate::errors::PlannerError;
use crate::tlog;
use crate::topology::{ClusterTopology, NodeList};

pub struct PlannerContext<'p> {
    pub catalog: &'p dyn Catalog,
    pub functions: &'p dyn FunctionRegistry,
    pub topology: &'p ClusterTopology,
    pub config: &'p PlannerConfig,
    /// Every data node, in registry order.
    pub data_nodes: NodeList,
    cluster_ok: Cell<bool>,
    cancel: Option<Arc<AtomicBool>>,
    deadline: Option<Instant>,
    depth: Cell<usize>,
}

/// Recursion level marker, released on drop.
pub struct DepthGuard<'c> {
    depth: &'c Cell<usize>,
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.depth.set(self.depth.get().saturating_sub(1));
    }
}

impl<'p> PlannerContext<'p> {
    /// # Errors
    /// - the node registry can't be read
    pub fn new(
        catalog: &'p dyn Catalog,
        functions: &'p dyn FunctionRegistry,
        topology: &'p ClusterTopology,
        config: &'p PlannerConfig,
        cancel: Option<Arc<AtomicBool>>,
    ) -> Result<Self, PlannerError> {
        let deadline = (config.statement_timeout_ms > 0)
            .then(|| Instant::now() + Duration::from_millis(config.statement_timeout_ms));
        Ok(PlannerContext {
            catalog,
            functions,
            topology,
            config,
            data_nodes: topology.data_nodes()?,
            cluster_ok: Cell::new(config.enable_cluster_plan),
            cancel,
            deadline,
            depth: Cell::new(0),
        })
    }

    #[must_use]
    pub fn cost(&self) -> &CostParams {
        &self.config.cost
    }

    /// Cluster planning is still possible for the statement.
    #[must_use]
    pub fn cluster_ok(&self) -> bool {
        self.cluster_ok.get()
    }

    /// Distribution of a provably empty relation: one arbitrary node, so
    /// that joins with it never need to move rows.
    #[must_use]
    pub fn dummy_reduce(&self) -> Option<ReduceInfo> {
        if !self.cluster_ok() {
            return None;
        }
        Some(match self.topology.preferred_node(&self.data_nodes) {
            Some(node) => ReduceInfo::random(std::iter::once(node).collect()),
            None => ReduceInfo::coordinator(),
        })
    }

    /// Give up cluster planning for the whole statement. Planning goes on
    /// with local-only paths.
    pub fn disable_cluster(&self, reason: &str) {
        if self.cluster_ok.replace(false) {
            tlog!(Info, "cluster plan abandoned"; "reason" => reason);
        }
    }

    /// # Errors
    /// - statement canceled or timed out
    pub fn check_for_interrupts(&self) -> Result<(), PlannerError> {
        if let Some(cancel) = &self.cancel {
            if cancel.load(Ordering::Relaxed) {
                return Err(PlannerError::Canceled);
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(PlannerError::StatementTimeout);
            }
        }
        Ok(())
    }

    /// Enter a recursive planning step.
    ///
    /// # Errors
    /// - statement canceled or timed out
    /// - recursion is deeper than `max_recursion_depth`
    pub fn enter(&self) -> Result<DepthGuard<'_>, PlannerError> {
        self.check_for_interrupts()?;
        let depth = self.depth.get() + 1;
        if depth > self.config.max_recursion_depth {
            return Err(PlannerError::StackDepthExceeded(depth));
        }
        self.depth.set(depth);
        Ok(DepthGuard { depth: &self.depth })
    }
}
