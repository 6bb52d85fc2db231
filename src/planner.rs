//! Cost-based search over local and distributed paths.
//!
//! Every relation of a query level gets two path lists: local-only paths,
//! which read remote data through the coordinator, and cluster paths,
//! which carry a [`ReduceInfo`] saying where their rows live. Joins,
//! appends and subqueries derive the distribution of their output from
//! their inputs and insert redistribution steps where the inputs don't
//! line up. The cheapest plan of either kind wins at the top.
//!
//! Failing to find a cluster path is never an error: the statement falls
//! back to its local plan. Catalog inconsistencies, interrupts and resource
//! exhaustion abort planning.

pub mod append;
pub mod base;
pub mod context;
pub mod join;
pub mod join_search;
pub mod propagate;
pub mod redistribute;
pub mod rel;
pub mod subquery;
pub mod upper;

#[cfg(test)]
mod tests;

use smol_str::format_smolstr;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::catalog::{Catalog, FunctionRegistry};
use crate::config::PlannerConfig;
use crate::distribution::reduce::ReduceInfo;
use crate::errors::{Entity, PlannerError};
use crate::ir::equivalence::EquivalenceClasses;
use crate::ir::expression::Expr;
use crate::ir::query::{Query, RangeEntry};
use crate::ir::relids::{RelIndex, Relids};
use crate::plan::{Dispatch, FinalPlan, PlanNode};
use crate::tlog;
use crate::topology::{ClusterTopology, NodeRegistry};

use self::context::PlannerContext;
use self::redistribute::restrict_replicated;
use self::rel::RelSearchNode;
use self::upper::{delivery_cost, plan_validity, UpperRel};

////////////////////////////////////////////////////////////////////////////////
// QueryLevel
////////////////////////////////////////////////////////////////////////////////

/// Qualifiers of one query level sorted out by the relations they read.
pub struct QueryLevel<'q> {
    pub query: &'q Query,
    pub ecs: EquivalenceClasses,
    restrictions: Vec<Vec<Expr>>,
    /// Qualifiers over several relations not expressed by `ecs`.
    join_quals: Vec<Expr>,
}

fn push_unique(list: &mut Vec<Expr>, qual: Expr) {
    if !list.contains(&qual) {
        list.push(qual);
    }
}

impl<'q> QueryLevel<'q> {
    #[must_use]
    pub fn new(query: &'q Query) -> Self {
        let ecs = EquivalenceClasses::build(&query.quals, &query.params);
        let mut restrictions: Vec<Vec<Expr>> = vec![Vec::new(); query.range_table.len()];
        let mut join_quals = Vec::new();

        for qual in &query.quals {
            let refs = qual.referenced_rels();
            if refs.is_empty() {
                // A false constant empties every relation; other constant
                // qualifiers are one-time filters and don't affect paths.
                if qual.is_constant_false(&query.params) {
                    for list in &mut restrictions {
                        push_unique(list, qual.clone());
                    }
                }
                continue;
            }
            if let Some(rel) = refs.singleton_member() {
                push_unique(&mut restrictions[rel], qual.clone());
            } else if !ecs.absorbs(qual) {
                join_quals.push(qual.clone());
            }
        }
        for (rel, list) in restrictions.iter_mut().enumerate() {
            for derived in ecs.derived_restrictions(rel) {
                push_unique(list, derived);
            }
        }
        for info in &query.append_rels {
            let inherited = restrictions[info.parent].clone();
            for child in &info.children {
                for qual in &inherited {
                    push_unique(
                        &mut restrictions[*child],
                        qual.replace_rel(info.parent, *child),
                    );
                }
            }
        }

        QueryLevel {
            query,
            ecs,
            restrictions,
            join_quals,
        }
    }

    /// Qualifiers evaluated by scans of `rel` alone.
    #[must_use]
    pub fn restrictions(&self, rel: RelIndex) -> &[Expr] {
        self.restrictions.get(rel).map_or(&[][..], Vec::as_slice)
    }

    /// Clauses joining `outer` to `inner`: one equality per equivalence
    /// class spanning both sides plus every other qualifier reading both.
    #[must_use]
    pub fn join_clauses(&self, outer: Relids, inner: Relids) -> Vec<Expr> {
        let both = outer.union(inner);
        let mut clauses = self.ecs.join_clauses(outer, inner);
        for qual in &self.join_quals {
            let refs = qual.referenced_rels();
            if refs.is_subset_of(both) && refs.overlaps(outer) && refs.overlaps(inner) {
                clauses.push(qual.clone());
            }
        }
        clauses
    }
}

////////////////////////////////////////////////////////////////////////////////
// relation dispatch
////////////////////////////////////////////////////////////////////////////////

/// Build the search node of range table entry `rel`.
///
/// # Errors
/// - the entry doesn't exist or is malformed
/// - planning the entry failed
pub(crate) fn build_rel(
    ctx: &PlannerContext<'_>,
    level: &QueryLevel<'_>,
    rel: RelIndex,
) -> Result<RelSearchNode, PlannerError> {
    let entry = level.query.range_table.get(rel).ok_or_else(|| {
        PlannerError::NotFound(Entity::RangeEntry, format_smolstr!("{rel}"))
    })?;
    match entry {
        RangeEntry::Relation { rel_id, .. } => base::build_base_rel(ctx, level, rel, *rel_id),
        RangeEntry::AppendParent { .. } => {
            let info = level.query.append_rel(rel).ok_or_else(|| {
                PlannerError::Invalid(
                    Entity::AppendRel,
                    Some(format_smolstr!("{} has no children", entry.name())),
                )
            })?;
            append::build_append_rel(ctx, level, rel, info)
        }
        RangeEntry::Subquery { query, .. } => {
            subquery::build_subquery_rel(ctx, level, rel, query, None)
        }
        RangeEntry::Cte { name, query } => {
            subquery::build_subquery_rel(ctx, level, rel, query, Some(name))
        }
        RangeEntry::WorkTable { .. } | RangeEntry::Tuplestore { .. } => {
            subquery::build_executor_rel(ctx, level, rel, entry)
        }
    }
}

/// Plan one query level, nested levels included.
///
/// # Errors
/// - malformed query
/// - no legal join order
/// - catalog errors, interrupts, recursion too deep, out of memory
pub(crate) fn plan_query_level(
    ctx: &PlannerContext<'_>,
    query: &Query,
) -> Result<UpperRel, PlannerError> {
    let _guard = ctx.enter()?;
    query.validate()?;
    if query.uses_temp_state {
        ctx.disable_cluster("query uses session-local state");
    }
    let level = QueryLevel::new(query);
    let mut base = Vec::new();
    for rel in query.base_rels() {
        base.try_reserve(1)?;
        base.push(build_rel(ctx, &level, rel)?);
    }
    let joined = join_search::make_rel_from_joinlist(ctx, &level, base)?;
    tlog!(Trace, "query level joined";
        "relids" => %joined.relids,
        "local paths" => joined.pathlist.len(),
        "cluster paths" => joined.cluster_pathlist.len());
    upper::plan_upper(ctx, &level, &joined)
}

/// Pick the cheaper of the best local and the best cluster plan.
fn choose_final(ctx: &PlannerContext<'_>, upper: &UpperRel) -> FinalPlan {
    let local_total = upper.local.total_cost;
    let cluster = if ctx.cluster_ok() {
        upper
            .cheapest_cluster(ctx)
            .filter(|(_, total)| *total < local_total)
    } else {
        None
    };

    let Some((path, _)) = cluster else {
        tlog!(Debug, "local plan chosen"; "cost" => local_total);
        return FinalPlan {
            root: PlanNode::from_path(&upper.local),
            dispatch: Dispatch::default(),
            cluster_plan_ok: false,
            total_cost: local_total,
            rows: upper.local.rows,
        };
    };

    // Any single copy of replicated rows will do.
    let replicated_on = path
        .reduce
        .as_ref()
        .filter(|r| r.is_replicated_like())
        .and_then(|r| ctx.topology.preferred_node(&r.effective_nodes()));
    let root = match replicated_on {
        Some(node) => restrict_replicated(&path, node),
        None => Rc::clone(&path),
    };
    let nodes = root
        .reduce
        .as_ref()
        .filter(|r| !r.is_coordinator())
        .map(ReduceInfo::effective_nodes)
        .unwrap_or_default();
    let dispatch = Dispatch {
        merge_sorted: !root.pathkeys.is_empty() && nodes.len() > 1,
        cost: delivery_cost(ctx, &root),
        nodes,
    };
    let plan = FinalPlan {
        root: PlanNode::from_path(&root),
        total_cost: root.total_cost + dispatch.cost,
        rows: root.rows,
        dispatch,
        cluster_plan_ok: true,
    };
    tlog!(Debug, "cluster plan chosen";
        "cost" => plan.total_cost,
        "local cost" => local_total,
        "redistributions" => plan.root.redistributions(),
        "distribution" => ?plan_validity(&root),
        "nodes" => plan.dispatch.nodes.len());
    plan
}

////////////////////////////////////////////////////////////////////////////////
// Planner
////////////////////////////////////////////////////////////////////////////////

/// Entry point: plans statements against a catalog and a cluster layout.
///
/// The planner is shared between sessions; each call builds its own
/// per-statement state.
pub struct Planner {
    catalog: Arc<dyn Catalog + Send + Sync>,
    functions: Arc<dyn FunctionRegistry + Send + Sync>,
    topology: ClusterTopology,
    config: PlannerConfig,
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner")
            .field("topology", &self.topology)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Planner {
    /// # Errors
    /// - invalid configuration
    /// - the configured primary node is not a data node
    pub fn new(
        catalog: Arc<dyn Catalog + Send + Sync>,
        registry: Arc<dyn NodeRegistry + Send + Sync>,
        functions: Arc<dyn FunctionRegistry + Send + Sync>,
        config: PlannerConfig,
    ) -> Result<Self, PlannerError> {
        config.validate()?;
        tlog::set_log_level(config.log_level.into());
        let topology = ClusterTopology::new(registry, &config)?;
        Ok(Planner {
            catalog,
            functions,
            topology,
            config,
        })
    }

    #[must_use]
    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    #[must_use]
    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// # Errors
    /// See [`Planner::plan_with_cancel`].
    pub fn plan(&self, query: &Query) -> Result<FinalPlan, PlannerError> {
        self.plan_inner(query, None)
    }

    /// Plan `query`, giving up with [`PlannerError::Canceled`] once
    /// `cancel` is raised.
    ///
    /// # Errors
    /// - malformed query, no legal join order
    /// - catalog inconsistency
    /// - canceled, timed out, recursion too deep, out of memory
    pub fn plan_with_cancel(
        &self,
        query: &Query,
        cancel: Arc<AtomicBool>,
    ) -> Result<FinalPlan, PlannerError> {
        self.plan_inner(query, Some(cancel))
    }

    fn plan_inner(
        &self,
        query: &Query,
        cancel: Option<Arc<AtomicBool>>,
    ) -> Result<FinalPlan, PlannerError> {
        let ctx = PlannerContext::new(
            self.catalog.as_ref(),
            self.functions.as_ref(),
            &self.topology,
            &self.config,
            cancel,
        )?;
        let upper = match plan_query_level(&ctx, query) {
            Ok(upper) => upper,
            Err(e) => {
                if e.is_catalog_inconsistency() {
                    tlog!(Warning, "dropping cached distribution descriptors"; "error" => %e);
                    self.topology.invalidate_all();
                }
                return Err(e);
            }
        };
        Ok(choose_final(&ctx, &upper))
    }
}
