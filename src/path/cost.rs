//! Cost formulas.
//!
//! Local operator formulas are deliberately simple; the network part of
//! the model is what arbitrates between shipping strategies. Costs of a
//! cluster path are per node: nodes work in parallel, so an operator
//! running on `k` nodes over `rows` rows is charged for `rows / k`.

use crate::config::CostParams;
use crate::path::AggStrategy;

#[derive(Clone, Copy, PartialEq, Debug, Default)]
pub struct Cost {
    pub startup: f64,
    pub total: f64,
}

impl Cost {
    #[must_use]
    pub fn new(startup: f64, total: f64) -> Self {
        Cost { startup, total }
    }

    /// Scale a per-relation cost down to the share of one of `nodes`.
    #[must_use]
    pub fn per_node(self, nodes: f64) -> Self {
        let nodes = nodes.max(1.0);
        Cost {
            startup: self.startup / nodes,
            total: self.total / nodes,
        }
    }

    #[must_use]
    pub fn add(self, startup: f64, run: f64) -> Self {
        Cost {
            startup: self.startup + startup,
            total: self.total + startup + run,
        }
    }
}

/// Row estimates never go below one row unless the relation is proven
/// empty.
#[must_use]
pub fn clamp_rows(rows: f64) -> f64 {
    if rows <= 1.0 {
        1.0
    } else {
        rows.round()
    }
}

fn log2(x: f64) -> f64 {
    if x <= 1.0 {
        0.0
    } else {
        x.log2()
    }
}

#[must_use]
pub fn seq_scan(p: &CostParams, pages: f64, tuples: f64, nquals: usize) -> Cost {
    #[allow(clippy::cast_precision_loss)]
    let per_tuple = p.cpu_tuple_cost + nquals as f64 * p.cpu_operator_cost;
    Cost::new(0.0, pages * p.seq_page_cost + tuples * per_tuple)
}

/// `selectivity` is the fraction of the relation matched by the index
/// conditions.
#[must_use]
pub fn index_scan(
    p: &CostParams,
    pages: f64,
    tuples: f64,
    selectivity: f64,
    nquals: usize,
) -> Cost {
    let fetched = (tuples * selectivity).max(1.0);
    let pages_fetched = (pages * selectivity).max(1.0);
    let startup = p.random_page_cost + log2(tuples) * p.cpu_operator_cost;
    #[allow(clippy::cast_precision_loss)]
    let per_tuple = p.cpu_index_tuple_cost + p.cpu_tuple_cost + nquals as f64 * p.cpu_operator_cost;
    Cost::new(
        startup,
        startup + pages_fetched * p.random_page_cost + fetched * per_tuple,
    )
}

/// One participant of a parallel sequential scan; the leader takes part.
#[must_use]
pub fn partial_seq_scan(p: &CostParams, pages: f64, tuples: f64, nquals: usize, workers: u32) -> Cost {
    let full = seq_scan(p, pages, tuples, nquals);
    let io = pages * p.seq_page_cost;
    let divisor = f64::from(workers) + 1.0;
    Cost::new(0.0, io + (full.total - io) / divisor)
}

#[must_use]
pub fn gather(p: &CostParams, input: Cost, rows: f64, workers: u32, merge: bool) -> Cost {
    let merge_cost = if merge {
        rows * log2(f64::from(workers) + 1.0) * p.cpu_operator_cost
    } else {
        0.0
    };
    input.add(p.parallel_setup_cost, rows * p.parallel_tuple_cost + merge_cost)
}

#[must_use]
pub fn sort(p: &CostParams, input: Cost, rows: f64) -> Cost {
    let rows = rows.max(1.0);
    let startup = input.total + 2.0 * p.cpu_operator_cost * rows * log2(rows);
    Cost::new(startup, startup + p.cpu_operator_cost * rows)
}

/// Nested loop. An unparameterized inner side is materialized after the
/// first pass; a parameterized one is re-executed for every outer row.
#[must_use]
#[allow(clippy::too_many_arguments)]
pub fn nestloop(
    p: &CostParams,
    outer: Cost,
    outer_rows: f64,
    inner: Cost,
    inner_rows: f64,
    out_rows: f64,
    nclauses: usize,
    inner_parameterized: bool,
) -> Cost {
    let startup = outer.startup + inner.startup;
    let run = if inner_parameterized {
        outer.total - outer.startup + outer_rows * (inner.total - inner.startup)
    } else {
        #[allow(clippy::cast_precision_loss)]
        let compare = outer_rows * inner_rows * nclauses as f64 * p.cpu_operator_cost;
        outer.total - outer.startup
            + inner.total
            - inner.startup
            + (outer_rows - 1.0).max(0.0) * inner_rows * p.cpu_operator_cost
            + compare
    };
    Cost::new(startup, startup + run + out_rows * p.cpu_tuple_cost)
}

#[must_use]
pub fn hashjoin(
    p: &CostParams,
    outer: Cost,
    outer_rows: f64,
    inner: Cost,
    inner_rows: f64,
    out_rows: f64,
    nclauses: usize,
) -> Cost {
    let build = inner.total + inner_rows * (p.cpu_operator_cost + p.cpu_tuple_cost);
    let startup = outer.startup + build;
    #[allow(clippy::cast_precision_loss)]
    let lookups = outer_rows * nclauses as f64 * p.cpu_operator_cost;
    Cost::new(
        startup,
        startup + outer.total - outer.startup + lookups + out_rows * p.cpu_tuple_cost,
    )
}

/// Both inputs are already sorted on the merge keys.
#[must_use]
pub fn mergejoin(
    p: &CostParams,
    outer: Cost,
    outer_rows: f64,
    inner: Cost,
    inner_rows: f64,
    out_rows: f64,
) -> Cost {
    let startup = outer.startup + inner.startup;
    Cost::new(
        startup,
        outer.total
            + inner.total
            + (outer_rows + inner_rows) * p.cpu_operator_cost
            + out_rows * p.cpu_tuple_cost,
    )
}

#[must_use]
pub fn append(children: &[Cost]) -> Cost {
    let startup = children.first().map_or(0.0, |c| c.startup);
    Cost::new(startup, children.iter().map(|c| c.total).sum())
}

#[must_use]
pub fn merge_append(p: &CostParams, children: &[Cost], rows: f64) -> Cost {
    #[allow(clippy::cast_precision_loss)]
    let n = children.len() as f64;
    let startup: f64 = children.iter().map(|c| c.startup).sum();
    let total: f64 = children.iter().map(|c| c.total).sum();
    Cost::new(
        startup,
        total + rows * log2(n) * p.cpu_operator_cost,
    )
}

#[must_use]
pub fn aggregate(
    p: &CostParams,
    strategy: AggStrategy,
    input: Cost,
    input_rows: f64,
    groups: f64,
    ngroup_cols: usize,
) -> Cost {
    #[allow(clippy::cast_precision_loss)]
    let per_row = p.cpu_operator_cost * (ngroup_cols as f64 + 1.0);
    match strategy {
        AggStrategy::Plain => {
            let total = input.total + input_rows * per_row;
            Cost::new(total, total + p.cpu_tuple_cost)
        }
        AggStrategy::Hashed => {
            let startup = input.total + input_rows * per_row;
            Cost::new(startup, startup + groups * p.cpu_tuple_cost)
        }
        AggStrategy::Sorted => Cost::new(
            input.startup,
            input.total + input_rows * per_row + groups * p.cpu_tuple_cost,
        ),
    }
}

#[must_use]
pub fn projection(p: &CostParams, input: Cost, rows: f64, ntargets: usize) -> Cost {
    #[allow(clippy::cast_precision_loss)]
    let run = rows * ntargets as f64 * p.cpu_operator_cost;
    input.add(0.0, run)
}

/// Rows surviving LIMIT/OFFSET and the cost of fetching them.
#[must_use]
pub fn limit(input: Cost, input_rows: f64, offset: Option<u64>, limit: Option<u64>) -> (Cost, f64) {
    #[allow(clippy::cast_precision_loss)]
    let offset = offset.unwrap_or(0) as f64;
    #[allow(clippy::cast_precision_loss)]
    let rows = limit.map_or(input_rows - offset, |l| (l as f64).min(input_rows - offset));
    let rows = rows.max(0.0);
    if input_rows <= 0.0 {
        return (input, 0.0);
    }
    let run = input.total - input.startup;
    let startup = input.startup + run * (offset / input_rows).min(1.0);
    let total = input.startup + run * ((offset + rows) / input_rows).min(1.0);
    (Cost::new(startup, total), rows)
}

/// Moving `rows` rows of `width` bytes over the network once.
#[must_use]
pub fn transfer(p: &CostParams, rows: f64, width: f64) -> f64 {
    rows * (p.network_tuple_cost + width * p.network_byte_cost)
}

/// Collect rows from `nodes` producers onto the coordinator, merging
/// sorted streams if `merge`.
#[must_use]
pub fn reduce_to_coordinator(p: &CostParams, rows: f64, width: f64, nodes: f64, merge: bool) -> f64 {
    let merge_cost = if merge {
        rows * log2(nodes) * p.cpu_operator_cost
    } else {
        0.0
    };
    transfer(p, rows, width) + merge_cost + p.reduce_setup_cost * nodes.max(1.0)
}

/// Broadcast every row to all `targets` nodes.
#[must_use]
pub fn broadcast(p: &CostParams, rows: f64, width: f64, targets: f64) -> f64 {
    transfer(p, rows * (targets - 1.0).max(0.0), width) + p.reduce_setup_cost * targets.max(1.0)
}

/// Re-hash rows over `targets` nodes; each node ships and receives its
/// share in parallel.
#[must_use]
pub fn repartition(p: &CostParams, rows: f64, width: f64, targets: f64) -> f64 {
    let targets = targets.max(1.0);
    transfer(p, rows / targets, width) + p.reduce_setup_cost * targets
}

/// Run-time node pruning by executor parameters: every node is set up,
/// every row re-checked.
#[must_use]
pub fn reduce_by_param(p: &CostParams, rows: f64, nodes: f64) -> f64 {
    p.reduce_setup_cost * nodes.max(1.0) + rows * p.cpu_operator_cost
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn network_costs() {
        let p = CostParams::default();
        // 1000 rows of 100 bytes: 1000 * (0.02 + 0.01) = 30
        assert!((transfer(&p, 1000.0, 100.0) - 30.0).abs() < 1e-9);
        // repartition over 4 nodes moves a quarter per node
        assert!((repartition(&p, 1000.0, 100.0, 4.0) - (7.5 + 40.0)).abs() < 1e-9);
        // broadcasting to 4 nodes ships every row three times
        assert!((broadcast(&p, 1000.0, 100.0, 4.0) - (90.0 + 40.0)).abs() < 1e-9);
        // a single target already holds the rows it reads
        assert!((broadcast(&p, 1000.0, 100.0, 1.0) - 10.0).abs() < 1e-9);
        let plain = reduce_to_coordinator(&p, 1000.0, 100.0, 4.0, false);
        let merged = reduce_to_coordinator(&p, 1000.0, 100.0, 4.0, true);
        assert!((plain - 70.0).abs() < 1e-9);
        assert!((merged - plain - 1000.0 * 2.0 * p.cpu_operator_cost).abs() < 1e-9);
    }

    #[test]
    fn limit_fraction() {
        let (cost, rows) = limit(Cost::new(0.0, 100.0), 1000.0, Some(100), Some(100));
        assert_eq!(rows, 100.0);
        assert!((cost.startup - 10.0).abs() < 1e-9);
        assert!((cost.total - 20.0).abs() < 1e-9);

        let (_, rows) = limit(Cost::new(0.0, 100.0), 10.0, Some(20), None);
        assert_eq!(rows, 0.0);
    }

    #[test]
    fn per_node_scaling() {
        let p = CostParams::default();
        let full = seq_scan(&p, 100.0, 10_000.0, 1);
        let share = full.per_node(4.0);
        assert!((share.total * 4.0 - full.total).abs() < 1e-9);
        assert_eq!(clamp_rows(0.2), 1.0);
        assert_eq!(clamp_rows(10.4), 10.0);
    }
}
