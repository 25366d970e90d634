//! The flat (one-dimensional) best-fit selector (spec §4.3;
//! `select_linear.c:777` `_job_test`).
//!
//! Builds the table of consecutive candidate runs, pre-admits any
//! required nodes, then repeatedly commits the best-fitting remaining run
//! (tightest sufficient run, or biggest insufficient run if none are
//! sufficient) until demand is met, stopping after one run for contiguous
//! jobs.

use crate::bitmap::Bitmap;
use crate::cr_state::CRState;
use crate::error::{CoreError, NoFitSnafu};
use crate::filter::enough_nodes;
use crate::gres::GresService;
use crate::procs::ProcsOracle;
use crate::types::{CoreConfig, JobRecord, NodeRecord};

pub(crate) fn node_avail_cpus(
    cr: &CRState,
    job: &JobRecord,
    node: &NodeRecord,
    gres: &dyn GresService,
    procs: &dyn ProcsOracle,
    cfg: &CoreConfig,
) -> u32 {
    let total = procs.total_cpus(node, cfg);
    let free = total.saturating_sub(cr.alloc_cpus(node.index));
    let wanted = procs.avail_cpus(job, node, cfg).min(free);
    gres.job_test(&job.gres_request, &node.gres, node.index, false).cap(wanted)
}

/// Splits a candidate bitmap into its maximal runs of consecutive set
/// node indices, in ascending order.
fn build_runs(candidates: &Bitmap) -> Vec<Vec<usize>> {
    let mut runs = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut prev: Option<usize> = None;
    for i in candidates.iter_set() {
        if let Some(p) = prev {
            if i != p + 1 {
                runs.push(std::mem::take(&mut current));
            }
        }
        current.push(i);
        prev = Some(i);
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs
}

/// A maximal consecutive run, with its required node (if any) already
/// pre-admitted and excluded from `order` — the remaining nodes, in the
/// order the commit step should claim them.
struct Run {
    required_at: Option<usize>,
    order: Vec<(usize, u32)>,
    cpu_sum: u32,
    node_count: u32,
    processed: bool,
}

/// Builds the run table, pre-admitting every required node into `output`
/// and subtracting its footprint from `rem_cpus`/`rem_nodes`.
fn build_run_table(
    cr: &CRState,
    job: &JobRecord,
    nodes: &[NodeRecord],
    candidates: &Bitmap,
    gres: &dyn GresService,
    procs: &dyn ProcsOracle,
    cfg: &CoreConfig,
    output: &mut Bitmap,
    rem_cpus: &mut i64,
    rem_nodes: &mut i64,
) -> Vec<Run> {
    let required = job.details.required_node_bitmap.as_ref();
    let physical_runs = build_runs(candidates);
    let mut runs = Vec::with_capacity(physical_runs.len());

    for run in &physical_runs {
        let mut required_pos: Option<usize> = None;
        for (pos, &n) in run.iter().enumerate() {
            if required.map_or(false, |r| r.test(n)) {
                if required_pos.is_none() {
                    required_pos = Some(pos);
                }
                output.set(n);
                let avail = node_avail_cpus(cr, job, &nodes[n], gres, procs, cfg);
                *rem_cpus -= avail as i64;
                *rem_nodes -= 1;
            }
        }

        let mut order: Vec<(usize, u32)> = Vec::new();
        match required_pos {
            Some(pos) => {
                for &n in &run[pos + 1..] {
                    order.push((n, node_avail_cpus(cr, job, &nodes[n], gres, procs, cfg)));
                }
                for &n in run[..pos].iter().rev() {
                    order.push((n, node_avail_cpus(cr, job, &nodes[n], gres, procs, cfg)));
                }
            }
            None => {
                for &n in run {
                    order.push((n, node_avail_cpus(cr, job, &nodes[n], gres, procs, cfg)));
                }
            }
        }

        let cpu_sum = order.iter().map(|&(_, c)| c).sum();
        let node_count = order.len() as u32;
        runs.push(Run {
            required_at: required_pos.map(|pos| run[pos]),
            order,
            cpu_sum,
            node_count,
            processed: false,
        });
    }
    runs
}

/// The run-table iterative selector shared by contiguous and scattered
/// placement (spec §4.3): pick the best remaining run, commit as much of
/// it as demand still needs, zero it out, and repeat — stopping after one
/// run for `contiguous` jobs, or once both remainders reach zero.
fn select_via_run_table(
    cr: &CRState,
    job: &JobRecord,
    nodes: &[NodeRecord],
    candidates: &Bitmap,
    gres: &dyn GresService,
    procs: &dyn ProcsOracle,
    cfg: &CoreConfig,
    min_nodes: u32,
    req_nodes: u32,
    min_cpus: u32,
    contiguous: bool,
) -> Result<Bitmap, CoreError> {
    let effective_min = min_nodes.max(req_nodes);
    if candidates.count() as u32 < effective_min {
        return NoFitSnafu.fail();
    }
    if let Some(req) = &job.details.required_node_bitmap {
        if !candidates.is_superset_of(req) {
            return NoFitSnafu.fail();
        }
    }

    let mut output = Bitmap::new(nodes.len());
    let mut rem_cpus: i64 = min_cpus as i64;
    let mut rem_nodes: i64 = effective_min as i64;

    let mut runs = build_run_table(cr, job, nodes, candidates, gres, procs, cfg, &mut output, &mut rem_cpus, &mut rem_nodes);

    let required_present = job.details.required_node_bitmap.as_ref().map_or(false, |r| r.count() > 0);

    while !(rem_nodes <= 0 && rem_cpus <= 0) {
        let carrying: Vec<usize> = (0..runs.len()).filter(|&i| !runs[i].processed && runs[i].required_at.is_some()).collect();
        let pool: Vec<usize> = if !carrying.is_empty() {
            carrying
        } else {
            (0..runs.len()).filter(|&i| !runs[i].processed).collect()
        };
        if pool.is_empty() {
            break;
        }

        let rem_nodes_u = rem_nodes.max(0) as u32;
        let sufficient: Vec<usize> = pool
            .iter()
            .copied()
            .filter(|&i| runs[i].cpu_sum as i64 >= rem_cpus && enough_nodes(runs[i].node_count, rem_nodes_u, min_nodes, req_nodes))
            .collect();

        let chosen = if !sufficient.is_empty() {
            *sufficient.iter().min_by_key(|&&i| runs[i].cpu_sum).unwrap()
        } else {
            *pool.iter().max_by_key(|&&i| runs[i].cpu_sum).unwrap()
        };

        if contiguous && required_present {
            let others_carry = runs.iter().enumerate().any(|(i, r)| i != chosen && !r.processed && r.required_at.is_some());
            if others_carry {
                return NoFitSnafu.fail();
            }
        }

        let chosen_sufficient =
            runs[chosen].cpu_sum as i64 >= rem_cpus && enough_nodes(runs[chosen].node_count, rem_nodes_u, min_nodes, req_nodes);
        if contiguous && !chosen_sufficient {
            return NoFitSnafu.fail();
        }

        for &(n, avail) in runs[chosen].order.clone().iter() {
            if rem_nodes <= 0 && rem_cpus <= 0 {
                break;
            }
            output.set(n);
            rem_cpus -= avail as i64;
            rem_nodes -= 1;
        }

        runs[chosen].processed = true;
        runs[chosen].cpu_sum = 0;
        runs[chosen].node_count = 0;

        if contiguous || (rem_nodes <= 0 && rem_cpus <= 0) {
            break;
        }
    }

    let rem_nodes_u = rem_nodes.max(0) as u32;
    if rem_cpus <= 0 && enough_nodes(0, rem_nodes_u, min_nodes, req_nodes) {
        Ok(output)
    } else {
        NoFitSnafu.fail()
    }
}

#[allow(clippy::too_many_arguments)]
fn select_contiguous(
    cr: &CRState,
    job: &JobRecord,
    nodes: &[NodeRecord],
    candidates: &Bitmap,
    gres: &dyn GresService,
    procs: &dyn ProcsOracle,
    cfg: &CoreConfig,
    min_nodes: u32,
    req_nodes: u32,
    min_cpus: u32,
) -> Result<Bitmap, CoreError> {
    select_via_run_table(cr, job, nodes, candidates, gres, procs, cfg, min_nodes, req_nodes, min_cpus, true)
}

#[allow(clippy::too_many_arguments)]
fn select_scattered(
    cr: &CRState,
    job: &JobRecord,
    nodes: &[NodeRecord],
    candidates: &Bitmap,
    gres: &dyn GresService,
    procs: &dyn ProcsOracle,
    cfg: &CoreConfig,
    min_nodes: u32,
    req_nodes: u32,
    min_cpus: u32,
) -> Result<Bitmap, CoreError> {
    select_via_run_table(cr, job, nodes, candidates, gres, procs, cfg, min_nodes, req_nodes, min_cpus, false)
}

/// Selects a node set for `job` out of `candidates` (an
/// availability-filtered bitmap from [`crate::filter::count_available`]),
/// targeting `job.details.min_nodes` with no `req_nodes`/`max_nodes`
/// beyond it. Equivalent to calling [`select_flat_demand`] with
/// `req_nodes == min_nodes` and `max_nodes` unbounded.
pub fn select_flat(
    cr: &CRState,
    job: &JobRecord,
    nodes: &[NodeRecord],
    candidates: &Bitmap,
    gres: &dyn GresService,
    procs: &dyn ProcsOracle,
    cfg: &CoreConfig,
) -> Result<Bitmap, CoreError> {
    let min_nodes = job.details.min_nodes.max(1);
    select_flat_demand(cr, job, nodes, candidates, gres, procs, cfg, min_nodes, u32::MAX, min_nodes)
}

/// Like [`select_flat`], but with `min_nodes`/`max_nodes`/`req_nodes`
/// supplied explicitly by the caller (spec §4.3 "Input"), as
/// `job_test`'s public signature allows a request to ask for more nodes
/// than the job's own floor (`req_nodes > min_nodes`) and to cap how many
/// it will accept (`max_nodes`).
#[allow(clippy::too_many_arguments)]
pub fn select_flat_demand(
    cr: &CRState,
    job: &JobRecord,
    nodes: &[NodeRecord],
    candidates: &Bitmap,
    gres: &dyn GresService,
    procs: &dyn ProcsOracle,
    cfg: &CoreConfig,
    min_nodes: u32,
    max_nodes: u32,
    req_nodes: u32,
) -> Result<Bitmap, CoreError> {
    let min_nodes = min_nodes.max(1);
    let min_cpus = job.details.min_cpus;

    if let Some(req) = &job.details.required_node_bitmap {
        if !candidates.is_superset_of(req) || req.count() as u32 > max_nodes {
            return NoFitSnafu.fail();
        }
    }

    let sel = if job.details.contiguous {
        select_contiguous(cr, job, nodes, candidates, gres, procs, cfg, min_nodes, req_nodes, min_cpus)?
    } else {
        select_scattered(cr, job, nodes, candidates, gres, procs, cfg, min_nodes, req_nodes, min_cpus)?
    };

    Ok(trim_to_max_nodes(sel, job.details.required_node_bitmap.as_ref(), max_nodes))
}

/// Enforces the `max_nodes` cap (spec §4.3's "Stop when `max_nodes == 0`"
/// commit-loop condition) by dropping highest-index non-required bits
/// until the set fits, never dropping a required node.
fn trim_to_max_nodes(mut sel: Bitmap, required: Option<&Bitmap>, max_nodes: u32) -> Bitmap {
    if max_nodes == u32::MAX || sel.count() as u32 <= max_nodes {
        return sel;
    }
    let droppable: Vec<usize> = sel
        .iter_set()
        .rev()
        .filter(|&n| required.map_or(true, |req| !req.test(n)))
        .collect();
    let mut to_drop = sel.count() as u32 - max_nodes;
    for n in droppable {
        if to_drop == 0 {
            break;
        }
        sel.clear(n);
        to_drop -= 1;
    }
    sel
}
