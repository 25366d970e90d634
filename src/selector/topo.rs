//! The topology-aware best-fit selector (spec §4.4; `select_linear.c:1037`
//! `_job_test_topo`).
//!
//! Six phases: pre-admit required nodes, try to satisfy the job from a
//! single leaf switch outright (leaf gravitation), recompute per-switch
//! CPU sums over the surviving candidates, pick the lowest-level switch
//! whose subtree still satisfies both minimums, restrict to that switch's
//! leaves, then hand the restricted bitmap to the flat selector for the
//! final node-level best-fit pick.

use crate::bitmap::Bitmap;
use crate::cr_state::CRState;
use crate::error::{CoreError, NoFitSnafu};
use crate::gres::GresService;
use crate::procs::ProcsOracle;
use crate::selector::flat::{self, node_avail_cpus};
use crate::switches::SwitchTopology;
use crate::types::{CoreConfig, JobRecord, NodeRecord, SwitchRecord};
use snafu::ensure;

/// Selects nodes for `job` within the switch topology, targeting
/// `job.details.min_nodes` with no `req_nodes`/`max_nodes` beyond it.
#[allow(clippy::too_many_arguments)]
pub fn select_topo(
    cr: &CRState,
    job: &JobRecord,
    nodes: &[NodeRecord],
    switches: &[SwitchRecord],
    topology: &SwitchTopology,
    candidates: &Bitmap,
    gres: &dyn GresService,
    procs: &dyn ProcsOracle,
    cfg: &CoreConfig,
) -> Result<Bitmap, CoreError> {
    let min_nodes = job.details.min_nodes.max(1);
    select_topo_demand(cr, job, nodes, switches, topology, candidates, gres, procs, cfg, min_nodes, u32::MAX, min_nodes)
}

/// Like [`select_topo`], but with `min_nodes`/`max_nodes`/`req_nodes`
/// supplied explicitly (spec §4.4; same extension as
/// [`flat::select_flat_demand`]).
#[allow(clippy::too_many_arguments)]
pub fn select_topo_demand(
    cr: &CRState,
    job: &JobRecord,
    nodes: &[NodeRecord],
    switches: &[SwitchRecord],
    topology: &SwitchTopology,
    candidates: &Bitmap,
    gres: &dyn GresService,
    procs: &dyn ProcsOracle,
    cfg: &CoreConfig,
    min_nodes: u32,
    max_nodes: u32,
    req_nodes: u32,
) -> Result<Bitmap, CoreError> {
    let min_nodes = min_nodes.max(1).max(req_nodes);
    let min_cpus = job.details.min_cpus;

    // Phase 1: required-node pre-admission. A required node outside the
    // candidate set can never be reached by any switch subtree either.
    if let Some(req) = &job.details.required_node_bitmap {
        ensure!(candidates.is_superset_of(req), NoFitSnafu);
    }

    if switches.is_empty() {
        return flat::select_flat_demand(cr, job, nodes, candidates, gres, procs, cfg, min_nodes, max_nodes, req_nodes);
    }

    // Phase 2: leaf gravitation — a job that fits entirely under one leaf
    // switch should stay there rather than spanning the fabric. Every
    // qualifying leaf is collected first and the tightest-fitting one
    // (smallest reachable node count) wins, matching Phase 4's tie-break.
    let mut gravitating: Vec<Bitmap> = Vec::new();
    for s in switches.iter() {
        if !s.is_leaf() {
            continue;
        }
        let mut overlap = s.node_bitmap.clone();
        overlap.and_with(candidates);
        if overlap.count() as u32 >= min_nodes {
            let cpus: u32 = overlap
                .iter_set()
                .map(|n| node_avail_cpus(cr, job, &nodes[n], gres, procs, cfg))
                .sum();
            if cpus >= min_cpus {
                gravitating.push(overlap);
            }
        }
    }
    if let Some(best) = gravitating.into_iter().min_by_key(|b| b.count()) {
        return flat::select_flat_demand(cr, job, nodes, &best, gres, procs, cfg, min_nodes, max_nodes, req_nodes);
    }

    // Phase 3: recompute per-switch CPU sums restricted to `candidates`.
    let mut switch_overlap: Vec<Bitmap> = Vec::with_capacity(switches.len());
    let mut switch_cpus: Vec<u32> = Vec::with_capacity(switches.len());
    for s in switches {
        let mut overlap = s.node_bitmap.clone();
        overlap.and_with(candidates);
        let cpus: u32 = overlap
            .iter_set()
            .map(|n| node_avail_cpus(cr, job, &nodes[n], gres, procs, cfg))
            .sum();
        switch_cpus.push(cpus);
        switch_overlap.push(overlap);
    }

    // Phase 4: lowest-level switch whose subtree satisfies both minimums,
    // tie-broken by the smallest reachable node count (tightest fit).
    let mut satisfying: Vec<usize> = (0..switches.len())
        .filter(|&i| switch_overlap[i].count() as u32 >= min_nodes && switch_cpus[i] >= min_cpus)
        .collect();
    if satisfying.is_empty() {
        return NoFitSnafu.fail();
    }
    satisfying.sort_by_key(|&i| (switches[i].level, switch_overlap[i].count()));
    let best_switch = satisfying[0];

    // Phase 5: restrict to the leaves reachable under the winning switch.
    let leaves = topology.leaves_under(best_switch, switches);
    let mut restricted = Bitmap::new(nodes.len());
    for leaf in leaves {
        restricted.or_with(&switches[leaf].node_bitmap);
    }
    restricted.and_with(candidates);
    if restricted.is_empty() {
        restricted = switch_overlap[best_switch].clone();
    }

    // Phase 6: final node-level best-fit pick within the restricted set.
    flat::select_flat_demand(cr, job, nodes, &restricted, gres, procs, cfg, min_nodes, max_nodes, req_nodes)
}
