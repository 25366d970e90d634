//! The temporal/preemption planner (spec §4.7; `select_linear.c:2257`
//! `_test_only`, `:2286` `_run_now`, `:2412` `_will_run_test`).
//!
//! Stateless free functions over `&CRState`/`&mut CRState` and clones, not
//! an object carrying its own fields — the collaborators (nodes,
//! partitions, switches, topology, GRES/procs oracles, config) are bundled
//! into [`PlannerCtx`] purely to keep call sites readable.

use crate::allocator;
use crate::bitmap::Bitmap;
use crate::cr_state::CRState;
use crate::error::{assert_clone_shape, CoreResult, NoFitSnafu};
use crate::filter;
use crate::gres::GresService;
use crate::mate;
use crate::procs::ProcsOracle;
use crate::selector::{flat, topo};
use crate::switches::SwitchTopology;
use crate::types::{CoreConfig, JobId, JobRecord, NodeRecord, PartitionRecord, PreemptMode, SelectMode, SwitchRecord};

/// Read-only collaborators and topology context shared across a planner
/// call. Borrowed for the call's duration; nothing here is owned by the
/// planner.
pub struct PlannerCtx<'a> {
    pub nodes: &'a [NodeRecord],
    pub partitions: &'a [PartitionRecord],
    pub switches: &'a [SwitchRecord],
    pub topology: Option<&'a SwitchTopology>,
    pub gres: &'a dyn GresService,
    pub procs: &'a dyn ProcsOracle,
    pub cfg: &'a CoreConfig,
}

/// A caller-supplied preemption candidate (spec Glossary "Preemptable"):
/// a running/suspended job plus the mode dictating how it releases.
#[derive(Clone, Copy, Debug)]
pub struct PreemptCandidate {
    pub job_id: JobId,
    pub mode: PreemptMode,
}

/// The three node-count parameters a `job_test` call supplies alongside
/// the job itself (spec §4.3 "Input", §6 `job_test`): `min_nodes` is the
/// job's floor, `req_nodes` may ask for more than the floor, and
/// `max_nodes` caps how many the selector is allowed to hand back.
#[derive(Clone, Copy, Debug)]
pub struct NodeDemand {
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub req_nodes: u32,
}

impl NodeDemand {
    /// The demand implied by the job alone, when a caller doesn't supply
    /// its own `min_n`/`max_n`/`req_n` (spec §6's `job_test` normally
    /// forwards these from the job's own `details.min_nodes`).
    pub fn from_job(job: &JobRecord) -> Self {
        let min_nodes = job.details.min_nodes.max(1);
        NodeDemand {
            min_nodes,
            max_nodes: u32::MAX,
            req_nodes: min_nodes,
        }
    }

    /// The effective node-count floor once `req_nodes > min_nodes` is
    /// accounted for (spec §8: "`req_nodes > min_nodes` forces
    /// `rem_nodes = req_nodes`").
    fn effective_min(&self) -> u32 {
        self.min_nodes.max(self.req_nodes)
    }
}

fn max_share_for(ctx: &PlannerCtx, job: &JobRecord) -> u32 {
    ctx.partitions
        .iter()
        .find(|p| p.id == job.partition)
        .map(|p| (p.share_limit() as u32).max(1))
        .unwrap_or(1)
        .min(64)
}

fn select(ctx: &PlannerCtx, cr: &CRState, job: &JobRecord, candidates: &Bitmap, demand: NodeDemand) -> CoreResult<Bitmap> {
    match ctx.topology {
        Some(topology) => topo::select_topo_demand(
            cr, job, ctx.nodes, ctx.switches, topology, candidates, ctx.gres, ctx.procs, ctx.cfg, demand.min_nodes, demand.max_nodes,
            demand.req_nodes,
        ),
        None => flat::select_flat_demand(
            cr, job, ctx.nodes, candidates, ctx.gres, ctx.procs, ctx.cfg, demand.min_nodes, demand.max_nodes, demand.req_nodes,
        ),
    }
}

/// TEST_ONLY: is there any conceivable allocation? Filters with
/// `run_cap = tot_cap = ∞` (ignoring sharing caps) and runs the selector
/// with the job's memory request zeroed out (ignoring memory headroom).
/// Pure: never touches `cr` or `job`'s placement fields.
pub fn test_only(ctx: &PlannerCtx, cr: &CRState, job: &JobRecord, candidates: &Bitmap) -> CoreResult<Bitmap> {
    test_only_demand(ctx, cr, job, candidates, NodeDemand::from_job(job))
}

/// Like [`test_only`], but with the node-count demand supplied explicitly
/// (spec §6 `job_test(min_n, max_n, req_n, ...)`).
pub fn test_only_demand(ctx: &PlannerCtx, cr: &CRState, job: &JobRecord, candidates: &Bitmap, demand: NodeDemand) -> CoreResult<Bitmap> {
    let mut filtered = Bitmap::new(ctx.nodes.len());
    let count = filter::count_available(
        cr,
        job,
        ctx.nodes,
        candidates,
        &mut filtered,
        u32::MAX,
        u32::MAX,
        SelectMode::TestOnly,
        ctx.gres,
        ctx.procs,
        ctx.cfg,
    );
    if count < demand.effective_min() {
        return NoFitSnafu.fail();
    }

    let mut scratch = job.clone();
    scratch.details.pn_min_memory = 0;
    select(ctx, cr, &scratch, &filtered, demand)
}

/// Walks the `(run_cap, tot_cap)` ladder spec §4.7 describes for RUN_NOW:
/// `run_cap` climbs from 0 to `max_share`; for each, `tot_cap` takes the
/// steps `{run_cap, run_cap+4, run_cap+5}`, except on the last `run_cap`
/// where `tot_cap` jumps straight to unbounded. A step is only acted on
/// when its available-node count rises above every count seen so far and
/// still meets `min_nodes`; a found mate wins over running the selector.
/// `exclude_from_mate` holds job ids being simulated as already-released in
/// the current preemption walk — a job can't be a valid mate footprint
/// once its own resources are the ones being freed to make room.
fn ladder(
    ctx: &PlannerCtx,
    cr: &CRState,
    job: &JobRecord,
    candidates: &Bitmap,
    max_share: u32,
    all_jobs: &[JobRecord],
    exclude_from_mate: &[JobId],
    demand: NodeDemand,
) -> Option<(Bitmap, u32)> {
    let min_nodes = demand.effective_min();
    let mut filtered = Bitmap::new(ctx.nodes.len());
    let mut best_count = 0u32;

    let mate_pool: Vec<JobRecord>;
    let mate_jobs: &[JobRecord] = if exclude_from_mate.is_empty() {
        all_jobs
    } else {
        mate_pool = all_jobs.iter().filter(|j| !exclude_from_mate.contains(&j.job_id)).cloned().collect();
        &mate_pool
    };

    for run_cap in 0..=max_share {
        let last = run_cap == max_share;
        let sus_steps: &[u32] = if last { &[u32::MAX] } else { &[0, 4, 5] };

        for &sus in sus_steps {
            let tot_cap = if sus == u32::MAX { u32::MAX } else { run_cap.saturating_add(sus) };
            let count = filter::count_available(
                cr, job, ctx.nodes, candidates, &mut filtered, run_cap, tot_cap, SelectMode::RunNow, ctx.gres, ctx.procs, ctx.cfg,
            );
            if count <= best_count || count < min_nodes {
                continue;
            }
            best_count = count;

            if run_cap > 0 {
                if let Some((mated, total_cpus)) =
                    mate::find_job_mate(mate_jobs, job, &filtered, min_nodes, job.details.min_cpus)
                {
                    return Some((mated, total_cpus));
                }
            }
            if let Ok(selected) = select(ctx, cr, job, &filtered, demand) {
                let total_cpus = allocator::total_cpus_of(&selected, ctx.nodes, ctx.procs, ctx.cfg);
                return Some((selected, total_cpus));
            }
        }
    }
    None
}

fn finalize_placement(ctx: &PlannerCtx, cr: &mut CRState, job: &mut JobRecord, selected: Bitmap, total_cpus: u32) -> CoreResult<()> {
    let alloc = allocator::build_alloc_record(cr, job, &selected, ctx.nodes, ctx.gres, ctx.procs, ctx.cfg);
    job.alloc = Some(alloc);
    job.node_bitmap = Some(selected);
    job.total_cpus = total_cpus;
    allocator::commit_alloc(cr, job, ctx.nodes, ctx.gres, ctx.cfg, true)
}

fn overlapping_ids<'a>(all_jobs: &'a [JobRecord], ids: &'a [JobId], selected: &'a Bitmap) -> Vec<JobId> {
    all_jobs
        .iter()
        .filter(|j| ids.contains(&j.job_id))
        .filter(|j| j.node_bitmap.as_ref().map_or(false, |b| b.overlaps(selected)))
        .map(|j| j.job_id)
        .collect()
}

/// RUN_NOW: try immediate placement, then (if given preemption
/// candidates) simulate removing them one at a time, retrying after each,
/// until the job fits or the candidate list is exhausted. On success,
/// commits the placement to `cr` and returns the job ids actually
/// preempted (the ones whose nodes overlap the final bitmap).
pub fn run_now(
    ctx: &PlannerCtx,
    cr: &mut CRState,
    job: &mut JobRecord,
    candidates: &Bitmap,
    preempt_candidates: &[PreemptCandidate],
    all_jobs: &[JobRecord],
) -> CoreResult<Vec<JobId>> {
    let demand = NodeDemand::from_job(job);
    run_now_demand(ctx, cr, job, candidates, preempt_candidates, all_jobs, demand)
}

/// Like [`run_now`], but with the node-count demand supplied explicitly
/// (spec §6 `job_test(min_n, max_n, req_n, ...)`).
#[allow(clippy::too_many_arguments)]
pub fn run_now_demand(
    ctx: &PlannerCtx,
    cr: &mut CRState,
    job: &mut JobRecord,
    candidates: &Bitmap,
    preempt_candidates: &[PreemptCandidate],
    all_jobs: &[JobRecord],
    demand: NodeDemand,
) -> CoreResult<Vec<JobId>> {
    let max_share = max_share_for(ctx, job);

    if let Some((selected, total_cpus)) = ladder(ctx, cr, job, candidates, max_share, all_jobs, &[], demand) {
        finalize_placement(ctx, cr, job, selected, total_cpus)?;
        return Ok(Vec::new());
    }

    if preempt_candidates.is_empty() {
        return NoFitSnafu.fail();
    }

    let mut sim = cr.clone();
    assert_clone_shape(sim.nodes.len() == cr.nodes.len());
    let mut removed_ids = Vec::new();
    for cand in preempt_candidates {
        let target = match all_jobs.iter().find(|j| j.job_id == cand.job_id) {
            Some(j) => j,
            None => continue,
        };
        let mut sim_job = target.clone();
        if allocator::release_alloc(&mut sim, &mut sim_job, ctx.gres, ctx.cfg, cand.mode.removes_all()).is_err() {
            continue;
        }
        removed_ids.push(cand.job_id);

        if let Some((selected, total_cpus)) = ladder(ctx, &sim, job, candidates, max_share, all_jobs, &removed_ids, demand) {
            let preemptees = overlapping_ids(all_jobs, &removed_ids, &selected);
            *cr = sim;
            finalize_placement(ctx, cr, job, selected, total_cpus)?;
            return Ok(preemptees);
        }
    }
    NoFitSnafu.fail()
}

/// WILL_RUN: when can this job run? Pure — `cr` is never mutated; only
/// `job.total_cpus`/`job.start_time` are predicted. First tries a
/// RUN_NOW-style placement one sharing slot short of the partition's cap
/// (`max_share − 1`), reserving headroom rather than claiming the whole
/// cap speculatively. Failing that, clones the registry, releases every
/// preemption candidate that must go immediately (suspended jobs, or
/// REQUEUE/CHECKPOINT/CANCEL jobs), retries, and if still short, releases
/// the remaining candidates one at a time in ascending `end_time` order
/// until the job fits.
pub fn will_run(
    ctx: &PlannerCtx,
    cr: &CRState,
    job: &mut JobRecord,
    candidates: &Bitmap,
    preempt_candidates: &[PreemptCandidate],
    all_jobs: &[JobRecord],
    now: i64,
) -> CoreResult<Vec<JobId>> {
    let demand = NodeDemand::from_job(job);
    will_run_demand(ctx, cr, job, candidates, preempt_candidates, all_jobs, now, demand)
}

/// Like [`will_run`], but with the node-count demand supplied explicitly
/// (spec §6 `job_test(min_n, max_n, req_n, ...)`).
#[allow(clippy::too_many_arguments)]
pub fn will_run_demand(
    ctx: &PlannerCtx,
    cr: &CRState,
    job: &mut JobRecord,
    candidates: &Bitmap,
    preempt_candidates: &[PreemptCandidate],
    all_jobs: &[JobRecord],
    now: i64,
    demand: NodeDemand,
) -> CoreResult<Vec<JobId>> {
    let headroom_share = max_share_for(ctx, job).saturating_sub(1);

    if let Some((_selected, total_cpus)) = ladder(ctx, cr, job, candidates, headroom_share, all_jobs, &[], demand) {
        job.total_cpus = total_cpus;
        job.start_time = now;
        return Ok(Vec::new());
    }

    if preempt_candidates.is_empty() {
        return NoFitSnafu.fail();
    }

    let mut sim = cr.clone();
    assert_clone_shape(sim.nodes.len() == cr.nodes.len());
    let mut must_preempt = Vec::new();
    let mut future_candidates: Vec<&PreemptCandidate> = Vec::new();

    for cand in preempt_candidates {
        let target = match all_jobs.iter().find(|j| j.job_id == cand.job_id) {
            Some(j) => j,
            None => continue,
        };
        if target.state.is_suspended() || cand.mode.removes_all() {
            let mut sim_job = target.clone();
            if allocator::release_alloc(&mut sim, &mut sim_job, ctx.gres, ctx.cfg, cand.mode.removes_all()).is_ok() {
                must_preempt.push(cand.job_id);
            }
        } else {
            future_candidates.push(cand);
        }
    }

    if let Some((selected, total_cpus)) = ladder(ctx, &sim, job, candidates, headroom_share, all_jobs, &must_preempt, demand) {
        job.total_cpus = total_cpus;
        job.start_time = now.saturating_add(1);
        return Ok(overlapping_ids(all_jobs, &must_preempt, &selected));
    }

    future_candidates.sort_by_key(|c| all_jobs.iter().find(|j| j.job_id == c.job_id).map(|j| j.end_time).unwrap_or(i64::MAX));

    for cand in future_candidates {
        let target = match all_jobs.iter().find(|j| j.job_id == cand.job_id) {
            Some(j) => j,
            None => continue,
        };
        if target.end_time == 0 {
            log::warn!("job {}: preemption candidate has zero end_time, skipping", target.job_id);
            continue;
        }
        let mut sim_job = target.clone();
        if allocator::release_alloc(&mut sim, &mut sim_job, ctx.gres, ctx.cfg, cand.mode.removes_all()).is_err() {
            continue;
        }

        let mut exclude = must_preempt.clone();
        exclude.push(target.job_id);
        if let Some((selected, total_cpus)) = ladder(ctx, &sim, job, candidates, headroom_share, all_jobs, &exclude, demand) {
            job.total_cpus = total_cpus;
            job.start_time = if target.end_time > now { target.end_time } else { now.saturating_add(1) };
            let mut preemptee_ids = must_preempt.clone();
            preemptee_ids.push(target.job_id);
            return Ok(overlapping_ids(all_jobs, &preemptee_ids, &selected));
        }
    }

    NoFitSnafu.fail()
}
