//! The Availability Filter: narrows a candidate bitmap down to nodes that
//! are up, unclaimed beyond their sharing caps, and hold enough free CPU
//! and memory for the job (spec §4.2; `select_linear.c:616` `_job_count_bitmap`).

use crate::bitmap::Bitmap;
use crate::cr_state::CRState;
use crate::gres::{GresFit, GresService};
use crate::procs::ProcsOracle;
use crate::types::{CoreConfig, JobRecord, NodeRecord, SelectMode};

/// `true` iff `avail` free units suffice to keep the request viable: when
/// the job has already been offered more than its floor (`req > min`),
/// the remaining demand shrinks to `rem - (req - min)`; otherwise the
/// full remaining demand `rem` is still required.
pub fn enough_nodes(avail: u32, rem: u32, min: u32, req: u32) -> bool {
    let needed = if req > min { rem.saturating_sub(req - min) } else { rem };
    avail >= needed
}

/// Narrows `in_bitmap` down to `out_bitmap`: nodes that are up, not
/// exclusively held by another job, within both the run-set and
/// total-set sharing caps, and carrying enough free CPU/memory (and GRES,
/// via `gres`) for `job`. Returns the number of qualifying nodes.
#[allow(clippy::too_many_arguments)]
pub fn count_available(
    cr: &CRState,
    job: &JobRecord,
    nodes: &[NodeRecord],
    in_bitmap: &Bitmap,
    out_bitmap: &mut Bitmap,
    run_cap: u32,
    tot_cap: u32,
    mode: SelectMode,
    gres: &dyn GresService,
    procs: &dyn ProcsOracle,
    cfg: &CoreConfig,
) -> u32 {
    out_bitmap.clear_all();
    let mut count = 0u32;
    let test_only = matches!(mode, SelectMode::TestOnly);

    for node_index in in_bitmap.iter_set() {
        let node = &nodes[node_index];

        if node.state.down || node.state.power_save {
            continue;
        }

        if let Some(excluded) = &job.details.excluded_node_bitmap {
            if excluded.test(node_index) {
                continue;
            }
        }

        // Step 1 (spec §4.2): GRES fit. `use_total` asks the GRES
        // collaborator to test against the node's total capacity rather
        // than its presently-free share when this is a TEST_ONLY pass.
        // Unlike CPU availability, a GRES bound that falls short of the
        // node's CPU count excludes the node outright rather than
        // capping the job down to it.
        let total_cpus = procs.total_cpus(node, cfg);
        let gres_fit = gres.job_test(&job.gres_request, &node.gres, node_index, test_only);
        if let GresFit::Bounded(bound) = gres_fit {
            if bound < total_cpus {
                continue;
            }
        }

        // Step 2: TEST_ONLY skips every remaining check (memory,
        // exclusive-use, sharing caps) — it asks only "could this job
        // conceivably ever land here", not "is there room right now".
        if test_only {
            out_bitmap.set(node_index);
            count += 1;
            continue;
        }

        // Step 3: memory fit.
        let (_, per_node_mem) = job.details.memory_request(cfg.cr_type_memory);
        if per_node_mem > 0 {
            let total_mem = node.effective(cfg.select_fast_schedule).real_memory;
            let free_mem = total_mem.saturating_sub(cr.alloc_memory(node_index));
            if free_mem < per_node_mem {
                continue;
            }
        }

        // Step 4: exclusive-use fit.
        if cr.is_exclusive(node_index) {
            continue;
        }
        if job.is_exclusive() && cr.run_job_count(node_index) > 0 {
            continue;
        }

        // Step 5: sharing caps (run/total job counts summed across every
        // partition the node belongs to).
        if !cr.ck_run_job(node_index, run_cap) {
            continue;
        }
        if !cr.ck_tot_job(node_index, tot_cap) {
            continue;
        }

        out_bitmap.set(node_index);
        count += 1;
    }

    count
}
