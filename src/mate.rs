//! "Find job mate" heuristic (spec §4.5; `select_linear.c:735`
//! `_find_job_mate`): when sharing is permitted, pack a new job onto an
//! already-running job's exact footprint instead of re-running the
//! selector from scratch.

use crate::bitmap::Bitmap;
use crate::types::{JobId, JobRecord};

/// Scans `jobs` for a running job whose footprint exactly matches what
/// `job` is asking for (node count, CPU floor, contiguity, required/
/// excluded coverage) and whose nodes all lie within `candidates`.
///
/// Per spec §9's Open Question resolution, only `JobState::Running`
/// candidates are considered — a suspended job of identical shape does
/// not qualify, since its resources are not presently free to co-locate
/// onto.
///
/// On a match, returns `candidates` intersected with the mate's
/// node-bitmap and the mate's `total_cpus` (to be copied onto `job`
/// verbatim, as the spec directs).
pub fn find_job_mate(
    jobs: &[JobRecord],
    job: &JobRecord,
    candidates: &Bitmap,
    req_nodes: u32,
    min_cpus: u32,
) -> Option<(Bitmap, u32)> {
    let required = job.details.required_node_bitmap.as_ref();
    let excluded = job.details.excluded_node_bitmap.as_ref();

    jobs.iter().find_map(|cand| {
        if cand.job_id == job.job_id || !cand.state.is_running() {
            return None;
        }
        let cand_bitmap = cand.node_bitmap.as_ref()?;
        if cand_bitmap.count() as u32 != req_nodes {
            return None;
        }
        if cand.total_cpus < min_cpus {
            return None;
        }
        if !candidates.is_superset_of(cand_bitmap) {
            return None;
        }
        if cand.details.contiguous != job.details.contiguous {
            return None;
        }
        if let Some(req) = required {
            if !cand_bitmap.is_superset_of(req) {
                return None;
            }
        }
        if let Some(exc) = excluded {
            if cand_bitmap.overlaps(exc) {
                return None;
            }
        }
        let mut mated = candidates.clone();
        mated.and_with(cand_bitmap);
        Some((mated, cand.total_cpus))
    })
}

/// Returns the running job ids eligible as a mate, for diagnostics.
pub fn mate_candidate_ids(jobs: &[JobRecord]) -> Vec<JobId> {
    jobs.iter()
        .filter(|j| j.state.is_running())
        .map(|j| j.job_id)
        .collect()
}
