//! The allocator: mutates the registry to reflect an allocation or
//! release of a job on a node set (spec §4.6).
//!
//! Grounded on `select_linear.c:1873` `_add_job_to_nodes`, `:1337`
//! `_rm_job_from_nodes`, `:1731` `_rm_job_from_one_node`, `:1492`
//! `_job_expand`.

use crate::cr_state::CRState;
use crate::error::{CoreError, CoreResult, ExpandGresBlockedSnafu, InvalidArgsSnafu};
use crate::gres::GresService;
use crate::procs::ProcsOracle;
use crate::types::{AllocRecord, CoreConfig, JobRecord, JobState, NodeRecord};
use itertools::Itertools;
use snafu::{ensure, OptionExt};

/// Run-length encodes a per-node CPU-count array into the
/// `cpu_array_value[] x cpu_array_reps[]` pair carried on `AllocRecord`
/// (spec §3).
fn run_length_encode(cpus: &[u16]) -> (Vec<u16>, Vec<u32>) {
    let mut values = Vec::new();
    let mut reps = Vec::new();
    for (value, group) in &cpus.iter().copied().group_by(|&c| c) {
        values.push(value);
        reps.push(group.count() as u32);
    }
    (values, reps)
}

/// Builds the per-job `AllocRecord` ("job resources") for a node set just
/// returned by a selector, against the registry state that selection ran
/// over (so per-node available CPU reflects what was actually offered).
pub fn build_alloc_record(
    cr: &CRState,
    job: &JobRecord,
    selected: &crate::bitmap::Bitmap,
    nodes: &[NodeRecord],
    gres: &dyn GresService,
    procs: &dyn ProcsOracle,
    cfg: &CoreConfig,
) -> AllocRecord {
    let mut alloc = AllocRecord::new(nodes.len());
    alloc.node_bitmap = selected.clone();

    let (per_cpu_mem, per_node_mem) = job.details.memory_request(cfg.cr_type_memory);
    let mut names = Vec::new();

    for node_index in selected.iter_set() {
        let node = &nodes[node_index];
        let cpus = crate::selector::flat::node_avail_cpus(cr, job, node, gres, procs, cfg);
        alloc.cpus.push(cpus as u16);
        alloc.cpus_used.push(0);
        let mem = if per_cpu_mem > 0 {
            per_cpu_mem.saturating_mul(cpus)
        } else {
            per_node_mem
        };
        alloc.memory_allocated.push(mem);
        alloc.memory_used.push(0);
        names.push(node.name.clone());
    }

    alloc.ncpus = alloc.cpus.iter().map(|&c| c as u32).sum();
    alloc.nhosts = selected.count() as u32;
    alloc.name_list = names.join(",");
    let (values, reps) = run_length_encode(&alloc.cpus);
    alloc.cpu_array_cnt = values.len() as u32;
    alloc.cpu_array_value = values;
    alloc.cpu_array_reps = reps;
    alloc
}

/// The node's *total* (not available) CPU count, summed across a node
/// set — becomes `JobRecord::total_cpus` after a successful placement
/// (spec §4.3's "commit rule" closing note).
pub fn total_cpus_of(selected: &crate::bitmap::Bitmap, nodes: &[NodeRecord], procs: &dyn ProcsOracle, cfg: &CoreConfig) -> u32 {
    selected.iter_set().map(|n| procs.total_cpus(&nodes[n], cfg)).sum()
}

/// `commit_alloc`: mutates `cr` to reflect `job`'s (already-built)
/// `AllocRecord`. `mode_all == false` is the "resume from suspend"
/// variant: the job re-enters the run-set but its total-set membership
/// and GRES reservation are left untouched, since neither was released
/// during a suspend (`release_alloc(mode_remove_all = false)`).
pub fn commit_alloc(
    cr: &mut CRState,
    job: &mut JobRecord,
    nodes: &[NodeRecord],
    gres: &dyn GresService,
    cfg: &CoreConfig,
    mode_all: bool,
) -> CoreResult<()> {
    let alloc = job
        .alloc
        .clone()
        .context(InvalidArgsSnafu { reason: "job has no allocation to commit".to_string() })?;
    let _ = nodes;

    for (slot, node_index) in alloc.node_bitmap.iter_set().enumerate() {
        let cpus = alloc.cpus.get(slot).copied().unwrap_or(0) as u32;
        let mem = alloc.memory_allocated.get(slot).copied().unwrap_or(0);

        cr.add_run_job(node_index, job.partition, job.job_id, cpus, mem);
        if mode_all {
            cr.add_tot_job(node_index, job.partition, job.job_id);
            let node_gres = &mut cr.nodes[node_index].gres;
            gres.alloc(&job.gres_request, node_gres, node_index);
            log::info!("node {node_index}: committed GRES for job {}", job.job_id);
        }
        if job.is_exclusive() {
            cr.mark_exclusive(node_index);
        }
    }
    job.state = JobState::Running;
    Ok(())
}

/// `release_alloc`: reverses `commit_alloc`'s bookkeeping for every node
/// in the job's `AllocRecord`. `mode_remove_all == false` is the
/// suspend-style release: GRES stays reserved and the total-set entry is
/// left in place (resume only needs to re-add the run-set entry).
pub fn release_alloc(
    cr: &mut CRState,
    job: &mut JobRecord,
    gres: &dyn GresService,
    cfg: &CoreConfig,
    mode_remove_all: bool,
) -> CoreResult<()> {
    let _ = cfg;
    let alloc = job
        .alloc
        .clone()
        .context(InvalidArgsSnafu { reason: "job has no allocation to release".to_string() })?;

    let mut any_found = false;
    let mut missing_partition = false;

    for (slot, node_index) in alloc.node_bitmap.iter_set().enumerate() {
        let cpus = alloc.cpus.get(slot).copied().unwrap_or(0) as u32;
        let mem = alloc.memory_allocated.get(slot).copied().unwrap_or(0);

        if mode_remove_all && cr.rem_tot_job(node_index, job.partition, job.job_id) {
            any_found = true;
        }
        match cr.rem_run_job(node_index, job.partition, job.job_id, cpus, mem) {
            Ok(()) => any_found = true,
            Err(CoreError::Inconsistent { .. }) => {
                // Not present in the run-set: expected for a job that
                // was already suspended, not a bookkeeping defect.
            }
            Err(e) => return Err(e),
        }
        if mode_remove_all {
            let node_gres = &mut cr.nodes[node_index].gres;
            gres.dealloc(&job.gres_request, node_gres, node_index);
        }
        if job.is_exclusive() {
            cr.unmark_exclusive(node_index);
        }
        if node_index >= cr.nodes.len() {
            missing_partition = true;
        }
    }

    if !any_found {
        log::error!("job {}: release_alloc found no resources to release", job.job_id);
        return crate::error::InconsistentSnafu {
            node: alloc.node_bitmap.first_set().unwrap_or(0),
            detail: "no resources".to_string(),
        }
        .fail();
    }
    if missing_partition {
        job.part_nodes_missing = true;
    }
    job.state = if mode_remove_all { JobState::Completed } else { JobState::Suspended };
    Ok(())
}

/// `release_one_node`: the same decrement logic as `release_alloc`,
/// limited to a single node, with the per-node CPU slot zeroed and the
/// run-length CPU-shape array rebuilt.
///
/// Per spec §9's Open Question resolution, the slot to clear is located
/// from `node_index` itself (a position within `alloc.node_bitmap`), not
/// from an unrelated outer loop counter — the latter is flagged in
/// spec.md as a latent bug in the source this was distilled from.
pub fn release_one_node(
    cr: &mut CRState,
    job: &mut JobRecord,
    node_index: usize,
    gres: &dyn GresService,
) -> CoreResult<()> {
    let alloc = job
        .alloc
        .as_mut()
        .context(InvalidArgsSnafu { reason: "job has no allocation".to_string() })?;
    ensure!(
        alloc.node_bitmap.test(node_index),
        InvalidArgsSnafu {
            reason: format!("node {node_index} is not part of job {}'s allocation", job.job_id)
        }
    );

    let slot = alloc.node_bitmap.iter_set().take_while(|&n| n < node_index).count();
    let cpus = alloc.cpus.get(slot).copied().unwrap_or(0) as u32;
    let mem = alloc.memory_allocated.get(slot).copied().unwrap_or(0);

    cr.rem_tot_job(node_index, job.partition, job.job_id);
    let _ = cr.rem_run_job(node_index, job.partition, job.job_id, cpus, mem);
    if job.is_exclusive() {
        cr.unmark_exclusive(node_index);
    }
    let node_gres = &mut cr.nodes[node_index].gres;
    gres.dealloc(&job.gres_request, node_gres, node_index);

    let alloc = job.alloc.as_mut().expect("checked above");
    alloc.node_bitmap.clear(node_index);
    if let Some(c) = alloc.cpus.get_mut(slot) {
        *c = 0;
    }
    if let Some(c) = alloc.cpus_used.get_mut(slot) {
        *c = 0;
    }
    if let Some(m) = alloc.memory_allocated.get_mut(slot) {
        *m = 0;
    }
    if let Some(m) = alloc.memory_used.get_mut(slot) {
        *m = 0;
    }
    alloc.ncpus = alloc.cpus.iter().map(|&c| c as u32).sum();
    alloc.nhosts = alloc.node_bitmap.count() as u32;
    let (values, reps) = run_length_encode(&alloc.cpus);
    alloc.cpu_array_cnt = values.len() as u32;
    alloc.cpu_array_value = values;
    alloc.cpu_array_reps = reps;
    Ok(())
}

/// `job_expand`: merges `from`'s `AllocRecord` into `to`'s, producing a
/// union node-bitmap. Overlapping nodes add CPU totals (only `from`'s
/// share is consumed); memory sums under per-CPU semantics, or is kept
/// as-is for per-node memory since the node's total draw did not change.
/// A node held exclusively by both jobs loses one `exclusive_cnt` claim
/// (the two jobs become one occupant). Neither job may carry GRES.
pub fn job_expand(cr: &mut CRState, from: &mut JobRecord, to: &mut JobRecord, nodes: &[NodeRecord], cfg: &CoreConfig) -> CoreResult<()> {
    ensure!(
        from.job_id != to.job_id,
        InvalidArgsSnafu { reason: "cannot expand a job into itself".to_string() }
    );
    ensure!(
        gres_holds_none(&from.gres_request) && gres_holds_none(&to.gres_request),
        ExpandGresBlockedSnafu
    );

    let from_alloc = from
        .alloc
        .take()
        .context(InvalidArgsSnafu { reason: "source job has no allocation".to_string() })?;
    let to_alloc = to
        .alloc
        .clone()
        .context(InvalidArgsSnafu { reason: "target job has no allocation".to_string() })?;

    let (per_cpu_mem, _) = to.details.memory_request(cfg.cr_type_memory);
    let node_count = nodes.len();

    let mut merged_bitmap = to_alloc.node_bitmap.clone();
    merged_bitmap.or_with(&from_alloc.node_bitmap);

    let mut cpus = vec![0u16; node_count];
    let mut memory = vec![0u32; node_count];
    for (slot, n) in to_alloc.node_bitmap.iter_set().enumerate() {
        cpus[n] = to_alloc.cpus.get(slot).copied().unwrap_or(0);
        memory[n] = to_alloc.memory_allocated.get(slot).copied().unwrap_or(0);
    }

    let mut new_nodes = Vec::new();
    for (slot, n) in from_alloc.node_bitmap.iter_set().enumerate() {
        let from_cpus = from_alloc.cpus.get(slot).copied().unwrap_or(0);
        let overlap = to_alloc.node_bitmap.test(n);
        cpus[n] = cpus[n].saturating_add(from_cpus);
        if per_cpu_mem > 0 {
            memory[n] = memory[n].saturating_add(per_cpu_mem.saturating_mul(from_cpus as u32));
        } else if !overlap {
            memory[n] = memory[n].saturating_add(from_alloc.memory_allocated.get(slot).copied().unwrap_or(0));
        }
        // `from`'s job-id leaves every node it touched; the CPU/memory it
        // contributed is now carried under `to`'s own entry above, so the
        // node-level counters are adjusted by zero here, not decremented.
        cr.rem_tot_job(n, from.partition, from.job_id);
        let _ = cr.rem_run_job(n, from.partition, from.job_id, 0, 0);
        if overlap {
            if from.is_exclusive() && to.is_exclusive() {
                cr.unmark_exclusive(n);
            }
        } else {
            new_nodes.push(n);
        }
    }
    for n in new_nodes {
        cr.add_tot_job(n, to.partition, to.job_id);
        cr.add_run_job(n, to.partition, to.job_id, 0, 0);
    }

    let mut merged = AllocRecord::new(node_count);
    merged.node_bitmap = merged_bitmap.clone();
    let mut names = Vec::new();
    for n in merged_bitmap.iter_set() {
        merged.cpus.push(cpus[n]);
        merged.cpus_used.push(0);
        merged.memory_allocated.push(memory[n]);
        merged.memory_used.push(0);
        names.push(nodes[n].name.clone());
    }
    merged.ncpus = merged.cpus.iter().map(|&c| c as u32).sum();
    merged.nhosts = merged_bitmap.count() as u32;
    merged.name_list = names.join(",");
    let (values, reps) = run_length_encode(&merged.cpus);
    merged.cpu_array_cnt = values.len() as u32;
    merged.cpu_array_value = values;
    merged.cpu_array_reps = reps;

    to.total_cpus = to.total_cpus.saturating_add(from.total_cpus);
    to.alloc = Some(merged);
    from.total_cpus = 0;
    from.state = JobState::Completed;

    Ok(())
}

fn gres_holds_none(spec: &crate::gres::GresSpec) -> bool {
    spec.is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::Bitmap;
    use crate::gres::{GresSpec, NullGresService};
    use crate::procs::LllpProcsOracle;
    use crate::types::{JobDetails, NodeHw, NodeStateFlags};

    fn node_records(n: usize, cpus: u32) -> Vec<NodeRecord> {
        (0..n)
            .map(|i| NodeRecord {
                index: i,
                name: format!("n{i}"),
                configured: NodeHw { cpus, sockets: 1, cores: cpus, threads: 1, real_memory: 4096 },
                live: NodeHw { cpus, sockets: 1, cores: cpus, threads: 1, real_memory: 4096 },
                gres: GresSpec::none(),
                partitions: vec![0],
                state: NodeStateFlags::default(),
            })
            .collect()
    }

    fn details(min_cpus: u32, min_nodes: u32, shared: bool) -> JobDetails {
        JobDetails {
            min_cpus,
            min_nodes,
            required_node_bitmap: None,
            excluded_node_bitmap: None,
            contiguous: false,
            shared,
            pn_min_memory: 0,
            cpus_per_task: 1,
            ntasks_per_node: 0,
            multi_core: None,
        }
    }

    #[test]
    fn commit_then_release_round_trips_counters() {
        let nodes = node_records(2, 8);
        let mut cr = CRState::new(&nodes);
        let mut job = JobRecord::new(1, 0, details(8, 2, false));
        let selected = Bitmap::from_indices(2, [0, 1]);
        let alloc = build_alloc_record(&cr, &job, &selected, &nodes, &NullGresService, &LllpProcsOracle, &CoreConfig::default());
        job.alloc = Some(alloc);
        job.node_bitmap = Some(selected);

        commit_alloc(&mut cr, &mut job, &nodes, &NullGresService, &CoreConfig::default(), true).unwrap();
        assert_eq!(cr.alloc_cpus(0), 8);
        assert!(cr.is_exclusive(0));

        release_alloc(&mut cr, &mut job, &NullGresService, &CoreConfig::default(), true).unwrap();
        assert_eq!(cr.alloc_cpus(0), 0);
        assert!(!cr.is_exclusive(0));
    }

    #[test]
    fn release_one_node_uses_the_released_nodes_own_slot() {
        let nodes = node_records(3, 4);
        let mut cr = CRState::new(&nodes);
        let mut job = JobRecord::new(1, 0, details(4, 3, true));
        let selected = Bitmap::from_indices(3, [0, 1, 2]);
        let alloc = build_alloc_record(&cr, &job, &selected, &nodes, &NullGresService, &LllpProcsOracle, &CoreConfig::default());
        job.alloc = Some(alloc);
        job.node_bitmap = Some(selected);
        commit_alloc(&mut cr, &mut job, &nodes, &NullGresService, &CoreConfig::default(), true).unwrap();

        release_one_node(&mut cr, &mut job, 1, &NullGresService).unwrap();
        let alloc = job.alloc.as_ref().unwrap();
        assert!(!alloc.node_bitmap.test(1));
        assert!(alloc.node_bitmap.test(0) && alloc.node_bitmap.test(2));
        assert_eq!(alloc.nhosts, 2);
        assert_eq!(cr.alloc_cpus(1), 0);
    }

    #[test]
    fn expand_merges_node_sets_and_sums_cpus() {
        let nodes = node_records(3, 4);
        let mut cr = CRState::new(&nodes);

        let mut from = JobRecord::new(1, 0, details(4, 1, true));
        let from_sel = Bitmap::from_indices(3, [1]);
        from.alloc = Some(build_alloc_record(&cr, &from, &from_sel, &nodes, &NullGresService, &LllpProcsOracle, &CoreConfig::default()));
        from.node_bitmap = Some(from_sel.clone());
        from.total_cpus = 4;
        commit_alloc(&mut cr, &mut from, &nodes, &NullGresService, &CoreConfig::default(), true).unwrap();

        let mut to = JobRecord::new(2, 0, details(4, 1, true));
        let to_sel = Bitmap::from_indices(3, [0]);
        to.alloc = Some(build_alloc_record(&cr, &to, &to_sel, &nodes, &NullGresService, &LllpProcsOracle, &CoreConfig::default()));
        to.node_bitmap = Some(to_sel.clone());
        to.total_cpus = 4;
        commit_alloc(&mut cr, &mut to, &nodes, &NullGresService, &CoreConfig::default(), true).unwrap();

        job_expand(&mut cr, &mut from, &mut to, &nodes, &CoreConfig::default()).unwrap();
        let merged = to.alloc.as_ref().unwrap();
        assert!(merged.node_bitmap.test(0) && merged.node_bitmap.test(1));
        assert_eq!(merged.nhosts, 2);
        assert_eq!(to.total_cpus, 8);
        assert!(from.alloc.is_none());
    }

    #[test]
    fn expand_rejects_self_merge() {
        let nodes = node_records(1, 4);
        let mut cr = CRState::new(&nodes);
        let mut job = JobRecord::new(1, 0, details(4, 1, true));
        let sel = Bitmap::from_indices(1, [0]);
        job.alloc = Some(build_alloc_record(&cr, &job, &sel, &nodes, &NullGresService, &LllpProcsOracle, &CoreConfig::default()));
        let mut job2 = job.clone();
        let err = job_expand(&mut cr, &mut job, &mut job2, &nodes, &CoreConfig::default()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgs { .. }));
    }
}
