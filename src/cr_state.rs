//! The Consumable-Resource Registry: per-node allocation counters and the
//! sparse job-id membership sets that back them (spec §4.1).
//!
//! `CRState::clone()` is the `_dup_cr` analogue (the planner clones this
//! whole-sale before simulating); dropping a `CRState` is `_free_cr` —
//! Rust's ownership already gives us that for free, so no explicit
//! teardown method is needed.

use crate::error::{CoreError, InconsistentSnafu};
use crate::gres::GresSpec;
use crate::types::{CoreConfig, JobId, JobRecord, NodeRecord};
use serde::{Deserialize, Serialize};

/// A growable set of job ids with `0` reserved as an empty-slot tombstone
/// (spec §9). `add` reuses a freed slot before growing, matching the
/// original's scan-then-append behavior in `_add_run_job`/`_add_tot_job`
/// without committing to its fixed `RUN_JOB_INCR`-sized reallocation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobIdSet(Vec<JobId>);

impl JobIdSet {
    pub fn new() -> Self {
        JobIdSet(Vec::new())
    }

    /// Inserts `job_id`, reusing a tombstoned slot if one exists.
    pub fn add(&mut self, job_id: JobId) {
        debug_assert_ne!(job_id, 0, "job id 0 is the empty-slot tombstone");
        if let Some(slot) = self.0.iter_mut().find(|slot| **slot == 0) {
            *slot = job_id;
        } else {
            self.0.push(job_id);
        }
    }

    /// Tombstones `job_id`'s slot. Returns `false` if it wasn't present.
    pub fn remove(&mut self, job_id: JobId) -> bool {
        match self.0.iter_mut().find(|slot| **slot == job_id) {
            Some(slot) => {
                *slot = 0;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.0.iter().any(|&slot| slot == job_id)
    }

    /// Number of live (non-tombstoned) entries.
    pub fn count(&self) -> usize {
        self.0.iter().filter(|&&slot| slot != 0).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = JobId> + '_ {
        self.0.iter().copied().filter(|&slot| slot != 0)
    }
}

/// Per-(node, partition) allocation counters — a node touches one `PartCR`
/// per partition it belongs to (spec §3 `PartCR`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartCR {
    pub partition: usize,
    pub alloc_cpus: u32,
    pub alloc_memory: u32,
    pub run_jobs: JobIdSet,
    pub tot_jobs: JobIdSet,
}

/// Per-node allocation state.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeCR {
    pub alloc_cpus: u32,
    pub alloc_memory: u32,
    /// Count of exclusive (non-shared) jobs occupying this node; nonzero
    /// means no further job may share it regardless of partition caps.
    pub exclusive_cnt: u32,
    pub run_jobs: JobIdSet,
    pub tot_jobs: JobIdSet,
    pub parts: Vec<PartCR>,
    /// Live GRES state for this node, seeded from `NodeRecord::gres` and
    /// mutated in place by `GresService::alloc`/`dealloc` as jobs commit
    /// and release — the registry, not the read-only node record, owns
    /// the mutable half of GRES accounting.
    pub gres: GresSpec,
}

impl NodeCR {
    fn part_mut(&mut self, partition: usize) -> Option<&mut PartCR> {
        self.parts.iter_mut().find(|p| p.partition == partition)
    }
}

/// The registry: one `NodeCR` per node index, in node-index order.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CRState {
    pub nodes: Vec<NodeCR>,
}

impl CRState {
    /// An empty registry sized to `node_count`, with each node's `PartCR`
    /// list seeded from `nodes[i].partitions`.
    pub fn new(nodes: &[NodeRecord]) -> Self {
        let mut state = CRState {
            nodes: vec![NodeCR::default(); nodes.len()],
        };
        for (ni, node) in nodes.iter().enumerate() {
            state.nodes[ni].parts = node
                .partitions
                .iter()
                .map(|&partition| PartCR {
                    partition,
                    alloc_cpus: 0,
                    alloc_memory: 0,
                    run_jobs: JobIdSet::new(),
                    tot_jobs: JobIdSet::new(),
                })
                .collect();
        }
        state
    }

    /// Rebuilds the registry from a world snapshot: every job with an
    /// assigned `node_bitmap` contributes to the total-set, and (per
    /// `JobRecord::counts_as_running`, spec §4.1) running/eligible
    /// suspended jobs also contribute their per-node CPU/memory shares to
    /// the run-set (the `_init_node_cr` analogue).
    pub fn init_from_world(nodes: &[NodeRecord], jobs: &[JobRecord], cfg: &CoreConfig) -> Self {
        let mut state = CRState::new(nodes);
        for job in jobs {
            let (bitmap, alloc) = match (&job.node_bitmap, &job.alloc) {
                (Some(bm), Some(alloc)) => (bm, alloc),
                _ => continue,
            };
            for (slot, node_index) in bitmap.iter_set().enumerate() {
                state.add_tot_job(node_index, job.partition, job.job_id);
                if job.counts_as_running() {
                    let cpus = alloc.cpus.get(slot).copied().unwrap_or(0) as u32;
                    let (_, per_node_mem) = job.details.memory_request(cfg.cr_type_memory);
                    state.add_run_job(node_index, job.partition, job.job_id, cpus, per_node_mem);
                    if job.is_exclusive() {
                        state.mark_exclusive(node_index);
                    }
                }
            }
        }
        state
    }

    fn node_mut(&mut self, node_index: usize) -> &mut NodeCR {
        &mut self.nodes[node_index]
    }

    /// Adds `job_id`'s footprint to the run-set: node-level and
    /// partition-level counters both advance (`_add_run_job`).
    pub fn add_run_job(&mut self, node_index: usize, partition: usize, job_id: JobId, cpus: u32, memory: u32) {
        let node = self.node_mut(node_index);
        node.alloc_cpus += cpus;
        node.alloc_memory += memory;
        node.run_jobs.add(job_id);
        match node.part_mut(partition) {
            Some(part) => {
                part.alloc_cpus += cpus;
                part.alloc_memory += memory;
                part.run_jobs.add(job_id);
            }
            None => log::warn!(
                "node {node_index}: partition {partition} has no PartCR entry for job {job_id}"
            ),
        }
    }

    /// Adds `job_id` to the total-set (`_add_tot_job`): the node-level set
    /// (used by "node already claimed by a pending/placed job" checks) and
    /// the owning `PartCR`'s own total-set both advance.
    pub fn add_tot_job(&mut self, node_index: usize, partition: usize, job_id: JobId) {
        let node = self.node_mut(node_index);
        node.tot_jobs.add(job_id);
        match node.part_mut(partition) {
            Some(part) => part.tot_jobs.add(job_id),
            None => log::warn!(
                "node {node_index}: partition {partition} has no PartCR entry for job {job_id}"
            ),
        }
    }

    /// Removes `job_id`'s footprint from the run-set (`_rem_run_job`).
    /// Counter underflow is clamped to zero and logged; a missing job-id
    /// slot is reported as `CoreError::Inconsistent` to the caller while
    /// the counters are still clamped best-effort.
    pub fn rem_run_job(
        &mut self,
        node_index: usize,
        partition: usize,
        job_id: JobId,
        cpus: u32,
        memory: u32,
    ) -> Result<(), CoreError> {
        let node = self.node_mut(node_index);
        node.alloc_cpus = node.alloc_cpus.saturating_sub(cpus);
        node.alloc_memory = node.alloc_memory.saturating_sub(memory);
        let removed = node.run_jobs.remove(job_id);
        if let Some(part) = node.part_mut(partition) {
            part.alloc_cpus = part.alloc_cpus.saturating_sub(cpus);
            part.alloc_memory = part.alloc_memory.saturating_sub(memory);
            part.run_jobs.remove(job_id);
        }
        if !removed {
            log::debug!("node {node_index}: job {job_id} was not in the run-set at release time");
            return Err(InconsistentSnafu {
                node: node_index,
                detail: format!("job {job_id} not present in run-set"),
            }
            .build());
        }
        Ok(())
    }

    /// Removes `job_id` from the total-set (`_rem_tot_job`): the node-level
    /// set and the owning `PartCR`'s total-set both lose the entry. If that
    /// leaves the partition's total-set empty while its run-set is still
    /// nonempty, the two have fallen out of sync (a run-job can't outlive
    /// every total-job claiming the same node) — the run-set is force-zeroed
    /// and the discrepancy logged, rather than left to misreport headroom.
    pub fn rem_tot_job(&mut self, node_index: usize, partition: usize, job_id: JobId) -> bool {
        let node = self.node_mut(node_index);
        let removed = node.tot_jobs.remove(job_id);
        if let Some(part) = node.part_mut(partition) {
            part.tot_jobs.remove(job_id);
            if part.tot_jobs.count() == 0 && part.run_jobs.count() > 0 {
                log::error!(
                    "node {node_index} partition {partition}: tot_job_cnt reached 0 while run_job_cnt was still {}, forcing it to 0 to resync",
                    part.run_jobs.count()
                );
                part.run_jobs = JobIdSet::new();
            }
        }
        removed
    }

    pub fn test_run_job(&self, node_index: usize, job_id: JobId) -> bool {
        self.nodes[node_index].run_jobs.contains(job_id)
    }

    pub fn test_tot_job(&self, node_index: usize, job_id: JobId) -> bool {
        self.nodes[node_index].tot_jobs.contains(job_id)
    }

    /// `true` iff another job may still join the run-set on this node
    /// without pushing the sum of `run_job_cnt` across *all* of the node's
    /// partitions past `cap` (`_ck_run_job`'s share-count check, which
    /// walks the whole `part_cr_ptr` chain rather than one partition).
    pub fn ck_run_job(&self, node_index: usize, cap: u32) -> bool {
        let total: u32 = self.nodes[node_index].parts.iter().map(|p| p.run_jobs.count() as u32).sum();
        total <= cap
    }

    /// `true` iff the sum of `tot_job_cnt` across all of the node's
    /// partitions still has room under `cap` (`_ck_tot_job`).
    pub fn ck_tot_job(&self, node_index: usize, cap: u32) -> bool {
        let total: u32 = self.nodes[node_index].parts.iter().map(|p| p.tot_jobs.count() as u32).sum();
        total <= cap
    }

    pub fn mark_exclusive(&mut self, node_index: usize) {
        self.node_mut(node_index).exclusive_cnt += 1;
    }

    pub fn unmark_exclusive(&mut self, node_index: usize) {
        let node = self.node_mut(node_index);
        node.exclusive_cnt = node.exclusive_cnt.saturating_sub(1);
    }

    pub fn is_exclusive(&self, node_index: usize) -> bool {
        self.nodes[node_index].exclusive_cnt > 0
    }

    pub fn alloc_cpus(&self, node_index: usize) -> u32 {
        self.nodes[node_index].alloc_cpus
    }

    pub fn run_job_count(&self, node_index: usize) -> usize {
        self.nodes[node_index].run_jobs.count()
    }

    pub fn alloc_memory(&self, node_index: usize) -> u32 {
        self.nodes[node_index].alloc_memory
    }

    /// A pretty-printed snapshot for diagnostics (`_dump_node_cr`).
    pub fn dump(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("<cr_state dump failed: {e}>"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::Bitmap;
    use crate::gres::GresSpec;
    use crate::types::{AllocRecord, JobDetails, JobState, NodeHw, NodeStateFlags};
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn node_records(n: usize) -> Vec<NodeRecord> {
        (0..n)
            .map(|i| NodeRecord {
                index: i,
                name: format!("n{i}"),
                configured: NodeHw {
                    cpus: 8,
                    sockets: 2,
                    cores: 4,
                    threads: 1,
                    real_memory: 4096,
                },
                live: NodeHw {
                    cpus: 8,
                    sockets: 2,
                    cores: 4,
                    threads: 1,
                    real_memory: 4096,
                },
                gres: GresSpec::none(),
                partitions: vec![0],
                state: NodeStateFlags::default(),
            })
            .collect()
    }

    #[test]
    fn job_id_set_reuses_tombstoned_slots() {
        let mut set = JobIdSet::new();
        set.add(5);
        set.add(9);
        assert_eq!(set.count(), 2);
        assert!(set.remove(5));
        assert_eq!(set.count(), 1);
        set.add(12);
        assert_eq!(set.count(), 2);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![12, 9]);
    }

    #[test]
    fn add_and_remove_run_job_round_trips_counters() {
        let nodes = node_records(2);
        let mut cr = CRState::new(&nodes);
        cr.add_run_job(0, 0, 42, 4, 1024);
        assert_eq!(cr.alloc_cpus(0), 4);
        assert_eq!(cr.alloc_memory(0), 1024);
        assert!(cr.test_run_job(0, 42));
        assert!(cr.ck_run_job(0, 1));
        assert!(!cr.ck_run_job(0, 0));

        cr.rem_run_job(0, 0, 42, 4, 1024).unwrap();
        assert_eq!(cr.alloc_cpus(0), 0);
        assert_eq!(cr.alloc_memory(0), 0);
        assert!(!cr.test_run_job(0, 42));
    }

    #[test]
    fn removing_absent_job_reports_inconsistent_but_clamps() {
        let nodes = node_records(1);
        let mut cr = CRState::new(&nodes);
        cr.add_run_job(0, 0, 1, 2, 256);
        let err = cr.rem_run_job(0, 0, 999, 2, 256).unwrap_err();
        assert!(matches!(err, CoreError::Inconsistent { node: 0, .. }));
        assert_eq!(cr.alloc_cpus(0), 0);
    }

    #[test]
    fn init_from_world_splits_running_and_pending() {
        let nodes = node_records(2);
        let mut alloc = AllocRecord::new(2);
        alloc.node_bitmap = Bitmap::from_indices(2, [0, 1]);
        alloc.cpus = vec![4, 4];

        let details = JobDetails {
            min_cpus: 8,
            min_nodes: 2,
            required_node_bitmap: None,
            excluded_node_bitmap: None,
            contiguous: false,
            shared: false,
            pn_min_memory: 0,
            cpus_per_task: 1,
            ntasks_per_node: 0,
            multi_core: None,
        };
        let mut running = JobRecord::new(1, 0, details.clone());
        running.state = JobState::Running;
        running.node_bitmap = Some(Bitmap::from_indices(2, [0, 1]));
        running.alloc = Some(alloc.clone());

        let mut pending = JobRecord::new(2, 0, details);
        pending.state = JobState::Pending;
        pending.node_bitmap = Some(Bitmap::from_indices(2, [0]));
        let mut pending_alloc = AllocRecord::new(2);
        pending_alloc.node_bitmap = Bitmap::from_indices(2, [0]);
        pending_alloc.cpus = vec![2];
        pending.alloc = Some(pending_alloc);

        let cfg = CoreConfig::default();
        let cr = CRState::init_from_world(&nodes, &[running, pending], &cfg);

        assert_eq!(cr.alloc_cpus(0), 4);
        assert_eq!(cr.alloc_cpus(1), 4);
        assert!(cr.test_tot_job(0, 2));
        assert!(!cr.test_run_job(0, 2));
        assert!(cr.is_exclusive(0));
        assert!(cr.is_exclusive(1));
    }

    /// A run of randomized add/mark operations, undone in reverse order,
    /// must restore every per-node counter to zero — `CRState::clone()`
    /// (the planner's preemption-simulation entry point) is only safe if
    /// a simulated commit+release round-trip never leaks state back into
    /// the clone it was copied from.
    #[test]
    fn randomized_commit_release_round_trips_to_empty() {
        let mut rng = SmallRng::seed_from_u64(0xC0FFEE);
        let node_count = rng.gen_range(4..32);
        let nodes = node_records(node_count);

        for _ in 0..20 {
            let mut cr = CRState::new(&nodes);
            let mut ops: Vec<(usize, JobId, u32, u32, bool)> = Vec::new();
            let op_count = rng.gen_range(1..16);
            for i in 0..op_count {
                let node_index = rng.gen_range(0..node_count);
                let job_id = (i + 1) as JobId;
                let cpus = rng.gen_range(1..8);
                let memory = rng.gen_range(0..2048);
                let exclusive = rng.gen_bool(0.5);
                cr.add_run_job(node_index, 0, job_id, cpus, memory);
                cr.add_tot_job(node_index, 0, job_id);
                if exclusive {
                    cr.mark_exclusive(node_index);
                }
                ops.push((node_index, job_id, cpus, memory, exclusive));
            }

            for (node_index, job_id, cpus, memory, exclusive) in ops.into_iter().rev() {
                cr.rem_run_job(node_index, 0, job_id, cpus, memory).unwrap();
                cr.rem_tot_job(node_index, 0, job_id);
                if exclusive {
                    cr.unmark_exclusive(node_index);
                }
            }

            for node_index in 0..node_count {
                assert_eq!(cr.alloc_cpus(node_index), 0);
                assert_eq!(cr.alloc_memory(node_index), 0);
                assert_eq!(cr.run_job_count(node_index), 0);
                assert!(!cr.is_exclusive(node_index));
            }
        }
    }
}
