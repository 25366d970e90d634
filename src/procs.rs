//! The CPU/socket/core/thread arithmetic collaborator: out of scope as a
//! feature (spec §1, §6), but fully specified in the original plugin's
//! `_get_avail_cpus`/`_get_total_cpus`, so a usable default ships here.

use crate::types::{CoreConfig, JobRecord, NodeRecord};

/// Computes CPU figures for a job/node pair. A host scheduler with a real
/// LLLP (lowest-level logical processor) implementation can supply its
/// own; `LllpProcsOracle` is the default, matching `select_linear.c:446`
/// (`_get_avail_cpus`) and `:514` (`_get_total_cpus`).
pub trait ProcsOracle: Send + Sync {
    /// The number of CPUs on `node` usable by `job`, honoring its
    /// multi-core shape constraints (sockets/cores/threads per unit) and
    /// its `cpus_per_task`/`ntasks_per_node` request.
    fn avail_cpus(&self, job: &JobRecord, node: &NodeRecord, cfg: &CoreConfig) -> u32;

    /// The total CPU count on `node`, independent of any job (used for
    /// "total" accounting alongside "available" accounting, spec §4.1).
    fn total_cpus(&self, node: &NodeRecord, cfg: &CoreConfig) -> u32;
}

/// The default LLLP oracle. Applies the job's multi-core shape
/// (`sockets_per_node`, `cores_per_socket`, `threads_per_core`) to cap the
/// usable CPU count below the node's raw total, then further caps by
/// `ntasks_per_node * cpus_per_task` when the job requested a specific
/// task layout.
#[derive(Clone, Copy, Debug, Default)]
pub struct LllpProcsOracle;

impl ProcsOracle for LllpProcsOracle {
    fn avail_cpus(&self, job: &JobRecord, node: &NodeRecord, cfg: &CoreConfig) -> u32 {
        let hw = node.effective(cfg.select_fast_schedule);
        let total = hw.cpus;
        if total == 0 {
            return 0;
        }

        let shape = match &job.details.multi_core {
            Some(s) => s,
            None => return cap_by_task_layout(job, total),
        };

        let sockets = if shape.sockets_per_node > 0 {
            shape.sockets_per_node.min(hw.sockets.max(1))
        } else {
            hw.sockets.max(1)
        };
        let cores_per_socket_avail = hw.cores / hw.sockets.max(1);
        let cores_per_socket = if shape.cores_per_socket > 0 {
            shape.cores_per_socket.min(cores_per_socket_avail.max(1))
        } else {
            cores_per_socket_avail.max(1)
        };
        let threads_per_core_avail = hw.threads / hw.cores.max(1);
        let threads_per_core = if shape.threads_per_core > 0 {
            shape.threads_per_core.min(threads_per_core_avail.max(1))
        } else {
            threads_per_core_avail.max(1)
        };

        let from_shape = sockets
            .saturating_mul(cores_per_socket)
            .saturating_mul(threads_per_core);
        cap_by_task_layout(job, from_shape.min(total))
    }

    fn total_cpus(&self, node: &NodeRecord, cfg: &CoreConfig) -> u32 {
        node.effective(cfg.select_fast_schedule).cpus
    }
}

fn cap_by_task_layout(job: &JobRecord, avail: u32) -> u32 {
    if job.details.ntasks_per_node == 0 {
        return avail;
    }
    let cpus_per_task = job.details.cpus_per_task.max(1);
    let needed = job.details.ntasks_per_node.saturating_mul(cpus_per_task);
    avail.min(needed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gres::GresSpec;
    use crate::types::{JobDetails, MultiCoreShape, NodeHw, NodeStateFlags};

    fn node(cpus: u32, sockets: u32, cores: u32, threads: u32) -> NodeRecord {
        NodeRecord {
            index: 0,
            name: "n0".into(),
            configured: NodeHw {
                cpus,
                sockets,
                cores,
                threads,
                real_memory: 1024,
            },
            live: NodeHw {
                cpus,
                sockets,
                cores,
                threads,
                real_memory: 1024,
            },
            gres: GresSpec::none(),
            partitions: vec![0],
            state: NodeStateFlags::default(),
        }
    }

    fn job(min_cpus: u32, multi_core: Option<MultiCoreShape>) -> JobRecord {
        let details = JobDetails {
            min_cpus,
            min_nodes: 1,
            required_node_bitmap: None,
            excluded_node_bitmap: None,
            contiguous: false,
            shared: true,
            pn_min_memory: 0,
            cpus_per_task: 1,
            ntasks_per_node: 0,
            multi_core,
        };
        JobRecord::new(1, 0, details)
    }

    #[test]
    fn no_shape_returns_full_node_cpus() {
        let n = node(16, 2, 8, 16);
        let j = job(1, None);
        let cfg = CoreConfig::default();
        assert_eq!(LllpProcsOracle.avail_cpus(&j, &n, &cfg), 16);
    }

    #[test]
    fn shape_caps_below_total() {
        let n = node(16, 2, 8, 16);
        let shape = MultiCoreShape {
            ntasks_per_socket: 0,
            ntasks_per_core: 0,
            sockets_per_node: 1,
            cores_per_socket: 2,
            threads_per_core: 1,
        };
        let j = job(1, Some(shape));
        let cfg = CoreConfig::default();
        assert_eq!(LllpProcsOracle.avail_cpus(&j, &n, &cfg), 2);
    }

    #[test]
    fn task_layout_caps_when_tighter_than_shape() {
        let n = node(16, 2, 8, 16);
        let mut j = job(1, None);
        j.details.ntasks_per_node = 2;
        j.details.cpus_per_task = 2;
        let cfg = CoreConfig::default();
        assert_eq!(LllpProcsOracle.avail_cpus(&j, &n, &cfg), 4);
    }

    #[test]
    fn zero_cpu_node_is_unusable() {
        let n = node(0, 1, 1, 1);
        let j = job(1, None);
        let cfg = CoreConfig::default();
        assert_eq!(LllpProcsOracle.avail_cpus(&j, &n, &cfg), 0);
    }
}
