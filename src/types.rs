//! The data model: read-only collaborator records, the job-write-back
//! record, and the process-wide sentinel constants the wire format and
//! memory-encoding contract depend on (spec §3, §6, §9).

use crate::bitmap::Bitmap;
use crate::gres::GresSpec;
use serde::{Deserialize, Serialize};

/// `NO_VAL` — the generic "unset" sentinel used where `0` would be
/// ambiguous with a legitimate zero value.
pub const NO_VAL: u32 = u32::MAX;

/// High bit of a per-node memory field: when set, the numeric remainder is
/// a per-CPU memory request rather than a per-node one.
pub const MEM_PER_CPU: u32 = 1 << 31;

/// Sharing-cap sentinel meaning "unlimited" when run-capping would
/// otherwise require iterating to infinity (`select_linear.c`'s
/// `NO_SHARE_LIMIT`).
pub const NO_SHARE_LIMIT: u32 = 0xFFFE;

/// Flag bit on `PartitionRecord::max_share` forcing sharing regardless of
/// what a job requests.
pub const SHARED_FORCE: u16 = 0x8000;

/// Magic value stamped into a freshly-allocated `NodeInfo` and checked on
/// free; a mismatch indicates a double-free or a corrupted handle.
pub const NODEINFO_MAGIC: u16 = 0x82ad;

/// A job's identifier. `0` is reserved as the "empty slot" tombstone in
/// the run-set/total-set job-id arrays (spec §9) and must never be used
/// for a real job.
pub type JobId = u32;

/// Hardware figures for a node, read either from the configured values or
/// from live values depending on `select_fast_schedule` (spec §3, §4.2).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHw {
    pub cpus: u32,
    pub sockets: u32,
    pub cores: u32,
    pub threads: u32,
    pub real_memory: u32,
}

/// Node state flags relevant to the core (spec §3).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStateFlags {
    pub down: bool,
    pub power_save: bool,
    pub power_up: bool,
    pub completing: bool,
    pub allocated: bool,
}

/// A read-only compute node collaborator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeRecord {
    pub index: usize,
    pub name: String,
    pub configured: NodeHw,
    pub live: NodeHw,
    pub gres: GresSpec,
    pub partitions: Vec<usize>,
    pub state: NodeStateFlags,
}

impl NodeRecord {
    /// The CPU/memory figures to use for this node given `fast_schedule`.
    pub fn effective(&self, fast_schedule: bool) -> NodeHw {
        if fast_schedule {
            self.configured
        } else {
            self.live
        }
    }
}

/// A read-only partition collaborator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionRecord {
    pub id: usize,
    pub name: String,
    pub node_bitmap: Bitmap,
    /// Encodes how many jobs may share a node; `SHARED_FORCE` may be set.
    pub max_share: u16,
}

impl PartitionRecord {
    pub fn forces_sharing(&self) -> bool {
        self.max_share & SHARED_FORCE != 0
    }

    pub fn share_limit(&self) -> u16 {
        self.max_share & !SHARED_FORCE
    }
}

/// A leaf or higher-level network switch (spec §3, §4.4).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SwitchRecord {
    pub name: String,
    pub level: u32,
    pub node_bitmap: Bitmap,
    pub link_speed: u32,
}

impl SwitchRecord {
    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }
}

/// Multi-core allocation shape constraints (spec §3 `multi-core shape`).
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct MultiCoreShape {
    pub ntasks_per_socket: u32,
    pub ntasks_per_core: u32,
    pub sockets_per_node: u32,
    pub cores_per_socket: u32,
    pub threads_per_core: u32,
}

/// A job's resource-request details (spec §3 `JobRecord.details`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobDetails {
    pub min_cpus: u32,
    pub min_nodes: u32,
    pub required_node_bitmap: Option<Bitmap>,
    pub excluded_node_bitmap: Option<Bitmap>,
    pub contiguous: bool,
    /// `true` iff the job is willing to share nodes with other jobs.
    /// `shared == false` is the "exclusive job" of spec §4.6/Glossary.
    pub shared: bool,
    /// Raw per-node-min-memory field; high bit is `MEM_PER_CPU`.
    pub pn_min_memory: u32,
    pub cpus_per_task: u32,
    pub ntasks_per_node: u32,
    pub multi_core: Option<MultiCoreShape>,
}

impl JobDetails {
    /// Splits `pn_min_memory` into `(per_cpu_mem, per_node_mem)`, at most
    /// one of which is nonzero — mirrors `select_linear.c`'s repeated
    /// `if (pn_min_memory & MEM_PER_CPU) ... else ...` decode.
    pub fn memory_request(&self, cr_type_memory: bool) -> (u32, u32) {
        if !cr_type_memory || self.pn_min_memory == 0 {
            return (0, 0);
        }
        if self.pn_min_memory & MEM_PER_CPU != 0 {
            (self.pn_min_memory & !MEM_PER_CPU, 0)
        } else {
            (0, self.pn_min_memory)
        }
    }
}

/// Lifecycle state of a job under the core's control (spec §4.7 state machine).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Suspended,
    Completing,
    Completed,
    Cancelled,
}

impl JobState {
    pub fn is_running(self) -> bool {
        matches!(self, JobState::Running)
    }

    pub fn is_suspended(self) -> bool {
        matches!(self, JobState::Suspended)
    }
}

/// How a preemptable job should be removed from a simulated/real registry
/// (spec Glossary: `Preemptable`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreemptMode {
    Requeue,
    Checkpoint,
    Cancel,
    Suspend,
}

impl PreemptMode {
    /// `true` for the modes that release *all* resources (GRES included)
    /// rather than the suspend-style CPU-only release.
    pub fn removes_all(self) -> bool {
        matches!(
            self,
            PreemptMode::Requeue | PreemptMode::Checkpoint | PreemptMode::Cancel
        )
    }
}

/// The planner mode a `job_test` call operates under (spec §4.7, §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectMode {
    TestOnly,
    RunNow,
    WillRun,
}

/// Per-job allocation bookkeeping ("job resources" in spec §3).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AllocRecord {
    pub node_bitmap: Bitmap,
    pub name_list: String,
    pub ncpus: u32,
    pub cpus: Vec<u16>,
    pub cpus_used: Vec<u16>,
    pub memory_allocated: Vec<u32>,
    pub memory_used: Vec<u32>,
    pub cpu_array_value: Vec<u16>,
    pub cpu_array_reps: Vec<u32>,
    pub cpu_array_cnt: u32,
    pub nhosts: u32,
    /// Implementation-internal per-node "used core" bitmap; cleared on
    /// `job_expand` (spec §4.6).
    pub core_bitmap_used: Option<Bitmap>,
}

impl AllocRecord {
    pub fn new(node_count: usize) -> Self {
        AllocRecord {
            node_bitmap: Bitmap::new(node_count),
            name_list: String::new(),
            ncpus: 0,
            cpus: Vec::new(),
            cpus_used: Vec::new(),
            memory_allocated: Vec::new(),
            memory_used: Vec::new(),
            cpu_array_value: Vec::new(),
            cpu_array_reps: Vec::new(),
            cpu_array_cnt: 0,
            nhosts: 0,
            core_bitmap_used: None,
        }
    }

    /// Invariant I4: `ncpus == sum(cpus)` and `nhosts == popcount(node_bitmap)`.
    pub fn check_invariant(&self) -> bool {
        self.ncpus == self.cpus.iter().map(|&c| c as u32).sum::<u32>()
            && self.nhosts as usize == self.node_bitmap.count()
    }
}

/// A read-write job collaborator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub partition: usize,
    pub details: JobDetails,
    pub node_bitmap: Option<Bitmap>,
    pub gres_request: GresSpec,
    pub total_cpus: u32,
    pub end_time: i64,
    pub start_time: i64,
    pub priority: u32,
    pub state: JobState,
    pub alloc: Option<AllocRecord>,
    pub part_nodes_missing: bool,
}

impl JobRecord {
    pub fn new(job_id: JobId, partition: usize, details: JobDetails) -> Self {
        assert_ne!(job_id, 0, "job id 0 is reserved as the empty-slot tombstone");
        JobRecord {
            job_id,
            partition,
            details,
            node_bitmap: None,
            gres_request: GresSpec::none(),
            total_cpus: 0,
            end_time: 0,
            start_time: 0,
            priority: 0,
            state: JobState::Pending,
            alloc: None,
            part_nodes_missing: false,
        }
    }

    /// Whether this job should be counted in the run-set during
    /// `init_from_world`: running jobs always count; a suspended job
    /// counts too unless its priority is zero (spec §4.1).
    pub fn counts_as_running(&self) -> bool {
        self.state.is_running() || (self.state.is_suspended() && self.priority != 0)
    }

    pub fn is_exclusive(&self) -> bool {
        !self.details.shared
    }
}

/// Process-wide configuration flags (spec §3 "Configuration flags").
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CoreConfig {
    pub select_fast_schedule: bool,
    pub cr_type_memory: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            select_fast_schedule: true,
            cr_type_memory: true,
        }
    }
}
