//! Public API and locking layer (spec §5, §6): `SelectCore` owns the
//! collaborator tables and the lazily-built `CRState`, guarded by one
//! process-wide mutex, and exposes the `node_init`/`job_test`/`job_begin`/
//! `job_ready`/`job_expand`/`job_resized`/`job_fini`/`job_suspend`/
//! `job_resume`/`reconfigure`/`resv_test`/`nodeinfo_set_all` operation
//! table. Every method takes the lock for its full duration except the
//! planner's cloning step inside `job_test`, which runs lock-free once
//! `CRState::clone()` has returned (the clone happens while the lock is
//! still held; the simulation it drives does not touch `self`).

use crate::allocator;
use crate::bitmap::Bitmap;
use crate::cr_state::CRState;
use crate::error::{CoreResult, InvalidArgsSnafu};
use crate::gres::GresService;
use crate::nodeinfo::{self, NodeInfo};
use crate::planner::{self, NodeDemand, PlannerCtx, PreemptCandidate};
use crate::procs::ProcsOracle;
use crate::reservation;
use crate::switches::SwitchTopology;
use crate::types::{CoreConfig, JobId, JobRecord, JobState, NodeRecord, PartitionRecord, SelectMode, SwitchRecord};
use snafu::ensure;
use std::sync::Mutex;

struct Inner {
    nodes: Vec<NodeRecord>,
    partitions: Vec<PartitionRecord>,
    switches: Vec<SwitchRecord>,
    topology: Option<SwitchTopology>,
    cfg: CoreConfig,
    cr: Option<CRState>,
    /// Every job the core currently knows about (pending, running, or
    /// suspended) — the roster `init_from_world`/the planner's preemption
    /// and mate-finding walks read from (spec §4.1, §4.5, §4.7).
    jobs: Vec<JobRecord>,
}

impl Inner {
    /// Lazily builds `cr` on first use and after `node_init`/`reconfigure`
    /// reset it to null (spec §3 "Lifecycle").
    fn ensure_cr(&mut self) {
        if self.cr.is_none() {
            self.cr = Some(CRState::init_from_world(&self.nodes, &self.jobs, &self.cfg));
        }
    }

    fn upsert_job(&mut self, job: &JobRecord) {
        match self.jobs.iter_mut().find(|j| j.job_id == job.job_id) {
            Some(slot) => *slot = job.clone(),
            None => self.jobs.push(job.clone()),
        }
    }
}

/// The process-wide scheduling core. Construct one per process; every
/// operation in §6's table is a method here.
pub struct SelectCore {
    inner: Mutex<Inner>,
    gres: Box<dyn GresService>,
    procs: Box<dyn ProcsOracle>,
}

impl SelectCore {
    pub fn new(cfg: CoreConfig, gres: Box<dyn GresService>, procs: Box<dyn ProcsOracle>) -> Self {
        SelectCore {
            inner: Mutex::new(Inner {
                nodes: Vec::new(),
                partitions: Vec::new(),
                switches: Vec::new(),
                topology: None,
                cfg,
                cr: None,
                jobs: Vec::new(),
            }),
            gres,
            procs,
        }
    }

    /// `node_init`: records the node/partition/switch tables and resets
    /// `CRState` to null — the next call that needs it rebuilds from
    /// whatever job roster is on hand at that point.
    pub fn node_init(&self, nodes: Vec<NodeRecord>, partitions: Vec<PartitionRecord>, switches: Vec<SwitchRecord>) {
        let topology = if switches.is_empty() { None } else { Some(SwitchTopology::build(&switches)) };
        let mut inner = self.inner.lock().unwrap();
        log::info!(
            "node_init: {} nodes, {} partitions, {} switches",
            nodes.len(),
            partitions.len(),
            switches.len()
        );
        inner.nodes = nodes;
        inner.partitions = partitions;
        inner.switches = switches;
        inner.topology = topology;
        inner.cr = None;
        inner.jobs.clear();
    }

    /// `job_test(job, bitmap, min_n, max_n, req_n, mode, preempt_cands,
    /// now)` (spec §4.7, §6). Narrows `candidates` in place on a
    /// successful RUN_NOW/TEST_ONLY placement; WILL_RUN leaves it
    /// untouched since it never commits and its selection is only a
    /// prediction (see DESIGN.md for this Open Question's resolution).
    /// Returns the job ids actually preempted (empty for TEST_ONLY, or
    /// when no preemption was needed).
    #[allow(clippy::too_many_arguments)]
    pub fn job_test(
        &self,
        job: &mut JobRecord,
        candidates: &mut Bitmap,
        min_n: u32,
        max_n: u32,
        req_n: u32,
        mode: SelectMode,
        preempt_candidates: &[PreemptCandidate],
        now: i64,
    ) -> CoreResult<Vec<JobId>> {
        let min_nodes = min_n.max(1);
        ensure!(
            candidates.count() as u32 >= min_nodes,
            InvalidArgsSnafu {
                reason: "candidate bitmap has fewer set bits than min_nodes".to_string()
            }
        );
        let demand = NodeDemand {
            min_nodes,
            max_nodes: max_n,
            req_nodes: req_n.max(min_nodes),
        };

        let mut inner = self.inner.lock().unwrap();
        inner.ensure_cr();
        let Inner { nodes, partitions, switches, topology, cfg, cr, jobs } = &mut *inner;
        let cr_state = cr.as_mut().expect("ensure_cr just built it");
        let ctx = PlannerCtx {
            nodes,
            partitions,
            switches,
            topology: topology.as_ref(),
            gres: self.gres.as_ref(),
            procs: self.procs.as_ref(),
            cfg,
        };

        match mode {
            SelectMode::TestOnly => {
                let narrowed = planner::test_only_demand(&ctx, cr_state, job, candidates, demand)?;
                *candidates = narrowed;
                Ok(Vec::new())
            }
            SelectMode::RunNow => {
                let preemptees = planner::run_now_demand(&ctx, cr_state, job, candidates, preempt_candidates, jobs, demand)?;
                *candidates = job.node_bitmap.clone().expect("run_now_demand sets node_bitmap on success");
                Inner::upsert_job_in(jobs, job);
                Ok(preemptees)
            }
            SelectMode::WillRun => {
                planner::will_run_demand(&ctx, cr_state, job, candidates, preempt_candidates, jobs, now, demand)
            }
        }
    }

    /// `job_begin(job)`: commits a job's allocation. A job RUN_NOW already
    /// placed (and therefore already committed by `job_test`) is a no-op
    /// here — this path exists for jobs whose placement was decided
    /// out-of-band (e.g. a WILL_RUN prediction the caller chooses to
    /// honor, or a restart replaying a previously-placed job) and still
    /// need their footprint folded into this process's `CRState`.
    pub fn job_begin(&self, job: &mut JobRecord) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.ensure_cr();

        if job.state == JobState::Running {
            log::debug!("job {}: job_begin on an already-committed job, treating as a no-op", job.job_id);
            return Ok(());
        }
        ensure!(
            job.node_bitmap.is_some(),
            InvalidArgsSnafu {
                reason: "job has no assigned node set".to_string()
            }
        );

        let Inner { nodes, cfg, cr, jobs, .. } = &mut *inner;
        let cr_state = cr.as_mut().expect("ensure_cr just built it");
        if job.alloc.is_none() {
            let selected = job.node_bitmap.clone().expect("checked above");
            job.alloc = Some(allocator::build_alloc_record(cr_state, job, &selected, nodes, self.gres.as_ref(), self.procs.as_ref(), cfg));
        }
        allocator::commit_alloc(cr_state, job, nodes, self.gres.as_ref(), cfg, true)?;
        Inner::upsert_job_in(jobs, job);
        Ok(())
    }

    /// `job_ready(job)`: true iff every node the job is assigned to is not
    /// POWER_SAVE or POWER_UP.
    pub fn job_ready(&self, job: &JobRecord) -> bool {
        let inner = self.inner.lock().unwrap();
        match &job.node_bitmap {
            Some(bm) => bm
                .iter_set()
                .all(|n| inner.nodes.get(n).map_or(false, |node| !node.state.power_save && !node.state.power_up)),
            None => false,
        }
    }

    /// `job_expand(from, to)`: merges `from`'s allocation into `to`'s.
    pub fn job_expand(&self, from: &mut JobRecord, to: &mut JobRecord) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.ensure_cr();
        let Inner { nodes, cfg, cr, jobs, .. } = &mut *inner;
        allocator::job_expand(cr.as_mut().expect("ensure_cr just built it"), from, to, nodes, cfg)?;
        jobs.retain(|j| j.job_id != from.job_id);
        Inner::upsert_job_in(jobs, to);
        Ok(())
    }

    /// `job_resized(job, node)`: releases one node from a job's allocation.
    pub fn job_resized(&self, job: &mut JobRecord, node_index: usize) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.ensure_cr();
        let Inner { cr, jobs, .. } = &mut *inner;
        allocator::release_one_node(cr.as_mut().expect("ensure_cr just built it"), job, node_index, self.gres.as_ref())?;
        Inner::upsert_job_in(jobs, job);
        Ok(())
    }

    /// `job_fini(job)`: `release_alloc(mode_remove_all = true)`, then
    /// drops the job from the roster.
    pub fn job_fini(&self, job: &mut JobRecord) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.ensure_cr();
        let Inner { cfg, cr, jobs, .. } = &mut *inner;
        allocator::release_alloc(cr.as_mut().expect("ensure_cr just built it"), job, self.gres.as_ref(), cfg, true)?;
        jobs.retain(|j| j.job_id != job.job_id);
        Ok(())
    }

    /// `job_suspend(job)`: `release_alloc(mode_remove_all = false)`.
    pub fn job_suspend(&self, job: &mut JobRecord) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.ensure_cr();
        let Inner { cfg, cr, jobs, .. } = &mut *inner;
        allocator::release_alloc(cr.as_mut().expect("ensure_cr just built it"), job, self.gres.as_ref(), cfg, false)?;
        Inner::upsert_job_in(jobs, job);
        Ok(())
    }

    /// `job_resume(job)`: `commit_alloc(mode_all = false)`.
    pub fn job_resume(&self, job: &mut JobRecord) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.ensure_cr();
        let Inner { nodes, cfg, cr, jobs, .. } = &mut *inner;
        allocator::commit_alloc(cr.as_mut().expect("ensure_cr just built it"), job, nodes, self.gres.as_ref(), cfg, false)?;
        Inner::upsert_job_in(jobs, job);
        Ok(())
    }

    /// `reconfigure()`: frees and rebuilds `CRState` from the current
    /// node/partition layout and job roster.
    pub fn reconfigure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.cr = Some(CRState::init_from_world(&inner.nodes, &inner.jobs, &inner.cfg));
        log::info!("reconfigure: rebuilt CRState for {} nodes, {} jobs", inner.nodes.len(), inner.jobs.len());
    }

    /// `resv_test(avail, node_cnt)`: picks nodes for an advance
    /// reservation using the same topology best-fit skeleton the job
    /// selector uses, restricted to a bare node-count target.
    pub fn resv_test(&self, avail: &Bitmap, node_cnt: u32) -> CoreResult<Bitmap> {
        let inner = self.inner.lock().unwrap();
        reservation::resv_test(avail, node_cnt, &inner.switches, inner.topology.as_ref())
    }

    /// `nodeinfo_set_all(last_update)`: per-node `alloc_cpus`, nonzero
    /// only for ALLOCATED/COMPLETING nodes.
    pub fn nodeinfo_set_all(&self, last_update: i64) -> Vec<NodeInfo> {
        let inner = self.inner.lock().unwrap();
        nodeinfo::nodeinfo_set_all(&inner.nodes, &inner.cfg, self.procs.as_ref(), last_update)
    }
}

impl Inner {
    fn upsert_job_in(jobs: &mut Vec<JobRecord>, job: &JobRecord) {
        match jobs.iter_mut().find(|j| j.job_id == job.job_id) {
            Some(slot) => *slot = job.clone(),
            None => jobs.push(job.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gres::{GresSpec, NullGresService};
    use crate::procs::LllpProcsOracle;
    use crate::types::{JobDetails, NodeHw, NodeStateFlags};

    fn nodes(n: usize, cpus: u32) -> Vec<NodeRecord> {
        (0..n)
            .map(|i| NodeRecord {
                index: i,
                name: format!("n{i}"),
                configured: NodeHw { cpus, sockets: 1, cores: cpus, threads: 1, real_memory: 8192 },
                live: NodeHw { cpus, sockets: 1, cores: cpus, threads: 1, real_memory: 8192 },
                gres: GresSpec::none(),
                partitions: vec![0],
                state: NodeStateFlags::default(),
            })
            .collect()
    }

    fn partitions() -> Vec<PartitionRecord> {
        vec![PartitionRecord {
            id: 0,
            name: "default".into(),
            node_bitmap: Bitmap::new(4),
            max_share: 2,
        }]
    }

    fn details(min_cpus: u32, min_nodes: u32) -> JobDetails {
        JobDetails {
            min_cpus,
            min_nodes,
            required_node_bitmap: None,
            excluded_node_bitmap: None,
            contiguous: false,
            shared: false,
            pn_min_memory: 0,
            cpus_per_task: 1,
            ntasks_per_node: 0,
            multi_core: None,
        }
    }

    fn core() -> SelectCore {
        let core = SelectCore::new(CoreConfig::default(), Box::new(NullGresService), Box::new(LllpProcsOracle));
        core.node_init(nodes(4, 4), partitions(), Vec::new());
        core
    }

    #[test]
    fn run_now_commits_and_job_begin_is_then_a_no_op() {
        let core = core();
        let mut job = JobRecord::new(1, 0, details(8, 2));
        let mut candidates = Bitmap::from_indices(4, [0, 1, 2, 3]);
        let preemptees = core
            .job_test(&mut job, &mut candidates, 2, u32::MAX, 2, SelectMode::RunNow, &[], 0)
            .unwrap();
        assert!(preemptees.is_empty());
        assert_eq!(job.state, JobState::Running);
        assert!(candidates.count() >= 2);

        core.job_begin(&mut job).unwrap();
        assert_eq!(job.state, JobState::Running);
    }

    #[test]
    fn test_only_never_commits() {
        let core = core();
        let mut job = JobRecord::new(1, 0, details(8, 2));
        job.details.pn_min_memory = 1_000_000;
        let mut candidates = Bitmap::from_indices(4, [0, 1, 2, 3]);
        core.job_test(&mut job, &mut candidates, 2, u32::MAX, 2, SelectMode::TestOnly, &[], 0).unwrap();
        assert_eq!(job.state, JobState::Pending);

        let inner = core.inner.lock().unwrap();
        assert_eq!(inner.cr.as_ref().unwrap().alloc_cpus(0), 0);
    }

    #[test]
    fn job_fini_releases_and_drops_from_roster() {
        let core = core();
        let mut job = JobRecord::new(1, 0, details(8, 2));
        let mut candidates = Bitmap::from_indices(4, [0, 1, 2, 3]);
        core.job_test(&mut job, &mut candidates, 2, u32::MAX, 2, SelectMode::RunNow, &[], 0).unwrap();

        core.job_fini(&mut job).unwrap();
        let inner = core.inner.lock().unwrap();
        assert!(inner.jobs.is_empty());
        assert_eq!(inner.cr.as_ref().unwrap().alloc_cpus(0), 0);
    }

    #[test]
    fn suspend_then_resume_round_trips_the_run_set() {
        let core = core();
        let mut job = JobRecord::new(1, 0, details(8, 2));
        let mut candidates = Bitmap::from_indices(4, [0, 1, 2, 3]);
        core.job_test(&mut job, &mut candidates, 2, u32::MAX, 2, SelectMode::RunNow, &[], 0).unwrap();
        let node = job.node_bitmap.as_ref().unwrap().first_set().unwrap();

        core.job_suspend(&mut job).unwrap();
        assert_eq!(job.state, JobState::Suspended);
        {
            let inner = core.inner.lock().unwrap();
            assert_eq!(inner.cr.as_ref().unwrap().alloc_cpus(node), 0);
        }

        core.job_resume(&mut job).unwrap();
        assert_eq!(job.state, JobState::Running);
        let inner = core.inner.lock().unwrap();
        assert!(inner.cr.as_ref().unwrap().alloc_cpus(node) > 0);
    }

    #[test]
    fn reconfigure_rebuilds_state_from_the_roster() {
        let core = core();
        let mut job = JobRecord::new(1, 0, details(8, 2));
        let mut candidates = Bitmap::from_indices(4, [0, 1, 2, 3]);
        core.job_test(&mut job, &mut candidates, 2, u32::MAX, 2, SelectMode::RunNow, &[], 0).unwrap();
        let node = job.node_bitmap.as_ref().unwrap().first_set().unwrap();
        let before = core.inner.lock().unwrap().cr.as_ref().unwrap().alloc_cpus(node);

        core.reconfigure();
        let after = core.inner.lock().unwrap().cr.as_ref().unwrap().alloc_cpus(node);
        assert_eq!(before, after);
    }

    #[test]
    fn resv_test_falls_back_to_plain_pick_without_switches() {
        let core = core();
        let avail = Bitmap::from_indices(4, [0, 1, 2, 3]);
        let sel = core.resv_test(&avail, 2).unwrap();
        assert_eq!(sel.count(), 2);
    }

    #[test]
    fn nodeinfo_set_all_reports_zero_until_allocated() {
        let core = core();
        let info = core.nodeinfo_set_all(0);
        assert_eq!(info.len(), 4);
        assert!(info.iter().all(|n| n.alloc_cpus == 0));
    }

    #[test]
    fn node_init_resets_cr_and_roster() {
        let core = core();
        let mut job = JobRecord::new(1, 0, details(8, 2));
        let mut candidates = Bitmap::from_indices(4, [0, 1, 2, 3]);
        core.job_test(&mut job, &mut candidates, 2, u32::MAX, 2, SelectMode::RunNow, &[], 0).unwrap();

        core.node_init(nodes(4, 4), partitions(), Vec::new());
        let inner = core.inner.lock().unwrap();
        assert!(inner.cr.is_none());
        assert!(inner.jobs.is_empty());
    }
}
