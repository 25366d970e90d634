//! The generic-resource (GRES) collaborator: out of scope for this crate's
//! own math (spec §1, §6), represented as a trait so a host scheduler can
//! plug in its real GRES plugin while the core ships a no-op default.

use serde::{Deserialize, Serialize};

/// An opaque GRES descriptor attached to a job request or a node's
/// configuration (e.g. `"gpu:4"`). The core never parses this string; it
/// is handed verbatim to whatever `GresService` the caller supplies.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GresSpec(pub Option<String>);

impl GresSpec {
    pub fn none() -> Self {
        GresSpec(None)
    }

    pub fn new(descriptor: impl Into<String>) -> Self {
        GresSpec(Some(descriptor.into()))
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }
}

/// Result of testing a job's GRES request against a node (spec §4.2
/// operation 1: "no GRES required" vs. a bounded CPU cap GRES imposes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GresFit {
    /// The node can satisfy any number of CPUs the rest of the selector
    /// decides to hand the job; GRES imposes no additional cap.
    Unbounded,
    /// GRES availability on this node caps the job to at most this many
    /// CPUs (e.g. one GPU per task, and only N GPUs free).
    Bounded(u32),
}

impl GresFit {
    pub fn is_satisfiable(self) -> bool {
        !matches!(self, GresFit::Bounded(0))
    }

    /// Combines this fit with a CPU ceiling already computed from other
    /// sources, taking the tighter of the two.
    pub fn cap(self, cpus: u32) -> u32 {
        match self {
            GresFit::Unbounded => cpus,
            GresFit::Bounded(n) => cpus.min(n),
        }
    }
}

/// The GRES collaborator (spec §1: "assumed to be provided by a
/// gres_service"; §4.2, §4.6 `job_expand` GRES-presence check).
///
/// Mirrors `gres_plugin_job_test`/`gres_plugin_job_alloc`/
/// `gres_plugin_job_dealloc` from `select_linear.c`.
pub trait GresService: Send + Sync {
    /// Tests whether `job_gres` fits on a node currently configured with
    /// `node_gres`, and what CPU cap (if any) that implies. `use_total`
    /// is set by the availability filter when called in `TEST_ONLY` mode
    /// (spec §4.2 operation 1, §4.7): test against the node's *total*
    /// GRES capacity rather than its presently-free share, since
    /// TEST_ONLY asks "could this job conceivably ever run here" rather
    /// than "can it run right now".
    fn job_test(&self, job_gres: &GresSpec, node_gres: &GresSpec, node_index: usize, use_total: bool) -> GresFit;

    /// Commits `job_gres` against `node_gres`, mutating the node's GRES
    /// state to reflect the allocation.
    fn alloc(&self, job_gres: &GresSpec, node_gres: &mut GresSpec, node_index: usize);

    /// Reverses a prior `alloc`.
    fn dealloc(&self, job_gres: &GresSpec, node_gres: &mut GresSpec, node_index: usize);

    /// `true` iff `spec` represents "this job/node holds no GRES at all",
    /// used by `job_expand`'s GRES-presence guard (spec §4.6).
    fn holds_none(&self, spec: &GresSpec) -> bool {
        spec.is_none()
    }
}

/// Default collaborator used when the host scheduler has no GRES plugin
/// wired in: every request is unbounded and alloc/dealloc are no-ops.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullGresService;

impl GresService for NullGresService {
    fn job_test(&self, _job_gres: &GresSpec, _node_gres: &GresSpec, _node_index: usize, _use_total: bool) -> GresFit {
        GresFit::Unbounded
    }

    fn alloc(&self, _job_gres: &GresSpec, _node_gres: &mut GresSpec, _node_index: usize) {}

    fn dealloc(&self, _job_gres: &GresSpec, _node_gres: &mut GresSpec, _node_index: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_takes_the_tighter_bound() {
        assert_eq!(GresFit::Unbounded.cap(8), 8);
        assert_eq!(GresFit::Bounded(3).cap(8), 3);
        assert_eq!(GresFit::Bounded(8).cap(3), 3);
    }

    #[test]
    fn bounded_zero_is_unsatisfiable() {
        assert!(!GresFit::Bounded(0).is_satisfiable());
        assert!(GresFit::Unbounded.is_satisfiable());
        assert!(GresFit::Bounded(1).is_satisfiable());
    }

    #[test]
    fn null_service_is_always_unbounded_and_inert() {
        let svc = NullGresService;
        let job_gres = GresSpec::new("gpu:2");
        let mut node_gres = GresSpec::none();
        assert_eq!(svc.job_test(&job_gres, &node_gres, 0, false), GresFit::Unbounded);
        svc.alloc(&job_gres, &mut node_gres, 0);
        assert!(node_gres.is_none());
    }
}
