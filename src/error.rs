//! Error taxonomy for the core (spec §7).
//!
//! Selection/placement failures and invalid-argument rejections are always
//! reported to the caller. Internal inconsistencies (counter underflow, a
//! missing `PartCR`) are logged and clamped locally, surfacing only as
//! `CoreError::Inconsistent` so the caller knows *something* was irregular
//! without being handed the clamped-away detail.

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CoreError {
    /// Missing job details, a candidate bitmap with fewer set bits than
    /// `min_nodes`, or an unrecognized planner mode.
    #[snafu(display("invalid arguments: {reason}"))]
    InvalidArgs { reason: String },

    /// The selector could not satisfy the job's demand from the candidate
    /// bitmap under the current sharing caps.
    #[snafu(display("no node set satisfies the request"))]
    NoFit,

    /// `job_expand` was attempted with GRES present on either side.
    #[snafu(display("job expansion is blocked: one or both jobs hold GRES"))]
    ExpandGresBlocked,

    /// A recoverable bookkeeping inconsistency (counter underflow, a node's
    /// partition no longer contains it, a duplicate release). The caller
    /// gets `SLURM_ERROR`-equivalent; the registry keeps running
    /// best-effort with the clamp already applied.
    #[snafu(display("inconsistent registry state on node {node}: {detail}"))]
    Inconsistent { node: usize, detail: String },
}

pub type CoreResult<T> = Result<T, CoreError>;

/// The process-aborting path for a registry clone that comes back
/// malformed. Rust's global allocator already aborts on OOM, so a clone
/// failing to allocate never reaches this point — this exists to give
/// the planner's preemption-simulation clones (`CRState::clone`, the
/// `_dup_cr` analogue) a named, asserted checkpoint rather than an
/// implicit guarantee.
pub fn assert_clone_shape(matches: bool) {
    if !matches {
        panic!("BitmapCloneFailed: registry clone does not match its source shape");
    }
}
