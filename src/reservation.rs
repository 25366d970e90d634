//! `resv_test` (spec §6; `select_linear.c:3167` `select_p_resv_test`):
//! picks nodes for an advance reservation using the same topology
//! best-fit skeleton as the job selector (§4.4), but restricted to a bare
//! node-count target — a reservation has no CPU demand or memory/GRES
//! request of its own.

use crate::bitmap::Bitmap;
use crate::error::{CoreError, NoFitSnafu};
use crate::switches::SwitchTopology;
use crate::types::SwitchRecord;
use snafu::ensure;

/// Picks `node_cnt` nodes out of `avail`, preferring the lowest-level
/// switch whose subtree covers the request with the fewest excess nodes
/// (the same switch-pick rule as §4.4 phase 4, with CPU sums dropped
/// since a reservation has no CPU floor). Falls back to a bare
/// lowest-index pick when no switch topology is present.
pub fn resv_test(
    avail: &Bitmap,
    node_cnt: u32,
    switches: &[SwitchRecord],
    topology: Option<&SwitchTopology>,
) -> Result<Bitmap, CoreError> {
    ensure!(avail.count() as u32 >= node_cnt, NoFitSnafu);

    let (switches, topology) = match (switches.is_empty(), topology) {
        (false, Some(t)) => (switches, t),
        _ => return avail.pick_n(node_cnt as usize).ok_or(CoreError::NoFit),
    };

    let mut satisfying: Vec<usize> = Vec::new();
    let mut overlaps: Vec<Bitmap> = Vec::with_capacity(switches.len());
    for (i, s) in switches.iter().enumerate() {
        let mut overlap = s.node_bitmap.clone();
        overlap.and_with(avail);
        if overlap.count() as u32 >= node_cnt {
            satisfying.push(i);
        }
        overlaps.push(overlap);
    }
    if satisfying.is_empty() {
        return NoFitSnafu.fail();
    }
    satisfying.sort_by_key(|&i| (switches[i].level, overlaps[i].count()));
    let best = satisfying[0];

    let leaves = topology.leaves_under(best, switches);
    let mut restricted = Bitmap::new(avail.len());
    for leaf in leaves {
        restricted.or_with(&switches[leaf].node_bitmap);
    }
    restricted.and_with(avail);
    if restricted.is_empty() {
        restricted = overlaps[best].clone();
    }

    restricted.pick_n(node_cnt as usize).ok_or(CoreError::NoFit)
}
