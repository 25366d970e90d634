//! Best-fit node selectors: a flat, bitmap-only selector and a
//! topology-aware selector layered over switch structure (spec §4.3, §4.4).

pub mod flat;
pub mod topo;
