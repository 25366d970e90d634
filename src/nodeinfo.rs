//! The only bit-exact wire surface this core owns: per-node `alloc_cpus`
//! (spec §6; `select_linear.c:107`, `:2904-2943` pack/unpack/alloc/free).
//!
//! Everything else about a node's allocation (memory, GRES, exclusive
//! use) lives in `CRState` and is never serialized across this boundary —
//! a host scheduler's own wire protocol carries that, if it has one.

use crate::types::NODEINFO_MAGIC;
use snafu::Snafu;

/// A freshly-allocated per-node info handle. The `magic` field is stamped
/// at construction and checked on free; a mismatch means a double-free or
/// a corrupted pointer handed back from elsewhere (`select_p_select_nodeinfo_free`'s
/// guard in the original).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    magic: u16,
    pub alloc_cpus: u16,
}

/// Returned by [`NodeInfo::free`] and [`unpack`] when a handle's magic
/// field doesn't match [`NODEINFO_MAGIC`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Snafu)]
#[snafu(display("nodeinfo handle has an invalid or already-freed magic field"))]
pub struct InvalidNodeInfo;

impl NodeInfo {
    /// Allocates a new handle with `alloc_cpus` set and the magic field
    /// initialized.
    pub fn new(alloc_cpus: u16) -> Self {
        NodeInfo {
            magic: NODEINFO_MAGIC,
            alloc_cpus,
        }
    }

    /// Packs this handle into the wire's 16-bit unsigned integer.
    pub fn pack(&self) -> u16 {
        self.alloc_cpus
    }

    /// Releases the handle, checking the magic field first.
    pub fn free(self) -> Result<(), InvalidNodeInfo> {
        if self.magic != NODEINFO_MAGIC {
            return Err(InvalidNodeInfo);
        }
        Ok(())
    }
}

/// Unpacks a wire-format `alloc_cpus` value into a freshly-allocated
/// [`NodeInfo`] with the magic field initialized. Symmetric with
/// [`NodeInfo::pack`]/[`NodeInfo::new`] — there is no failure mode on
/// unpack itself since the wire carries no magic field of its own; only
/// [`NodeInfo::free`] can observe a corrupted handle.
pub fn unpack(alloc_cpus: u16) -> NodeInfo {
    NodeInfo::new(alloc_cpus)
}

/// `nodeinfo_set_all` (spec §6): builds one [`NodeInfo`] per node. A node
/// reports its effective CPU count as `alloc_cpus` while it is
/// `ALLOCATED` or `COMPLETING`, and `0` otherwise — `last_update` has no
/// bearing on the value computed here (the core never caches a prior
/// snapshot to diff against); the parameter exists only to match the
/// caller-facing operation signature in spec §6.
pub fn nodeinfo_set_all(
    nodes: &[crate::types::NodeRecord],
    cfg: &crate::types::CoreConfig,
    procs: &dyn crate::procs::ProcsOracle,
    _last_update: i64,
) -> Vec<NodeInfo> {
    nodes
        .iter()
        .map(|node| {
            let cpus = if node.state.allocated || node.state.completing {
                procs.total_cpus(node, cfg) as u16
            } else {
                0
            };
            NodeInfo::new(cpus)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_then_unpack_round_trips() {
        let info = NodeInfo::new(12);
        let wire = info.pack();
        let back = unpack(wire);
        assert_eq!(back.alloc_cpus, 12);
        assert_eq!(back, info);
    }

    #[test]
    fn free_accepts_a_freshly_allocated_handle() {
        let info = NodeInfo::new(4);
        assert!(info.free().is_ok());
    }

    #[test]
    fn free_rejects_a_corrupted_magic() {
        let mut info = NodeInfo::new(4);
        info.magic = 0xdead;
        assert_eq!(info.free(), Err(InvalidNodeInfo));
    }

    #[test]
    fn set_all_reports_cpus_only_for_allocated_or_completing_nodes() {
        use crate::gres::GresSpec;
        use crate::procs::LllpProcsOracle;
        use crate::types::{CoreConfig, NodeHw, NodeStateFlags};

        let hw = NodeHw { cpus: 8, sockets: 1, cores: 8, threads: 1, real_memory: 1024 };
        let mut allocated = crate::types::NodeRecord {
            index: 0,
            name: "n0".into(),
            configured: hw,
            live: hw,
            gres: GresSpec::none(),
            partitions: vec![0],
            state: NodeStateFlags::default(),
        };
        allocated.state.allocated = true;
        let mut completing = allocated.clone();
        completing.index = 1;
        completing.name = "n1".into();
        completing.state.allocated = false;
        completing.state.completing = true;
        let mut idle = allocated.clone();
        idle.index = 2;
        idle.name = "n2".into();
        idle.state.allocated = false;

        let cfg = CoreConfig::default();
        let infos = nodeinfo_set_all(&[allocated, completing, idle], &cfg, &LllpProcsOracle, 0);
        assert_eq!(infos[0].alloc_cpus, 8);
        assert_eq!(infos[1].alloc_cpus, 8);
        assert_eq!(infos[2].alloc_cpus, 0);
    }
}
