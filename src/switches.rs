//! Network switch topology: per-switch node bitmaps and levels, plus the
//! containment DAG derived from them (spec §4.4; `select_linear.c:1037`
//! `_job_test_topo`'s switch table).

use crate::types::SwitchRecord;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;

/// A containment DAG over switches: an edge `a -> b` means switch `a`'s
/// node-bitmap is a strict superset of switch `b`'s (`a` sits above `b`
/// in the fabric). Built once per topology snapshot and consulted by the
/// topology-aware selector's leaf-restriction step and by `resv_test`.
pub struct SwitchTopology {
    graph: DiGraph<usize, ()>,
    index_of: Vec<NodeIndex>,
}

impl SwitchTopology {
    pub fn build(switches: &[SwitchRecord]) -> Self {
        let mut graph = DiGraph::new();
        let index_of: Vec<NodeIndex> = (0..switches.len()).map(|i| graph.add_node(i)).collect();
        for i in 0..switches.len() {
            for j in 0..switches.len() {
                if i == j {
                    continue;
                }
                let si = &switches[i].node_bitmap;
                let sj = &switches[j].node_bitmap;
                if si.is_superset_of(sj) && si != sj {
                    graph.add_edge(index_of[i], index_of[j], ());
                }
            }
        }
        SwitchTopology { graph, index_of }
    }

    /// All switches strictly contained within `switch` (its descendants
    /// in the containment DAG).
    pub fn descendants(&self, switch: usize) -> Vec<usize> {
        let mut dfs = Dfs::new(&self.graph, self.index_of[switch]);
        dfs.next(&self.graph); // skip the start node itself
        let mut out = Vec::new();
        while let Some(nx) = dfs.next(&self.graph) {
            out.push(self.graph[nx]);
        }
        out
    }

    /// The leaf switches reachable under `switch`, including `switch`
    /// itself if it is already a leaf.
    pub fn leaves_under(&self, switch: usize, switches: &[SwitchRecord]) -> Vec<usize> {
        if switches[switch].is_leaf() {
            return vec![switch];
        }
        self.descendants(switch)
            .into_iter()
            .filter(|&i| switches[i].is_leaf())
            .collect()
    }

    pub fn dump(&self, switches: &[SwitchRecord]) -> String {
        switches
            .iter()
            .map(|s| format!("{} (level {}): {} nodes", s.name, s.level, s.node_bitmap.count()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
