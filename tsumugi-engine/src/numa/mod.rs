//! NUMA topology, the tid-to-core thread map and the worker pool.

mod pool;
mod topology;

pub use pool::WorkerPool;
pub use topology::{Topology, parse_cpu_list};

use tracing::info;

/// Mapping of worker tids onto physical cores, spread across memory nodes
/// with the main-thread node laid out first (tids `0..nt_mp`).
#[derive(Debug, Clone)]
pub struct ThreadMap {
    /// Worker count in the main-thread node.
    pub nt_mp: usize,
    pub n_threads: usize,
    pub tid_to_proc_id: Vec<u32>,
    pub tid_to_node_id: Vec<u32>,
    /// Main-thread node, where non-sharded tensors and run state live.
    pub mt_node: usize,
}

impl ThreadMap {
    /// Spread `n_procs` threads over `n_nodes` nodes. Zero or out-of-range
    /// requests clamp to the hardware.
    pub fn new(topo: &Topology, cfg_n_procs: i32, cfg_n_nodes: i32) -> ThreadMap {
        let mut n_nodes = cfg_n_nodes as usize;
        if cfg_n_nodes <= 0 || n_nodes > topo.n_nodes {
            n_nodes = topo.n_nodes;
        }
        let mut n_procs = cfg_n_procs as usize;
        if cfg_n_procs <= 0 || n_procs > topo.n_procs {
            n_procs = topo.n_procs;
        }
        if n_nodes > n_procs {
            n_nodes = n_procs;
        }

        let tpn = n_procs / n_nodes; // threads per node

        let mut tid_to_proc_id = Vec::new();
        let mut tid_to_node_id = Vec::new();
        let mut nt_mp = 0usize;

        // walk proc_list node group by node group (main-thread node first)
        let mut k = 0usize;
        let mut groups = 0usize;
        while k < topo.proc_list.len() && groups < n_nodes {
            let node = topo.proc_node[k];
            let group_len = topo
                .proc_list[k..]
                .iter()
                .zip(&topo.proc_node[k..])
                .take_while(|(_, n)| **n == node)
                .count();
            let nt = group_len.min(tpn);
            tid_to_proc_id.extend_from_slice(&topo.proc_list[k..k + nt]);
            tid_to_node_id.extend(std::iter::repeat_n(node, nt));
            if groups == 0 {
                nt_mp = nt;
            }
            k += group_len;
            groups += 1;
        }

        let n_threads = tid_to_proc_id.len();
        info!("processor(s) used: {} in {} node(s)", n_threads, groups);

        ThreadMap {
            nt_mp,
            n_threads,
            tid_to_proc_id,
            tid_to_node_id,
            mt_node: topo.mt_node,
        }
    }

    /// Row count of the `tid` shard when `wy` rows are split `dy` apiece.
    pub fn shard_rows(y: usize, dy: usize, wy: usize) -> usize {
        if y + dy <= wy { dy } else { wy.saturating_sub(y) }
    }
}
