//! Physical core and memory node enumeration.
//!
//! On Linux the cpu/node layout is read from sysfs; SMT siblings are
//! collapsed so only one logical cpu per physical core is used. Elsewhere,
//! or when sysfs is unreadable, a single node holding every available core
//! is assumed.

#[cfg(target_os = "linux")]
use std::fs;
use tracing::info;

/// Hardware topology, read once at init.
#[derive(Debug, Clone)]
pub struct Topology {
    /// Memory node count.
    pub n_nodes: usize,
    /// Node of the main thread.
    pub mt_node: usize,
    /// Physical core count.
    pub n_procs: usize,
    /// Logical cpu ids, one per physical core, grouped by node with the
    /// main-thread node's cores first.
    pub proc_list: Vec<u32>,
    /// Node id of each `proc_list` entry.
    pub proc_node: Vec<u32>,
    /// Physical core count per node id.
    pub node_nprocs: Vec<usize>,
}

/// Parse a sysfs cpu list such as `0-3,8,10-11`.
pub fn parse_cpu_list(s: &str) -> Vec<u32> {
    let mut out = Vec::new();
    for part in s.trim().split(',') {
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((a, b)) => {
                if let (Ok(a), Ok(b)) = (a.trim().parse::<u32>(), b.trim().parse::<u32>()) {
                    out.extend(a..=b);
                }
            }
            None => {
                if let Ok(v) = part.trim().parse::<u32>() {
                    out.push(v);
                }
            }
        }
    }
    out
}

/// Collapse SMT: keep a cpu only if it is the first id of its sibling set.
fn physical_cpus(online: &[u32], sibling_of: impl Fn(u32) -> Option<Vec<u32>>) -> Vec<u32> {
    let mut phys = Vec::new();
    for &cpu in online {
        match sibling_of(cpu) {
            Some(sib) if !sib.is_empty() => {
                if sib.iter().copied().min() == Some(cpu) {
                    phys.push(cpu);
                }
            }
            _ => phys.push(cpu),
        }
    }
    phys
}

/// Order cores so the main-thread node's group comes first.
fn order_mt_first(
    n_nodes: usize,
    mt_node: usize,
    node_plist: &[Vec<u32>],
) -> (Vec<u32>, Vec<u32>) {
    let mut proc_list = Vec::new();
    let mut proc_node = Vec::new();
    let mut push_node = |n: usize| {
        for &cpu in &node_plist[n] {
            proc_list.push(cpu);
            proc_node.push(n as u32);
        }
    };
    push_node(mt_node);
    for n in 0..n_nodes {
        if n != mt_node {
            push_node(n);
        }
    }
    (proc_list, proc_node)
}

impl Topology {
    pub fn detect() -> Topology {
        #[cfg(target_os = "linux")]
        {
            if let Some(t) = Self::detect_sysfs() {
                info!(
                    "numa node(s): {}, mp node: {}, physical procs: {}",
                    t.n_nodes, t.mt_node, t.n_procs
                );
                return t;
            }
        }
        let t = Self::fallback();
        info!("numa topology unavailable, single node, {} procs", t.n_procs);
        t
    }

    /// One node with every available core.
    pub fn fallback() -> Topology {
        let n = std::thread::available_parallelism().map(|v| v.get()).unwrap_or(1);
        Topology {
            n_nodes: 1,
            mt_node: 0,
            n_procs: n,
            proc_list: (0..n as u32).collect(),
            proc_node: vec![0; n],
            node_nprocs: vec![n],
        }
    }

    #[cfg(target_os = "linux")]
    fn detect_sysfs() -> Option<Topology> {
        let cpu_base = "/sys/devices/system/cpu";
        let online = parse_cpu_list(&fs::read_to_string(format!("{cpu_base}/online")).ok()?);
        if online.is_empty() {
            return None;
        }

        let phys = physical_cpus(&online, |cpu| {
            fs::read_to_string(format!(
                "{cpu_base}/cpu{cpu}/topology/thread_siblings_list"
            ))
            .ok()
            .map(|s| parse_cpu_list(&s))
        });

        // node -> physical cpus; a missing node tree means one node
        let node_base = "/sys/devices/system/node";
        let mut node_plist: Vec<Vec<u32>> = Vec::new();
        let mut cpu_node = vec![0u32; online.iter().copied().max().unwrap_or(0) as usize + 1];
        let mut n_nodes = 0usize;
        while let Ok(list) = fs::read_to_string(format!("{node_base}/node{n_nodes}/cpulist")) {
            let cpus = parse_cpu_list(&list);
            for &c in &cpus {
                if (c as usize) < cpu_node.len() {
                    cpu_node[c as usize] = n_nodes as u32;
                }
            }
            node_plist.push(
                phys.iter()
                    .copied()
                    .filter(|c| cpus.contains(c))
                    .collect(),
            );
            n_nodes += 1;
        }
        if n_nodes == 0 {
            n_nodes = 1;
            node_plist.push(phys.clone());
        }
        if node_plist.iter().any(|p| p.is_empty()) {
            return None; // a cpu-less node, treat topology as unreliable
        }

        let mt_cpu = unsafe { libc::sched_getcpu() };
        let mt_node = if mt_cpu >= 0 && (mt_cpu as usize) < cpu_node.len() {
            cpu_node[mt_cpu as usize] as usize
        } else {
            0
        };

        let node_nprocs: Vec<usize> = node_plist.iter().map(|p| p.len()).collect();
        let (proc_list, proc_node) = order_mt_first(n_nodes, mt_node, &node_plist);

        Some(Topology {
            n_nodes,
            mt_node,
            n_procs: phys.len(),
            proc_list,
            proc_node,
            node_nprocs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(parse_cpu_list("0-3"), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpu_list("0-1,4,6-7\n"), vec![0, 1, 4, 6, 7]);
        assert_eq!(parse_cpu_list("5"), vec![5]);
        assert!(parse_cpu_list("").is_empty());
    }

    #[test]
    fn test_physical_collapses_smt_siblings() {
        // cpus 0..8, siblings paired (0,4) (1,5) (2,6) (3,7)
        let online: Vec<u32> = (0..8).collect();
        let phys = physical_cpus(&online, |c| Some(vec![c % 4, c % 4 + 4]));
        assert_eq!(phys, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_order_mt_first() {
        let plist = vec![vec![0, 1], vec![2, 3]];
        let (procs, nodes) = order_mt_first(2, 1, &plist);
        assert_eq!(procs, vec![2, 3, 0, 1]);
        assert_eq!(nodes, vec![1, 1, 0, 0]);
    }

    #[test]
    fn test_fallback_single_node() {
        let t = Topology::fallback();
        assert_eq!(t.n_nodes, 1);
        assert_eq!(t.proc_list.len(), t.n_procs);
        assert!(t.node_nprocs[0] >= 1);
    }
}
