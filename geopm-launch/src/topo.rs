// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use anyhow::{bail, Result};
use geopm_util::{int_ceil_div, ExpError};
use log::warn;
use std::collections::BTreeSet;

use super::config::CtlMode;

pub type CpuSet = BTreeSet<usize>;

/// Compute node layout as reported by lscpu. Linux CPU numbering is
/// assumed to be core-major: CPU `core + ht * num_core` is hyperthread
/// `ht` of physical core `core`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    pub num_cpu: usize,
    pub thread_per_core: usize,
    pub core_per_socket: usize,
    pub num_socket: usize,
}

impl Topology {
    pub fn new(num_socket: usize, core_per_socket: usize, thread_per_core: usize) -> Self {
        Self {
            num_cpu: num_socket * core_per_socket * thread_per_core,
            thread_per_core,
            core_per_socket,
            num_socket,
        }
    }

    pub fn num_core(&self) -> usize {
        self.num_socket * self.core_per_socket
    }

    pub fn parse_lscpu(output: &str) -> Result<Self> {
        let mut num_cpu = None;
        let mut thread_per_core = None;
        let mut core_per_socket = None;
        let mut num_socket = None;

        for line in output.lines() {
            let mut kv = line.splitn(2, ':');
            let key = kv.next().unwrap_or("").trim();
            let val = match kv.next().map(|v| v.trim().parse::<usize>()) {
                Some(Ok(v)) => v,
                _ => continue,
            };
            match key {
                "CPU(s)" => num_cpu = Some(val),
                "Thread(s) per core" => thread_per_core = Some(val),
                "Core(s) per socket" => core_per_socket = Some(val),
                "Socket(s)" => num_socket = Some(val),
                _ => {}
            }
        }

        match (num_cpu, thread_per_core, core_per_socket, num_socket) {
            (Some(num_cpu), Some(tpc), Some(cps), Some(sockets)) if tpc * cps * sockets > 0 => {
                Ok(Self {
                    num_cpu,
                    thread_per_core: tpc,
                    core_per_socket: cps,
                    num_socket: sockets,
                })
            }
            _ => bail!("failed to parse topology from lscpu output"),
        }
    }
}

/// Hexadecimal mask of `set`, zero padded to cover `num_cpu` CPUs.
pub fn cpu_mask_hex(set: &CpuSet, num_cpu: usize) -> String {
    let width = int_ceil_div(num_cpu.max(1), 4);
    let mut buf = String::with_capacity(width);
    for nibble in (0..width).rev() {
        let mut val = 0u32;
        for bit in 0..4 {
            if set.contains(&(nibble * 4 + bit)) {
                val |= 1 << bit;
            }
        }
        buf.push_str(&format!("{:x}", val));
    }
    buf
}

/// Per-node CPU placement request.
#[derive(Debug, Clone, Copy)]
pub struct AffinityRequest {
    pub rank_per_node: usize,
    pub cpu_per_rank: usize,
    pub ctl: Option<CtlMode>,
    pub is_geopmctl: bool,
    pub hyperthreads_disabled: bool,
}

/// CPU sets in the order the launcher hands them out to ranks on a node.
/// The controller set, if the controller runs as its own rank, comes
/// first.
pub fn affinity_list(topo: &Topology, req: &AffinityRequest) -> Result<Vec<CpuSet>> {
    let num_core = topo.num_core();
    let rpn = req.rank_per_node;
    let cpr = req.cpu_per_rank.max(1);

    let app_cpu = rpn * cpr;
    let ht_depth = int_ceil_div(app_cpu, num_core).max(1);
    if ht_depth > topo.thread_per_core {
        return Err(ExpError::config(format!(
            "{} ranks with {} CPUs each need {} hyperthreads per core but only {} exist, ranks cannot share a core",
            rpn, cpr, ht_depth, topo.thread_per_core
        )));
    }
    if req.hyperthreads_disabled && ht_depth > 1 {
        return Err(ExpError::config(format!(
            "{} ranks with {} CPUs each require hyperthreads which are disabled",
            rpn, cpr
        )));
    }

    let core_per_rank = int_ceil_div(cpr, ht_depth);
    if rpn * core_per_rank > num_core {
        return Err(ExpError::config(format!(
            "{} ranks with {} cores each do not fit in {} cores",
            rpn, core_per_rank, num_core
        )));
    }

    // Fill from the top, a socket at a time when the ranks split evenly.
    let mut first_cores = vec![];
    if rpn > 0 && rpn % topo.num_socket == 0 {
        let rank_per_socket = rpn / topo.num_socket;
        for socket in 0..topo.num_socket {
            let base = (socket + 1) * topo.core_per_socket - rank_per_socket * core_per_rank;
            for idx in 0..rank_per_socket {
                first_cores.push(base + idx * core_per_rank);
            }
        }
    } else {
        let base = num_core - rpn * core_per_rank;
        for idx in 0..rpn {
            first_cores.push(base + idx * core_per_rank);
        }
    }

    let mut app_sets: Vec<CpuSet> = first_cores
        .iter()
        .map(|first| {
            let mut set = CpuSet::new();
            for core in *first..*first + core_per_rank {
                for ht in 0..ht_depth {
                    set.insert(core + ht * num_core);
                }
            }
            set
        })
        .collect();

    let used: CpuSet = app_sets.iter().flatten().cloned().collect();
    let ctl_cpu = match (0..topo.num_cpu).find(|cpu| !used.contains(cpu)) {
        Some(cpu) => cpu,
        None => {
            if req.ctl.is_some() {
                warn!("Application uses every CPU, GEOPM controller will share CPU 0");
            }
            0
        }
    };
    let ctl_set: CpuSet = vec![ctl_cpu].into_iter().collect();

    if req.is_geopmctl {
        return Ok(vec![ctl_set]);
    }

    let mut result = vec![];
    match req.ctl {
        Some(CtlMode::Process) => result.push(ctl_set),
        Some(CtlMode::Pthread) => {
            if let Some(first) = app_sets.first_mut() {
                first.insert(ctl_cpu);
            }
        }
        _ => {}
    }
    result.append(&mut app_sets);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LSCPU: &str = "Architecture:        x86_64
CPU op-mode(s):      32-bit, 64-bit
CPU(s):              80
On-line CPU(s) list: 0-79
Thread(s) per core:  2
Core(s) per socket:  20
Socket(s):           2
NUMA node(s):        2
";

    fn set(v: &[usize]) -> CpuSet {
        v.iter().cloned().collect()
    }

    fn req(rpn: usize, cpr: usize, ctl: Option<CtlMode>) -> AffinityRequest {
        AffinityRequest {
            rank_per_node: rpn,
            cpu_per_rank: cpr,
            ctl,
            is_geopmctl: false,
            hyperthreads_disabled: false,
        }
    }

    #[test]
    fn test_parse_lscpu() {
        let topo = Topology::parse_lscpu(LSCPU).unwrap();
        assert_eq!(topo, Topology::new(2, 20, 2));
        assert!(Topology::parse_lscpu("CPU(s): 4\n").is_err());
    }

    #[test]
    fn test_cpu_mask_hex() {
        for (cpus, num_cpu, expected) in &[
            (vec![0], 8, "01"),
            (vec![0, 1, 2, 3], 8, "0f"),
            (vec![40], 80, "00000000010000000000"),
            (vec![79], 80, "80000000000000000000"),
            (vec![1, 4], 5, "12"),
            (vec![], 0, "0"),
            (vec![], 12, "000"),
        ] {
            let result = cpu_mask_hex(&set(cpus), *num_cpu);
            println!("{:?}/{} -> {} ({})", cpus, num_cpu, &result, expected);
            assert_eq!(&result, expected);
        }
    }

    #[test]
    fn test_affinity_process_full_node() {
        let topo = Topology::new(2, 20, 2);
        let list = affinity_list(&topo, &req(40, 1, Some(CtlMode::Process))).unwrap();
        assert_eq!(list.len(), 41);
        assert_eq!(list[0], set(&[40]));
        for rank in 0..40 {
            assert_eq!(list[rank + 1], set(&[rank]));
        }
    }

    #[test]
    fn test_affinity_socket_packing() {
        let topo = Topology::new(2, 20, 2);
        let list = affinity_list(&topo, &req(4, 4, Some(CtlMode::Process))).unwrap();
        assert_eq!(
            list,
            vec![
                set(&[0]),
                set(&[12, 13, 14, 15]),
                set(&[16, 17, 18, 19]),
                set(&[32, 33, 34, 35]),
                set(&[36, 37, 38, 39]),
            ]
        );
    }

    #[test]
    fn test_affinity_uneven_and_hyperthreads() {
        let topo = Topology::new(2, 4, 2);
        // 3 ranks over 2 sockets: packed from the top ignoring sockets
        let list = affinity_list(&topo, &req(3, 2, None)).unwrap();
        assert_eq!(list, vec![set(&[2, 3]), set(&[4, 5]), set(&[6, 7])]);

        // 4 ranks x 4 cpus on 8 cores needs 2 hyperthreads per core
        let list = affinity_list(&topo, &req(4, 4, Some(CtlMode::Pthread))).unwrap();
        assert_eq!(list.len(), 4);
        assert_eq!(list[0], set(&[0, 1, 8, 9]));
        assert_eq!(list[3], set(&[6, 7, 14, 15]));
        let all: CpuSet = list.iter().flatten().cloned().collect();
        assert_eq!(all.len(), 16);

        // every CPU taken, controller falls back to CPU 0
        let topo = Topology::new(1, 4, 1);
        let list = affinity_list(&topo, &req(4, 1, Some(CtlMode::Process))).unwrap();
        assert_eq!(list[0], set(&[0]));
        assert_eq!(list[1], set(&[0]));
    }

    #[test]
    fn test_affinity_pthread_and_geopmctl() {
        let topo = Topology::new(1, 4, 1);
        let list = affinity_list(&topo, &req(2, 1, Some(CtlMode::Pthread))).unwrap();
        assert_eq!(list, vec![set(&[0, 2]), set(&[3])]);

        let mut r = req(2, 1, Some(CtlMode::Application));
        r.is_geopmctl = true;
        assert_eq!(affinity_list(&topo, &r).unwrap(), vec![set(&[0])]);
    }

    #[test]
    fn test_affinity_errors() {
        let topo = Topology::new(2, 4, 2);
        assert!(affinity_list(&topo, &req(8, 3, None)).is_err());
        let mut r = req(4, 4, None);
        r.hyperthreads_disabled = true;
        let err = affinity_list(&topo, &r).unwrap_err();
        assert!(err.downcast_ref::<ExpError>().is_some());
    }

    #[test]
    fn test_affinity_no_overlap() {
        for (sockets, cores, threads, rpn, cpr) in &[
            (2, 20, 2, 40, 1),
            (2, 20, 2, 10, 4),
            (2, 20, 2, 6, 7),
            (1, 64, 4, 64, 4),
            (2, 18, 2, 36, 2),
        ] {
            let topo = Topology::new(*sockets, *cores, *threads);
            let list = affinity_list(&topo, &req(*rpn, *cpr, None)).unwrap();
            assert_eq!(list.len(), *rpn);
            let mut seen = CpuSet::new();
            for cpu_set in list.iter() {
                for cpu in cpu_set.iter() {
                    assert!(seen.insert(*cpu), "cpu {} assigned twice", cpu);
                    assert!(*cpu < topo.num_cpu);
                }
            }
            if rpn % sockets == 0 {
                for cpu_set in list.iter() {
                    let socks: BTreeSet<usize> =
                        cpu_set.iter().map(|c| (c % topo.num_core()) / cores).collect();
                    assert_eq!(socks.len(), 1);
                }
            }
        }
    }
}
