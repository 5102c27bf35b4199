//! CPU topology discovery and core pinning

use crate::{Error, Result};
use libc::cpu_set_t;
use std::collections::HashMap;
use std::fs;

/// Per-core information
#[derive(Debug, Clone, Copy)]
pub struct CoreInfo {
    /// Logical core ID
    pub core_id: usize,
    /// NUMA node the core belongs to
    pub numa_node: usize,
}

/// CPU topology
#[derive(Debug)]
pub struct CpuTopology {
    /// All logical cores
    pub cores: Vec<CoreInfo>,
    /// Cores grouped by NUMA node
    pub numa_to_cores: HashMap<usize, Vec<usize>>,
}

impl CpuTopology {
    /// Discover the topology from /sys; single-node fallback when the NUMA
    /// hierarchy is not exposed.
    pub fn detect() -> Self {
        let num_cores = num_cpus::get();
        let node_map = read_numa_nodes();

        let mut cores = Vec::with_capacity(num_cores);
        let mut numa_to_cores: HashMap<usize, Vec<usize>> = HashMap::new();

        for core_id in 0..num_cores {
            let numa_node = node_map.get(&core_id).copied().unwrap_or(0);
            cores.push(CoreInfo { core_id, numa_node });
            numa_to_cores.entry(numa_node).or_default().push(core_id);
        }

        Self {
            cores,
            numa_to_cores,
        }
    }

    /// NUMA node of a core, 0 if unknown
    pub fn numa_node_of(&self, core_id: usize) -> usize {
        self.cores
            .get(core_id)
            .map(|c| c.numa_node)
            .unwrap_or(0)
    }

    pub fn num_cores(&self) -> usize {
        self.cores.len()
    }

    pub fn num_numa_nodes(&self) -> usize {
        self.numa_to_cores.len().max(1)
    }
}

/// Parse `/sys/devices/system/node/node*/cpulist` into core -> node
fn read_numa_nodes() -> HashMap<usize, usize> {
    let mut map = HashMap::new();
    let entries = match fs::read_dir("/sys/devices/system/node") {
        Ok(e) => e,
        Err(_) => return map,
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(node_str) = name.strip_prefix("node") else {
            continue;
        };
        let Ok(node) = node_str.parse::<usize>() else {
            continue;
        };
        let path = entry.path().join("cpulist");
        if let Ok(list) = fs::read_to_string(path) {
            for core in parse_cpu_list(list.trim()) {
                map.insert(core, node);
            }
        }
    }

    map
}

/// Parse a kernel-style cpulist such as "0-3,8-11,15"
pub fn parse_cpu_list(list: &str) -> Vec<usize> {
    let mut cores = Vec::new();
    for part in list.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = part.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<usize>(), hi.parse::<usize>()) {
                cores.extend(lo..=hi);
            }
        } else if let Ok(core) = part.parse::<usize>() {
            cores.push(core);
        }
    }
    cores
}

/// Pin the calling thread to a single core
pub fn pin_current_thread(core_id: usize) -> Result<()> {
    if core_id >= num_cpus::get() {
        return Err(Error::InvalidConfig(format!(
            "core ID {} out of range",
            core_id
        )));
    }

    let mut cpu_set: cpu_set_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::CPU_SET(core_id, &mut cpu_set);
    }

    let result = unsafe {
        libc::pthread_setaffinity_np(
            libc::pthread_self(),
            std::mem::size_of::<cpu_set_t>(),
            &cpu_set as *const cpu_set_t,
        )
    };

    if result != 0 {
        return Err(Error::IoError(std::io::Error::from_raw_os_error(result)));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_detection() {
        let topo = CpuTopology::detect();
        assert!(topo.num_cores() > 0);
        assert!(topo.num_numa_nodes() >= 1);
        assert_eq!(topo.cores.len(), topo.num_cores());
    }

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(parse_cpu_list("0-3"), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpu_list("0,2,4"), vec![0, 2, 4]);
        assert_eq!(parse_cpu_list("0-1,8-9"), vec![0, 1, 8, 9]);
        assert!(parse_cpu_list("").is_empty());
    }

    #[test]
    fn test_pin_current_thread() {
        // Pinning to core 0 is always legal; environments that forbid
        // affinity changes surface an IoError, which is also acceptable.
        match pin_current_thread(0) {
            Ok(()) => {}
            Err(Error::IoError(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    #[test]
    fn test_pin_out_of_range() {
        assert!(pin_current_thread(usize::MAX).is_err());
    }
}
