//! CPU topology lookups and harness affinity.

use std::collections::BTreeMap;

use crate::error::{DoatError, Result};

// ---------------------------------------------------------------------------
// Core → socket map
// ---------------------------------------------------------------------------

/// Logical CPU to physical package (socket) map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuTopology {
    sockets: BTreeMap<usize, u32>,
}

impl CpuTopology {
    /// Parse `/proc/cpuinfo` text: `processor` starts a block, `physical id`
    /// inside the block names its socket. Processors without a physical id
    /// are placed on socket 0.
    pub fn from_cpuinfo(text: &str) -> Self {
        let mut sockets = BTreeMap::new();
        let mut current: Option<usize> = None;
        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            match key.trim() {
                "processor" => {
                    current = value.trim().parse().ok();
                    if let Some(cpu) = current {
                        sockets.entry(cpu).or_insert(0);
                    }
                }
                "physical id" => {
                    if let (Some(cpu), Ok(socket)) = (current, value.trim().parse()) {
                        sockets.insert(cpu, socket);
                    }
                }
                _ => {}
            }
        }
        Self { sockets }
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (usize, u32)>) -> Self {
        Self {
            sockets: pairs.into_iter().collect(),
        }
    }

    #[cfg(target_os = "linux")]
    pub fn detect() -> Result<Self> {
        let text = std::fs::read_to_string("/proc/cpuinfo")?;
        Ok(Self::from_cpuinfo(&text))
    }

    #[cfg(not(target_os = "linux"))]
    pub fn detect() -> Result<Self> {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Ok(Self::from_pairs((0..cores).map(|c| (c, 0))))
    }

    pub fn socket_of(&self, core: usize) -> Result<u32> {
        self.sockets
            .get(&core)
            .copied()
            .ok_or_else(|| DoatError::Config(format!("core {core} does not exist on this machine")))
    }

    pub fn core_count(&self) -> usize {
        self.sockets.len()
    }

    pub fn socket_count(&self) -> usize {
        let mut ids: Vec<u32> = self.sockets.values().copied().collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }
}

// ---------------------------------------------------------------------------
// Affinity
// ---------------------------------------------------------------------------

/// Set of CPUs the calling thread may run on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityMask {
    cpus: Vec<usize>,
}

impl AffinityMask {
    pub fn single(core: usize) -> Self {
        Self { cpus: vec![core] }
    }

    pub fn cpus(&self) -> &[usize] {
        &self.cpus
    }

    #[cfg(target_os = "linux")]
    pub fn current() -> std::io::Result<Self> {
        // SAFETY: cpu_set_t is plain data; sched_getaffinity writes at most
        // size_of::<cpu_set_t>() bytes into it.
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            let cpus = (0..libc::CPU_SETSIZE as usize)
                .filter(|&cpu| libc::CPU_ISSET(cpu, &set))
                .collect();
            Ok(Self { cpus })
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn current() -> std::io::Result<Self> {
        Ok(Self { cpus: Vec::new() })
    }

    #[cfg(target_os = "linux")]
    pub fn apply(&self) -> std::io::Result<()> {
        if self.cpus.is_empty() {
            return Ok(());
        }
        // SAFETY: see `current`; CPU_SET only touches bits inside the set.
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            for &cpu in &self.cpus {
                libc::CPU_SET(cpu, &mut set);
            }
            if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn apply(&self) -> std::io::Result<()> {
        log::debug!("CPU affinity is not supported on this platform");
        Ok(())
    }
}

/// `taskset`-style list: `0-3,8,10-11`.
impl std::fmt::Display for AffinityMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut cpus = self.cpus.clone();
        cpus.sort_unstable();
        cpus.dedup();
        let mut parts = Vec::new();
        let mut i = 0;
        while i < cpus.len() {
            let start = cpus[i];
            let mut end = start;
            while i + 1 < cpus.len() && cpus[i + 1] == end + 1 {
                i += 1;
                end = cpus[i];
            }
            if start == end {
                parts.push(start.to_string());
            } else {
                parts.push(format!("{start}-{end}"));
            }
            i += 1;
        }
        write!(f, "{}", parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_SOCKETS: &str = "\
processor\t: 0
vendor_id\t: GenuineIntel
physical id\t: 0
core id\t\t: 0

processor\t: 1
physical id\t: 0

processor\t: 2
physical id\t: 1

processor\t: 3
physical id\t: 1
";

    #[test]
    fn test_cpuinfo_maps_cores_to_sockets() {
        let topo = CpuTopology::from_cpuinfo(TWO_SOCKETS);
        assert_eq!(topo.core_count(), 4);
        assert_eq!(topo.socket_of(0).unwrap(), 0);
        assert_eq!(topo.socket_of(1).unwrap(), 0);
        assert_eq!(topo.socket_of(2).unwrap(), 1);
        assert_eq!(topo.socket_of(3).unwrap(), 1);
    }

    #[test]
    fn test_unknown_core_is_config_error() {
        let topo = CpuTopology::from_cpuinfo(TWO_SOCKETS);
        assert!(matches!(topo.socket_of(9), Err(DoatError::Config(_))));
    }

    #[test]
    fn test_missing_physical_id_defaults_to_socket_zero() {
        let topo = CpuTopology::from_cpuinfo("processor : 0\nprocessor : 1\n");
        assert_eq!(topo.socket_of(1).unwrap(), 0);
    }

    #[test]
    fn test_affinity_display_compresses_ranges() {
        let mask = AffinityMask {
            cpus: vec![0, 1, 2, 3, 8, 11, 10],
        };
        assert_eq!(mask.to_string(), "0-3,8,10-11");
        assert_eq!(AffinityMask::single(5).to_string(), "5");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_current_affinity_is_non_empty() {
        let mask = AffinityMask::current().unwrap();
        assert!(!mask.cpus().is_empty());
    }
}
