//! CPU configuration.
//!
//! The map planner sizes per-CPU maps from the set of possible CPUs,
//! and the built-in variables expose online CPU identity. Discovery
//! reads the sysfs list files; tests inject a synthetic configuration
//! instead.

use crate::{RtResult, RuntimeError};

/// The CPUs visible to this tracing session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpuConfig {
    /// All possible CPU ids, sorted.
    pub possible: Vec<u32>,
    /// Online CPU ids, sorted.
    pub online: Vec<u32>,
}

impl CpuConfig {
    /// Read the configuration from sysfs.
    pub fn detect() -> RtResult<Self> {
        let read = |path: &str| -> RtResult<String> {
            std::fs::read_to_string(path)
                .map_err(|e| RuntimeError::Config(format!("{path}: {e}")))
        };
        let possible = parse_cpu_list(&read("/sys/devices/system/cpu/possible")?)?;
        let online = parse_cpu_list(&read("/sys/devices/system/cpu/online")?)?;
        Ok(CpuConfig { possible, online })
    }

    /// A synthetic configuration with `n` CPUs, all online.
    pub fn synthetic(n: u32) -> Self {
        let cpus: Vec<u32> = (0..n).collect();
        CpuConfig {
            possible: cpus.clone(),
            online: cpus,
        }
    }

    /// Number of possible CPUs.
    pub fn num_possible(&self) -> u32 {
        self.possible.len() as u32
    }

    /// Number of online CPUs.
    pub fn num_online(&self) -> u32 {
        self.online.len() as u32
    }

    /// The highest possible CPU id.
    pub fn max_cpuid(&self) -> u32 {
        self.possible.last().copied().unwrap_or(0)
    }
}

/// Parse the sysfs CPU list syntax: comma-separated ids and inclusive
/// ranges, e.g. `0-3,5,7-8`.
pub fn parse_cpu_list(text: &str) -> RtResult<Vec<u32>> {
    let mut cpus = Vec::new();
    let text = text.trim();
    if text.is_empty() {
        return Ok(cpus);
    }
    for part in text.split(',') {
        let bad = || RuntimeError::Config(format!("malformed CPU list entry '{part}'"));
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.trim().parse().map_err(|_| bad())?;
                let hi: u32 = hi.trim().parse().map_err(|_| bad())?;
                if lo > hi {
                    return Err(bad());
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.trim().parse().map_err(|_| bad())?),
        }
    }
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_syntax() {
        assert_eq!(parse_cpu_list("0-3\n").unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpu_list("0").unwrap(), vec![0]);
        assert_eq!(parse_cpu_list("0-2,4,6-7").unwrap(), vec![0, 1, 2, 4, 6, 7]);
        assert_eq!(parse_cpu_list("").unwrap(), Vec::<u32>::new());
        assert!(parse_cpu_list("3-1").is_err());
        assert!(parse_cpu_list("x").is_err());
    }

    #[test]
    fn synthetic_counts() {
        let conf = CpuConfig::synthetic(4);
        assert_eq!(conf.num_possible(), 4);
        assert_eq!(conf.num_online(), 4);
        assert_eq!(conf.max_cpuid(), 3);
    }
}
