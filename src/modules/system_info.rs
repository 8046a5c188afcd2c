// src/modules/system_info.rs
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::{error, warn};
use sysinfo::System;

use crate::cpuinfo_parser::{resolve_model_name, CpuInfoParser};
use crate::locator::{ControlFileTable, FileRole, SysRoots, Vendor};
use crate::sysfs::read_number;

#[derive(Debug, Clone, PartialEq)]
pub struct CpuTopology {
    pub vendor: Vendor,
    pub thread_count: usize,
    pub physical_cores: usize,
    pub cache_sizes: BTreeMap<String, String>,
    pub model_name: String,
    pub total_ram_mb: Option<u64>,
}

impl CpuTopology {
    /// Derive the topology from the resolved files. Approximate on hosts
    /// whose cpuinfo lacks topology fields.
    pub fn build(table: &ControlFileTable, roots: &SysRoots) -> Self {
        let cpuinfo = table
            .proc_cpuinfo
            .as_ref()
            .and_then(|p| match fs::read_to_string(p) {
                Ok(text) => Some(text),
                Err(e) => {
                    error!("Failed to read {}: {}", p.display(), e);
                    None
                }
            })
            .unwrap_or_default();

        let parsed = CpuInfoParser::parse(&cpuinfo, table.thread_count);

        Self {
            vendor: table.vendor,
            thread_count: table.thread_count,
            physical_cores: parsed.physical_cores,
            cache_sizes: table.cache_sizes.clone(),
            model_name: resolve_model_name(parsed.model_name, roots),
            total_ram_mb: read_total_ram_mb(table.proc_meminfo.as_deref()),
        }
    }
}

/// `MemTotal` in MB, falling back to sysinfo when meminfo is unreadable.
pub fn read_total_ram_mb(meminfo: Option<&Path>) -> Option<u64> {
    let from_meminfo = meminfo.and_then(|p| fs::read_to_string(p).ok()).and_then(|text| {
        text.lines()
            .find(|l| l.starts_with("MemTotal"))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb / 1024)
    });

    from_meminfo.or_else(|| {
        let mut sys = System::new();
        sys.refresh_memory();
        let bytes = sys.total_memory();
        (bytes > 0).then(|| bytes / 1024 / 1024)
    })
}

/// Hardware frequency limits per thread, in MHz.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllowedFrequencies {
    pub min_mhz: BTreeMap<usize, f64>,
    pub max_mhz: BTreeMap<usize, f64>,
}

impl AllowedFrequencies {
    /// Lowest minimum and highest maximum across all threads.
    pub fn overall(&self) -> Option<(f64, f64)> {
        let min = self.min_mhz.values().copied().reduce(f64::min)?;
        let max = self.max_mhz.values().copied().reduce(f64::max)?;
        Some((min, max))
    }
}

pub fn allowed_cpu_frequency(table: &ControlFileTable) -> AllowedFrequencies {
    let mut allowed = AllowedFrequencies::default();
    for thread in 0..table.thread_count {
        let (Some(min_file), Some(max_file)) = (
            table.path(FileRole::CpuinfoMinFreq, thread),
            table.path(FileRole::CpuinfoMaxFreq, thread),
        ) else {
            continue;
        };
        match (read_number::<u64>(min_file), read_number::<u64>(max_file)) {
            (Ok(min), Ok(max)) => {
                allowed.min_mhz.insert(thread, min as f64 / 1000.0);
                allowed.max_mhz.insert(thread, max as f64 / 1000.0);
            }
            (Err(e), _) | (_, Err(e)) => error!("{}", e),
        }
    }
    allowed
}

/// Maximum package power in watts (Intel RAPL only).
pub fn allowed_tdp_watts(table: &ControlFileTable) -> Option<f64> {
    if table.vendor != Vendor::Intel {
        return None;
    }
    let Some(path) = table.max_tdp.as_ref() else {
        warn!("Intel max TDP file not found");
        return None;
    };
    match read_number::<u64>(path) {
        Ok(uw) => Some(uw as f64 / 1_000_000.0),
        Err(e) => {
            error!("{}", e);
            None
        }
    }
}

/// Union of every thread's available governors, sorted.
pub fn available_governors(table: &ControlFileTable) -> Vec<String> {
    let mut governors: Vec<String> = table
        .paths(FileRole::ScalingAvailableGovernors)
        .filter_map(|(_, p)| fs::read_to_string(p).ok())
        .flat_map(|s| s.split_whitespace().map(String::from).collect::<Vec<_>>())
        .collect();
    governors.sort();
    governors.dedup();
    governors
}

const CACHE_LABELS: &[(&str, &str)] = &[
    ("1_Data", "L1 Data"),
    ("1_Instruction", "L1 Instruction"),
    ("2_Unified", "L2 Unified"),
    ("3_Unified", "L3 Unified"),
];

/// Everything shown in the CPU information view.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuInfoReport {
    pub model_name: String,
    pub cache_sizes: Vec<(String, String)>,
    pub total_ram_mb: Option<u64>,
    pub allowed: AllowedFrequencies,
    pub physical_cores: usize,
    pub virtual_cores: usize,
}

impl CpuInfoReport {
    pub fn new(topology: &CpuTopology, allowed: AllowedFrequencies) -> Self {
        let cache_sizes = CACHE_LABELS
            .iter()
            .filter_map(|(key, label)| {
                topology
                    .cache_sizes
                    .get(*key)
                    .map(|size| (label.to_string(), size.clone()))
            })
            .collect();

        Self {
            model_name: topology.model_name.clone(),
            cache_sizes,
            total_ram_mb: topology.total_ram_mb,
            allowed,
            physical_cores: topology.physical_cores,
            virtual_cores: topology.thread_count,
        }
    }

    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![format!("Model Name: {}", self.model_name)];
        for (label, size) in &self.cache_sizes {
            lines.push(format!("{}: {}", label, size));
        }
        lines.push(format!(
            "Total RAM (MB): {}",
            self.total_ram_mb.map_or_else(|| "Unknown".into(), |m| m.to_string())
        ));
        if let Some((min, max)) = self.allowed.overall() {
            lines.push(format!("Min (MHz): {:.0}", min));
            lines.push(format!("Max (MHz): {:.0}", max));
        }
        lines.push(format!("Physical Cores: {}", self.physical_cores));
        lines.push(format!("Virtual Cores (Threads): {}", self.virtual_cores));
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::FakeHost;

    #[test]
    fn test_topology_from_fake_intel() {
        let host = FakeHost::intel(4);
        let table = host.table();
        let topology = CpuTopology::build(&table, &host.roots);

        assert_eq!(topology.vendor, Vendor::Intel);
        assert_eq!(topology.thread_count, 4);
        assert_eq!(topology.physical_cores, 2);
        assert_eq!(topology.model_name, "Intel(R) Core(TM) i7-1260P");
        assert_eq!(topology.total_ram_mb, Some(16303412 / 1024));
    }

    #[test]
    fn test_allowed_values() {
        let host = FakeHost::intel(2);
        let table = host.table();

        let allowed = allowed_cpu_frequency(&table);
        assert_eq!(allowed.min_mhz.get(&1), Some(&400.0));
        assert_eq!(allowed.overall(), Some((400.0, 4700.0)));
        assert_eq!(allowed_tdp_watts(&table), Some(64.0));

        let amd = FakeHost::amd(2);
        assert_eq!(allowed_tdp_watts(&amd.table()), None);
    }

    #[test]
    fn test_available_governors_union() {
        let host = FakeHost::amd(2);
        host.write(
            "sys/devices/system/cpu/cpu1/cpufreq/scaling_available_governors",
            "schedutil performance\n",
        );
        let governors = available_governors(&host.table());
        assert_eq!(governors, vec!["performance", "powersave", "schedutil"]);
    }

    #[test]
    fn test_report_lines() {
        let host = FakeHost::intel(4);
        let table = host.table();
        let topology = CpuTopology::build(&table, &host.roots);
        let report = CpuInfoReport::new(&topology, allowed_cpu_frequency(&table));
        let lines = report.lines();

        assert!(lines.contains(&"L1 Data: 48K".to_string()));
        assert!(lines.contains(&"L2 Unified: 1280K".to_string()));
        assert!(lines.contains(&"Max (MHz): 4700".to_string()));
        assert_eq!(lines.last().unwrap(), "Virtual Cores (Threads): 4");
    }

    #[test]
    fn test_ram_fallback() {
        assert!(read_total_ram_mb(None).is_some());
    }
}
