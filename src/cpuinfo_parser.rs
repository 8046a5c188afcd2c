// src/cpuinfo_parser.rs

use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use log::debug;
use sysinfo::System;

use crate::locator::SysRoots;

pub const UNKNOWN_CPU: &str = "Unknown CPU";

/// Which detection method produced the physical core count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreCountMethod {
    /// `cpu cores` agreed with the per-package core id sets.
    CpuCoresField,
    CoreIdSets,
    ArmClusters,
    ArmSymmetric,
    PackageCount,
    SiblingsRatio,
    HalfOfThreads,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuInfo {
    pub model_name: Option<String>,
    pub processor_count: usize,
    pub physical_cores: usize,
    pub method: CoreCountMethod,
}

/// Fields gathered from every `processor` block.
#[derive(Debug, Default)]
struct Observed {
    model_name: Option<String>,
    processors: usize,
    core_ids: BTreeMap<String, BTreeSet<String>>,
    cpu_cores: BTreeMap<String, usize>,
    any_cpu_cores: Option<usize>,
    siblings: Option<usize>,
    packages: BTreeSet<String>,
    clusters: BTreeMap<String, usize>,
    cpu_parts: BTreeSet<String>,
}

fn split_blocks(text: &str) -> Vec<BTreeMap<String, String>> {
    let mut blocks = Vec::new();
    let mut current = BTreeMap::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            current.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

fn observe(text: &str) -> Observed {
    let mut seen = Observed::default();

    for block in split_blocks(text) {
        if seen.model_name.is_none() {
            seen.model_name = ["model name", "Hardware", "Processor", "cpu model"]
                .iter()
                .find_map(|k| block.get(*k))
                .filter(|v| !v.is_empty())
                .cloned();
        }
        if block.contains_key("processor") {
            seen.processors += 1;
        }

        let package = block.get("physical id").cloned();
        if let Some(p) = &package {
            seen.packages.insert(p.clone());
        }
        let number = |key: &str| block.get(key).and_then(|v| v.parse::<usize>().ok());

        if let Some(cores) = number("cpu cores") {
            seen.any_cpu_cores.get_or_insert(cores);
            if let Some(p) = &package {
                seen.cpu_cores.insert(p.clone(), cores);
            }
        }
        if let Some(siblings) = number("siblings") {
            seen.siblings.get_or_insert(siblings);
        }
        if let (Some(p), Some(core)) = (&package, block.get("core id")) {
            seen.core_ids.entry(p.clone()).or_default().insert(core.clone());
        }
        if let Some(cluster) = block.get("cluster") {
            *seen.clusters.entry(cluster.clone()).or_default() += 1;
        }
        if let Some(part) = block.get("CPU part") {
            seen.cpu_parts.insert(part.clone());
        }
    }
    seen
}

impl Observed {
    fn core_id_total(&self) -> Option<usize> {
        let total: usize = self.core_ids.values().map(BTreeSet::len).sum();
        (total > 0).then_some(total)
    }

    /// Methods in priority order; the first that has its fields wins.
    fn physical_cores(&self, threads: usize) -> (usize, CoreCountMethod) {
        let topology = self.core_id_total();

        if !self.cpu_cores.is_empty() {
            let declared: usize = self.cpu_cores.values().sum();
            if topology == Some(declared) {
                return (declared, CoreCountMethod::CpuCoresField);
            }
            debug!("cpu cores ({}) disagrees with core ids ({:?})", declared, topology);
        }
        if let Some(total) = topology {
            return (total, CoreCountMethod::CoreIdSets);
        }
        if self.clusters.len() > 1 {
            return (self.clusters.values().sum(), CoreCountMethod::ArmClusters);
        }
        if self.cpu_parts.len() == 1 {
            return (threads, CoreCountMethod::ArmSymmetric);
        }
        if let (false, Some(cores)) = (self.packages.is_empty(), self.any_cpu_cores) {
            return (self.packages.len() * cores, CoreCountMethod::PackageCount);
        }
        if let (Some(siblings), Some(cores)) = (self.siblings, self.any_cpu_cores) {
            if cores > 0 && siblings >= cores {
                let per_core = siblings / cores;
                return (threads / per_core, CoreCountMethod::SiblingsRatio);
            }
        }
        (threads / 2, CoreCountMethod::HalfOfThreads)
    }
}

pub struct CpuInfoParser;

impl CpuInfoParser {
    /// Parse `/proc/cpuinfo` text. `thread_count` stands in when the text
    /// has no `processor` entries. Never fails; missing fields only move
    /// detection further down the method list.
    pub fn parse(text: &str, thread_count: usize) -> CpuInfo {
        let seen = observe(text);
        let threads = if seen.processors > 0 { seen.processors } else { thread_count };
        let (cores, method) = seen.physical_cores(threads);
        debug!("Physical cores {} via {:?}", cores, method);

        CpuInfo {
            model_name: seen.model_name,
            processor_count: threads,
            physical_cores: cores.clamp(1, threads.max(1)),
            method,
        }
    }
}

fn read_trimmed(path: &std::path::Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim_matches(|c: char| c == '\0' || c.is_whitespace()).to_string())
        .filter(|s| !s.is_empty())
}

/// Model name from cpuinfo, then device tree, then DMI, then architecture.
pub fn resolve_model_name(parsed: Option<String>, roots: &SysRoots) -> String {
    if let Some(name) = parsed {
        return name;
    }

    let device_tree = [
        roots.proc.join("device-tree/model"),
        roots.sys.join("firmware/devicetree/base/model"),
    ];
    if let Some(model) = device_tree.iter().find_map(|p| read_trimmed(p)) {
        return model;
    }

    let dmi = roots.sys.join("class/dmi/id");
    if let Some(product) = read_trimmed(&dmi.join("product_name")) {
        return match read_trimmed(&dmi.join("product_version")) {
            Some(version) => format!("{} {}", product, version),
            None => product,
        };
    }

    System::cpu_arch()
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| UNKNOWN_CPU.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{FakeHost, INTEL_CPUINFO};

    fn block(fields: &[(&str, String)]) -> String {
        let mut out: String = fields
            .iter()
            .map(|(k, v)| format!("{}\t: {}\n", k, v))
            .collect();
        out.push('\n');
        out
    }

    #[test]
    fn test_x86_hyperthreaded() {
        let info = CpuInfoParser::parse(INTEL_CPUINFO, 4);
        assert_eq!(info.model_name.as_deref(), Some("Intel(R) Core(TM) i7-1260P"));
        assert_eq!(info.processor_count, 4);
        assert_eq!(info.physical_cores, 2);
        assert_eq!(info.method, CoreCountMethod::CpuCoresField);
    }

    #[test]
    fn test_dual_socket_sums_packages() {
        let mut text = String::new();
        for p in 0..2 {
            for c in 0..4 {
                text += &block(&[
                    ("processor", (p * 4 + c).to_string()),
                    ("physical id", p.to_string()),
                    ("core id", c.to_string()),
                    ("cpu cores", "4".into()),
                ]);
            }
        }
        let info = CpuInfoParser::parse(&text, 8);
        assert_eq!(info.physical_cores, 8);
        assert_eq!(info.method, CoreCountMethod::CpuCoresField);
    }

    #[test]
    fn test_cpu_cores_disagreement_uses_core_ids() {
        let mut text = String::new();
        for c in 0..6 {
            text += &block(&[
                ("processor", c.to_string()),
                ("physical id", "0".into()),
                ("core id", c.to_string()),
                ("cpu cores", "4".into()),
            ]);
        }
        let info = CpuInfoParser::parse(&text, 6);
        assert_eq!(info.physical_cores, 6);
        assert_eq!(info.method, CoreCountMethod::CoreIdSets);
    }

    #[test]
    fn test_arm_clusters() {
        let mut text = String::new();
        for i in 0..8 {
            text += &block(&[
                ("processor", i.to_string()),
                ("cluster", if i < 4 { "0" } else { "1" }.into()),
                ("CPU part", if i < 4 { "0xd05" } else { "0xd0d" }.into()),
            ]);
        }
        let info = CpuInfoParser::parse(&text, 8);
        assert_eq!(info.physical_cores, 8);
        assert_eq!(info.method, CoreCountMethod::ArmClusters);
        assert_eq!(info.model_name, None);
    }

    #[test]
    fn test_arm_symmetric() {
        let mut text = String::new();
        for i in 0..4 {
            text += &block(&[("processor", i.to_string()), ("CPU part", "0xd08".into())]);
        }
        text += "Hardware\t: BCM2835\n";
        let info = CpuInfoParser::parse(&text, 4);
        assert_eq!(info.physical_cores, 4);
        assert_eq!(info.method, CoreCountMethod::ArmSymmetric);
        assert_eq!(info.model_name.as_deref(), Some("BCM2835"));
    }

    #[test]
    fn test_package_count_estimate() {
        let mut text = String::new();
        for i in 0..8 {
            text += &block(&[
                ("processor", i.to_string()),
                ("physical id", "0".into()),
                ("cpu cores", "4".into()),
            ]);
        }
        let info = CpuInfoParser::parse(&text, 8);
        assert_eq!(info.physical_cores, 4);
        assert_eq!(info.method, CoreCountMethod::PackageCount);
    }

    #[test]
    fn test_siblings_ratio() {
        let mut text = String::new();
        for i in 0..8 {
            text += &block(&[
                ("processor", i.to_string()),
                ("siblings", "8".into()),
                ("cpu cores", "4".into()),
            ]);
        }
        let info = CpuInfoParser::parse(&text, 8);
        assert_eq!(info.physical_cores, 4);
        assert_eq!(info.method, CoreCountMethod::SiblingsRatio);
    }

    #[test]
    fn test_half_of_threads_fallback() {
        let info = CpuInfoParser::parse("garbage without colons\n", 6);
        assert_eq!(info.processor_count, 6);
        assert_eq!(info.physical_cores, 3);
        assert_eq!(info.method, CoreCountMethod::HalfOfThreads);

        let single = CpuInfoParser::parse("", 1);
        assert_eq!(single.physical_cores, 1);
    }

    #[test]
    fn test_model_name_fallbacks() {
        let host = FakeHost::amd(1);
        assert_eq!(
            resolve_model_name(Some("Ryzen".into()), &host.roots),
            "Ryzen"
        );

        host.write("sys/class/dmi/id/product_name", "ThinkPad X13\n");
        host.write("sys/class/dmi/id/product_version", "Gen 2\n");
        assert_eq!(resolve_model_name(None, &host.roots), "ThinkPad X13 Gen 2");

        host.write("proc/device-tree/model", "Raspberry Pi 4 Model B\0");
        assert_eq!(resolve_model_name(None, &host.roots), "Raspberry Pi 4 Model B");

        host.remove("proc/device-tree");
        host.remove("sys/class/dmi");
        assert!(!resolve_model_name(None, &host.roots).is_empty());
    }
}
