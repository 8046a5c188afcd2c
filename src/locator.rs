// src/locator.rs
//
// Resolves every CPU control and telemetry file once at startup.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::dir_cache::DirectoryCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vendor {
    Intel,
    /// AMD or any other generic cpufreq layout.
    Other,
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vendor::Intel => write!(f, "Intel"),
            Vendor::Other => write!(f, "Other"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileRole {
    ScalingGovernor,
    ScalingCurFreq,
    ScalingMaxFreq,
    ScalingMinFreq,
    CpuinfoMaxFreq,
    CpuinfoMinFreq,
    ScalingAvailableGovernors,
    Boost,
    PackageThrottleTime,
    EnergyPerfBias,
}

impl FileRole {
    pub const CPUFREQ: [FileRole; 8] = [
        FileRole::ScalingGovernor,
        FileRole::ScalingCurFreq,
        FileRole::ScalingMaxFreq,
        FileRole::ScalingMinFreq,
        FileRole::CpuinfoMaxFreq,
        FileRole::CpuinfoMinFreq,
        FileRole::ScalingAvailableGovernors,
        FileRole::Boost,
    ];

    pub const INTEL_ONLY: [FileRole; 2] = [FileRole::PackageThrottleTime, FileRole::EnergyPerfBias];

    pub fn file_name(self) -> &'static str {
        match self {
            FileRole::ScalingGovernor => "scaling_governor",
            FileRole::ScalingCurFreq => "scaling_cur_freq",
            FileRole::ScalingMaxFreq => "scaling_max_freq",
            FileRole::ScalingMinFreq => "scaling_min_freq",
            FileRole::CpuinfoMaxFreq => "cpuinfo_max_freq",
            FileRole::CpuinfoMinFreq => "cpuinfo_min_freq",
            FileRole::ScalingAvailableGovernors => "scaling_available_governors",
            FileRole::Boost => "boost",
            FileRole::PackageThrottleTime => "package_throttle_total_time_ms",
            FileRole::EnergyPerfBias => "energy_perf_bias",
        }
    }

    /// Directory below `cpu<N>/` holding this file.
    pub fn subdir(self) -> &'static str {
        match self {
            FileRole::PackageThrottleTime => "thermal_throttle",
            FileRole::EnergyPerfBias => "power",
            _ => "cpufreq",
        }
    }
}

/// Absolute paths of every resolved control file. Built once, then only read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlFileTable {
    pub vendor: Vendor,
    pub thread_count: usize,
    pub cpu_directory: Option<PathBuf>,
    pub per_thread: BTreeMap<FileRole, BTreeMap<usize, PathBuf>>,
    /// intel_pstate/no_turbo, "0" means boost enabled.
    pub intel_boost: Option<PathBuf>,
    /// cpufreq/boost shared by all policies on generic drivers.
    pub generic_boost: Option<PathBuf>,
    pub tdp: Option<PathBuf>,
    pub max_tdp: Option<PathBuf>,
    pub package_temp: Option<PathBuf>,
    pub proc_stat: Option<PathBuf>,
    pub proc_cpuinfo: Option<PathBuf>,
    pub proc_meminfo: Option<PathBuf>,
    /// Size strings keyed `"<level>_<type>"`, e.g. `"2_Unified" -> "1024K"`.
    pub cache_sizes: BTreeMap<String, String>,
}

impl ControlFileTable {
    /// Table with every capability absent.
    pub fn empty(thread_count: usize) -> Self {
        Self {
            vendor: Vendor::Other,
            thread_count,
            cpu_directory: None,
            per_thread: BTreeMap::new(),
            intel_boost: None,
            generic_boost: None,
            tdp: None,
            max_tdp: None,
            package_temp: None,
            proc_stat: None,
            proc_cpuinfo: None,
            proc_meminfo: None,
            cache_sizes: BTreeMap::new(),
        }
    }

    pub fn path(&self, role: FileRole, thread: usize) -> Option<&Path> {
        self.per_thread
            .get(&role)
            .and_then(|m| m.get(&thread))
            .map(PathBuf::as_path)
    }

    /// Resolved `(thread, path)` pairs for a role, in thread order.
    pub fn paths(&self, role: FileRole) -> impl Iterator<Item = (usize, &Path)> + '_ {
        self.per_thread
            .get(&role)
            .into_iter()
            .flat_map(|m| m.iter().map(|(t, p)| (*t, p.as_path())))
    }

    pub fn has(&self, role: FileRole) -> bool {
        self.per_thread.get(&role).map_or(false, |m| !m.is_empty())
    }

    pub fn is_degraded(&self) -> bool {
        self.cpu_directory.is_none()
    }

    /// Check the paths a replayed table cannot work without.
    pub fn validate(&self, expected_threads: usize) -> Result<(), String> {
        let exists = |p: &Option<PathBuf>| p.as_deref().map_or(false, Path::exists);

        if !exists(&self.cpu_directory) {
            return Err("CPU directory missing".into());
        }
        if self.thread_count != expected_threads {
            return Err(format!(
                "thread count changed ({} -> {})",
                self.thread_count, expected_threads
            ));
        }
        if !self.paths(FileRole::ScalingMaxFreq).any(|(_, p)| p.exists()) {
            return Err("no scaling_max_freq file".into());
        }
        if !exists(&self.proc_stat) {
            return Err("/proc/stat path missing".into());
        }
        if !exists(&self.package_temp) {
            return Err("thermal sensor path missing".into());
        }
        Ok(())
    }
}

/// Filesystem roots, injectable so discovery can run against a fake host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysRoots {
    pub sys: PathBuf,
    pub proc: PathBuf,
}

impl Default for SysRoots {
    fn default() -> Self {
        Self {
            sys: PathBuf::from("/sys"),
            proc: PathBuf::from("/proc"),
        }
    }
}

/// Number of `cpuN` entries the kernel exposes, online or not and whatever
/// this process's affinity. `None` when the cpu directory is not at its
/// usual place.
pub fn count_logical_threads(roots: &SysRoots) -> Option<usize> {
    let entries = fs::read_dir(roots.sys.join("devices/system/cpu")).ok()?;
    let count = entries
        .flatten()
        .filter(|e| is_thread_dir_name(&e.file_name().to_string_lossy()))
        .count();
    (count > 0).then_some(count)
}

fn is_thread_dir_name(name: &str) -> bool {
    name.strip_prefix("cpu")
        .map_or(false, |n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

pub struct CpuFileLocator {
    roots: SysRoots,
    cache: DirectoryCache,
    thread_count: usize,
    replayed: bool,
}

impl CpuFileLocator {
    pub fn new(roots: SysRoots, cache: DirectoryCache, thread_count: usize) -> Self {
        Self {
            roots,
            cache,
            thread_count,
            replayed: false,
        }
    }

    /// Whether the last `discover` call reused the persisted table.
    pub fn replayed(&self) -> bool {
        self.replayed
    }

    pub fn cache(&self) -> &DirectoryCache {
        &self.cache
    }

    /// Replay the persisted table when it still validates, otherwise scan.
    pub fn discover(&mut self) -> ControlFileTable {
        self.replayed = false;

        if let Some(file) = self.cache.load() {
            if let Some(table) = file.resolved {
                match table.validate(self.thread_count) {
                    Ok(()) => {
                        info!("Using cached CPU file table ({} CPU)", table.vendor);
                        self.replayed = true;
                        return table;
                    }
                    Err(reason) => warn!("Discovery cache is stale ({}), rescanning", reason),
                }
            }
            // listings from a stale cache may be stale too
            self.cache.clear();
        }

        let table = self.scan();
        if table.is_degraded() {
            warn!("No CPU frequency directory found, CPU controls are unavailable");
        } else if let Err(e) = self.cache.save(Some(&table)) {
            warn!("Could not persist discovery cache: {:#}", e);
        }
        table
    }

    /// Full discovery, ignoring anything persisted.
    pub fn scan(&mut self) -> ControlFileTable {
        let mut table = ControlFileTable::empty(self.thread_count);

        let Some((cpu_dir, vendor)) = self.find_cpu_directory() else {
            return table;
        };
        info!("Found {} CPU directory at {}", vendor, cpu_dir.display());
        table.vendor = vendor;

        self.resolve_thread_files(&cpu_dir, &mut table);

        match vendor {
            Vendor::Intel => {
                table.intel_boost = self.cache.find_file(&cpu_dir.join("intel_pstate"), "no_turbo");
                if table.intel_boost.is_none() {
                    warn!("intel_pstate/no_turbo not found, boost control unavailable");
                }
                if let Some((tdp, max_tdp)) = self.find_rapl() {
                    table.tdp = Some(tdp);
                    table.max_tdp = max_tdp;
                } else {
                    info!("No RAPL package domain found, TDP control unavailable");
                }
            }
            Vendor::Other => {
                table.generic_boost = self.cache.find_file(&cpu_dir.join("cpufreq"), "boost");
            }
        }

        let proc_root = self.roots.proc.clone();
        table.proc_stat = self.cache.find_file(&proc_root, "stat");
        table.proc_cpuinfo = self.cache.find_file(&proc_root, "cpuinfo");
        table.proc_meminfo = self.cache.find_file(&proc_root, "meminfo");
        for (name, path) in [
            ("stat", &table.proc_stat),
            ("cpuinfo", &table.proc_cpuinfo),
            ("meminfo", &table.proc_meminfo),
        ] {
            if path.is_none() {
                warn!("{}/{} not found", proc_root.display(), name);
            }
        }

        table.package_temp = self.find_package_temp(vendor);
        if table.package_temp.is_none() {
            warn!("No temperature sensor found");
        }

        table.cache_sizes = self.read_cache_sizes(&cpu_dir);
        table.cpu_directory = Some(cpu_dir);
        table
    }

    fn is_cpu_directory(subdirs: &[String]) -> Option<Vendor> {
        let has = |name: &str| subdirs.iter().any(|d| d == name);
        if !has("cpu0") {
            return None;
        }
        if has("intel_pstate") {
            Some(Vendor::Intel)
        } else if has("cpufreq") {
            Some(Vendor::Other)
        } else {
            None
        }
    }

    /// The usual location is checked first; otherwise the first matching
    /// directory in walk order wins.
    fn find_cpu_directory(&mut self) -> Option<(PathBuf, Vendor)> {
        let usual = self.roots.sys.join("devices/system/cpu");
        if let Some(vendor) = self
            .cache
            .entry(&usual)
            .and_then(|e| Self::is_cpu_directory(&e.subdirs))
        {
            return Some((usual, vendor));
        }

        let sys = self.roots.sys.clone();
        self.cache
            .walk(&sys)
            .find_map(|(path, subdirs, _)| Self::is_cpu_directory(&subdirs).map(|v| (path, v)))
    }

    fn resolve_thread_files(&mut self, cpu_dir: &Path, table: &mut ControlFileTable) {
        let mut roles: Vec<FileRole> = FileRole::CPUFREQ.to_vec();
        if table.vendor == Vendor::Intel {
            roles.extend(FileRole::INTEL_ONLY);
        }

        for role in roles {
            let mut found = BTreeMap::new();
            let mut missing = Vec::new();

            for thread in 0..self.thread_count {
                let dir = cpu_dir.join(format!("cpu{}", thread)).join(role.subdir());
                match self.cache.find_file(&dir, role.file_name()) {
                    Some(path) => {
                        found.insert(thread, path);
                    }
                    None => missing.push(thread),
                }
            }

            // intel_pstate has a single global no_turbo instead
            let expected_absent = role == FileRole::Boost && table.vendor == Vendor::Intel;
            if !missing.is_empty() && !expected_absent {
                warn!("{} not found for threads {:?}", role.file_name(), missing);
            }
            if !found.is_empty() {
                table.per_thread.insert(role, found);
            }
        }
    }

    fn find_package_temp(&mut self, vendor: Vendor) -> Option<PathBuf> {
        let keywords: &[&str] = match vendor {
            Vendor::Intel => &["package", "cpu"],
            Vendor::Other => &["tctl"],
        };

        let mut k10temp: Option<PathBuf> = None;
        let mut first: Option<PathBuf> = None;

        for root in [self.roots.sys.join("class"), self.roots.sys.join("devices")] {
            for (dir, _, files) in self.cache.walk(&root) {
                let inputs = files
                    .iter()
                    .filter(|f| f.starts_with("temp") && f.ends_with("_input"));

                for input in inputs {
                    let label = input.replace("_input", "_label");
                    if files.contains(&label) {
                        let text = fs::read_to_string(dir.join(&label))
                            .unwrap_or_default()
                            .to_lowercase();
                        if keywords.iter().any(|k| text.contains(k)) {
                            debug!("Thermal sensor {} ({})", dir.join(input).display(), text.trim());
                            return Some(dir.join(input));
                        }
                    }

                    if k10temp.is_none() && is_k10temp_dir(&dir, &files) {
                        k10temp = Some(dir.join(input));
                    }
                    if first.is_none() {
                        first = Some(dir.join(input));
                    }
                }
            }
        }

        if k10temp.is_some() {
            return k10temp;
        }
        if let Some(path) = &first {
            warn!("No labelled package sensor, falling back to {}", path.display());
        }
        first
    }

    /// `constraint_0_power_limit_uw` and `constraint_0_max_power_uw` of package domain 0.
    fn find_rapl(&mut self) -> Option<(PathBuf, Option<PathBuf>)> {
        for root in [self.roots.sys.join("class/powercap"), self.roots.sys.join("devices")] {
            let hit = self.cache.walk(&root).find(|(dir, _, files)| {
                dir.file_name().map_or(false, |n| n == "intel-rapl:0")
                    && files.iter().any(|f| f == "constraint_0_power_limit_uw")
            });
            if let Some((dir, _, files)) = hit {
                let max = files
                    .iter()
                    .any(|f| f == "constraint_0_max_power_uw")
                    .then(|| dir.join("constraint_0_max_power_uw"));
                return Some((dir.join("constraint_0_power_limit_uw"), max));
            }
        }
        None
    }

    fn read_cache_sizes(&mut self, cpu_dir: &Path) -> BTreeMap<String, String> {
        let cache_dir = cpu_dir.join("cpu0/cache");
        let mut sizes = BTreeMap::new();
        let indexes: Vec<String> = match self.cache.entry(&cache_dir) {
            Some(entry) => entry
                .subdirs
                .iter()
                .filter(|d| d.starts_with("index"))
                .cloned()
                .collect(),
            None => return sizes,
        };

        for index in indexes {
            let dir = cache_dir.join(&index);
            let read = |name: &str| {
                fs::read_to_string(dir.join(name))
                    .ok()
                    .map(|s| s.trim().to_string())
            };
            match (read("level"), read("type"), read("size")) {
                (Some(level), Some(kind), Some(size)) => {
                    sizes.insert(format!("{}_{}", level, kind), size);
                }
                _ => debug!("Incomplete cache description in {}", dir.display()),
            }
        }
        sizes
    }
}

fn is_k10temp_dir(dir: &Path, files: &[String]) -> bool {
    if dir.to_string_lossy().contains("k10temp") {
        return true;
    }
    files.iter().any(|f| f == "name")
        && fs::read_to_string(dir.join("name")).map_or(false, |n| n.trim() == "k10temp")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dir_cache::CacheFile;
    use crate::fixtures::FakeHost;

    #[test]
    fn test_intel_discovery() {
        let host = FakeHost::intel(4);
        let table = host.table();

        assert_eq!(table.vendor, Vendor::Intel);
        assert_eq!(table.cpu_directory.as_deref(), Some(host.cpu_dir().as_path()));
        assert_eq!(table.paths(FileRole::ScalingMaxFreq).count(), 4);
        assert!(!table.has(FileRole::Boost));
        assert!(table.has(FileRole::EnergyPerfBias));
        assert!(table.has(FileRole::PackageThrottleTime));
        assert_eq!(
            table.intel_boost.as_deref(),
            Some(host.cpu_dir().join("intel_pstate/no_turbo").as_path())
        );
        assert!(table.tdp.as_ref().unwrap().ends_with("intel-rapl:0/constraint_0_power_limit_uw"));
        assert!(table.max_tdp.is_some());
        assert!(table.package_temp.as_ref().unwrap().ends_with("hwmon1/temp1_input"));
        assert_eq!(table.cache_sizes.get("1_Data").map(String::as_str), Some("48K"));
        assert_eq!(table.cache_sizes.get("3_Unified").map(String::as_str), Some("24576K"));
        assert!(table.proc_stat.is_some() && table.proc_meminfo.is_some());
        assert!(table.validate(4).is_ok());
    }

    #[test]
    fn test_amd_discovery() {
        let host = FakeHost::amd(2);
        let table = host.table();

        assert_eq!(table.vendor, Vendor::Other);
        assert_eq!(table.paths(FileRole::Boost).count(), 2);
        assert!(!table.has(FileRole::EnergyPerfBias));
        assert!(table.tdp.is_none());
        assert!(table.intel_boost.is_none());
        assert!(table.package_temp.as_ref().unwrap().ends_with("hwmon2/temp1_input"));
    }

    #[test]
    fn test_k10temp_fallback_without_label() {
        let host = FakeHost::amd(2);
        host.remove("sys/class/hwmon/hwmon2/temp1_label");
        let table = host.table();
        assert!(table.package_temp.as_ref().unwrap().ends_with("hwmon2/temp1_input"));
    }

    #[test]
    fn test_first_sensor_last_resort() {
        let host = FakeHost::amd(2);
        host.remove("sys/class/hwmon/hwmon2");
        let table = host.table();
        assert!(table.package_temp.as_ref().unwrap().ends_with("hwmon0/temp1_input"));
    }

    #[test]
    fn test_missing_cpu_directory_is_degraded() {
        let host = FakeHost::intel(2);
        host.remove("sys/devices/system/cpu");
        let table = host.table();
        assert!(table.is_degraded());
        assert!(table.per_thread.is_empty());
        assert!(table.validate(2).is_err());
    }

    #[test]
    fn test_count_logical_threads() {
        let host = FakeHost::amd(3);
        host.write("sys/devices/system/cpu/cpuidle/current_driver", "intel_idle\n");
        host.write("sys/devices/system/cpu/cpu12x/uevent", "");
        assert_eq!(count_logical_threads(&host.roots), Some(3));

        host.rename("sys/devices/system/cpu", "sys/devices/platform/cpus");
        assert_eq!(count_logical_threads(&host.roots), None);
    }

    #[test]
    fn test_walk_finds_relocated_cpu_directory() {
        let host = FakeHost::amd(2);
        host.rename("sys/devices/system/cpu", "sys/devices/platform/cpus");
        let table = host.table();
        assert!(table.cpu_directory.unwrap().ends_with("platform/cpus"));
    }

    #[test]
    fn test_cached_table_is_replayed() {
        let host = FakeHost::intel(2);
        let cache_file = host.path("cache/directory_cache.json");

        let mut first = CpuFileLocator::new(
            host.roots.clone(),
            DirectoryCache::with_file(cache_file.clone()),
            2,
        );
        let table = first.discover();
        assert!(!first.replayed());
        assert!(cache_file.exists());

        let mut second =
            CpuFileLocator::new(host.roots.clone(), DirectoryCache::with_file(cache_file), 2);
        assert_eq!(second.discover(), table);
        assert!(second.replayed());
    }

    #[test]
    fn test_stale_proc_stat_triggers_rescan() {
        let host = FakeHost::intel(2);
        let cache_file = host.path("cache/directory_cache.json");
        CpuFileLocator::new(
            host.roots.clone(),
            DirectoryCache::with_file(cache_file.clone()),
            2,
        )
        .discover();

        let mut file: CacheFile =
            serde_json::from_str(&fs::read_to_string(&cache_file).unwrap()).unwrap();
        file.resolved.as_mut().unwrap().proc_stat = Some(host.path("proc/gone/stat"));
        fs::write(&cache_file, serde_json::to_string(&file).unwrap()).unwrap();

        let mut locator =
            CpuFileLocator::new(host.roots.clone(), DirectoryCache::with_file(cache_file), 2);
        let table = locator.discover();
        assert!(!locator.replayed());
        assert_eq!(table.proc_stat, Some(host.path("proc/stat")));
    }

    #[test]
    fn test_thread_count_change_invalidates() {
        let host = FakeHost::intel(2);
        let table = host.table();
        assert!(table.validate(2).is_ok());
        assert!(table.validate(8).is_err());
    }

    #[test]
    fn test_table_json_shape() {
        let host = FakeHost::intel(1);
        let json = serde_json::to_value(host.table()).unwrap();
        assert!(json["per_thread"]["scaling_max_freq"]["0"].is_string());
    }
}
