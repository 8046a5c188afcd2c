// src/fixtures.rs
//
// Synthetic /sys and /proc trees for tests.

use std::fs;
use std::path::PathBuf;

use tempfile::TempDir;

use crate::dir_cache::DirectoryCache;
use crate::locator::{count_logical_threads, ControlFileTable, CpuFileLocator, SysRoots};

pub const PROC_STAT: &str = "cpu  100 0 100 800 0 0 0 0 0 0
cpu0 50 0 50 400 0 0 0 0 0 0
cpu1 50 0 50 400 0 0 0 0 0 0
intr 12345
ctxt 6789
";

pub const INTEL_CPUINFO: &str = "processor\t: 0
vendor_id\t: GenuineIntel
model name\t: Intel(R) Core(TM) i7-1260P
physical id\t: 0
siblings\t: 4
core id\t: 0
cpu cores\t: 2

processor\t: 1
vendor_id\t: GenuineIntel
model name\t: Intel(R) Core(TM) i7-1260P
physical id\t: 0
siblings\t: 4
core id\t: 0
cpu cores\t: 2

processor\t: 2
vendor_id\t: GenuineIntel
model name\t: Intel(R) Core(TM) i7-1260P
physical id\t: 0
siblings\t: 4
core id\t: 1
cpu cores\t: 2

processor\t: 3
vendor_id\t: GenuineIntel
model name\t: Intel(R) Core(TM) i7-1260P
physical id\t: 0
siblings\t: 4
core id\t: 1
cpu cores\t: 2
";

pub const MEMINFO: &str = "MemTotal:       16303412 kB
MemFree:         8123456 kB
MemAvailable:   12000000 kB
";

pub struct FakeHost {
    pub dir: TempDir,
    pub roots: SysRoots,
}

impl FakeHost {
    fn base() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let roots = SysRoots {
            sys: dir.path().join("sys"),
            proc: dir.path().join("proc"),
        };
        let host = Self { dir, roots };
        host.write("proc/stat", PROC_STAT);
        host.write("proc/cpuinfo", INTEL_CPUINFO);
        host.write("proc/meminfo", MEMINFO);
        host.write("sys/class/hwmon/hwmon0/name", "acpitz\n");
        host.write("sys/class/hwmon/hwmon0/temp1_input", "30000\n");
        host
    }

    fn cpufreq_thread(&self, thread: usize) {
        let dir = format!("sys/devices/system/cpu/cpu{}/cpufreq", thread);
        let files = [
            ("scaling_governor", "powersave\n"),
            ("scaling_cur_freq", "2400000\n"),
            ("scaling_max_freq", "4700000\n"),
            ("scaling_min_freq", "400000\n"),
            ("cpuinfo_max_freq", "4700000\n"),
            ("cpuinfo_min_freq", "400000\n"),
            ("scaling_available_governors", "performance powersave\n"),
        ];
        for (name, value) in files {
            self.write(&format!("{}/{}", dir, name), value);
        }
    }

    pub fn intel(threads: usize) -> Self {
        let host = Self::base();
        host.write("sys/devices/system/cpu/intel_pstate/no_turbo", "0\n");
        for t in 0..threads {
            host.cpufreq_thread(t);
            let cpu = format!("sys/devices/system/cpu/cpu{}", t);
            host.write(&format!("{}/thermal_throttle/package_throttle_total_time_ms", cpu), "0\n");
            host.write(&format!("{}/power/energy_perf_bias", cpu), "6\n");
        }
        for (index, level, kind, size) in [
            (0, 1, "Data", "48K"),
            (1, 1, "Instruction", "32K"),
            (2, 2, "Unified", "1280K"),
            (3, 3, "Unified", "24576K"),
        ] {
            let dir = format!("sys/devices/system/cpu/cpu0/cache/index{}", index);
            host.write(&format!("{}/level", dir), &format!("{}\n", level));
            host.write(&format!("{}/type", dir), &format!("{}\n", kind));
            host.write(&format!("{}/size", dir), &format!("{}\n", size));
        }
        host.write("sys/class/hwmon/hwmon1/name", "coretemp\n");
        host.write("sys/class/hwmon/hwmon1/temp1_input", "45000\n");
        host.write("sys/class/hwmon/hwmon1/temp1_label", "Package id 0\n");
        host.write("sys/class/powercap/intel-rapl:0/constraint_0_power_limit_uw", "28000000\n");
        host.write("sys/class/powercap/intel-rapl:0/constraint_0_max_power_uw", "64000000\n");
        host.write("sys/class/powercap/intel-rapl:0:0/constraint_0_power_limit_uw", "0\n");
        host
    }

    pub fn amd(threads: usize) -> Self {
        let host = Self::base();
        for t in 0..threads {
            host.cpufreq_thread(t);
            host.write(&format!("sys/devices/system/cpu/cpu{}/cpufreq/boost", t), "1\n");
        }
        host.write("sys/devices/system/cpu/cpufreq/boost", "1\n");
        host.write("sys/class/hwmon/hwmon1/name", "nvme\n");
        host.write("sys/class/hwmon/hwmon1/temp1_input", "38000\n");
        host.write("sys/class/hwmon/hwmon1/temp1_label", "Composite\n");
        host.write("sys/class/hwmon/hwmon2/name", "k10temp\n");
        host.write("sys/class/hwmon/hwmon2/temp1_input", "52125\n");
        host.write("sys/class/hwmon/hwmon2/temp1_label", "Tctl\n");
        host
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn cpu_dir(&self) -> PathBuf {
        self.roots.sys.join("devices/system/cpu")
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.path(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    pub fn remove(&self, rel: &str) {
        let path = self.path(rel);
        if path.is_dir() {
            fs::remove_dir_all(path).unwrap();
        } else {
            fs::remove_file(path).unwrap();
        }
    }

    pub fn rename(&self, from: &str, to: &str) {
        let to = self.path(to);
        fs::create_dir_all(to.parent().unwrap()).unwrap();
        fs::rename(self.path(from), to).unwrap();
    }

    /// Discovery against this host with an in-memory cache.
    pub fn table(&self) -> ControlFileTable {
        let threads = count_logical_threads(&self.roots).unwrap_or(2);
        CpuFileLocator::new(self.roots.clone(), DirectoryCache::new(), threads).scan()
    }
}
