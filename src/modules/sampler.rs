// src/modules/sampler.rs
//
// Per-tick reads of frequency, load, temperature, throttle and governor state.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Local};
use log::error;

use crate::error::SampleError;
use crate::locator::{ControlFileTable, FileRole, Vendor};
use crate::sysfs::{read_number, read_value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    pub fn idle_total(&self) -> u64 {
        self.idle + self.iowait
    }

    fn parse(fields: &[&str]) -> Option<Self> {
        let mut values = [0u64; 8];
        if fields.len() < 4 {
            return None;
        }
        for (slot, field) in values.iter_mut().zip(fields) {
            *slot = field.parse().ok()?;
        }
        let [user, nice, system, idle, iowait, irq, softirq, steal] = values;
        Some(Self { user, nice, system, idle, iowait, irq, softirq, steal })
    }
}

/// Aggregate and per-thread counters from one read of `/proc/stat`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcStat {
    pub aggregate: Option<CpuTimes>,
    pub per_cpu: BTreeMap<usize, CpuTimes>,
}

impl ProcStat {
    pub fn parse(text: &str) -> Self {
        let mut stat = ProcStat::default();
        for line in text.lines() {
            let mut parts = line.split_whitespace();
            let Some(label) = parts.next() else { continue };
            let Some(rest) = label.strip_prefix("cpu") else { continue };
            let fields: Vec<&str> = parts.collect();
            let Some(times) = CpuTimes::parse(&fields) else { continue };

            if rest.is_empty() {
                stat.aggregate = Some(times);
            } else if let Ok(index) = rest.parse::<usize>() {
                stat.per_cpu.insert(index, times);
            }
        }
        stat
    }
}

/// Busy share of the interval between two readings, 0.0 when nothing elapsed.
pub fn load_percentage(prev: &CpuTimes, curr: &CpuTimes) -> f64 {
    let total_diff = curr.total().saturating_sub(prev.total());
    if total_diff == 0 {
        return 0.0;
    }
    let idle_diff = curr.idle_total().saturating_sub(prev.idle_total());
    let busy = total_diff.saturating_sub(idle_diff);
    (100.0 * busy as f64 / total_diff as f64).clamp(0.0, 100.0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleSnapshot {
    pub taken_at: DateTime<Local>,
    pub frequencies_mhz: BTreeMap<usize, f64>,
    pub loads: BTreeMap<usize, f64>,
    pub total_load: Option<f64>,
    pub package_temp_c: Option<f64>,
    pub governor: Option<String>,
    pub boost: Option<bool>,
    pub throttling: bool,
}

impl SampleSnapshot {
    pub fn average_frequency_mhz(&self) -> Option<f64> {
        mean(self.frequencies_mhz.values())
    }

    pub fn average_load(&self) -> Option<f64> {
        mean(self.loads.values())
    }
}

fn mean<'a>(values: impl Iterator<Item = &'a f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

fn parse_boost(value: &str, inverted: bool) -> Option<bool> {
    let enabled = match value {
        "1" => true,
        "0" => false,
        _ => return None,
    };
    Some(enabled != inverted)
}

/// Owns the previous `/proc/stat` and throttle readings. Has no timer of
/// its own; the caller decides when to `tick`.
pub struct SamplingEngine {
    table: Arc<ControlFileTable>,
    prev_stat: Option<ProcStat>,
    prev_throttle: BTreeMap<usize, u64>,
    last: Option<SampleSnapshot>,
}

impl SamplingEngine {
    pub fn new(table: Arc<ControlFileTable>) -> Self {
        let mut engine = Self {
            table,
            prev_stat: None,
            prev_throttle: BTreeMap::new(),
            last: None,
        };
        engine.prev_stat = engine.read_stat();
        engine.prev_throttle = engine.read_throttle_counters();
        engine
    }

    pub fn table(&self) -> &ControlFileTable {
        &self.table
    }

    pub fn last(&self) -> Option<&SampleSnapshot> {
        self.last.as_ref()
    }

    fn read_stat(&self) -> Option<ProcStat> {
        let path = self.table.proc_stat.as_ref()?;
        match read_value(path) {
            Ok(text) => Some(ProcStat::parse(&text)),
            Err(e) => {
                error!("{}", e);
                None
            }
        }
    }

    fn read_throttle_counters(&self) -> BTreeMap<usize, u64> {
        self.table
            .paths(FileRole::PackageThrottleTime)
            .filter_map(|(thread, path)| match read_number::<u64>(path) {
                Ok(v) => Some((thread, v)),
                Err(e) => {
                    error!("{}", e);
                    None
                }
            })
            .collect()
    }

    /// Current frequency per thread in MHz. Threads whose file could not be
    /// read keep their last reported value.
    pub fn read_cpu_speeds(&self) -> BTreeMap<usize, f64> {
        let mut speeds = BTreeMap::new();
        for (thread, path) in self.table.paths(FileRole::ScalingCurFreq) {
            match read_number::<u64>(path) {
                Ok(khz) => {
                    speeds.insert(thread, khz as f64 / 1000.0);
                }
                Err(e) => {
                    error!("{}", e);
                    if let Some(prev) = self.last.as_ref().and_then(|s| s.frequencies_mhz.get(&thread)) {
                        speeds.insert(thread, *prev);
                    }
                }
            }
        }
        speeds
    }

    /// Package temperature in °C; `None` when no sensor was found.
    pub fn read_package_temperature(&self) -> Result<Option<f64>, SampleError> {
        match self.table.package_temp.as_ref() {
            Some(path) => Ok(Some(read_number::<f64>(path)? / 1000.0)),
            None => Ok(None),
        }
    }

    /// Thread 0's governor; all policies are assumed to share it.
    pub fn read_governor(&self) -> Result<Option<String>, SampleError> {
        match self.table.path(FileRole::ScalingGovernor, 0) {
            Some(path) => read_value(path).map(Some),
            None => Ok(None),
        }
    }

    /// Boost state, with intel_pstate's `no_turbo` inverted.
    pub fn read_boost(&self) -> Result<Option<bool>, SampleError> {
        let (path, inverted) = match self.table.vendor {
            Vendor::Intel => match &self.table.intel_boost {
                Some(p) => (p.clone(), true),
                None => return Ok(None),
            },
            Vendor::Other => match self
                .table
                .paths(FileRole::Boost)
                .next()
                .map(|(_, p)| p.to_path_buf())
                .or_else(|| self.table.generic_boost.clone())
            {
                Some(p) => (p, false),
                None => return Ok(None),
            },
        };

        let value = read_value(&path)?;
        match parse_boost(&value, inverted) {
            Some(enabled) => Ok(Some(enabled)),
            None => Err(SampleError::Parse {
                path: path.display().to_string(),
                value,
            }),
        }
    }

    fn keep_last<T: Clone>(
        &self,
        result: Result<Option<T>, SampleError>,
        field: impl Fn(&SampleSnapshot) -> Option<T>,
    ) -> Option<T> {
        match result {
            Ok(value) => value,
            Err(e) => {
                error!("{}", e);
                self.last.as_ref().and_then(field)
            }
        }
    }

    pub fn tick(&mut self) -> SampleSnapshot {
        let mut loads = BTreeMap::new();
        let mut total_load = None;
        let curr_stat = self.read_stat();

        if let (Some(prev), Some(curr)) = (&self.prev_stat, &curr_stat) {
            for (cpu, times) in &curr.per_cpu {
                if let Some(before) = prev.per_cpu.get(cpu) {
                    loads.insert(*cpu, load_percentage(before, times));
                }
            }
            if let (Some(before), Some(now)) = (&prev.aggregate, &curr.aggregate) {
                total_load = Some(load_percentage(before, now));
            }
        }
        if curr_stat.is_some() {
            self.prev_stat = curr_stat;
        }

        let counters = self.read_throttle_counters();
        let throttling = counters.iter().any(|(thread, now)| {
            self.prev_throttle
                .get(thread)
                .map_or(false, |before| now > before)
        });
        for (thread, value) in counters {
            self.prev_throttle.insert(thread, value);
        }

        let snapshot = SampleSnapshot {
            taken_at: Local::now(),
            frequencies_mhz: self.read_cpu_speeds(),
            loads,
            total_load,
            package_temp_c: self.keep_last(self.read_package_temperature(), |s| s.package_temp_c),
            governor: self.keep_last(self.read_governor(), |s| s.governor.clone()),
            boost: self.keep_last(self.read_boost(), |s| s.boost),
            throttling,
        };
        self.last = Some(snapshot.clone());
        snapshot
    }
}
