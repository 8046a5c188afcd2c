// src/modules/system_monitor.rs
use std::fmt;
use std::path::Path;

use crate::modules::sampler::SampleSnapshot;
use crate::modules::system_info::CpuInfoReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewType {
    Info,
    Monitor,
}

impl fmt::Display for ViewType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewType::Info => write!(f, "Info"),
            ViewType::Monitor => write!(f, "Monitor"),
        }
    }
}

fn or_unknown<T: fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "Unknown".into(), |v| v.to_string())
}

fn on_off(value: Option<bool>) -> &'static str {
    match value {
        Some(true) => "On",
        Some(false) => "Off",
        None => "Unknown",
    }
}

/// Lays out the CPU report and the latest sample as two text columns.
pub struct SystemMonitor {
    pub view: ViewType,
    pub left: Vec<String>,
    pub right: Vec<String>,
}

impl SystemMonitor {
    pub fn new(view: ViewType) -> Self {
        Self {
            view,
            left: Vec::new(),
            right: Vec::new(),
        }
    }

    pub fn format_cpu_info(&mut self, report: &CpuInfoReport, config_path: Option<&Path>) {
        self.left.clear();
        self.right.clear();

        self.left.push("CPU Information".into());
        self.left.push(String::new());
        self.left.extend(report.lines());

        if let Some(path) = config_path {
            self.left.push(String::new());
            self.left.push(format!("Using settings defined in {}", path.display()));
        }
    }

    /// Refresh both columns; `sample` is skipped in the info view.
    pub fn format_system_info(
        &mut self,
        report: &CpuInfoReport,
        sample: &SampleSnapshot,
        config_path: Option<&Path>,
        interval: f64,
    ) {
        self.format_cpu_info(report, config_path);
        if self.view == ViewType::Info {
            return;
        }

        self.left.push(String::new());
        self.left.push("Thread   Usage     Frequency".into());
        for (thread, mhz) in &sample.frequencies_mhz {
            let usage = sample
                .loads
                .get(thread)
                .map_or_else(|| "  -  ".to_string(), |l| format!("{:>5.1}%", l));
            self.left.push(format!("CPU{:<3}  {}   {:>6.0} MHz", thread, usage, mhz));
        }

        self.right.push("CPU Frequency Scaling".into());
        self.right.push(String::new());
        self.right.push(format!("Governor: {}", or_unknown(sample.governor.as_deref())));
        self.right.push(format!("Boost: {}", on_off(sample.boost)));
        self.right.push(format!(
            "Throttling: {}",
            if sample.throttling { "Yes" } else { "No" }
        ));
        self.right.push(String::new());

        self.right.push("System Statistics".into());
        self.right.push(String::new());
        self.right.push(format!(
            "Total CPU usage: {}",
            or_unknown(sample.total_load.map(|l| format!("{:.1} %", l)))
        ));
        self.right.push(format!(
            "Average thread usage: {}",
            or_unknown(sample.average_load().map(|l| format!("{:.1} %", l)))
        ));
        self.right.push(format!(
            "Average frequency: {}",
            or_unknown(sample.average_frequency_mhz().map(|f| format!("{:.0} MHz", f)))
        ));
        self.right.push(format!(
            "Package temperature: {}",
            sample
                .package_temp_c
                .map_or_else(|| "Unavailable".into(), |t| format!("{:.1} °C", t))
        ));
        self.right.push(String::new());
        self.right.push(format!(
            "Sampled {} (every {:.1} s)",
            sample.taken_at.format("%H:%M:%S"),
            interval
        ));
    }

    pub fn render(&self, width: usize) -> String {
        if self.right.is_empty() {
            return self.left.join("\n");
        }
        let half = (width / 2).saturating_sub(1);
        let rows = self.left.len().max(self.right.len());
        (0..rows)
            .map(|i| {
                let left = self.left.get(i).map(String::as_str).unwrap_or_default();
                let right = self.right.get(i).map(String::as_str).unwrap_or_default();
                format!("{:<half$} │ {}", left, right, half = half)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::FakeHost;
    use crate::modules::sampler::SamplingEngine;
    use crate::modules::system_info::{allowed_cpu_frequency, CpuTopology};
    use std::sync::Arc;

    fn inputs() -> (CpuInfoReport, SampleSnapshot) {
        let host = FakeHost::intel(2);
        let table = host.table();
        let topology = CpuTopology::build(&table, &host.roots);
        let report = CpuInfoReport::new(&topology, allowed_cpu_frequency(&table));
        let mut engine = SamplingEngine::new(Arc::new(table));
        (report, engine.tick())
    }

    #[test]
    fn test_monitor_columns() {
        let (report, sample) = inputs();
        let mut monitor = SystemMonitor::new(ViewType::Monitor);
        monitor.format_system_info(&report, &sample, None, 1.0);

        assert!(monitor.left.iter().any(|l| l.starts_with("CPU0 ") && l.ends_with("2400 MHz")));
        assert!(monitor.right.contains(&"Governor: powersave".to_string()));
        assert!(monitor.right.contains(&"Package temperature: 45.0 °C".to_string()));

        let text = monitor.render(80);
        assert_eq!(text.lines().count(), monitor.left.len().max(monitor.right.len()));
        assert!(text.lines().all(|l| l.contains(" │ ")));
    }

    #[test]
    fn test_info_view_is_single_column() {
        let (report, sample) = inputs();
        let mut monitor = SystemMonitor::new(ViewType::Info);
        monitor.format_system_info(&report, &sample, Some(Path::new("/tmp/config.ini")), 1.0);

        assert!(monitor.right.is_empty());
        assert_eq!(monitor.left.last().unwrap(), "Using settings defined in /tmp/config.ini");
        assert!(!monitor.render(80).contains('│'));
    }

    #[test]
    fn test_render_narrow_width() {
        let (report, sample) = inputs();
        let mut monitor = SystemMonitor::new(ViewType::Monitor);
        monitor.format_system_info(&report, &sample, None, 1.0);
        for width in [0, 1, 2] {
            assert!(monitor.render(width).lines().all(|l| l.contains(" │ ")));
        }
    }
}
