// src/globals.rs

use std::path::Path;
use std::process::{Command, Stdio};

pub const ALL_GOVERNORS: &[&str] = &[
    "conservative",
    "ondemand",
    "performance",
    "powersave",
    "schedutil",
    "userspace",
];

/// Allowed energy_perf_bias hints, with the labels shown to users.
pub const EPB_OPTIONS: &[(u8, &str)] = &[
    (0, "Performance"),
    (4, "Balance-Performance"),
    (6, "Normal"),
    (8, "Balance-Power"),
    (15, "Power"),
];

pub const MAX_FREQUENCY_MHZ: u32 = 6000;

pub const UPDATE_INTERVAL_MIN: f64 = 0.1;
pub const UPDATE_INTERVAL_MAX: f64 = 20.0;
pub const UPDATE_INTERVAL_DEFAULT: f64 = 1.0;

// ============================================================================
// AMD ryzen_smu driver interface
// ============================================================================
/// Driver directory, relative to the sysfs root.
pub const RYZEN_SMU_SUBDIR: &str = "kernel/ryzen_smu_drv";
pub const SMU_ARGS_FILE: &str = "smu_args";
pub const SMU_MP1_CMD_FILE: &str = "mp1_smu_cmd";
pub const SMU_RSMU_CMD_FILE: &str = "rsmu_cmd";

/// MP1 opcode that applies a per-core curve optimizer offset.
pub const SMU_PBO_OPCODE: u8 = 0x35;
/// RSMU opcode that sets the package power limit.
pub const SMU_TDP_OPCODE: u8 = 0x53;
/// The SMU argument block is six 32-bit little-endian words.
pub const SMU_ARGS_LEN: usize = 24;

// ============================================================================
// Transient and installed file locations
// ============================================================================
pub const APP_NAME: &str = "ClockSpeeds";
pub const SETTINGS_FILE: &str = "/tmp/clockspeeds_settings.json";
pub const SCRIPT_STAGING_PATH: &str = "/tmp/apply_clockspeeds_settings.sh";
pub const SCRIPT_INSTALL_PATH: &str = "/usr/local/bin/apply_clockspeeds_settings.sh";
pub const SERVICE_NAME: &str = "clockspeeds.service";
pub const SERVICE_STAGING_PATH: &str = "/tmp/clockspeeds.service";
pub const SERVICE_INSTALL_PATH: &str = "/etc/systemd/system/clockspeeds.service";

// Check if a command exists
pub fn does_command_exist(cmd: &str) -> bool {
    Command::new("which")
        .arg(cmd)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

lazy_static::lazy_static! {
    pub static ref PKEXEC_EXISTS: bool = does_command_exist("pkexec");
    pub static ref SYSTEMCTL_EXISTS: bool = does_command_exist("systemctl");
}

pub fn is_valid_governor(name: &str) -> bool {
    ALL_GOVERNORS.contains(&name)
}

pub fn is_valid_epb(value: u8) -> bool {
    EPB_OPTIONS.iter().any(|(v, _)| *v == value)
}

/// Drop-down style label for an EPB value, e.g. `"6 Normal"`.
pub fn epb_label(value: u8) -> Option<String> {
    EPB_OPTIONS
        .iter()
        .find(|(v, _)| *v == value)
        .map(|(v, name)| format!("{} {}", v, name))
}

/// Whether the ryzen_smu driver exposes the files needed for PBO and TDP writes.
pub fn smu_driver_present(dir: &Path) -> bool {
    [SMU_ARGS_FILE, SMU_MP1_CMD_FILE, SMU_RSMU_CMD_FILE]
        .iter()
        .all(|f| dir.join(f).exists())
}
