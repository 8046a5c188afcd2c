// src/commands.rs
//
// Turns a control intent into the shell commands that perform it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::ScaleRange;
use crate::error::ControlError;
use crate::globals::{
    is_valid_epb, is_valid_governor, MAX_FREQUENCY_MHZ, SMU_ARGS_FILE, SMU_ARGS_LEN,
    SMU_MP1_CMD_FILE, SMU_PBO_OPCODE, SMU_RSMU_CMD_FILE, SMU_TDP_OPCODE,
};
use crate::locator::{ControlFileTable, FileRole, Vendor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ActionKind {
    FrequencyLimits,
    Governor,
    Boost,
    Tdp,
    PboOffset,
    EnergyPerfBias,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::FrequencyLimits => "frequency limits",
            ActionKind::Governor => "governor",
            ActionKind::Boost => "boost",
            ActionKind::Tdp => "TDP",
            ActionKind::PboOffset => "PBO offset",
            ActionKind::EnergyPerfBias => "energy/performance bias",
        };
        write!(f, "{}", name)
    }
}

/// Requested limits for one thread, in MHz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrequencyLimit {
    pub min_mhz: i64,
    pub max_mhz: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PendingAction {
    /// Limits for each selected thread.
    FrequencyLimits(BTreeMap<usize, FrequencyLimit>),
    Governor(String),
    Boost(bool),
    Tdp { watts: f64 },
    /// Positive magnitude; applied as a negative curve offset.
    PboOffset(i64),
    EnergyPerfBias(u8),
}

impl PendingAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            PendingAction::FrequencyLimits(_) => ActionKind::FrequencyLimits,
            PendingAction::Governor(_) => ActionKind::Governor,
            PendingAction::Boost(_) => ActionKind::Boost,
            PendingAction::Tdp { .. } => ActionKind::Tdp,
            PendingAction::PboOffset(_) => ActionKind::PboOffset,
            PendingAction::EnergyPerfBias(_) => ActionKind::EnergyPerfBias,
        }
    }

    /// Same limits for every listed thread.
    pub fn uniform_limits(threads: impl IntoIterator<Item = usize>, min_mhz: i64, max_mhz: i64) -> Self {
        PendingAction::FrequencyLimits(
            threads
                .into_iter()
                .map(|t| (t, FrequencyLimit { min_mhz, max_mhz }))
                .collect(),
        )
    }
}

/// Validation bounds that come from configuration or hardware.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    pub tdp_watts: ScaleRange,
    pub pbo: ScaleRange,
    /// RAPL maximum package power, when known.
    pub max_tdp_watts: Option<f64>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            tdp_watts: ScaleRange { min: 1, max: 400 },
            pbo: ScaleRange { min: 0, max: 30 },
            max_tdp_watts: None,
        }
    }
}

/// Ordered commands for one action. Run as a single `&&` chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPlan {
    pub kind: ActionKind,
    pub commands: Vec<String>,
}

impl CommandPlan {
    pub fn joined(&self) -> String {
        self.commands.join(" && ")
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

// ============================================================================
// AMD SMU encodings
// ============================================================================

/// Negate the magnitude and encode it as 16-bit two's complement.
pub fn encode_pbo_offset(magnitude: i64) -> u32 {
    let value = -magnitude;
    let encoded = if value < 0 { value + 65536 } else { value };
    (encoded & 0xFFFF) as u32
}

/// Core selector placed in the upper bits of the SMU argument.
pub fn smu_core_mask(core_id: u32) -> u32 {
    (((core_id & 8) << 5) | (core_id & 7)) << 20
}

pub fn smu_pbo_args(core_id: u32, magnitude: i64) -> u32 {
    smu_core_mask(core_id) | encode_pbo_offset(magnitude)
}

/// Pack up to six 32-bit arguments little-endian into the SMU argument block.
pub fn encode_smu_args(args: &[u32]) -> [u8; SMU_ARGS_LEN] {
    let mut block = [0u8; SMU_ARGS_LEN];
    for (chunk, arg) in block.chunks_exact_mut(4).zip(args) {
        chunk.copy_from_slice(&arg.to_le_bytes());
    }
    block
}

/// Octal escapes understood by every POSIX `printf`.
pub fn printf_escape(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("\\{:03o}", b)).collect()
}

fn echo_tee(value: impl fmt::Display, path: &Path) -> String {
    format!("echo {} | tee {} > /dev/null", value, path.display())
}

fn printf_tee(bytes: &[u8], path: &Path) -> String {
    format!("printf '{}' | tee {} > /dev/null", printf_escape(bytes), path.display())
}

pub struct CommandBuilder<'a> {
    table: &'a ControlFileTable,
    physical_cores: usize,
    smu_dir: Option<PathBuf>,
    limits: Limits,
}

impl<'a> CommandBuilder<'a> {
    /// `smu_dir` is the ryzen_smu driver directory, when it was detected.
    pub fn new(
        table: &'a ControlFileTable,
        physical_cores: usize,
        smu_dir: Option<PathBuf>,
        limits: Limits,
    ) -> Self {
        Self {
            table,
            physical_cores,
            smu_dir,
            limits,
        }
    }

    pub fn vendor(&self) -> Vendor {
        self.table.vendor
    }

    /// Validate `action` and build its commands. Validation failures and
    /// missing capabilities are reported as distinct errors; a successful
    /// plan is never empty.
    pub fn build(&self, action: &PendingAction) -> Result<CommandPlan, ControlError> {
        let commands = match action {
            PendingAction::FrequencyLimits(limits) => self.frequency_commands(limits)?,
            PendingAction::Governor(name) => self.governor_commands(name)?,
            PendingAction::Boost(enabled) => self.boost_commands(*enabled)?,
            PendingAction::Tdp { watts } => self.tdp_commands(*watts)?,
            PendingAction::PboOffset(magnitude) => self.pbo_commands(*magnitude)?,
            PendingAction::EnergyPerfBias(value) => self.epb_commands(*value)?,
        };
        Ok(CommandPlan {
            kind: action.kind(),
            commands,
        })
    }

    fn per_thread(&self, role: FileRole, value: impl fmt::Display) -> Result<Vec<String>, ControlError> {
        let commands: Vec<String> = self
            .table
            .paths(role)
            .map(|(_, path)| echo_tee(&value, path))
            .collect();
        if commands.is_empty() {
            return Err(ControlError::NotSupported(format!("no {} files", role.file_name())));
        }
        Ok(commands)
    }

    fn frequency_commands(
        &self,
        limits: &BTreeMap<usize, FrequencyLimit>,
    ) -> Result<Vec<String>, ControlError> {
        if limits.is_empty() {
            return Err(ControlError::NothingSelected);
        }

        let ceiling = i64::from(MAX_FREQUENCY_MHZ);
        for (thread, limit) in limits {
            if *thread >= self.table.thread_count {
                return Err(ControlError::InvalidValue(format!("thread {} does not exist", thread)));
            }
            if !(0 <= limit.min_mhz && limit.min_mhz <= limit.max_mhz && limit.max_mhz <= ceiling) {
                return Err(ControlError::InvalidValue(format!(
                    "thread {}: need 0 <= min ({}) <= max ({}) <= {} MHz",
                    thread, limit.min_mhz, limit.max_mhz, ceiling
                )));
            }
        }

        let mut commands = Vec::with_capacity(limits.len() * 2);
        for (thread, limit) in limits {
            let (Some(max_file), Some(min_file)) = (
                self.table.path(FileRole::ScalingMaxFreq, *thread),
                self.table.path(FileRole::ScalingMinFreq, *thread),
            ) else {
                return Err(ControlError::NotSupported(format!(
                    "scaling frequency files for thread {}",
                    thread
                )));
            };
            // max first: the new minimum may be above the old maximum
            commands.push(echo_tee(limit.max_mhz * 1000, max_file));
            commands.push(echo_tee(limit.min_mhz * 1000, min_file));
        }
        Ok(commands)
    }

    fn governor_commands(&self, name: &str) -> Result<Vec<String>, ControlError> {
        if !is_valid_governor(name) {
            return Err(ControlError::InvalidGovernor(name.to_string()));
        }
        self.per_thread(FileRole::ScalingGovernor, name)
    }

    fn boost_commands(&self, enabled: bool) -> Result<Vec<String>, ControlError> {
        match self.table.vendor {
            Vendor::Intel => match &self.table.intel_boost {
                Some(no_turbo) => Ok(vec![echo_tee(if enabled { 0 } else { 1 }, no_turbo)]),
                None => Err(ControlError::NotSupported("intel_pstate/no_turbo".into())),
            },
            Vendor::Other => {
                let value = u8::from(enabled);
                if self.table.has(FileRole::Boost) {
                    self.per_thread(FileRole::Boost, value)
                } else if let Some(global) = &self.table.generic_boost {
                    Ok(vec![echo_tee(value, global)])
                } else {
                    Err(ControlError::NotSupported("no boost files".into()))
                }
            }
        }
    }

    fn smu_dir(&self, what: &str) -> Result<&Path, ControlError> {
        self.smu_dir
            .as_deref()
            .ok_or_else(|| ControlError::NotSupported(format!("{} needs the ryzen_smu driver", what)))
    }

    fn tdp_commands(&self, watts: f64) -> Result<Vec<String>, ControlError> {
        let range = self.limits.tdp_watts;
        let mut upper = f64::from(range.max);
        if let Some(max) = self.limits.max_tdp_watts.filter(|_| self.table.vendor == Vendor::Intel) {
            upper = upper.min(max);
        }
        if !watts.is_finite() || watts < f64::from(range.min) || watts > upper {
            return Err(ControlError::InvalidValue(format!(
                "TDP {} W outside {}..={} W",
                watts, range.min, upper
            )));
        }

        match self.table.vendor {
            Vendor::Intel => {
                let tdp = self
                    .table
                    .tdp
                    .as_ref()
                    .ok_or_else(|| ControlError::NotSupported("RAPL power limit file".into()))?;
                let microwatts = (watts * 1_000_000.0).round() as u64;
                Ok(vec![echo_tee(microwatts, tdp)])
            }
            Vendor::Other => {
                let smu = self.smu_dir("TDP control")?;
                let milliwatts = (watts * 1000.0).round() as u32;
                Ok(vec![
                    printf_tee(&encode_smu_args(&[milliwatts]), &smu.join(SMU_ARGS_FILE)),
                    printf_tee(&[SMU_TDP_OPCODE], &smu.join(SMU_RSMU_CMD_FILE)),
                ])
            }
        }
    }

    fn pbo_commands(&self, magnitude: i64) -> Result<Vec<String>, ControlError> {
        let range = self.limits.pbo;
        if !u32::try_from(magnitude).map_or(false, |m| range.contains(m)) {
            return Err(ControlError::InvalidValue(format!(
                "PBO offset {} outside {}..={}",
                magnitude, range.min, range.max
            )));
        }
        if self.table.vendor == Vendor::Intel {
            return Err(ControlError::NotSupported("PBO offsets on Intel CPUs".into()));
        }
        let smu = self.smu_dir("PBO offset")?;
        let args_file = smu.join(SMU_ARGS_FILE);
        let cmd_file = smu.join(SMU_MP1_CMD_FILE);

        let mut commands = Vec::with_capacity(self.physical_cores * 2);
        for core in 0..self.physical_cores as u32 {
            let args = smu_pbo_args(core, magnitude);
            commands.push(printf_tee(&encode_smu_args(&[args]), &args_file));
            commands.push(printf_tee(&[SMU_PBO_OPCODE], &cmd_file));
        }
        if commands.is_empty() {
            return Err(ControlError::NotSupported("no physical cores detected".into()));
        }
        Ok(commands)
    }

    fn epb_commands(&self, value: u8) -> Result<Vec<String>, ControlError> {
        if !is_valid_epb(value) {
            return Err(ControlError::InvalidValue(format!(
                "energy_perf_bias {} (allowed 0, 4, 6, 8, 15)",
                value
            )));
        }
        self.per_thread(FileRole::EnergyPerfBias, value)
    }
}
