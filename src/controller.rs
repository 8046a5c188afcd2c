// src/controller.rs
//
// The operations a front end calls. Everything here runs on the control
// thread; only the elevated commands run elsewhere.

use anyhow::Result;
use log::{debug, error, info, warn};

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::boot_service::{self, StagingPaths};
use crate::commands::{CommandBuilder, Limits, PendingAction};
use crate::config::Config;
use crate::dir_cache::DirectoryCache;
use crate::error::ControlError;
use crate::globals::{smu_driver_present, RYZEN_SMU_SUBDIR, SERVICE_INSTALL_PATH, SETTINGS_FILE};
use crate::ledger::SettingsLedger;
use crate::locator::{count_logical_threads, ControlFileTable, CpuFileLocator, SysRoots, Vendor};
use crate::modules::sampler::{SampleSnapshot, SamplingEngine};
use crate::modules::system_info::{
    allowed_cpu_frequency, allowed_tdp_watts, available_governors, AllowedFrequencies,
    CpuInfoReport, CpuTopology,
};
use crate::privileged::{Completion, Elevator, PrivilegedExecutor, Ticket};

/// What a privileged command was for.
#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    Action(PendingAction),
    BootInstall,
    BootRemove,
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Action(action) => write!(f, "{}", action.kind()),
            Job::BootInstall => write!(f, "boot service install"),
            Job::BootRemove => write!(f, "boot service removal"),
        }
    }
}

/// Everything the controller needs, resolved up front.
pub struct ControllerContext {
    pub table: Arc<ControlFileTable>,
    pub topology: CpuTopology,
    pub limits: Limits,
    pub smu_dir: Option<PathBuf>,
    pub elevator: Arc<dyn Elevator>,
    pub ledger_path: PathBuf,
    pub staging: StagingPaths,
    pub boot_service_installed: bool,
    /// Keep frequency requests inside each thread's cpuinfo range.
    pub hardware_frequency_limits: bool,
}

impl ControllerContext {
    /// Run discovery against `roots` and gather the rest from `config`.
    /// Threads are counted from sysfs; `fallback_threads` is used only when
    /// the cpu directory is not where it usually is.
    pub fn discover(
        roots: SysRoots,
        cache: DirectoryCache,
        fallback_threads: usize,
        config: &Config,
        elevator: Arc<dyn Elevator>,
    ) -> Self {
        let thread_count = count_logical_threads(&roots).unwrap_or_else(|| {
            warn!("Could not count CPU threads in sysfs, assuming {}", fallback_threads);
            fallback_threads
        });
        let mut locator = CpuFileLocator::new(roots.clone(), cache, thread_count);
        let table = locator.discover();
        let topology = CpuTopology::build(&table, &roots);

        let smu_dir = match table.vendor {
            Vendor::Other => {
                let dir = roots.sys.join(RYZEN_SMU_SUBDIR);
                if smu_driver_present(&dir) {
                    info!("ryzen_smu driver found at {}", dir.display());
                    Some(dir)
                } else {
                    info!("ryzen_smu driver not loaded, PBO and TDP controls are unavailable");
                    None
                }
            }
            Vendor::Intel => None,
        };

        let limits = Limits {
            tdp_watts: config.tdp_scale(),
            pbo: config.pbo_scale(),
            max_tdp_watts: allowed_tdp_watts(&table),
        };

        Self {
            table: Arc::new(table),
            topology,
            limits,
            smu_dir,
            elevator,
            ledger_path: PathBuf::from(SETTINGS_FILE),
            staging: StagingPaths::default(),
            boot_service_installed: Path::new(SERVICE_INSTALL_PATH).exists(),
            hardware_frequency_limits: !config.disable_scale_limits(),
        }
    }
}

pub struct CpuController {
    table: Arc<ControlFileTable>,
    topology: CpuTopology,
    limits: Limits,
    smu_dir: Option<PathBuf>,
    sampler: SamplingEngine,
    executor: PrivilegedExecutor<Job>,
    ledger: SettingsLedger,
    staging: StagingPaths,
    boot_service_installed: bool,
    hardware_frequency_limits: bool,
}

impl CpuController {
    pub fn new(context: ControllerContext) -> Result<Self> {
        let ledger = SettingsLedger::create(&context.ledger_path)?;
        Ok(Self {
            sampler: SamplingEngine::new(Arc::clone(&context.table)),
            executor: PrivilegedExecutor::new(context.elevator),
            table: context.table,
            topology: context.topology,
            limits: context.limits,
            smu_dir: context.smu_dir,
            ledger,
            staging: context.staging,
            boot_service_installed: context.boot_service_installed,
            hardware_frequency_limits: context.hardware_frequency_limits,
        })
    }

    pub fn table(&self) -> &ControlFileTable {
        &self.table
    }

    pub fn topology(&self) -> &CpuTopology {
        &self.topology
    }

    pub fn ledger(&self) -> &SettingsLedger {
        &self.ledger
    }

    pub fn boot_service_installed(&self) -> bool {
        self.boot_service_installed
    }

    pub fn in_flight(&self) -> usize {
        self.executor.in_flight()
    }

    fn builder(&self) -> CommandBuilder<'_> {
        CommandBuilder::new(
            &self.table,
            self.topology.physical_cores,
            self.smu_dir.clone(),
            self.limits,
        )
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    pub fn get_cpu_info(&self) -> CpuInfoReport {
        CpuInfoReport::new(&self.topology, self.get_allowed_cpu_frequency())
    }

    pub fn read_cpu_speeds(&self) -> BTreeMap<usize, f64> {
        self.sampler.read_cpu_speeds()
    }

    pub fn get_allowed_cpu_frequency(&self) -> AllowedFrequencies {
        allowed_cpu_frequency(&self.table)
    }

    /// Selectable TDP range in watts, or `None` when TDP cannot be set here.
    pub fn get_allowed_tdp_values(&self) -> Option<(f64, f64)> {
        let min = f64::from(self.limits.tdp_watts.min);
        let max = f64::from(self.limits.tdp_watts.max);
        match self.table.vendor {
            Vendor::Intel => {
                self.table.tdp.as_ref()?;
                let max = self.limits.max_tdp_watts.map_or(max, |rapl| rapl.min(max));
                (min <= max).then_some((min, max))
            }
            Vendor::Other => self.smu_dir.as_ref().map(|_| (min, max)),
        }
    }

    pub fn available_governors(&self) -> Vec<String> {
        available_governors(&self.table)
    }

    pub fn last_sample(&self) -> Option<&SampleSnapshot> {
        self.sampler.last()
    }

    pub fn tick(&mut self) -> SampleSnapshot {
        self.sampler.tick()
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Validate, build and submit `action`. Returns once the command has
    /// been handed to a worker; the outcome arrives via `process_completions`.
    pub fn apply(&mut self, action: PendingAction) -> Result<Ticket, ControlError> {
        let built = self
            .builder()
            .build(&action)
            .and_then(|plan| self.check_hardware_range(&action).map(|()| plan));
        let plan = match built {
            Ok(plan) => plan,
            Err(e) => {
                if e.is_validation() {
                    warn!("Rejected {}: {}", action.kind(), e);
                } else {
                    info!("Cannot apply {}: {}", action.kind(), e);
                }
                return Err(e);
            }
        };
        debug!("Applying {} with {} command(s)", plan.kind, plan.len());
        Ok(self.executor.submit(plan.joined(), Job::Action(action)))
    }

    /// Reject frequency limits outside a thread's cpuinfo range. Threads
    /// whose range could not be read are left to the fixed bound.
    fn check_hardware_range(&self, action: &PendingAction) -> Result<(), ControlError> {
        let PendingAction::FrequencyLimits(limits) = action else {
            return Ok(());
        };
        if !self.hardware_frequency_limits {
            return Ok(());
        }
        let allowed = self.get_allowed_cpu_frequency();
        for (thread, limit) in limits {
            let (Some(&lo), Some(&hi)) = (allowed.min_mhz.get(thread), allowed.max_mhz.get(thread)) else {
                continue;
            };
            let (lo, hi) = (lo.floor() as i64, hi.ceil() as i64);
            if limit.min_mhz < lo || limit.max_mhz > hi {
                return Err(ControlError::InvalidValue(format!(
                    "CPU{} allows {}-{} MHz, requested {}-{} MHz",
                    thread, lo, hi, limit.min_mhz, limit.max_mhz
                )));
            }
        }
        Ok(())
    }

    pub fn apply_frequency_limits(
        &mut self,
        threads: impl IntoIterator<Item = usize>,
        min_mhz: i64,
        max_mhz: i64,
    ) -> Result<Ticket, ControlError> {
        self.apply(PendingAction::uniform_limits(threads, min_mhz, max_mhz))
    }

    pub fn apply_governor(&mut self, governor: &str) -> Result<Ticket, ControlError> {
        self.apply(PendingAction::Governor(governor.to_string()))
    }

    pub fn apply_boost(&mut self, enabled: bool) -> Result<Ticket, ControlError> {
        self.apply(PendingAction::Boost(enabled))
    }

    pub fn apply_tdp(&mut self, watts: f64) -> Result<Ticket, ControlError> {
        self.apply(PendingAction::Tdp { watts })
    }

    pub fn apply_pbo_offset(&mut self, magnitude: i64) -> Result<Ticket, ControlError> {
        self.apply(PendingAction::PboOffset(magnitude))
    }

    pub fn apply_energy_perf_bias(&mut self, value: u8) -> Result<Ticket, ControlError> {
        self.apply(PendingAction::EnergyPerfBias(value))
    }

    /// Stage a replay script for the ledger's current contents and install
    /// it as a systemd service.
    pub fn apply_on_boot(&mut self) -> Result<Ticket> {
        let script = boot_service::generate_script(self.ledger.settings(), &self.builder())?;
        boot_service::write_staging(&script, &self.staging)?;
        let command = boot_service::install_command(&self.staging);
        Ok(self.executor.submit(command, Job::BootInstall))
    }

    pub fn remove_boot_service(&mut self) -> Ticket {
        self.executor.submit(boot_service::remove_command(), Job::BootRemove)
    }

    // ------------------------------------------------------------------------
    // Completions
    // ------------------------------------------------------------------------

    fn settle(&mut self, done: &Completion<Job>) {
        if !done.outcome.is_success() {
            return;
        }
        match &done.payload {
            Job::Action(action) => match self.ledger.record(action, self.table.vendor) {
                Ok(()) => info!("Applied {}", action.kind()),
                Err(e) => error!("Applied {} but could not record it: {:#}", action.kind(), e),
            },
            Job::BootInstall => {
                info!("Systemd service created and started");
                self.boot_service_installed = true;
            }
            Job::BootRemove => {
                info!("Systemd service removed");
                self.boot_service_installed = false;
            }
        }
    }

    /// Drain finished commands without blocking, recording successes.
    pub fn process_completions(&mut self) -> Vec<Completion<Job>> {
        let done = self.executor.try_completions();
        for completion in &done {
            self.settle(completion);
        }
        done
    }

    /// Block up to `timeout` for one finished command.
    pub fn wait_for_completion(&mut self, timeout: Duration) -> Option<Completion<Job>> {
        let done = self.executor.wait_completion(timeout)?;
        self.settle(&done);
        Some(done)
    }
}
