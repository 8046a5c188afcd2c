// src/ledger.rs
//
// Last successfully applied values, kept in a transient JSON file that
// lives only as long as the process.

use anyhow::{Context, Result};
use log::{error, info};
use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::commands::{FrequencyLimit, PendingAction};
use crate::globals::epb_label;
use crate::locator::Vendor;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppliedSettings {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub min_speeds: BTreeMap<usize, i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub max_speeds: BTreeMap<usize, i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub checked_threads: BTreeMap<usize, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub governor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boost: Option<bool>,
    /// Microwatts on Intel, milliwatts through the SMU.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tdp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pbo_offset: Option<i64>,
    /// Drop-down label such as `"6 Normal"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epb: Option<String>,
}

fn tdp_units_per_watt(vendor: Vendor) -> f64 {
    match vendor {
        Vendor::Intel => 1_000_000.0,
        Vendor::Other => 1000.0,
    }
}

impl AppliedSettings {
    pub fn is_empty(&self) -> bool {
        *self == AppliedSettings::default()
    }

    /// Overwrite only the keys `action` controls.
    pub fn record(&mut self, action: &PendingAction, vendor: Vendor) {
        match action {
            PendingAction::FrequencyLimits(limits) => {
                self.checked_threads = limits.keys().map(|t| (*t, true)).collect();
                for (thread, limit) in limits {
                    self.min_speeds.insert(*thread, limit.min_mhz);
                    self.max_speeds.insert(*thread, limit.max_mhz);
                }
            }
            PendingAction::Governor(name) => self.governor = Some(name.clone()),
            PendingAction::Boost(enabled) => self.boost = Some(*enabled),
            PendingAction::Tdp { watts } => {
                self.tdp = Some((watts * tdp_units_per_watt(vendor)).round() as u64)
            }
            PendingAction::PboOffset(magnitude) => self.pbo_offset = Some(*magnitude),
            PendingAction::EnergyPerfBias(value) => {
                self.epb = epb_label(*value).or_else(|| Some(value.to_string()))
            }
        }
    }

    /// Actions that reproduce these settings, in script order:
    /// frequency, governor, boost, TDP, PBO, EPB.
    pub fn actions(&self, vendor: Vendor) -> Vec<PendingAction> {
        let mut actions = Vec::new();

        let limits: BTreeMap<usize, FrequencyLimit> = self
            .min_speeds
            .iter()
            .filter_map(|(thread, min)| {
                self.max_speeds.get(thread).map(|max| {
                    (*thread, FrequencyLimit { min_mhz: *min, max_mhz: *max })
                })
            })
            .collect();
        if !limits.is_empty() {
            actions.push(PendingAction::FrequencyLimits(limits));
        }
        if let Some(governor) = &self.governor {
            actions.push(PendingAction::Governor(governor.clone()));
        }
        if let Some(boost) = self.boost {
            actions.push(PendingAction::Boost(boost));
        }
        if let Some(tdp) = self.tdp {
            actions.push(PendingAction::Tdp {
                watts: tdp as f64 / tdp_units_per_watt(vendor),
            });
        }
        if let Some(offset) = self.pbo_offset {
            actions.push(PendingAction::PboOffset(offset));
        }
        if let Some(value) = self
            .epb
            .as_deref()
            .and_then(|label| label.split_whitespace().next())
            .and_then(|v| v.parse::<u8>().ok())
        {
            actions.push(PendingAction::EnergyPerfBias(value));
        }
        actions
    }
}

/// Owns the settings file: created empty, rewritten on every change,
/// deleted on drop.
pub struct SettingsLedger {
    path: PathBuf,
    settings: AppliedSettings,
}

impl SettingsLedger {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to delete old settings file {}", path.display()))?;
            info!("Old settings file deleted");
        }
        let ledger = Self {
            path,
            settings: AppliedSettings::default(),
        };
        ledger.persist()?;
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &AppliedSettings {
        &self.settings
    }

    /// Record a successful apply and write the whole ledger out.
    pub fn record(&mut self, action: &PendingAction, vendor: Vendor) -> Result<()> {
        self.settings.record(action, vendor);
        self.persist()
    }

    /// Read back what is on disk.
    pub fn load(&self) -> Result<AppliedSettings> {
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", self.path.display()))
    }

    fn persist(&self) -> Result<()> {
        let json = serde_json::to_string(&self.settings)?;
        fs::write(&self.path, json)
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}

impl Drop for SettingsLedger {
    fn drop(&mut self) {
        if self.path.exists() {
            match fs::remove_file(&self.path) {
                Ok(()) => info!("Settings file deleted"),
                Err(e) => error!("Failed to delete settings file: {}", e),
            }
        }
    }
}
