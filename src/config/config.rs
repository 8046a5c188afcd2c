// src/config/config.rs

use anyhow::{Context, Result};
use log::{debug, error, LevelFilter};
use notify::event::{CreateKind, EventKind, ModifyKind, RemoveKind};
use notify::{RecursiveMode, Watcher};

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use configparser::ini::Ini;

use crate::globals::{APP_NAME, MAX_FREQUENCY_MHZ, UPDATE_INTERVAL_DEFAULT};
use crate::scheduler::clamp_interval;

pub const SECTION: &str = "Settings";

/// Keys written with their defaults when missing from the file.
const DEFAULTS: &[(&str, &str)] = &[
    ("update_interval", "1.0"),
    ("clock_scale_minimum", "1"),
    ("clock_scale_maximum", "6000"),
    ("tdp_scale_minimum", "1"),
    ("tdp_scale_maximum", "400"),
    ("pbo_scale_minimum", "0"),
    ("pbo_scale_maximum", "30"),
    ("disable_scale_limits", "False"),
    ("logging_level", "WARNING"),
];

/// Inclusive slider range for one kind of setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleRange {
    pub min: u32,
    pub max: u32,
}

impl ScaleRange {
    pub fn contains(&self, value: u32) -> bool {
        value >= self.min && value <= self.max
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Config {
    path: Arc<Mutex<PathBuf>>,
    config: Arc<Mutex<Ini>>,
    reloaded: Arc<AtomicBool>,
    watcher: Mutex<Option<notify::RecommendedWatcher>>,
}

impl Config {
    pub fn new() -> Self {
        Config {
            path: Arc::new(Mutex::new(PathBuf::new())),
            config: Arc::new(Mutex::new(Ini::new())),
            reloaded: Arc::new(AtomicBool::new(false)),
            watcher: Mutex::new(None),
        }
    }

    /// Load `path`, filling in missing keys with defaults and writing them back.
    pub fn load(path: PathBuf) -> Result<Self> {
        let config = Self::new();
        *lock(&config.path) = path.clone();

        if path.exists() {
            config.update_config();
        }

        if config.fill_defaults() {
            if let Err(e) = config.save() {
                // a read-only config location is not fatal, defaults still apply
                error!("Could not write default settings: {:#}", e);
            }
        }

        Ok(config)
    }

    /// Watch the config directory and reload on change.
    pub fn watch(&self) -> Result<()> {
        let path = self.get_path();
        let config_clone: Arc<Mutex<Ini>> = Arc::clone(&self.config);
        let path_clone = Arc::clone(&self.path);
        let reloaded = Arc::clone(&self.reloaded);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    let should_update = matches!(
                        event.kind,
                        EventKind::Create(CreateKind::File)
                            | EventKind::Modify(ModifyKind::Data(_))
                            | EventKind::Remove(RemoveKind::File)
                    );
                    if !should_update {
                        return;
                    }

                    let current_path = lock(&path_clone).clone();
                    if event.paths.iter().any(|p| p == &current_path) {
                        let mut new_config = Ini::new();
                        if new_config.load(current_path.to_string_lossy().as_ref()).is_ok() {
                            *lock(&config_clone) = new_config;
                            reloaded.store(true, Ordering::SeqCst);
                            debug!("Reloaded {}", current_path.display());
                        }
                    }
                }
                Err(e) => error!("Config watch error: {:?}", e),
            }
        })?;

        if let Some(parent) = path.parent() {
            watcher
                .watch(parent, RecursiveMode::NonRecursive)
                .with_context(|| format!("Failed to watch {}", parent.display()))?;
        }

        *lock(&self.watcher) = Some(watcher);
        Ok(())
    }

    /// True once after the watcher has swapped in a fresh file.
    pub fn take_reloaded(&self) -> bool {
        self.reloaded.swap(false, Ordering::SeqCst)
    }

    pub fn has_config(&self) -> bool {
        lock(&self.path).exists()
    }

    pub fn get_path(&self) -> PathBuf {
        lock(&self.path).clone()
    }

    pub fn update_config(&self) {
        let path = self.get_path();
        let mut new_config = Ini::new();
        match new_config.load(path.to_string_lossy().as_ref()) {
            Ok(_) => *lock(&self.config) = new_config,
            Err(e) => error!(
                "The following error occurred while parsing the config file:\n{}",
                e
            ),
        }
    }

    fn fill_defaults(&self) -> bool {
        let mut config = lock(&self.config);
        let mut changed = false;
        for (key, value) in DEFAULTS {
            if config.get(SECTION, key).is_none() {
                config.set(SECTION, key, Some(value.to_string()));
                changed = true;
            }
        }
        changed
    }

    pub fn save(&self) -> Result<()> {
        let path = self.get_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        lock(&self.config)
            .write(path.to_string_lossy().as_ref())
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        lock(&self.config).get(SECTION, key)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        let value = self.get_string(key)?;
        match value.trim().parse() {
            Ok(v) => Some(v),
            Err(_) => {
                error!("Invalid number for {}: {:?}", key, value);
                None
            }
        }
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get_f64(key)
            .filter(|v| *v >= 0.0)
            .map(|v| v.round() as u32)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        let value = self.get_string(key)?;
        match value.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Some(true),
            "false" | "no" | "off" | "0" => Some(false),
            _ => {
                error!("Invalid boolean for {}: {:?}", key, value);
                None
            }
        }
    }

    pub fn update_interval(&self) -> f64 {
        clamp_interval(
            self.get_f64("update_interval")
                .unwrap_or(UPDATE_INTERVAL_DEFAULT),
        )
    }

    /// Store a new polling interval; returns the clamped value actually kept.
    pub fn set_update_interval(&self, seconds: f64) -> Result<f64> {
        let interval = clamp_interval(seconds);
        lock(&self.config).set(SECTION, "update_interval", Some(format!("{:.1}", interval)));
        self.save()?;
        Ok(interval)
    }

    fn scale(&self, prefix: &str, default_min: u32, default_max: u32) -> ScaleRange {
        let min = self
            .get_u32(&format!("{}_minimum", prefix))
            .unwrap_or(default_min);
        let max = self
            .get_u32(&format!("{}_maximum", prefix))
            .unwrap_or(default_max);
        if min > max {
            error!("{}_minimum exceeds {}_maximum, using defaults", prefix, prefix);
            return ScaleRange { min: default_min, max: default_max };
        }
        ScaleRange { min, max }
    }

    /// Frequency slider range in MHz, never above the hard frequency ceiling.
    pub fn clock_scale(&self) -> ScaleRange {
        let range = self.scale("clock_scale", 1, MAX_FREQUENCY_MHZ);
        ScaleRange {
            min: range.min.min(MAX_FREQUENCY_MHZ),
            max: range.max.min(MAX_FREQUENCY_MHZ),
        }
    }

    pub fn tdp_scale(&self) -> ScaleRange {
        self.scale("tdp_scale", 1, 400)
    }

    pub fn pbo_scale(&self) -> ScaleRange {
        self.scale("pbo_scale", 0, 30)
    }

    /// When set, frequency limits may leave the per-thread hardware range.
    pub fn disable_scale_limits(&self) -> bool {
        self.get_bool("disable_scale_limits").unwrap_or(false)
    }

    pub fn logging_level(&self) -> LevelFilter {
        parse_level(&self.get_string("logging_level").unwrap_or_default())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

pub fn parse_level(name: &str) -> LevelFilter {
    match name.trim().to_ascii_uppercase().as_str() {
        "DEBUG" => LevelFilter::Debug,
        "INFO" => LevelFilter::Info,
        "ERROR" | "CRITICAL" => LevelFilter::Error,
        "OFF" => LevelFilter::Off,
        _ => LevelFilter::Warn,
    }
}

/// Find the config file to use
///
/// 1. Command line argument
/// 2. `$XDG_CONFIG_HOME/ClockSpeeds/config.ini`, falling back to `~/.config`
pub fn find_config_file(args_config_file: Option<&str>) -> Result<PathBuf> {
    if let Some(config_path) = args_config_file {
        let path = PathBuf::from(config_path);
        if !path.is_file() {
            anyhow::bail!("Config file specified with '--config {}' not found.", config_path);
        }
        return Ok(path);
    }

    let user_config_dir = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .ok()
        .or_else(dirs::config_dir)
        .context("Could not determine the user config directory")?;

    Ok(user_config_dir.join(APP_NAME).join("config.ini"))
}

/// Location of the persisted discovery cache.
pub fn default_cache_file() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join(APP_NAME).join("directory_cache.json"))
}
