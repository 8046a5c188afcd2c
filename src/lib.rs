pub mod boot_service;
pub mod commands;
pub mod config;
pub mod controller;
pub mod cpuinfo_parser;
pub mod dir_cache;
pub mod error;
pub mod globals;
pub mod ledger;
pub mod locator;
pub mod modules;
pub mod privileged;
pub mod scheduler;
pub mod sysfs;

#[cfg(test)]
mod fixtures;

// Re-exports
pub use commands::{CommandBuilder, PendingAction};
pub use config::{find_config_file, Config};
pub use controller::{ControllerContext, CpuController, Job};
pub use error::ControlError;
pub use globals::*;
pub use locator::{ControlFileTable, SysRoots, Vendor};
pub use privileged::{ExecOutcome, Pkexec};
