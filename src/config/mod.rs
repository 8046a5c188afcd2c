// src/config/mod.rs

pub mod config;

pub use config::{default_cache_file, find_config_file, parse_level, Config, ScaleRange};
