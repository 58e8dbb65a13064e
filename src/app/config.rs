use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app::error::RunError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSettings {
    pub boot_timeout_ms: u64,
    pub boot_poll_interval_ms: u64,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            boot_timeout_ms: 120_000,
            boot_poll_interval_ms: 5_000,
        }
    }
}

impl DeviceSettings {
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_millis(self.boot_timeout_ms)
    }

    pub fn boot_poll_interval(&self) -> Duration {
        Duration::from_millis(self.boot_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatcherSettings {
    pub producers: usize,
    pub analyzers: usize,
    pub queue_capacity: usize,
    pub poll_interval_ms: u64,
    pub default_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            producers: 2,
            analyzers: 2,
            queue_capacity: 10,
            poll_interval_ms: 100,
            default_timeout_ms: 30_000,
            shutdown_grace_ms: 1_000,
        }
    }
}

impl WatcherSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstallSettings {
    pub replace_existing: bool,
    pub allow_downgrade: bool,
    pub grant_permissions: bool,
    pub install_timeout_s: u64,
    pub extra_args: String,
}

impl Default for InstallSettings {
    fn default() -> Self {
        Self {
            replace_existing: true,
            allow_downgrade: false,
            grant_permissions: true,
            install_timeout_s: 120,
            extra_args: String::new(),
        }
    }
}

impl InstallSettings {
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSettings {
    pub adb_program: String,
    pub emulator_program: String,
    pub xcrun_program: String,
    pub ios_dump_program: String,
    pub command_timeout_s: u64,
    pub capture_timeout_s: u64,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            adb_program: "adb".to_string(),
            emulator_program: "emulator".to_string(),
            xcrun_program: "xcrun".to_string(),
            ios_dump_program: "idb".to_string(),
            command_timeout_s: 10,
            capture_timeout_s: 15,
        }
    }
}

impl ToolSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_s)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSettings {
    pub log_level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FarmConfig {
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub watcher: WatcherSettings,
    #[serde(default)]
    pub install: InstallSettings,
    #[serde(default)]
    pub tools: ToolSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub version: String,
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("COLDBREW_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".coldbrew_config.json")
}

pub fn backup_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".coldbrew_config.backup.json")
}

pub fn load_config() -> Result<FarmConfig, RunError> {
    load_config_from_path(&config_path())
}

pub fn save_config(config: &FarmConfig) -> Result<(), RunError> {
    save_config_to_path(config, &config_path(), &backup_config_path())
}

pub fn load_config_from_path(path: &Path) -> Result<FarmConfig, RunError> {
    if !path.exists() {
        return Ok(FarmConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| RunError::system(format!("Failed to read config: {err}"), ""))?;
    let config: FarmConfig = serde_json::from_str(&raw)
        .map_err(|err| RunError::system(format!("Failed to parse config: {err}"), ""))?;
    Ok(validate_config(config))
}

pub fn save_config_to_path(
    config: &FarmConfig,
    path: &Path,
    backup_path: &Path,
) -> Result<(), RunError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = fs::copy(path, backup_path);
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| RunError::system(format!("Failed to serialize config: {err}"), ""))?;
    fs::write(path, payload)
        .map_err(|err| RunError::system(format!("Failed to write config: {err}"), ""))?;
    Ok(())
}

fn validate_config(mut config: FarmConfig) -> FarmConfig {
    if config.device.boot_timeout_ms < 1_000 {
        config.device.boot_timeout_ms = 120_000;
    }
    if config.device.boot_poll_interval_ms < 100 {
        config.device.boot_poll_interval_ms = 5_000;
    }
    if !(1..=8).contains(&config.watcher.producers) {
        config.watcher.producers = 2;
    }
    if !(1..=8).contains(&config.watcher.analyzers) {
        config.watcher.analyzers = 2;
    }
    if config.watcher.queue_capacity == 0 {
        config.watcher.queue_capacity = 10;
    }
    if config.watcher.poll_interval_ms < 10 {
        config.watcher.poll_interval_ms = 100;
    }
    if config.watcher.default_timeout_ms < 1_000 {
        config.watcher.default_timeout_ms = 30_000;
    }
    if config.watcher.shutdown_grace_ms < 100 {
        config.watcher.shutdown_grace_ms = 1_000;
    }
    if config.install.install_timeout_s == 0 {
        config.install.install_timeout_s = 120;
    }
    if config.tools.command_timeout_s == 0 {
        config.tools.command_timeout_s = 10;
    }
    if config.tools.capture_timeout_s == 0 {
        config.tools.capture_timeout_s = 15;
    }
    config
}
