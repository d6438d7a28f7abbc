//! Configuration loading from a human-editable TOML file, mirroring the
//! shape of the original YAML configuration one field for one field.

use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockConfig {
    #[serde(default = "default_block_size")]
    pub size: u32,
    #[serde(default = "default_hash_algorithm")]
    pub algorithm: String,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            size: default_block_size(),
            algorithm: default_hash_algorithm(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RansomwareThresholdsConfig {
    #[serde(default = "default_files_count")]
    pub files_count: usize,
    #[serde(default = "default_time_window_sec")]
    pub time_window_sec: i64,
    #[serde(default = "default_block_change_percent")]
    pub block_change_percent: f64,
    #[serde(default = "default_entropy_threshold")]
    pub entropy_threshold: f64,
}

impl Default for RansomwareThresholdsConfig {
    fn default() -> Self {
        Self {
            files_count: default_files_count(),
            time_window_sec: default_time_window_sec(),
            block_change_percent: default_block_change_percent(),
            entropy_threshold: default_entropy_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_fallback_interval")]
    pub fallback_interval_sec: u64,
    #[serde(default = "default_use_kernel_notifications")]
    pub use_kernel_notifications: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            fallback_interval_sec: default_fallback_interval(),
            use_kernel_notifications: default_use_kernel_notifications(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub protected_paths: Vec<String>,
    #[serde(default)]
    pub block: BlockConfig,
    #[serde(default)]
    pub ransomware_thresholds: RansomwareThresholdsConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default = "default_storage_path")]
    pub storage_path: String,
    #[serde(default = "default_log_path")]
    pub log_path: String,
    #[serde(default = "default_control_socket_path")]
    pub control_socket_path: String,
    #[serde(default = "default_allowed_admins")]
    pub allowed_admins: Vec<String>,
    #[serde(default)]
    pub update_mode: bool,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            protected_paths: Vec::new(),
            block: BlockConfig::default(),
            ransomware_thresholds: RansomwareThresholdsConfig::default(),
            monitoring: MonitoringConfig::default(),
            storage_path: default_storage_path(),
            log_path: default_log_path(),
            control_socket_path: default_control_socket_path(),
            allowed_admins: default_allowed_admins(),
            update_mode: false,
        }
    }
}

fn default_block_size() -> u32 {
    65_536
}
fn default_hash_algorithm() -> String {
    "sha256".to_string()
}
fn default_files_count() -> usize {
    10
}
fn default_time_window_sec() -> i64 {
    10
}
fn default_block_change_percent() -> f64 {
    70.0
}
fn default_entropy_threshold() -> f64 {
    7.5
}
fn default_fallback_interval() -> u64 {
    60
}
fn default_use_kernel_notifications() -> bool {
    true
}
fn default_storage_path() -> String {
    "/var/lib/secure_fs_guard/storage".to_string()
}
fn default_log_path() -> String {
    "/var/log/secure_fs_guard/system.log".to_string()
}
fn default_control_socket_path() -> String {
    "/var/run/secure_fs_guard.sock".to_string()
}
fn default_allowed_admins() -> Vec<String> {
    vec!["root".to_string(), "admin".to_string()]
}

const DEFAULT_CONFIG_HEADER: &str = "# Secure FS Guard configuration\n# Generated on first run; edit in place and restart the daemon to apply.\n\n";

/// Loads configuration from `path`. If the file does not exist, writes a
/// commented default configuration there and proceeds with default values.
pub fn load(path: &Path) -> anyhow::Result<SystemConfig> {
    if !path.exists() {
        create_default_config(path)?;
        return Ok(SystemConfig::default());
    }
    let text = std::fs::read_to_string(path)?;
    let config: SystemConfig = toml::from_str(&text)?;
    validate(&config)?;
    Ok(config)
}

fn create_default_config(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let config = SystemConfig::default();
    let body = toml::to_string_pretty(&config)?;
    std::fs::write(path, format!("{DEFAULT_CONFIG_HEADER}{body}"))?;
    Ok(())
}

/// Fails fast at startup on invalid thresholds, bad paths, or nonsensical
/// monitoring intervals.
pub fn validate(config: &SystemConfig) -> anyhow::Result<()> {
    if config.block.size == 0 {
        anyhow::bail!("block.size must be greater than zero");
    }
    if !(0.0..=100.0).contains(&config.ransomware_thresholds.block_change_percent) {
        anyhow::bail!("ransomware_thresholds.block_change_percent must be within [0, 100]");
    }
    if !(0.0..=8.0).contains(&config.ransomware_thresholds.entropy_threshold) {
        anyhow::bail!("ransomware_thresholds.entropy_threshold must be within [0, 8]");
    }
    if config.monitoring.fallback_interval_sec == 0 {
        anyhow::bail!("monitoring.fallback_interval_sec must be greater than zero");
    }
    for path in &config.protected_paths {
        if !Path::new(path).is_absolute() {
            anyhow::bail!("protected path {path:?} must be absolute");
        }
    }
    Ok(())
}

pub fn add_protected_path(config_path: &Path, config: &mut SystemConfig, path: String) -> anyhow::Result<()> {
    if !config.protected_paths.contains(&path) {
        config.protected_paths.push(path);
        save(config_path, config)?;
    }
    Ok(())
}

pub fn remove_protected_path(config_path: &Path, config: &mut SystemConfig, path: &str) -> anyhow::Result<()> {
    config.protected_paths.retain(|p| p != path);
    save(config_path, config)
}

fn save(path: &Path, config: &SystemConfig) -> anyhow::Result<()> {
    let body = toml::to_string_pretty(config)?;
    std::fs::write(path, format!("{DEFAULT_CONFIG_HEADER}{body}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_config_bootstraps_default_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let config = load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.block.size, 65_536);
    }

    #[test]
    fn validate_rejects_out_of_range_entropy_threshold() {
        let mut config = SystemConfig::default();
        config.ransomware_thresholds.entropy_threshold = 99.0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_relative_protected_path() {
        let mut config = SystemConfig::default();
        config.protected_paths.push("relative/path".to_string());
        assert!(validate(&config).is_err());
    }
}
