use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use super::ConfigError;
use crate::control::virsh::VirshSettings;
use crate::executor::RuntimeSettings;
use crate::retry::RetryPolicy;

const APP_DIR: &str = "boxman";
const CONFIG_FILE: &str = "boxman.yml";

/// Per-user settings shared by every project.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub providers: ProvidersConfig,
    pub runtime: RuntimeSettings,
    pub timing: TimingSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub libvirt: VirshSettings,
}

/// Waiting and retry bounds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    /// Overall budget for a VM to acquire a DHCP address.
    pub ip_wait_timeout_secs: u64,
    /// Delay between lease polls.
    pub ip_poll_interval_secs: u64,
    /// Attempts to install and verify the SSH key.
    pub ssh_attempts: u32,
    /// How long a guest gets to power off before it is destroyed.
    pub shutdown_timeout_secs: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            ip_wait_timeout_secs: 600,
            ip_poll_interval_secs: 5,
            ssh_attempts: 5,
            shutdown_timeout_secs: 30,
        }
    }
}

impl TimingSettings {
    #[must_use]
    pub fn ip_wait_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            Duration::from_secs(self.ip_poll_interval_secs),
            Duration::from_secs(self.ip_wait_timeout_secs),
        )
    }

    #[must_use]
    pub fn ssh_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            Duration::from_secs(1),
            Duration::from_secs(60),
            self.ssh_attempts.max(1),
        )
    }

    #[must_use]
    pub fn shutdown_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            Duration::from_secs(1),
            Duration::from_secs(self.shutdown_timeout_secs),
        )
    }
}

/// The platform config directory plus `boxman` (`~/.config/boxman` on
/// Linux). Falls back to `.boxman` in the working directory when there is
/// no home.
#[must_use]
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir().map_or_else(|| PathBuf::from(".boxman"), |dir| dir.join(APP_DIR))
}

/// `~/.config/boxman/boxman.yml`, expanded.
#[must_use]
pub fn default_app_config_path() -> PathBuf {
    default_config_dir().join(CONFIG_FILE)
}

/// Load the application configuration.
///
/// With `explicit` set, the file must exist. Otherwise the default location
/// is tried and a missing file yields defaults.
///
/// # Errors
///
/// Returns an error if a file that should be read cannot be, or does not
/// parse.
pub fn load_app_config(explicit: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let path = default_app_config_path();
            if !path.exists() {
                debug!(path = %path.display(), "No application config, using defaults");
                return Ok(AppConfig::default());
            }
            path
        }
    };

    let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    if content.trim().is_empty() {
        return Ok(AppConfig::default());
    }
    serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse { path, source })
}
