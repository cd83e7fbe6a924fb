//! Runtime configuration and well-known paths.
//!
//! Everything lives under `~/.penlab`. A missing `daemon.toml` means defaults;
//! a malformed one is reported and the daemon falls back to defaults as well.

use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

const PENLAB_DIR: &str = ".penlab";
const CONFIG_NAME: &str = "daemon.toml";
const SOCKET_NAME: &str = "daemon.sock";
const SESSIONS_DIR_NAME: &str = "sessions";

// One day; keeps the millisecond conversion far from i64 overflow.
const MAX_STALENESS_SECS: f64 = 86_400.0;

pub const SOCKET_ENV: &str = "PENLAB_SOCKET";
pub const SESSIONS_DIR_ENV: &str = "PENLAB_SESSIONS_DIR";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default)]
    pub sessions_dir: Option<PathBuf>,
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: f64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_observer_send_timeout_ms")]
    pub observer_send_timeout_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            sessions_dir: None,
            staleness_secs: default_staleness_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
            observer_send_timeout_ms: default_observer_send_timeout_ms(),
            max_connections: default_max_connections(),
        }
    }
}

impl DaemonConfig {
    pub fn staleness(&self) -> chrono::Duration {
        let secs = self.staleness_secs.clamp(0.0, MAX_STALENESS_SECS);
        chrono::Duration::milliseconds((secs * 1000.0).round() as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn observer_send_timeout(&self) -> Duration {
        Duration::from_millis(self.observer_send_timeout_ms.max(1))
    }

    /// `PENLAB_SESSIONS_DIR` wins over the config file, which wins over the
    /// default under the penlab home.
    pub fn resolve_sessions_dir(&self) -> Result<PathBuf, String> {
        if let Ok(path) = env::var(SESSIONS_DIR_ENV) {
            if !path.trim().is_empty() {
                return Ok(PathBuf::from(path));
            }
        }
        match &self.sessions_dir {
            Some(path) => Ok(path.clone()),
            None => Ok(penlab_home()?.join(SESSIONS_DIR_NAME)),
        }
    }
}

fn default_staleness_secs() -> f64 {
    3.0
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_observer_send_timeout_ms() -> u64 {
    500
}

fn default_max_connections() -> usize {
    64
}

pub fn penlab_home() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(PENLAB_DIR))
}

pub fn default_config_path() -> Result<PathBuf, String> {
    Ok(penlab_home()?.join(CONFIG_NAME))
}

pub fn socket_path() -> Result<PathBuf, String> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    Ok(penlab_home()?.join(SOCKET_NAME))
}

pub fn load_config(path: Option<PathBuf>) -> Result<DaemonConfig, String> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(DaemonConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|err| {
        format!(
            "Failed to read daemon config {}: {}",
            config_path.display(),
            err
        )
    })?;
    parse_config(&content, &config_path)
}

fn parse_config(content: &str, path: &Path) -> Result<DaemonConfig, String> {
    let config = toml::from_str::<DaemonConfig>(content)
        .map_err(|err| format!("Failed to parse daemon config {}: {}", path.display(), err))?;
    if !(config.staleness_secs.is_finite() && config.staleness_secs > 0.0) {
        return Err(format!(
            "Invalid daemon config {}: staleness_secs must be positive",
            path.display()
        ));
    }
    if config.staleness_secs > MAX_STALENESS_SECS {
        return Err(format!(
            "Invalid daemon config {}: staleness_secs must be at most {}",
            path.display(),
            MAX_STALENESS_SECS
        ));
    }
    if config.max_connections == 0 {
        return Err(format!(
            "Invalid daemon config {}: max_connections must be at least 1",
            path.display()
        ));
    }
    Ok(config)
}
