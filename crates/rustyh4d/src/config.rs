//! Configuration for the daemon.
//!
//! Settings are read from a TOML file; a missing file means defaults. The
//! transport path can be overridden from the environment.

use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{DaemonError, Result};

/// Daemon configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Device node speaking H4, such as a UART tty
    #[serde(default = "default_device")]
    pub device: PathBuf,

    /// Issue an HCI Reset once the session is up
    #[serde(default = "default_reset_on_start")]
    pub reset_on_start: bool,

    /// How long the controller gets to answer the reset
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

fn default_device() -> PathBuf {
    PathBuf::from("/dev/ttyUSB0")
}

const fn default_reset_on_start() -> bool {
    true
}

const fn default_reset_timeout_ms() -> u64 {
    2000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: default_device(),
            reset_on_start: default_reset_on_start(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

impl Config {
    /// Loads the configuration from its default location.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;

        if let Ok(device) = env::var("RUSTYH4_DEVICE") {
            config.device = PathBuf::from(device);
        }

        Ok(config)
    }

    /// Loads the configuration from `path`, or defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    fn config_path() -> Result<PathBuf> {
        if let Ok(path) = env::var("RUSTYH4_CONFIG") {
            return Ok(PathBuf::from(path));
        }

        let config_dir = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
            PathBuf::from(config_home)
        } else if let Ok(home) = env::var("HOME") {
            PathBuf::from(home).join(".config")
        } else {
            return Err(DaemonError::ConfigDirNotFound);
        };

        Ok(config_dir.join("rustyh4").join("config.toml"))
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}
