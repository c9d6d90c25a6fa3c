//! Configuration file support for bwflash.
//!
//! Configuration is loaded with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (BWFLASH_*)
//! 3. Local config file (./bwflash.toml)
//! 4. Global config file (~/.config/bwflash/config.toml)

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                if let Some(global) = Self::load_from_file(&global_path) {
                    debug!("Loaded global config from {}", global_path.display());
                    config.merge(global);
                }
            }
        }

        if let Some(local) = Self::load_from_file(Path::new("bwflash.toml")) {
            debug!("Loaded local config from bwflash.toml");
            config.merge(local);
        }

        config
    }

    /// Load configuration from an explicit path.
    pub fn load_from_path(path: &Path) -> Self {
        Self::load_from_file(path).unwrap_or_else(|| {
            warn!("Could not read config from {}", path.display());
            Self::default()
        })
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        let contents = fs::read_to_string(path).ok()?;
        match toml::from_str(&contents) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("Ignoring malformed config {}: {e}", path.display());
                None
            }
        }
    }

    fn merge(&mut self, other: Self) {
        if other.connection.serial.is_some() {
            self.connection.serial = other.connection.serial;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }
    }

    /// Path of the global config file.
    pub fn global_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "scooterteam", "bwflash")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}
