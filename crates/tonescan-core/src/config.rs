//! Persisted settings
//!
//! Settings live in a JSON file, by default
//! `<config dir>/tonescan/settings.json`. A missing file means defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::protocol::{SessionConfig, COLORIMETER_VENDOR_ID};

/// Errors loading or saving settings
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Reading or writing the file failed
    #[error("Failed to access {path:?}: {source}")]
    Io {
        /// Settings file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// File is not valid settings JSON
    #[error("Invalid settings file {path:?}: {source}")]
    Parse {
        /// Settings file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },
}

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// USB vendor id used to recognize the colorimeter
    pub vendor_id: u16,

    /// Port to use instead of discovery
    pub preferred_port: Option<String>,

    /// Use the simulated device
    pub demo_mode: bool,

    /// Default tracing filter
    pub log_filter: String,

    /// Protocol timing
    pub session: SessionConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            vendor_id: COLORIMETER_VENDOR_ID,
            preferred_port: None,
            demo_mode: false,
            log_filter: "info".to_string(),
            session: SessionConfig::default(),
        }
    }
}

impl Settings {
    /// Default settings path, if the platform has a config directory
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("tonescan").join("settings.json"))
    }

    /// Load settings from `path`, or defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("No settings at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from the default location
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Write settings as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source: io::Error| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let content = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, content).map_err(io_err)
    }
}
