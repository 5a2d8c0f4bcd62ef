//! Layered settings for the CLI: an optional TOML file under `BAM_*`
//! environment overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

/// Default relay endpoint.
const DEFAULT_RELAY_URL: &str = "ws://localhost:3000/socket/";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// WebSocket endpoint of the relay.
    pub relay_url: String,
    /// Access key presented to the relay; validated there, not here.
    pub access_key: String,
    /// Group to negotiate in.
    pub group_key: Option<String>,
    pub job: JobSettings,
    pub machine: MachineSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    /// Seconds a submitted job stays available before giving up.
    pub timeout_secs: u64,
    /// Material offered with the job details.
    pub material: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MachineSettings {
    /// Ultimaker hostname or IP for the networked driver.
    pub ultimaker_host: Option<String>,
    /// Baud rate hint for embedders opening a serial printer port.
    pub baud_rate: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            access_key: "socket-key".to_string(),
            group_key: Some("test-group".to_string()),
            job: JobSettings::default(),
            machine: MachineSettings::default(),
        }
    }
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            material: "PLA".to_string(),
        }
    }
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            ultimaker_host: None,
            baud_rate: 115_200,
        }
    }
}

impl Settings {
    /// Load from `path` (or the default config location) with `BAM_*`
    /// environment overrides; a missing file just means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_path(),
        };

        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        builder = builder.add_source(Environment::with_prefix("BAM").separator("__"));

        builder
            .build()
            .context("loading settings")?
            .try_deserialize()
            .context("parsing settings")
    }

    fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("bam").join("config.toml"))
    }
}
