//! Orchestrator settings.
//!
//! A single TOML file under the config dir, all fields defaulted so an absent
//! file behaves like stock settings. Credentials never live here; they are
//! read from the environment and forwarded to the engine per invocation.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Default remote endpoint when a directory descriptor omits one.
    pub base_url: String,

    /// Argv of the external sync engine (program plus leading arguments).
    pub engine_command: Vec<String>,

    /// Restrict `projects` listings to non-archived, non-trashed entries.
    pub active_only: bool,

    /// Upload concurrency passed to `push`.
    pub concurrency: u32,

    pub poll_interval_secs: u64,
    pub backup_interval_secs: u64,

    /// How long after a locally-initiated change the poller treats remote
    /// timestamp movement as our own echo rather than an incoming edit.
    pub suppress_window_secs: u64,

    /// Override for the backup tree root (default: `<config dir>/backups`).
    pub backup_root: Option<PathBuf>,

    /// Override for the state file (default: `<config dir>/state.json`).
    pub state_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            base_url: "http://localhost".to_string(),
            engine_command: vec!["ol-sync".to_string()],
            active_only: true,
            concurrency: 4,
            poll_interval_secs: 30,
            backup_interval_secs: 120,
            suppress_window_secs: 90,
            backup_root: None,
            state_path: None,
        }
    }
}

impl Settings {
    /// Load settings from the config dir. A missing file yields defaults;
    /// an unreadable or malformed file is an error the caller surfaces.
    pub fn load() -> Result<Self, ConfigError> {
        let path = paths::settings_path();
        if !path.exists() {
            return Ok(Settings::default());
        }
        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_secs(self.backup_interval_secs)
    }

    pub fn suppress_window(&self) -> Duration {
        Duration::from_secs(self.suppress_window_secs)
    }

    pub fn backup_root(&self) -> PathBuf {
        self.backup_root.clone().unwrap_or_else(paths::backup_root)
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_path.clone().unwrap_or_else(paths::state_path)
    }
}
