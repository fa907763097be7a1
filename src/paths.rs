//! XDG directory helpers for config/state/backup locations.

use std::path::PathBuf;

/// Base directory for configuration and orchestrator state.
///
/// Uses `OLSYNCD_CONFIG_DIR` if set, otherwise `$XDG_CONFIG_HOME/olsyncd` or
/// `~/.config/olsyncd`.
pub(crate) fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("OLSYNCD_CONFIG_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("olsyncd")
}

/// Settings file path (config.toml).
pub(crate) fn settings_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Orchestrator state file path (state.json).
pub(crate) fn state_path() -> PathBuf {
    config_dir().join("state.json")
}

/// Root of the incremental backup tree.
pub(crate) fn backup_root() -> PathBuf {
    config_dir().join("backups")
}
