//! Durable orchestration state.
//!
//! One JSON object keyed by project identity. Load never fails (anything
//! unreadable is an empty map); save is an atomic replace with owner-only
//! permissions, so a reader racing a writer sees either the prior or the new
//! complete content.
//!
//! The store does not arbitrate concurrent writers: each `ProjectState` field
//! has exactly one mutating subsystem (poller increments `pending`, backup
//! clears `dirty`, apply zeroes both).

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::registry::normalize_base_url;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StateError {
    #[error("failed to create state dir {0}: {1}")]
    CreateDir(PathBuf, #[source] std::io::Error),

    #[error("failed to stage state file in {0}: {1}")]
    Stage(PathBuf, #[source] std::io::Error),

    #[error("failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to replace {0}: {1}")]
    Replace(PathBuf, #[source] std::io::Error),
}

/// Stable identity for a tracked project, independent of local directory:
/// normalized remote endpoint plus remote project id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectKey(String);

impl ProjectKey {
    pub fn new(base_url: &str, project_id: &str) -> Self {
        ProjectKey(format!("{}|{}", normalize_base_url(base_url), project_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted per-project record. Wire names are camelCase to match the
/// engine's JSON ecosystem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProjectState {
    pub base_url: String,
    pub project_id: String,
    pub dir: String,

    /// Remote-reported last-updated timestamp, verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<String>,

    /// Remote-side changes observed but not yet reconciled via apply.
    /// Non-decreasing except a successful apply, which sets exactly 0.
    pub pending: u64,

    /// A remote snapshot backup is owed.
    pub dirty: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_changed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_remote_backup_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_applied_at: Option<String>,
}

pub type StateMap = BTreeMap<ProjectKey, ProjectState>;

/// Current wall-clock time as an RFC 3339 string.
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        StateStore { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the full mapping. Absent, unreadable, or malformed content all
    /// yield an empty map; tracking simply restarts from the next poll.
    pub fn load(&self) -> StateMap {
        let Ok(contents) = fs::read_to_string(&self.path) else {
            return StateMap::new();
        };
        serde_json::from_str(&contents).unwrap_or_default()
    }

    /// Serialize the full mapping to a fresh temp file in the target's
    /// directory, atomically replace the target, then restrict permissions
    /// to the owner.
    pub fn save(&self, map: &StateMap) -> Result<(), StateError> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        fs::create_dir_all(parent)
            .map_err(|e| StateError::CreateDir(parent.to_path_buf(), e))?;

        let mut temp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| StateError::Stage(parent.to_path_buf(), e))?;
        serde_json::to_writer_pretty(&mut temp, map)?;
        temp.write_all(b"\n")
            .map_err(|e| StateError::Stage(parent.to_path_buf(), e))?;
        temp.persist(&self.path)
            .map_err(|e| StateError::Replace(self.path.clone(), e.error))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600));
        }
        Ok(())
    }
}
