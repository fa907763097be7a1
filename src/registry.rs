//! Directory-to-project resolution.
//!
//! The external engine owns a read-only descriptor (`.ol-sync.json`) in every
//! linked directory. Resolution reads it, derives the project identity key,
//! and upserts the baseline state fields. Absence of tracking is a normal,
//! silent outcome; nothing here errors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Deserialize;

use crate::lock;
use crate::state::{ProjectKey, StateMap};

/// Descriptor file name, owned by the engine.
pub const DESCRIPTOR_NAME: &str = ".ol-sync.json";

/// Strip trailing slashes so equivalent endpoints compare equal.
pub fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

/// Collapse anything outside `[A-Za-z0-9._-]` into `_` for use as a path
/// component, with a fallback when nothing survives.
pub fn safe_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_was_sep = false;
    for c in value.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            out.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "remote".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Filesystem-safe label for the endpoint's host (port kept, scheme dropped).
pub fn host_label(base_url: &str) -> String {
    let rest = base_url
        .split_once("://")
        .map_or(base_url, |(_, rest)| rest);
    let host = rest.split('/').next().unwrap_or(rest);
    if host.is_empty() {
        safe_component(base_url)
    } else {
        safe_component(host)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Descriptor {
    base_url: String,
    project_id: String,
}

/// Successful resolution of a local directory.
#[derive(Debug, Clone)]
pub struct ResolvedProject {
    pub base_url: String,
    pub project_id: String,
    pub key: ProjectKey,
    pub host_label: String,
}

pub struct ProjectRegistry {
    default_base_url: String,
    cache: Mutex<HashMap<PathBuf, ProjectKey>>,
}

impl ProjectRegistry {
    pub fn new(default_base_url: String) -> Self {
        ProjectRegistry {
            default_base_url: normalize_base_url(&default_base_url),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a directory to its project identity, recording the
    /// association and upserting the baseline state entry (endpoint, project
    /// id, dir only; pending/dirty are untouched).
    pub fn resolve(&self, dir: &Path, state: &Mutex<StateMap>) -> Option<ResolvedProject> {
        let contents = std::fs::read_to_string(dir.join(DESCRIPTOR_NAME)).ok()?;
        let descriptor: Descriptor = serde_json::from_str(&contents).ok()?;

        let base_url = if descriptor.base_url.trim().is_empty() {
            self.default_base_url.clone()
        } else {
            normalize_base_url(&descriptor.base_url)
        };
        let project_id = descriptor.project_id.trim().to_string();
        if base_url.is_empty() || project_id.is_empty() {
            return None;
        }

        let key = ProjectKey::new(&base_url, &project_id);
        lock(&self.cache).insert(dir.to_path_buf(), key.clone());

        {
            let mut map = lock(state);
            let entry = map.entry(key.clone()).or_default();
            entry.base_url = base_url.clone();
            entry.project_id = project_id.clone();
            entry.dir = dir.display().to_string();
        }

        Some(ResolvedProject {
            host_label: host_label(&base_url),
            base_url,
            project_id,
            key,
        })
    }

    /// Cached key for a directory, if it has resolved before. No I/O.
    pub fn cached_key(&self, dir: &Path) -> Option<ProjectKey> {
        lock(&self.cache).get(dir).cloned()
    }

    /// Drop the cached association; the next resolve re-reads the descriptor.
    /// Call after any operation that may rewrite it (link, pull, create).
    pub fn invalidate(&self, dir: &Path) {
        lock(&self.cache).remove(dir);
    }
}
