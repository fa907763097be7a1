//! Incremental backups.
//!
//! Periodic loop with two passes in fixed order. The local pass copies files
//! the watch subprocesses reported as synced since the previous pass. The
//! remote pass snapshots the remote's current differences for every project
//! the poller flagged dirty, clearing the flag per project as soon as its
//! snapshot lands so a mid-loop crash leaves each project consistent.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use thiserror::Error;

use super::Orchestrator;
use crate::lock;
use crate::registry::host_label;
use crate::state::{ProjectKey, ProjectState, now_rfc3339};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BackupError {
    #[error("failed to create backup dir {0}: {1}")]
    CreateDir(PathBuf, #[source] std::io::Error),

    #[error("failed to copy {src} to {dst}: {source}")]
    Copy {
        src: PathBuf,
        dst: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Join a slash-separated relative path onto a root, component by component.
fn join_rel(root: &Path, rel: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for part in rel.split('/').filter(|p| !p.is_empty()) {
        path.push(part);
    }
    path
}

/// Copy contents plus permissions (fs::copy) and carry the source mtime over.
fn copy_with_metadata(src: &Path, dst: &Path) -> Result<(), BackupError> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| BackupError::CreateDir(parent.to_path_buf(), e))?;
    }
    let copy_err = |source| BackupError::Copy {
        src: src.to_path_buf(),
        dst: dst.to_path_buf(),
        source,
    };
    fs::copy(src, dst).map_err(copy_err)?;
    let meta = fs::metadata(src).map_err(copy_err)?;
    filetime::set_file_mtime(dst, FileTime::from_last_modification_time(&meta))
        .map_err(copy_err)?;
    Ok(())
}

/// UTC second-precision timestamp with filesystem-safe separators.
fn backup_stamp() -> String {
    use time::macros::format_description;
    time::OffsetDateTime::now_utc()
        .format(format_description!(
            "[year]-[month]-[day]T[hour]-[minute]-[second]Z"
        ))
        .unwrap_or_else(|_| "unknown".to_string())
}

impl Orchestrator {
    pub(crate) fn run_backup_loop(&self) {
        loop {
            if self.shutdown.is_triggered() {
                break;
            }
            if let Err(e) = self.backup_once()
                && self.backup_errors.admit()
            {
                tracing::warn!("backup pass failed: {e}");
                self.events.log("backup", format!("error: {e}"));
            }
            if self.shutdown.sleep(self.settings.backup_interval()) {
                break;
            }
        }
        tracing::debug!("backup loop stopped");
    }

    /// One backup cycle: local pass, then remote pass.
    pub fn backup_once(&self) -> crate::Result<()> {
        self.backup_local_pass()?;
        self.backup_remote_pass();
        Ok(())
    }

    /// Copy every dirty-flagged file still present as a regular file into a
    /// fresh timestamped snapshot, then drop exactly the copied snapshot from
    /// the live set. Paths reported mid-pass wait for the next cycle.
    fn backup_local_pass(&self) -> Result<(), BackupError> {
        let dirs: Vec<PathBuf> = lock(&self.dirty)
            .iter()
            .filter(|(_, set)| !set.is_empty())
            .map(|(dir, _)| dir.clone())
            .collect();

        for dir in dirs {
            let snapshot: BTreeSet<String> = lock(&self.dirty)
                .get(&dir)
                .cloned()
                .unwrap_or_default();
            if snapshot.is_empty() {
                continue;
            }
            let Some(resolved) = self.registry.resolve(&dir, &self.state) else {
                continue;
            };

            let dest_root = self
                .settings
                .backup_root()
                .join(&resolved.host_label)
                .join(&resolved.project_id)
                .join("local")
                .join(backup_stamp());

            let mut copied = 0usize;
            for rel in &snapshot {
                let src = join_rel(&dir, rel);
                if !src.is_file() {
                    continue;
                }
                copy_with_metadata(&src, &join_rel(&dest_root, rel))?;
                copied += 1;
            }
            if copied > 0 {
                tracing::info!(
                    project = %resolved.project_id,
                    files = copied,
                    dest = %dest_root.display(),
                    "local backup"
                );
                self.events.log(
                    "backup",
                    format!(
                        "local {} files={} -> {}",
                        resolved.project_id,
                        copied,
                        dest_root.display()
                    ),
                );
            }

            let mut dirty = lock(&self.dirty);
            if let Some(set) = dirty.get_mut(&dir) {
                for rel in &snapshot {
                    set.remove(rel);
                }
                if set.is_empty() {
                    dirty.remove(&dir);
                }
            }
        }
        Ok(())
    }

    /// Snapshot the remote differences for every dirty project. Per-project
    /// failures leave `dirty` set so the next cycle retries.
    fn backup_remote_pass(&self) {
        let dirty_projects: Vec<(ProjectKey, ProjectState)> = lock(&self.state)
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();

        for (key, entry) in dirty_projects {
            if entry.dir.is_empty() || entry.base_url.is_empty() || entry.project_id.is_empty() {
                continue;
            }

            let manifest = match self.engine.fetch(&entry.base_url, Path::new(&entry.dir)) {
                Ok(manifest) => manifest,
                Err(e) => {
                    if self.backup_errors.admit() {
                        tracing::warn!("remote backup: fetch failed for {key}: {e}");
                        self.events
                            .log("backup", format!("fetch failed for {key}: {e}"));
                    }
                    continue;
                }
            };
            if manifest.batch_id.is_empty() || manifest.inbox_dir.is_empty() {
                continue;
            }

            let dest_root = self
                .settings
                .backup_root()
                .join(host_label(&entry.base_url))
                .join(&entry.project_id)
                .join("remote")
                .join(&manifest.batch_id);

            let staging = PathBuf::from(&manifest.inbox_dir);
            let mut copied = 0usize;
            let mut failed = false;
            for rel in manifest.incoming_paths() {
                let src = join_rel(&staging, &rel);
                if !src.is_file() {
                    continue;
                }
                if let Err(e) = copy_with_metadata(&src, &join_rel(&dest_root, &rel)) {
                    if self.backup_errors.admit() {
                        tracing::warn!("remote backup: {e}");
                        self.events.log("backup", format!("error: {e}"));
                    }
                    failed = true;
                    break;
                }
                copied += 1;
            }
            if failed {
                continue; // dirty stays set; retried next cycle
            }

            {
                let mut state = lock(&self.state);
                if let Some(live) = state.get_mut(&key) {
                    live.dirty = false;
                    live.last_remote_backup_at = Some(now_rfc3339());
                }
            }
            if let Err(e) = self.persist_state() {
                if self.backup_errors.admit() {
                    tracing::warn!("remote backup: persist failed: {e}");
                }
                continue;
            }
            if copied > 0 {
                tracing::info!(
                    project = %entry.project_id,
                    files = copied,
                    dest = %dest_root.display(),
                    "remote backup"
                );
                self.events.log(
                    "backup",
                    format!(
                        "remote {} files={} -> {}",
                        entry.project_id,
                        copied,
                        dest_root.display()
                    ),
                );
            }
        }
    }
}
