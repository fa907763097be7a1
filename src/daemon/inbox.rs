//! Inbox reconciliation.
//!
//! Fetch replaces the single held manifest wholesale; apply consumes it
//! (without clearing) and is the only path allowed to reduce `pending`.
//! Poll-detected counts stay cumulative until the user explicitly applies;
//! nothing here runs automatically.

use std::path::Path;

use super::{Event, Orchestrator};
use crate::engine::{EngineError, InboxManifest};
use crate::lock;
use crate::registry::normalize_base_url;
use crate::state::{ProjectKey, now_rfc3339};

/// Result of a confirmed apply.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub batch_id: String,
    /// Count of added plus modified entries the engine was asked to apply.
    pub applied: usize,
    pub output: String,
}

impl Orchestrator {
    /// Fetch the remote's current differences and replace the held manifest.
    pub fn fetch_remote_changes(&self, dir: &Path) -> crate::Result<InboxManifest> {
        let base_url = self.base_url_for(dir);
        let manifest = self.engine.fetch(&base_url, dir)?;
        let (added, modified, deleted) = manifest.counts();
        *lock(&self.inbox) = Some(manifest.clone());
        self.events.emit(Event::InboxReplaced {
            added,
            modified,
            deleted,
        });
        tracing::info!(batch = %manifest.batch_id, added, modified, deleted, "inbox fetched");
        Ok(manifest)
    }

    /// Apply the held manifest last-write-wins; fetches first when none is
    /// held. On success zeroes `pending`, clears `dirty`, stamps
    /// `lastAppliedAt`, and persists immediately. The manifest stays held.
    pub fn apply_remote_changes(&self, dir: &Path) -> crate::Result<ApplyOutcome> {
        let held = lock(&self.inbox).clone();
        let manifest = match held {
            Some(manifest) if !manifest.batch_id.is_empty() => manifest,
            _ => self.fetch_remote_changes(dir)?,
        };
        if manifest.batch_id.is_empty() {
            return Err(EngineError::EmptyBatch { subcommand: "fetch" }.into());
        }

        let base_url = if manifest.base_url.is_empty() {
            self.base_url_for(dir)
        } else {
            normalize_base_url(&manifest.base_url)
        };
        let output = self.engine.apply(&base_url, dir, &manifest.batch_id)?;

        let project_id = if manifest.project_id.is_empty() {
            self.registry
                .resolve(dir, &self.state)
                .map(|r| r.project_id)
                .unwrap_or_default()
        } else {
            manifest.project_id.clone()
        };
        if !project_id.is_empty() {
            let key = ProjectKey::new(&base_url, &project_id);
            {
                let mut state = lock(&self.state);
                let entry = state.entry(key).or_default();
                entry.base_url = base_url;
                entry.project_id = project_id;
                entry.pending = 0;
                entry.dirty = false;
                entry.last_applied_at = Some(now_rfc3339());
            }
            self.persist_state()?;
            self.events.emit(Event::StateChanged);
        }

        let (added, modified, _) = manifest.counts();
        Ok(ApplyOutcome {
            batch_id: manifest.batch_id,
            applied: added + modified,
            output,
        })
    }

    /// The most recently fetched manifest, if any.
    pub fn inbox_manifest(&self) -> Option<InboxManifest> {
        lock(&self.inbox).clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::engine::InboxChanges;
    use crate::test_harness::{ScriptedEngine, test_orchestrator, write_descriptor};

    fn manifest(batch: &str) -> InboxManifest {
        InboxManifest {
            batch_id: batch.into(),
            inbox_dir: "/tmp/inbox".into(),
            changes: InboxChanges {
                added: vec!["new.tex".into()],
                modified: vec![],
                deleted: vec![],
            },
            base_url: "http://localhost".into(),
            project_id: "p1".into(),
        }
    }

    fn key() -> ProjectKey {
        ProjectKey::new("http://localhost", "p1")
    }

    #[test]
    fn fetch_replaces_manifest_wholesale() {
        let tmp = TempDir::new().expect("tempdir");
        let engine = Arc::new(ScriptedEngine::new());
        let (orch, _events, _guard) = test_orchestrator(tmp.path(), engine.clone());
        let project = tmp.path().join("proj");
        std::fs::create_dir_all(&project).expect("mkdir");
        write_descriptor(&project, "http://localhost", "p1");

        engine.script_fetch(Ok(manifest("b-1")));
        engine.script_fetch(Ok(manifest("b-2")));
        orch.fetch_remote_changes(&project).expect("fetch");
        assert_eq!(orch.inbox_manifest().expect("held").batch_id, "b-1");
        orch.fetch_remote_changes(&project).expect("fetch");
        assert_eq!(orch.inbox_manifest().expect("held").batch_id, "b-2");
    }

    #[test]
    fn apply_zeroes_pending_and_keeps_manifest() {
        let tmp = TempDir::new().expect("tempdir");
        let engine = Arc::new(ScriptedEngine::new());
        let (orch, _events, _guard) = test_orchestrator(tmp.path(), engine.clone());
        let project = tmp.path().join("proj");
        std::fs::create_dir_all(&project).expect("mkdir");
        write_descriptor(&project, "http://localhost", "p1");

        {
            let mut state = orch.state.lock().expect("lock");
            let entry = state.entry(key()).or_default();
            entry.pending = 4;
            entry.dirty = true;
        }

        engine.script_fetch(Ok(manifest("b-1")));
        engine.script_apply(Ok("applied".into()));
        let outcome = orch.apply_remote_changes(&project).expect("apply");
        assert_eq!(outcome.batch_id, "b-1");
        assert_eq!(outcome.applied, 1);

        let state = orch.state_snapshot();
        let entry = state.get(&key()).expect("entry");
        assert_eq!(entry.pending, 0);
        assert!(!entry.dirty);
        assert!(entry.last_applied_at.is_some());
        assert!(orch.inbox_manifest().is_some(), "apply does not clear slot");

        // Zeroing was persisted immediately.
        let reloaded = crate::state::StateStore::new(orch.settings.state_path()).load();
        assert_eq!(reloaded.get(&key()).expect("entry").pending, 0);
    }

    #[test]
    fn failed_apply_mutates_nothing() {
        let tmp = TempDir::new().expect("tempdir");
        let engine = Arc::new(ScriptedEngine::new());
        let (orch, _events, _guard) = test_orchestrator(tmp.path(), engine.clone());
        let project = tmp.path().join("proj");
        std::fs::create_dir_all(&project).expect("mkdir");
        write_descriptor(&project, "http://localhost", "p1");

        {
            let mut state = orch.state.lock().expect("lock");
            state.entry(key()).or_default().pending = 2;
        }

        engine.script_fetch(Ok(manifest("b-1")));
        engine.script_apply(Err(EngineError::Failed {
            subcommand: "apply",
            code: Some(1),
            diagnostic: "conflict".into(),
        }));
        assert!(orch.apply_remote_changes(&project).is_err());
        assert_eq!(orch.state_snapshot().get(&key()).expect("entry").pending, 2);
    }

    #[test]
    fn apply_without_manifest_fetches_first() {
        let tmp = TempDir::new().expect("tempdir");
        let engine = Arc::new(ScriptedEngine::new());
        let (orch, _events, _guard) = test_orchestrator(tmp.path(), engine.clone());
        let project = tmp.path().join("proj");
        std::fs::create_dir_all(&project).expect("mkdir");
        write_descriptor(&project, "http://localhost", "p1");

        engine.script_fetch(Ok(manifest("b-9")));
        engine.script_apply(Ok(String::new()));
        let outcome = orch.apply_remote_changes(&project).expect("apply");
        assert_eq!(outcome.batch_id, "b-9");
        let calls = engine.calls();
        assert!(calls.iter().any(|c| c.starts_with("fetch ")));
        assert!(calls.iter().any(|c| c.starts_with("apply ")));
    }
}
