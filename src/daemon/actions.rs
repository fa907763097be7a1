//! One-shot engine actions: listing, linking, push, pull, create.
//!
//! These run on the caller's thread; only the suppression stamp they leave
//! behind interacts with the background loops.

use std::path::Path;
use std::time::Instant;

use super::Orchestrator;
use crate::engine::{CreateOutcome, PushOptions, RemoteProject};
use crate::lock;
use crate::state::ProjectKey;

impl Orchestrator {
    /// Remote projects visible to the configured account.
    pub fn list_projects(&self) -> crate::Result<Vec<RemoteProject>> {
        let projects = self
            .engine
            .projects(&self.base_url_for_default(), self.settings.active_only)?;
        Ok(projects)
    }

    /// Write a descriptor linking `dir` to an existing remote project.
    /// `force` overwrites a descriptor pointing at a different project.
    pub fn link_project(&self, dir: &Path, project_id: &str, force: bool) -> crate::Result<String> {
        let base_url = self.base_url_for(dir);
        let output = self.engine.link(&base_url, project_id, dir, force)?;
        self.registry.invalidate(dir);
        Ok(output)
    }

    /// Push local contents to the remote. A successful push (dry-run
    /// included) stamps the suppression window so the poller does not count
    /// our own upload as a remote change.
    pub fn push_project(&self, dir: &Path, dry_run: bool) -> crate::Result<String> {
        let base_url = self.base_url_for(dir);
        let options = PushOptions {
            concurrency: self.settings.concurrency,
            dry_run,
        };
        let output = self.engine.push(&base_url, dir, &options)?;
        self.mark_outgoing(dir);
        Ok(output)
    }

    /// Pull the remote project into `dir`.
    pub fn pull_project(&self, dir: &Path, project_id: &str) -> crate::Result<String> {
        let base_url = self.base_url_for(dir);
        let output = self.engine.pull(&base_url, project_id, dir)?;
        self.registry.invalidate(dir);
        Ok(output)
    }

    /// Create a remote project, named after `dir` unless overridden, and
    /// optionally push the current contents. Creation counts as outgoing
    /// traffic either way.
    pub fn create_project(
        &self,
        dir: &Path,
        name: Option<&str>,
        push: bool,
        force: bool,
    ) -> crate::Result<CreateOutcome> {
        let base_url = self.base_url_for(dir);
        let name = match name {
            Some(name) => name.to_string(),
            None => dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "project".to_string()),
        };
        let outcome = self.engine.create(&base_url, dir, &name, force)?;
        self.registry.invalidate(dir);
        if let Some(id) = &outcome.project_id {
            let key = ProjectKey::new(&base_url, id);
            lock(&self.outgoing).insert(key, Instant::now());
        }
        if push {
            self.push_project(dir, false)?;
        }
        Ok(outcome)
    }

    /// Stamp `dir`'s project as recently-outgoing, starting the poller's
    /// self-echo suppression window.
    pub fn mark_outgoing(&self, dir: &Path) {
        if let Some(resolved) = self.registry.resolve(dir, &self.state) {
            lock(&self.outgoing).insert(resolved.key, Instant::now());
        }
    }

    fn base_url_for_default(&self) -> String {
        crate::registry::normalize_base_url(&self.settings.base_url)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::test_harness::{ScriptedEngine, test_orchestrator, write_descriptor};

    #[test]
    fn push_stamps_suppression_window() {
        let tmp = TempDir::new().expect("tempdir");
        let engine = Arc::new(ScriptedEngine::new());
        let (orch, _events, _guard) = test_orchestrator(tmp.path(), engine.clone());
        let project = tmp.path().join("proj");
        std::fs::create_dir_all(&project).expect("mkdir");
        write_descriptor(&project, "http://localhost", "p1");

        engine.script_push(Ok("pushed 3 files".into()));
        orch.push_project(&project, false).expect("push");

        let key = ProjectKey::new("http://localhost", "p1");
        assert!(orch.outgoing.lock().expect("lock").contains_key(&key));
    }

    #[test]
    fn dry_run_push_also_stamps() {
        let tmp = TempDir::new().expect("tempdir");
        let engine = Arc::new(ScriptedEngine::new());
        let (orch, _events, _guard) = test_orchestrator(tmp.path(), engine.clone());
        let project = tmp.path().join("proj");
        std::fs::create_dir_all(&project).expect("mkdir");
        write_descriptor(&project, "http://localhost", "p1");

        engine.script_push(Ok("would push 3 files".into()));
        orch.push_project(&project, true).expect("push");
        assert_eq!(orch.outgoing.lock().expect("lock").len(), 1);
    }

    #[test]
    fn failed_push_leaves_no_stamp() {
        let tmp = TempDir::new().expect("tempdir");
        let engine = Arc::new(ScriptedEngine::new());
        let (orch, _events, _guard) = test_orchestrator(tmp.path(), engine.clone());
        let project = tmp.path().join("proj");
        std::fs::create_dir_all(&project).expect("mkdir");
        write_descriptor(&project, "http://localhost", "p1");

        engine.script_push(Err(crate::engine::EngineError::Failed {
            subcommand: "push",
            code: Some(1),
            diagnostic: "auth".into(),
        }));
        assert!(orch.push_project(&project, false).is_err());
        assert!(orch.outgoing.lock().expect("lock").is_empty());
    }

    #[test]
    fn create_stamps_new_project_id() {
        let tmp = TempDir::new().expect("tempdir");
        let engine = Arc::new(ScriptedEngine::new());
        let (orch, _events, _guard) = test_orchestrator(tmp.path(), engine.clone());
        let project = tmp.path().join("proj");
        std::fs::create_dir_all(&project).expect("mkdir");

        engine.script_create(Ok(CreateOutcome {
            project_id: Some("5f1e2d3c4b5a69788766cafe".into()),
            output: "Created 5f1e2d3c4b5a69788766cafe".into(),
        }));
        let outcome = orch
            .create_project(&project, None, false, false)
            .expect("create");
        assert_eq!(
            outcome.project_id.as_deref(),
            Some("5f1e2d3c4b5a69788766cafe")
        );
        let key = ProjectKey::new("http://localhost", "5f1e2d3c4b5a69788766cafe");
        assert!(orch.outgoing.lock().expect("lock").contains_key(&key));
    }
}
