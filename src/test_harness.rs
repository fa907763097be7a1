//! Shared fixtures for unit and integration tests: a scripted engine fake
//! and a pre-wired orchestrator backed by a temp directory.
//!
//! Not part of the public API.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Child;
use std::sync::{Arc, Mutex};

use crossbeam::channel::Receiver;

use crate::config::Settings;
use crate::daemon::{Event, EventSink, Orchestrator, ShutdownGuard, shutdown};
use crate::engine::{
    CreateOutcome, Engine, EngineError, InboxManifest, PushOptions, RemoteProject,
};
use crate::lock;
use crate::registry::DESCRIPTOR_NAME;

/// Engine fake driven by scripted responses. Each `script_*` call queues one
/// response; when a queue is empty the call succeeds with an empty result.
/// Every invocation is recorded for call-order assertions.
#[derive(Default)]
pub struct ScriptedEngine {
    calls: Mutex<Vec<String>>,
    projects: Mutex<VecDeque<Result<Vec<RemoteProject>, EngineError>>>,
    pushes: Mutex<VecDeque<Result<String, EngineError>>>,
    fetches: Mutex<VecDeque<Result<InboxManifest, EngineError>>>,
    applies: Mutex<VecDeque<Result<String, EngineError>>>,
    creates: Mutex<VecDeque<Result<CreateOutcome, EngineError>>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        ScriptedEngine::default()
    }

    pub fn script_projects(&self, response: Result<Vec<RemoteProject>, EngineError>) {
        lock(&self.projects).push_back(response);
    }

    pub fn script_push(&self, response: Result<String, EngineError>) {
        lock(&self.pushes).push_back(response);
    }

    pub fn script_fetch(&self, response: Result<InboxManifest, EngineError>) {
        lock(&self.fetches).push_back(response);
    }

    pub fn script_apply(&self, response: Result<String, EngineError>) {
        lock(&self.applies).push_back(response);
    }

    pub fn script_create(&self, response: Result<CreateOutcome, EngineError>) {
        lock(&self.creates).push_back(response);
    }

    /// Invocations so far, oldest first, formatted `<subcommand> <args...>`.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn record(&self, call: String) {
        lock(&self.calls).push(call);
    }
}

impl Engine for ScriptedEngine {
    fn projects(
        &self,
        base_url: &str,
        active_only: bool,
    ) -> Result<Vec<RemoteProject>, EngineError> {
        self.record(format!("projects {base_url} active_only={active_only}"));
        lock(&self.projects).pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }

    fn link(
        &self,
        base_url: &str,
        project_id: &str,
        dir: &Path,
        force: bool,
    ) -> Result<String, EngineError> {
        self.record(format!(
            "link {base_url} {project_id} {} force={force}",
            dir.display()
        ));
        Ok(String::new())
    }

    fn push(
        &self,
        base_url: &str,
        dir: &Path,
        options: &PushOptions,
    ) -> Result<String, EngineError> {
        self.record(format!(
            "push {base_url} {} dry_run={}",
            dir.display(),
            options.dry_run
        ));
        lock(&self.pushes)
            .pop_front()
            .unwrap_or_else(|| Ok(String::new()))
    }

    fn pull(&self, base_url: &str, project_id: &str, dir: &Path) -> Result<String, EngineError> {
        self.record(format!("pull {base_url} {project_id} {}", dir.display()));
        Ok(String::new())
    }

    fn create(
        &self,
        base_url: &str,
        dir: &Path,
        name: &str,
        force: bool,
    ) -> Result<CreateOutcome, EngineError> {
        self.record(format!(
            "create {base_url} {} name={name} force={force}",
            dir.display()
        ));
        lock(&self.creates).pop_front().unwrap_or_else(|| {
            Ok(CreateOutcome {
                project_id: None,
                output: String::new(),
            })
        })
    }

    fn fetch(&self, base_url: &str, dir: &Path) -> Result<InboxManifest, EngineError> {
        self.record(format!("fetch {base_url} {}", dir.display()));
        lock(&self.fetches)
            .pop_front()
            .unwrap_or_else(|| Ok(InboxManifest::default()))
    }

    fn apply(&self, base_url: &str, dir: &Path, batch_id: &str) -> Result<String, EngineError> {
        self.record(format!("apply {base_url} {} {batch_id}", dir.display()));
        lock(&self.applies)
            .pop_front()
            .unwrap_or_else(|| Ok(String::new()))
    }

    fn spawn_watch(&self, base_url: &str, dir: &Path) -> Result<Child, EngineError> {
        self.record(format!("watch {base_url} {}", dir.display()));
        Err(EngineError::Launch {
            program: "scripted".to_string(),
            source: std::io::Error::other("scripted engine cannot spawn"),
        })
    }
}

/// Orchestrator with state and backups rooted under `tmp`, plus the event
/// receiver and the shutdown guard that keeps its loops runnable.
pub fn test_orchestrator(
    tmp: &Path,
    engine: Arc<dyn Engine>,
) -> (Arc<Orchestrator>, Receiver<Event>, ShutdownGuard) {
    let settings = Settings {
        state_path: Some(tmp.join("state.json")),
        backup_root: Some(tmp.join("backups")),
        ..Settings::default()
    };
    let (events, rx) = EventSink::channel();
    let (guard, shutdown) = shutdown::channel();
    let orch = Arc::new(Orchestrator::new(settings, engine, events, shutdown));
    (orch, rx, guard)
}

/// Write a `.ol-sync.json` descriptor into `dir`.
pub fn write_descriptor(dir: &Path, base_url: &str, project_id: &str) {
    let body = serde_json::json!({ "baseUrl": base_url, "projectId": project_id });
    std::fs::write(dir.join(DESCRIPTOR_NAME), body.to_string()).expect("write descriptor");
}
