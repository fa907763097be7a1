//! Watch supervision.
//!
//! One external watch subprocess plus one stdout reader thread per directory.
//! The reader recognizes the engine's fixed "synced" prefix to feed the dirty
//! file set and the outgoing suppression table; every line is forwarded to
//! the log sink either way. A second thread drains stderr into the sink.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use super::{Event, Orchestrator, canonicalize_dir};
use crate::engine::SYNCED_PREFIX;
use crate::lock;

/// Outcome of a watch-start request.
#[derive(Debug)]
pub enum StartWatch {
    Started { pid: u32 },
    AlreadyRunning,
}

/// Runtime record of a live watch. Created on start, destroyed when the
/// subprocess exits or the reader reaps it.
pub struct WatchEntry {
    pub(crate) child: Child,
    pub(crate) pid: u32,
    pub(crate) reader: Option<JoinHandle<()>>,
    pub(crate) stderr_reader: Option<JoinHandle<()>>,
}

impl WatchEntry {
    fn is_running(&mut self) -> bool {
        self.child.try_wait().ok().flatten().is_none()
    }
}

/// Display snapshot of one live watch.
#[derive(Debug, Clone)]
pub struct WatchStatus {
    pub dir: PathBuf,
    pub pid: u32,
    pub pending: u64,
}

fn watch_label(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.display().to_string())
}

fn signal_term(pid: u32) {
    // Exited children make this fail; that is fine.
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

impl Orchestrator {
    /// Launch the engine in watch mode for a directory. A second start for
    /// the same resolved directory is a no-op.
    pub fn start_watch(self: &Arc<Self>, dir: &Path) -> crate::Result<StartWatch> {
        let abs = canonicalize_dir(dir);
        {
            let mut watches = lock(&self.watches);
            if let Some(entry) = watches.get_mut(&abs) {
                if entry.is_running() {
                    return Ok(StartWatch::AlreadyRunning);
                }
                watches.remove(&abs);
            }
        }

        let base_url = self.base_url_for(&abs);
        let mut child = self.engine.spawn_watch(&base_url, &abs)?;
        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let label = watch_label(&abs);

        lock(&self.watches).insert(
            abs.clone(),
            WatchEntry {
                child,
                pid,
                reader: None,
                stderr_reader: None,
            },
        );

        let reader = stdout.map(|out| {
            let orch = Arc::clone(self);
            let dir = abs.clone();
            let label = label.clone();
            std::thread::spawn(move || orch.pump_watch_stdout(dir, label, pid, out))
        });
        let stderr_reader = stderr.map(|err| {
            let orch = Arc::clone(self);
            let label = label.clone();
            std::thread::spawn(move || orch.pump_watch_stderr(label, err))
        });

        if let Some(entry) = lock(&self.watches).get_mut(&abs) {
            entry.reader = reader;
            entry.stderr_reader = stderr_reader;
        }

        self.events.log(format!("watch:{label}"), "started");
        self.events.emit(Event::WatchListChanged);
        Ok(StartWatch::Started { pid })
    }

    /// Ask the watch for a directory to terminate. Returns false (and does
    /// nothing) when no live watch exists; never an error.
    pub fn stop_watch(&self, dir: &Path) -> bool {
        let abs = canonicalize_dir(dir);
        let mut watches = lock(&self.watches);
        if let Some(entry) = watches.get_mut(&abs) {
            if entry.is_running() {
                signal_term(entry.pid);
                return true;
            }
        }
        false
    }

    /// Graceful termination request to every live watch, without waiting for
    /// exit; reader threads self-terminate when the output streams close.
    pub fn stop_all_watches(&self) {
        let mut watches = lock(&self.watches);
        for entry in watches.values_mut() {
            if entry.is_running() {
                signal_term(entry.pid);
            }
        }
    }

    /// Sorted snapshot for display; exited subprocesses are reaped here.
    pub fn active_watches(&self) -> Vec<WatchStatus> {
        let mut live: Vec<(PathBuf, u32)> = Vec::new();
        {
            let mut watches = lock(&self.watches);
            watches.retain(|_, entry| entry.is_running());
            for (dir, entry) in watches.iter() {
                live.push((dir.clone(), entry.pid));
            }
        }

        let state = lock(&self.state);
        live.into_iter()
            .map(|(dir, pid)| {
                let pending = self
                    .registry
                    .cached_key(&dir)
                    .and_then(|key| state.get(&key).map(|s| s.pending))
                    .unwrap_or(0);
                WatchStatus { dir, pid, pending }
            })
            .collect()
    }

    fn pump_watch_stdout(self: Arc<Self>, dir: PathBuf, label: String, pid: u32, out: ChildStdout) {
        for line in BufReader::new(out).lines() {
            let Ok(line) = line else { break };
            if let Some(rel) = line.strip_prefix(SYNCED_PREFIX) {
                let rel = rel.trim();
                if !rel.is_empty() {
                    lock(&self.dirty)
                        .entry(dir.clone())
                        .or_default()
                        .insert(rel.to_string());
                    let key = self.registry.cached_key(&dir).or_else(|| {
                        self.registry.resolve(&dir, &self.state).map(|r| r.key)
                    });
                    if let Some(key) = key {
                        lock(&self.outgoing).insert(key, Instant::now());
                    }
                }
            }
            tracing::debug!(watch = %label, "{line}");
            self.events.log(format!("watch:{label}"), line);
        }

        // Output stream closed: reap the subprocess and drop its entry.
        self.reap_watch(&dir, pid, &label);
    }

    /// Remove and wait the entry for `dir`, but only while it still belongs
    /// to this reader's subprocess; a stop-then-restart may have replaced it
    /// with a fresh one the stale reader must not evict.
    fn reap_watch(&self, dir: &Path, pid: u32, label: &str) {
        let entry = {
            let mut watches = lock(&self.watches);
            match watches.get(dir) {
                Some(entry) if entry.pid == pid => watches.remove(dir),
                _ => None,
            }
        };
        if let Some(mut entry) = entry {
            match entry.child.wait() {
                Ok(status) => {
                    self.events
                        .log(format!("watch:{label}"), format!("exited with {status}"));
                }
                Err(e) => {
                    self.events
                        .log(format!("watch:{label}"), format!("wait failed: {e}"));
                }
            }
        }
        self.events.emit(Event::WatchListChanged);
    }

    fn pump_watch_stderr(self: Arc<Self>, label: String, err: ChildStderr) {
        for line in BufReader::new(err).lines() {
            let Ok(line) = line else { break };
            self.events.log(format!("watch:{label}"), line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_harness::{ScriptedEngine, test_orchestrator};
    use tempfile::TempDir;

    #[test]
    fn stop_without_watch_is_noop() {
        let tmp = TempDir::new().expect("tempdir");
        let (orch, _events, _guard) =
            test_orchestrator(tmp.path(), Arc::new(ScriptedEngine::new()));
        assert!(!orch.stop_watch(Path::new("/nonexistent")));
        orch.stop_all_watches();
        assert!(orch.active_watches().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn stale_reader_leaves_replacement_entry_alone() {
        let tmp = TempDir::new().expect("tempdir");
        let (orch, _events, _guard) =
            test_orchestrator(tmp.path(), Arc::new(ScriptedEngine::new()));
        let dir = tmp.path().join("proj");

        let child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn");
        let pid = child.id();
        lock(&orch.watches).insert(
            dir.clone(),
            WatchEntry {
                child,
                pid,
                reader: None,
                stderr_reader: None,
            },
        );

        // A reader from a replaced incarnation carries the old pid; reaping
        // with it must not evict the current entry.
        orch.reap_watch(&dir, pid.wrapping_add(1), "proj");
        assert_eq!(orch.active_watches().len(), 1);

        // The matching reader still reaps normally.
        assert!(orch.stop_watch(&dir));
        orch.reap_watch(&dir, pid, "proj");
        assert!(orch.active_watches().is_empty());
    }
}
