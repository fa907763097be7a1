//! Watch supervision against a real subprocess: a shell stub stands in for
//! the engine's `watch` subcommand and emits the fixed `synced ` prefix.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use olsyncd::config::Settings;
use olsyncd::daemon::{Event, EventSink, Orchestrator, StartWatch, shutdown};
use olsyncd::engine::{CliEngine, Credentials};
use olsyncd::state::ProjectKey;

fn write_stub(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("engine-stub.sh");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write stub");
    let mut perms = fs::metadata(&path).expect("stat").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod");
    path
}

fn stub_orchestrator(
    tmp: &Path,
    stub: &Path,
) -> (
    Arc<Orchestrator>,
    crossbeam::channel::Receiver<Event>,
    olsyncd::daemon::ShutdownGuard,
) {
    let settings = Settings {
        engine_command: vec![stub.display().to_string()],
        state_path: Some(tmp.join("state.json")),
        backup_root: Some(tmp.join("backups")),
        ..Settings::default()
    };
    let engine = Arc::new(CliEngine::new(
        settings.engine_command.clone(),
        Credentials::default(),
    ));
    let (events, rx) = EventSink::channel();
    let (guard, shutdown) = shutdown::channel();
    let orch = Arc::new(Orchestrator::new(settings, engine, events, shutdown));
    (orch, rx, guard)
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    false
}

#[test]
fn watch_lines_feed_dirty_set() {
    let tmp = TempDir::new().expect("tempdir");
    let stub = write_stub(
        tmp.path(),
        concat!(
            "echo 'synced main.tex'\n",
            "echo 'synced fig/plot a.png'\n",
            "echo 'watching for changes'\n",
            "sleep 30"
        ),
    );
    let (orch, _events, _guard) = stub_orchestrator(tmp.path(), &stub);

    let project = tmp.path().join("thesis");
    fs::create_dir_all(&project).expect("mkdir");
    olsyncd::test_harness::write_descriptor(&project, "http://localhost", "p1");

    match orch.start_watch(&project).expect("start") {
        StartWatch::Started { .. } => {}
        StartWatch::AlreadyRunning => panic!("fresh watch reported as running"),
    }

    assert!(
        wait_until(Duration::from_secs(5), || {
            orch.dirty_paths(&project).len() == 2
        }),
        "synced lines never reached the dirty set"
    );
    let paths = orch.dirty_paths(&project);
    assert_eq!(paths, vec!["fig/plot a.png".to_string(), "main.tex".to_string()]);

    // Non-prefixed output is forwarded but never marks anything dirty.
    assert_eq!(orch.dirty_paths(&project).len(), 2);

    orch.stop_all_watches();
}

#[test]
fn synced_line_suppresses_next_poll() {
    let tmp = TempDir::new().expect("tempdir");
    let ts_file = tmp.path().join("remote-ts");
    fs::write(&ts_file, "2024-01-01T00:00:00Z").expect("write");

    // One stub serves both subcommands: `projects` reports whatever
    // timestamp the test last wrote, `watch` reports one synced file.
    let script = format!(
        concat!(
            "if [ \"$1\" = projects ]; then\n",
            "  printf '[{{\"id\":\"p1\",\"lastUpdated\":\"%s\"}}]' \"$(cat '{ts}')\"\n",
            "  exit 0\n",
            "fi\n",
            "echo 'synced main.tex'\n",
            "sleep 30"
        ),
        ts = ts_file.display()
    );
    let stub = write_stub(tmp.path(), &script);
    let (orch, _events, _guard) = stub_orchestrator(tmp.path(), &stub);

    let project = tmp.path().join("thesis");
    fs::create_dir_all(&project).expect("mkdir");
    olsyncd::test_harness::write_descriptor(&project, "http://localhost", "p1");

    orch.start_watch(&project).expect("start");
    assert!(
        wait_until(Duration::from_secs(5), || {
            orch.dirty_paths(&project).len() == 1
        }),
        "synced line never processed"
    );

    let key = ProjectKey::new("http://localhost", "p1");
    orch.poll_remote_once().expect("poll");
    assert_eq!(orch.state_snapshot().get(&key).expect("entry").pending, 0);

    // The remote timestamp moves right after our own sync: within the
    // suppression window this is our echo, not an incoming change.
    fs::write(&ts_file, "2024-01-01T00:05:00Z").expect("write");
    orch.poll_remote_once().expect("poll");

    let state = orch.state_snapshot();
    let entry = state.get(&key).expect("entry");
    assert_eq!(entry.pending, 0, "own sync echo counted as a remote change");
    assert!(!entry.dirty);
    assert_eq!(entry.last_updated.as_deref(), Some("2024-01-01T00:05:00Z"));

    orch.stop_all_watches();
}

#[test]
fn second_start_is_a_no_op_while_running() {
    let tmp = TempDir::new().expect("tempdir");
    let stub = write_stub(tmp.path(), "sleep 30");
    let (orch, _events, _guard) = stub_orchestrator(tmp.path(), &stub);

    let project = tmp.path().join("thesis");
    fs::create_dir_all(&project).expect("mkdir");

    assert!(matches!(
        orch.start_watch(&project).expect("start"),
        StartWatch::Started { .. }
    ));
    assert!(matches!(
        orch.start_watch(&project).expect("restart"),
        StartWatch::AlreadyRunning
    ));
    assert_eq!(orch.active_watches().len(), 1);

    assert!(orch.stop_watch(&project));
    assert!(
        wait_until(Duration::from_secs(5), || orch.active_watches().is_empty()),
        "watch still listed after stop"
    );
}

#[test]
fn exited_watch_is_reaped_from_the_list() {
    let tmp = TempDir::new().expect("tempdir");
    let stub = write_stub(tmp.path(), "echo 'synced once.tex'");
    let (orch, events, _guard) = stub_orchestrator(tmp.path(), &stub);

    let project = tmp.path().join("thesis");
    fs::create_dir_all(&project).expect("mkdir");

    orch.start_watch(&project).expect("start");
    assert!(
        wait_until(Duration::from_secs(5), || orch.active_watches().is_empty()),
        "exited watch never reaped"
    );

    // The reader announced the exit before removing the entry.
    let mut saw_exit_log = false;
    while let Ok(event) = events.try_recv() {
        if let Event::Log { line, .. } = event
            && line.contains("exited")
        {
            saw_exit_log = true;
        }
    }
    assert!(saw_exit_log, "no exit log emitted");
}
