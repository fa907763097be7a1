//! Foreground daemon entry: wires the engine, the orchestrator, the
//! background loops, and signal handling, then serializes events onto the
//! log until SIGTERM/SIGINT.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError};
use signal_hook::consts::{SIGINT, SIGTERM};

use super::shutdown;
use super::{Event, EventSink, Orchestrator};
use crate::engine::{CliEngine, Credentials};

const EVENT_POLL: Duration = Duration::from_millis(200);

/// Run the orchestrator in the foreground until a termination signal.
/// Watches are started for each of `dirs`; the poll and backup loops run
/// regardless.
pub fn run_orchestrator(settings: crate::config::Settings, dirs: &[PathBuf]) -> crate::Result<()> {
    let credentials = Credentials::from_env();
    if credentials.email.trim().is_empty() {
        tracing::warn!("no credentials in environment; engine calls may fail to authenticate");
    }
    let engine = Arc::new(CliEngine::new(settings.engine_command.clone(), credentials));

    let (events, event_rx) = EventSink::channel();
    let (guard, shutdown) = shutdown::channel();
    let orch = Arc::new(Orchestrator::new(settings, engine, events, shutdown));

    let term = Arc::new(AtomicBool::new(false));
    for signal in [SIGTERM, SIGINT] {
        signal_hook::flag::register(signal, Arc::clone(&term)).map_err(crate::Error::Signal)?;
    }

    for dir in dirs {
        orch.select_dir(dir);
        if let Err(err) = orch.start_watch(dir) {
            tracing::error!(dir = %dir.display(), %err, "failed to start watch");
        }
    }

    let poller = {
        let orch = Arc::clone(&orch);
        std::thread::spawn(move || orch.run_poll_loop())
    };
    let backup = {
        let orch = Arc::clone(&orch);
        std::thread::spawn(move || orch.run_backup_loop())
    };

    tracing::info!(
        poll_secs = orch.settings.poll_interval_secs,
        backup_secs = orch.settings.backup_interval_secs,
        "orchestrator running"
    );

    while !term.load(Ordering::Relaxed) {
        match event_rx.recv_timeout(EVENT_POLL) {
            Ok(event) => render_event(&event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    tracing::info!("shutting down");
    orch.stop_all_watches();
    drop(guard);
    let _ = poller.join();
    let _ = backup.join();
    drain_events(&event_rx);
    orch.persist_state()?;
    Ok(())
}

fn drain_events(rx: &Receiver<Event>) {
    while let Ok(event) = rx.try_recv() {
        render_event(&event);
    }
}

fn render_event(event: &Event) {
    match event {
        Event::Log { label, line } => tracing::info!(target: "olsyncd::engine", %label, "{line}"),
        Event::WatchListChanged => tracing::debug!("watch list changed"),
        Event::StateChanged => tracing::debug!("state changed"),
        Event::InboxReplaced {
            added,
            modified,
            deleted,
        } => tracing::info!(added, modified, deleted, "inbox replaced"),
    }
}
