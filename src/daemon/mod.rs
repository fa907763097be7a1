//! The orchestration core.
//!
//! One `Orchestrator` owns every shared table:
//! - persisted project state (poller writes pending/dirty, backup clears
//!   dirty, apply zeroes pending)
//! - per-directory dirty file sets (watch readers add, backup pass removes)
//! - the outgoing suppression table (watch readers and push/create stamp,
//!   poller reads)
//! - the live watch table (supervisor is the sole mutator)
//!
//! Each key has exactly one mutating subsystem, and no lock is held across
//! engine or file I/O, so critical sections stay short and non-blocking.

pub mod actions;
pub mod backup;
pub mod events;
pub mod inbox;
pub mod poller;
pub mod run;
pub mod shutdown;
pub mod throttle;
pub mod watch;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

pub use events::{Event, EventSink};
pub use inbox::ApplyOutcome;
pub use run::run_orchestrator;
pub use shutdown::{Shutdown, ShutdownGuard};
pub use watch::{StartWatch, WatchEntry, WatchStatus};

use crate::config::Settings;
use crate::engine::{Engine, InboxManifest};
use crate::lock;
use crate::registry::{ProjectRegistry, normalize_base_url};
use crate::state::{ProjectKey, StateMap, StateStore};
use throttle::ErrorThrottle;

pub struct Orchestrator {
    pub settings: Settings,
    pub engine: Arc<dyn Engine>,
    pub registry: ProjectRegistry,
    pub(crate) store: StateStore,

    pub(crate) state: Mutex<StateMap>,
    pub(crate) dirty: Mutex<HashMap<PathBuf, BTreeSet<String>>>,
    pub(crate) outgoing: Mutex<HashMap<ProjectKey, Instant>>,
    pub(crate) watches: Mutex<BTreeMap<PathBuf, WatchEntry>>,
    pub(crate) inbox: Mutex<Option<InboxManifest>>,
    pub(crate) selected: Mutex<Option<PathBuf>>,

    pub(crate) events: EventSink,
    pub(crate) shutdown: Shutdown,
    pub(crate) poll_errors: ErrorThrottle,
    pub(crate) backup_errors: ErrorThrottle,
}

impl Orchestrator {
    pub fn new(
        settings: Settings,
        engine: Arc<dyn Engine>,
        events: EventSink,
        shutdown: Shutdown,
    ) -> Self {
        let store = StateStore::new(settings.state_path());
        let state = Mutex::new(store.load());
        let registry = ProjectRegistry::new(settings.base_url.clone());
        Orchestrator {
            settings,
            engine,
            registry,
            store,
            state,
            dirty: Mutex::new(HashMap::new()),
            outgoing: Mutex::new(HashMap::new()),
            watches: Mutex::new(BTreeMap::new()),
            inbox: Mutex::new(None),
            selected: Mutex::new(None),
            events,
            shutdown,
            poll_errors: ErrorThrottle::default(),
            backup_errors: ErrorThrottle::default(),
        }
    }

    /// Mark a directory as the user's current focus; the poller includes it
    /// even without a live watch.
    pub fn select_dir(&self, dir: &Path) {
        *lock(&self.selected) = Some(canonicalize_dir(dir));
    }

    /// Snapshot of the persisted state mapping.
    pub fn state_snapshot(&self) -> StateMap {
        lock(&self.state).clone()
    }

    /// Sum of unreconciled remote changes across all tracked projects.
    pub fn pending_total(&self) -> u64 {
        lock(&self.state).values().map(|s| s.pending).sum()
    }

    /// Relative paths reported changed under `dir` since the last local
    /// backup pass.
    pub fn dirty_paths(&self, dir: &Path) -> Vec<String> {
        let abs = canonicalize_dir(dir);
        lock(&self.dirty)
            .get(&abs)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Endpoint to use for a directory: its descriptor's, else the default.
    pub(crate) fn base_url_for(&self, dir: &Path) -> String {
        self.registry
            .resolve(dir, &self.state)
            .map(|r| r.base_url)
            .unwrap_or_else(|| normalize_base_url(&self.settings.base_url))
    }

    /// Persist the current mapping.
    pub(crate) fn persist_state(&self) -> Result<(), crate::state::StateError> {
        let snapshot = lock(&self.state).clone();
        self.store.save(&snapshot)
    }
}

/// Absolute form of a directory; falls back to the given path when it does
/// not (yet) exist.
pub(crate) fn canonicalize_dir(dir: &Path) -> PathBuf {
    std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf())
}
