//! Remote-change detection.
//!
//! Periodic loop: resolve the directories of interest, query each distinct
//! endpoint once, and compare remote-reported last-updated stamps against the
//! stored ones. Movement inside the suppression window is our own write
//! echoed back, not an incoming change.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;

use super::{Event, Orchestrator};
use crate::lock;
use crate::state::{ProjectKey, now_rfc3339};

struct TrackedDir {
    base_url: String,
    project_id: String,
    dir: PathBuf,
}

impl Orchestrator {
    pub(crate) fn run_poll_loop(&self) {
        loop {
            if self.shutdown.is_triggered() {
                break;
            }
            if let Err(e) = self.poll_remote_once()
                && self.poll_errors.admit()
            {
                tracing::warn!("remote poll failed: {e}");
                self.events.log("poll", format!("error: {e}"));
            }
            if self.shutdown.sleep(self.settings.poll_interval()) {
                break;
            }
        }
        tracing::debug!("remote poll loop stopped");
    }

    /// One poll cycle. Endpoint failures are handled (and throttled) inside;
    /// the returned error is reserved for a failed state persist.
    pub fn poll_remote_once(&self) -> crate::Result<()> {
        let mut dirs: BTreeSet<PathBuf> = lock(&self.watches).keys().cloned().collect();
        if let Some(selected) = lock(&self.selected).clone() {
            dirs.insert(selected);
        }

        // Unresolved directories drop out for this cycle only.
        let mut tracked: BTreeMap<ProjectKey, TrackedDir> = BTreeMap::new();
        for dir in dirs {
            if let Some(r) = self.registry.resolve(&dir, &self.state) {
                tracked.insert(
                    r.key,
                    TrackedDir {
                        base_url: r.base_url,
                        project_id: r.project_id,
                        dir,
                    },
                );
            }
        }
        if tracked.is_empty() {
            return Ok(());
        }

        let bases: BTreeSet<String> = tracked.values().map(|t| t.base_url.clone()).collect();
        let window = self.settings.suppress_window();
        let mut changed = false;

        for base in bases {
            let projects = match self.engine.projects(&base, false) {
                Ok(projects) => projects,
                Err(e) => {
                    if self.poll_errors.admit() {
                        tracing::warn!("remote poll: projects query failed for {base}: {e}");
                        self.events
                            .log("poll", format!("projects query failed for {base}: {e}"));
                    }
                    continue;
                }
            };
            let id_to_last: HashMap<&str, &str> = projects
                .iter()
                .filter(|p| !p.id.is_empty() && !p.last_updated.is_empty())
                .map(|p| (p.id.as_str(), p.last_updated.as_str()))
                .collect();

            // Evaluate suppression up front so the state lock stays innermost
            // and is never held while another table is taken.
            let recently_outgoing: HashSet<ProjectKey> = {
                let outgoing = lock(&self.outgoing);
                tracked
                    .keys()
                    .filter(|key| outgoing.get(key).is_some_and(|at| at.elapsed() <= window))
                    .cloned()
                    .collect()
            };

            let now_iso = now_rfc3339();
            let mut state = lock(&self.state);
            for (key, info) in tracked.iter().filter(|(_, t)| t.base_url == base) {
                let Some(&last) = id_to_last.get(info.project_id.as_str()) else {
                    continue;
                };
                let entry = state.entry(key.clone()).or_default();
                entry.base_url = info.base_url.clone();
                entry.project_id = info.project_id.clone();
                entry.dir = info.dir.display().to_string();
                entry.last_checked_at = Some(now_iso.clone());

                let prev = entry.last_updated.clone().unwrap_or_default();
                if prev.is_empty() {
                    // First observation establishes the baseline, never pending.
                    entry.last_updated = Some(last.to_string());
                    changed = true;
                    continue;
                }
                if prev == last {
                    continue;
                }

                entry.last_updated = Some(last.to_string());
                if recently_outgoing.contains(key) {
                    changed = true;
                    continue;
                }

                entry.pending += 1;
                entry.dirty = true;
                entry.last_changed_at = Some(now_rfc3339());
                changed = true;
            }
        }

        if changed {
            self.persist_state()?;
            self.events.emit(Event::StateChanged);
        }
        Ok(())
    }
}
