//! Command-line front end.
//!
//! `run` hosts the long-lived orchestrator; everything else is a one-shot
//! action over a freshly built orchestrator so suppression stamps and state
//! updates behave identically in both modes.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::config::Settings;
use crate::daemon::{EventSink, Orchestrator, ShutdownGuard, shutdown};
use crate::engine::{CliEngine, Credentials};

#[derive(Parser, Debug)]
#[command(name = "olsyncd", about = "Background orchestrator for ol-sync projects", version)]
pub struct Cli {
    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the orchestrator in the foreground until SIGTERM/SIGINT.
    Run {
        /// Directories to watch from the start; repeatable.
        #[arg(long = "dir", value_name = "DIR")]
        dirs: Vec<PathBuf>,
    },

    /// List remote projects visible to the configured account.
    Projects {
        /// Include archived and trashed projects.
        #[arg(long)]
        all: bool,
    },

    /// Link a directory to an existing remote project.
    Link {
        dir: PathBuf,
        project_id: String,
        /// Overwrite a descriptor pointing at a different project.
        #[arg(long)]
        force: bool,
    },

    /// Upload local contents to the remote.
    Push {
        dir: PathBuf,
        /// Report what would change without uploading.
        #[arg(long)]
        dry_run: bool,
    },

    /// Download a remote project into a fresh child of a directory.
    Pull {
        /// Parent directory; the project lands in a new uniquely-named
        /// child, never an existing one.
        dir: PathBuf,
        project_id: String,
    },

    /// Create a remote project named after the directory.
    Create {
        dir: PathBuf,
        /// Project name; defaults to the directory name.
        #[arg(long)]
        name: Option<String>,
        /// Push the directory's current contents after creating.
        #[arg(long)]
        push: bool,
        /// Create even if the directory is already linked.
        #[arg(long)]
        force: bool,
    },

    /// Fetch the remote's pending differences without applying them.
    Fetch { dir: PathBuf },

    /// Apply fetched remote differences last-write-wins.
    Apply {
        dir: PathBuf,
        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Show tracked projects and unreconciled change counts.
    Status,
}

pub fn run(cli: Cli) -> crate::Result<()> {
    let mut settings = Settings::load()?;
    if let Command::Projects { all: true } = &cli.command {
        settings.active_only = false;
    }

    match cli.command {
        Command::Run { dirs } => crate::daemon::run_orchestrator(settings, &dirs),
        Command::Projects { .. } => {
            let (orch, _guard) = one_shot(settings);
            let projects = orch.list_projects()?;
            if projects.is_empty() {
                println!("no projects");
            }
            for p in projects {
                println!("{}  {}  (updated {})", p.id, p.name, p.last_updated);
            }
            Ok(())
        }
        Command::Link {
            dir,
            project_id,
            force,
        } => {
            let (orch, _guard) = one_shot(settings);
            print_output(&orch.link_project(&dir, &project_id, force)?);
            Ok(())
        }
        Command::Push { dir, dry_run } => {
            let (orch, _guard) = one_shot(settings);
            print_output(&orch.push_project(&dir, dry_run)?);
            Ok(())
        }
        Command::Pull { dir, project_id } => {
            let (orch, _guard) = one_shot(settings);
            let name = orch
                .list_projects()
                .ok()
                .and_then(|projects| projects.into_iter().find(|p| p.id == project_id))
                .map(|p| p.name)
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| project_id.clone())
                .replace('/', "_");
            let dest = unique_child_dir(&dir, &name);
            std::fs::create_dir_all(&dest)
                .map_err(|e| crate::Error::CreateDir(dest.clone(), e))?;
            print_output(&orch.pull_project(&dest, &project_id)?);
            println!("pulled into {}", dest.display());
            Ok(())
        }
        Command::Create {
            dir,
            name,
            push,
            force,
        } => {
            let (orch, _guard) = one_shot(settings);
            let outcome = orch.create_project(&dir, name.as_deref(), push, force)?;
            print_output(&outcome.output);
            if let Some(id) = outcome.project_id {
                println!("project id: {id}");
            }
            Ok(())
        }
        Command::Fetch { dir } => {
            let (orch, _guard) = one_shot(settings);
            let manifest = orch.fetch_remote_changes(&dir)?;
            let (added, modified, deleted) = manifest.counts();
            println!(
                "batch {}: {added} added, {modified} modified, {deleted} deleted",
                manifest.batch_id
            );
            for path in manifest.incoming_paths() {
                println!("  {path}");
            }
            Ok(())
        }
        Command::Apply { dir, yes } => {
            let (orch, _guard) = one_shot(settings);
            let manifest = orch.fetch_remote_changes(&dir)?;
            let (added, modified, deleted) = manifest.counts();
            if added + modified + deleted == 0 {
                println!("nothing to apply");
                return Ok(());
            }
            println!(
                "batch {}: {added} added, {modified} modified, {deleted} deleted",
                manifest.batch_id
            );
            if !yes && !confirm("apply these changes locally?")? {
                println!("aborted");
                return Ok(());
            }
            let outcome = orch.apply_remote_changes(&dir)?;
            println!("applied batch {} ({} files)", outcome.batch_id, outcome.applied);
            if !outcome.output.trim().is_empty() {
                print_output(&outcome.output);
            }
            Ok(())
        }
        Command::Status => {
            let (orch, _guard) = one_shot(settings);
            let state = orch.state_snapshot();
            if state.is_empty() {
                println!("no tracked projects");
            } else {
                for entry in state.values() {
                    println!(
                        "{}  {}  pending={}  dirty={}  dir={}",
                        entry.base_url, entry.project_id, entry.pending, entry.dirty, entry.dir
                    );
                }
                println!("total pending: {}", orch.pending_total());
            }
            let watches = orch.active_watches();
            if watches.is_empty() {
                println!("no active watches");
            } else {
                for watch in watches {
                    println!(
                        "watch {}  pid={}  pending={}",
                        watch.dir.display(),
                        watch.pid,
                        watch.pending
                    );
                }
            }
            Ok(())
        }
    }
}

fn one_shot(settings: Settings) -> (Arc<Orchestrator>, ShutdownGuard) {
    let engine = Arc::new(CliEngine::new(
        settings.engine_command.clone(),
        Credentials::from_env(),
    ));
    let (events, _rx) = EventSink::channel();
    let (guard, shutdown) = shutdown::channel();
    let orch = Arc::new(Orchestrator::new(settings, engine, events, shutdown));
    (orch, guard)
}

fn print_output(output: &str) {
    let trimmed = output.trim_end();
    if !trimmed.is_empty() {
        println!("{trimmed}");
    }
}

fn confirm(prompt: &str) -> crate::Result<bool> {
    print!("{prompt} [y/N] ");
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

/// First non-existing child of `parent`: `name`, then `name (1)`, `name (2)`, ...
fn unique_child_dir(parent: &Path, name: &str) -> PathBuf {
    let candidate = parent.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let mut counter = 1u32;
    loop {
        let candidate = parent.join(format!("{name} ({counter})"));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}
