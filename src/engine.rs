//! External sync-engine adapter.
//!
//! The protocol that actually talks to the remote service lives in an
//! external command-line engine. This module is the only place that invokes
//! it: one subcommand per operation, exit code 0 for success, diagnostic text
//! surfaced verbatim on failure. `Engine` is the seam the orchestrator is
//! tested through.

use std::io;
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};

use serde::Deserialize;
use thiserror::Error;

/// Fixed stdout prefix a watch subprocess emits after syncing a file out;
/// the remainder of the line is the relative path.
pub const SYNCED_PREFIX: &str = "synced ";

const EMAIL_ENV: &str = "OVERLEAF_SYNC_EMAIL";
const PASSWORD_ENV: &str = "OVERLEAF_SYNC_PASSWORD";

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EngineError {
    #[error("failed to launch sync engine `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Non-zero exit; `diagnostic` is the engine's own text, verbatim.
    #[error("{diagnostic}")]
    Failed {
        subcommand: &'static str,
        code: Option<i32>,
        diagnostic: String,
    },

    #[error("failed to parse `{subcommand}` output: {source}")]
    Parse {
        subcommand: &'static str,
        #[source]
        source: serde_json::Error,
        output: String,
    },

    #[error("`{subcommand}` returned no usable batch id")]
    EmptyBatch { subcommand: &'static str },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RemoteProject {
    pub id: String,
    pub name: String,
    pub access_level: String,
    pub archived: bool,
    pub trashed: bool,
    pub last_updated: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModifiedEntry {
    pub path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InboxChanges {
    pub added: Vec<String>,
    pub modified: Vec<ModifiedEntry>,
    pub deleted: Vec<String>,
}

/// Description of remote-side differences awaiting user-confirmed
/// application. Replaced wholesale on each fetch.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InboxManifest {
    pub batch_id: String,
    pub inbox_dir: String,
    pub changes: InboxChanges,
    pub base_url: String,
    pub project_id: String,
}

impl InboxManifest {
    /// Relative paths of added plus modified files, deduplicated and sorted.
    pub fn incoming_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .changes
            .added
            .iter()
            .cloned()
            .chain(self.changes.modified.iter().map(|m| m.path.clone()))
            .filter(|p| !p.is_empty())
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.changes.added.len(),
            self.changes.modified.len(),
            self.changes.deleted.len(),
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn from_env() -> Self {
        Credentials {
            email: std::env::var(EMAIL_ENV).unwrap_or_default(),
            password: std::env::var(PASSWORD_ENV).unwrap_or_default(),
        }
    }

    /// Environment entries to set on the child, skipping empty values so the
    /// engine can fall back to its own credential sources.
    fn env_overrides(&self) -> Vec<(&'static str, String)> {
        let mut vars = Vec::new();
        if !self.email.trim().is_empty() {
            vars.push((EMAIL_ENV, self.email.trim().to_string()));
        }
        if !self.password.is_empty() {
            vars.push((PASSWORD_ENV, self.password.clone()));
        }
        vars
    }
}

#[derive(Debug, Clone)]
pub struct PushOptions {
    pub concurrency: u32,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct CreateOutcome {
    /// Parsed from the engine's `Created <24-hex-id>` success line.
    pub project_id: Option<String>,
    pub output: String,
}

/// Everything the orchestrator needs from the external engine.
pub trait Engine: Send + Sync {
    fn projects(&self, base_url: &str, active_only: bool)
    -> Result<Vec<RemoteProject>, EngineError>;

    fn link(
        &self,
        base_url: &str,
        project_id: &str,
        dir: &Path,
        force: bool,
    ) -> Result<String, EngineError>;

    fn push(&self, base_url: &str, dir: &Path, options: &PushOptions)
    -> Result<String, EngineError>;

    fn pull(&self, base_url: &str, project_id: &str, dir: &Path) -> Result<String, EngineError>;

    fn create(
        &self,
        base_url: &str,
        dir: &Path,
        name: &str,
        force: bool,
    ) -> Result<CreateOutcome, EngineError>;

    fn fetch(&self, base_url: &str, dir: &Path) -> Result<InboxManifest, EngineError>;

    fn apply(&self, base_url: &str, dir: &Path, batch_id: &str) -> Result<String, EngineError>;

    /// Long-running watch subprocess with piped stdout/stderr.
    fn spawn_watch(&self, base_url: &str, dir: &Path) -> Result<Child, EngineError>;
}

/// Extract the project id from a `Created <24-hex-id>` line, anywhere in the
/// output, case-insensitive on the keyword.
pub fn parse_created_id(output: &str) -> Option<String> {
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.len() < 7 || !trimmed[..7].eq_ignore_ascii_case("created") {
            continue;
        }
        let id = trimmed[7..].trim();
        if id.len() == 24 && id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Some(id.to_ascii_lowercase());
        }
    }
    None
}

/// Runs the external engine binary, forwarding credentials via environment.
pub struct CliEngine {
    program: String,
    prefix_args: Vec<String>,
    credentials: Credentials,
}

impl CliEngine {
    /// `argv` is the engine invocation: program plus any leading arguments
    /// (for engines launched through an interpreter).
    pub fn new(argv: Vec<String>, credentials: Credentials) -> Self {
        let mut iter = argv.into_iter();
        let program = iter.next().unwrap_or_else(|| "ol-sync".to_string());
        CliEngine {
            program,
            prefix_args: iter.collect(),
            credentials,
        }
    }

    fn command(&self, subcommand: &'static str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.prefix_args);
        cmd.arg(subcommand);
        for (name, value) in self.credentials.env_overrides() {
            cmd.env(name, value);
        }
        cmd
    }

    fn run(&self, mut cmd: Command, subcommand: &'static str) -> Result<Output, EngineError> {
        let output = cmd.output().map_err(|source| EngineError::Launch {
            program: self.program.clone(),
            source,
        })?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(EngineError::Failed {
                subcommand,
                code: output.status.code(),
                diagnostic: diagnostic_text(&output, subcommand),
            })
        }
    }
}

/// Failure text for the user: stderr first, stdout as fallback.
fn diagnostic_text(output: &Output, subcommand: &str) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let text = if stderr.trim().is_empty() {
        stdout.trim()
    } else {
        stderr.trim()
    };
    if text.is_empty() {
        format!("{subcommand} failed with {}", output.status)
    } else {
        text.to_string()
    }
}

fn stdout_text(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    if stdout.trim().is_empty() {
        String::from_utf8_lossy(&output.stderr).trim().to_string()
    } else {
        stdout.trim().to_string()
    }
}

fn parse_json<T: for<'de> Deserialize<'de>>(
    output: &Output,
    subcommand: &'static str,
) -> Result<T, EngineError> {
    let text = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(&text).map_err(|source| EngineError::Parse {
        subcommand,
        source,
        output: text.into_owned(),
    })
}

impl Engine for CliEngine {
    fn projects(
        &self,
        base_url: &str,
        active_only: bool,
    ) -> Result<Vec<RemoteProject>, EngineError> {
        let mut cmd = self.command("projects");
        cmd.args(["--base-url", base_url]);
        if active_only {
            cmd.arg("--active-only");
        }
        cmd.arg("--json");
        let output = self.run(cmd, "projects")?;
        parse_json(&output, "projects")
    }

    fn link(
        &self,
        base_url: &str,
        project_id: &str,
        dir: &Path,
        force: bool,
    ) -> Result<String, EngineError> {
        let mut cmd = self.command("link");
        cmd.args(["--base-url", base_url, "--project-id", project_id]);
        cmd.arg("--dir").arg(dir);
        if force {
            cmd.arg("--force");
        }
        Ok(stdout_text(&self.run(cmd, "link")?))
    }

    fn push(
        &self,
        base_url: &str,
        dir: &Path,
        options: &PushOptions,
    ) -> Result<String, EngineError> {
        let mut cmd = self.command("push");
        cmd.args(["--base-url", base_url]);
        cmd.arg("--dir").arg(dir);
        cmd.args(["--concurrency", &options.concurrency.to_string()]);
        if options.dry_run {
            cmd.arg("--dry-run");
        }
        Ok(stdout_text(&self.run(cmd, "push")?))
    }

    fn pull(&self, base_url: &str, project_id: &str, dir: &Path) -> Result<String, EngineError> {
        let mut cmd = self.command("pull");
        cmd.args(["--base-url", base_url, "--project-id", project_id]);
        cmd.arg("--dir").arg(dir);
        Ok(stdout_text(&self.run(cmd, "pull")?))
    }

    fn create(
        &self,
        base_url: &str,
        dir: &Path,
        name: &str,
        force: bool,
    ) -> Result<CreateOutcome, EngineError> {
        let mut cmd = self.command("create");
        cmd.args(["--base-url", base_url]);
        cmd.arg("--dir").arg(dir);
        cmd.args(["--name", name]);
        if force {
            cmd.arg("--force");
        }
        let text = stdout_text(&self.run(cmd, "create")?);
        Ok(CreateOutcome {
            project_id: parse_created_id(&text),
            output: text,
        })
    }

    fn fetch(&self, base_url: &str, dir: &Path) -> Result<InboxManifest, EngineError> {
        let mut cmd = self.command("fetch");
        cmd.args(["--base-url", base_url]);
        cmd.arg("--dir").arg(dir);
        cmd.arg("--json");
        let output = self.run(cmd, "fetch")?;
        parse_json(&output, "fetch")
    }

    fn apply(&self, base_url: &str, dir: &Path, batch_id: &str) -> Result<String, EngineError> {
        let mut cmd = self.command("apply");
        cmd.args(["--base-url", base_url]);
        cmd.arg("--dir").arg(dir);
        cmd.args(["--batch", batch_id]);
        Ok(stdout_text(&self.run(cmd, "apply")?))
    }

    fn spawn_watch(&self, base_url: &str, dir: &Path) -> Result<Child, EngineError> {
        let mut cmd = self.command("watch");
        cmd.args(["--base-url", base_url]);
        cmd.arg("--dir").arg(dir);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.spawn().map_err(|source| EngineError::Launch {
            program: self.program.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_id_parses_success_line() {
        let out = "linking...\nCreated 5f3a9b8c7d6e5f4a3b2c1d0e\ndone";
        assert_eq!(
            parse_created_id(out).as_deref(),
            Some("5f3a9b8c7d6e5f4a3b2c1d0e")
        );
    }

    #[test]
    fn created_id_is_case_insensitive_and_lowercased() {
        assert_eq!(
            parse_created_id("created 5F3A9B8C7D6E5F4A3B2C1D0E").as_deref(),
            Some("5f3a9b8c7d6e5f4a3b2c1d0e")
        );
    }

    #[test]
    fn created_id_rejects_wrong_shapes() {
        assert!(parse_created_id("Created 1234").is_none());
        assert!(parse_created_id("Created xyzxyzxyzxyzxyzxyzxyzxyz").is_none());
        assert!(parse_created_id("Recreated 5f3a9b8c7d6e5f4a3b2c1d0e").is_none());
        assert!(parse_created_id("").is_none());
    }

    #[test]
    fn manifest_decodes_engine_json() {
        let json = r#"{
            "batchId": "b-17",
            "inboxDir": "/tmp/inbox/b-17",
            "changes": {
                "added": ["new.tex"],
                "modified": [{"path": "main.tex"}],
                "deleted": ["old.tex"]
            },
            "baseUrl": "http://localhost",
            "projectId": "abc"
        }"#;
        let manifest: InboxManifest = serde_json::from_str(json).expect("decode");
        assert_eq!(manifest.batch_id, "b-17");
        assert_eq!(manifest.counts(), (1, 1, 1));
        assert_eq!(manifest.incoming_paths(), vec!["main.tex", "new.tex"]);
    }

    #[test]
    fn manifest_tolerates_missing_fields() {
        let manifest: InboxManifest = serde_json::from_str("{}").expect("decode");
        assert!(manifest.batch_id.is_empty());
        assert!(manifest.incoming_paths().is_empty());
    }

    #[test]
    fn projects_decode_with_partial_fields() {
        let json = r#"[{"id":"p1","lastUpdated":"2024-01-01T00:00:00Z"},{"name":"x"}]"#;
        let projects: Vec<RemoteProject> = serde_json::from_str(json).expect("decode");
        assert_eq!(projects[0].id, "p1");
        assert!(projects[1].id.is_empty());
    }

    #[test]
    fn empty_credentials_set_nothing() {
        assert!(Credentials::default().env_overrides().is_empty());
        let creds = Credentials {
            email: "  ".into(),
            password: String::new(),
        };
        assert!(creds.env_overrides().is_empty());
    }

    #[test]
    fn credentials_trim_email_only() {
        let creds = Credentials {
            email: " a@b.c ".into(),
            password: "p w".into(),
        };
        let vars = creds.env_overrides();
        assert_eq!(vars.len(), 2);
        assert_eq!(vars[0], (EMAIL_ENV, "a@b.c".to_string()));
        assert_eq!(vars[1], (PASSWORD_ENV, "p w".to_string()));
    }
}
