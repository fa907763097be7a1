use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::daemon::backup::BackupError;
use crate::engine::EngineError;
use crate::state::StateError;

/// Crate-level convenience error.
///
/// A thin wrapper over the per-concern errors; each variant keeps its
/// original diagnostic text so user-facing failures surface verbatim.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error("failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),

    #[error("failed to create {0}: {1}")]
    CreateDir(PathBuf, #[source] std::io::Error),
}
