#![forbid(unsafe_code)]

pub mod cli;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod error;
mod paths;
pub mod registry;
pub mod state;

#[doc(hidden)]
pub mod test_harness;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

pub use crate::engine::{CliEngine, Engine, InboxManifest, RemoteProject};
pub use crate::registry::{ProjectRegistry, ResolvedProject};
pub use crate::state::{ProjectKey, ProjectState, StateMap, StateStore};

/// Lock a mutex, recovering the guard if a panicking thread poisoned it.
/// Background loops must keep running past a single failed task.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
