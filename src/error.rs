//! Crate-level error taxonomy.
//!
//! Startup refusals are the only errors surfaced to the embedding process;
//! everything at runtime is classified and contained at the coordinator or
//! socket boundary (close codes and counters, never propagated panics).

use std::path::PathBuf;

use thiserror::Error;

use crate::name::NameError;
use crate::replica::ReplicaError;
use crate::storage::StorageError;

/// Errors surfaced by the hub API.
#[derive(Debug, Error)]
pub enum HubError {
    #[error(
        "base directory {0} is a system path; pass dangerously_allow_system_paths to proceed"
    )]
    DangerousBaseDir(PathBuf),

    #[error("another instance (pid {pid}) already serves this directory; stop it or remove {lock_path}")]
    AlreadyRunning { pid: u32, lock_path: PathBuf },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid document name: {0}")]
    Name(#[from] NameError),

    #[error("replica error: {0}")]
    Replica(#[from] ReplicaError),

    #[error("hub is shutting down")]
    ShuttingDown,
}

pub type Result<T, E = HubError> = std::result::Result<T, E>;
