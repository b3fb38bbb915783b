//! Pluggable persistence for `(document name → current text, replica state)`.
//!
//! Two backends expose the same capability:
//!
//! ```text
//! ┌──────────────┐   load/save/flush    ┌───────────────────────────────┐
//! │ Coordinator  │ ───────────────────► │ FsStorage   (text file +      │
//! │              │                      │              snapshot slot)   │
//! │              │ ◄─────────────────── │ TableStorage (row per doc)    │
//! └──────────────┘   external changes   └───────────────────────────────┘
//!                    (filesystem only)
//! ```
//!
//! The external-change stream is part of the capability: the filesystem
//! backend watches the base directory and emits `(path, text-or-error)`
//! events; the table backend simply has no stream.

pub mod fs;
pub mod table;

use std::path::PathBuf;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::name::DocName;

pub use fs::{FsStorage, FsStorageConfig};
pub use table::{MemoryTable, TableBackend, TableKey, TableRow, TableStorage};

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{path} is {size} bytes, over the {limit}-byte limit")]
    Oversize { path: PathBuf, size: u64, limit: u64 },

    #[error("corrupt stored state: {0}")]
    Corrupt(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Whatever storage currently holds for a document.
#[derive(Debug, Clone, Default)]
pub struct Loaded {
    pub text: Option<String>,
    pub replica_state: Option<Vec<u8>>,
}

/// An out-of-band modification of a watched file.
#[derive(Debug, Clone)]
pub struct ExternalChange {
    pub path: PathBuf,
    /// The file's new content, or the read error as text.
    pub text: Result<String, String>,
}

/// The storage capability.
#[async_trait]
pub trait DocStorage: Send + Sync {
    /// Read whatever is persisted. Absence is not an error.
    async fn load(&self, name: &DocName) -> Result<Loaded, StorageError>;

    /// Atomically persist text and (when given) encoded replica state.
    async fn save(
        &self,
        name: &DocName,
        text: &str,
        replica_state: Option<&[u8]>,
    ) -> Result<(), StorageError>;

    /// Identical to [`save`](Self::save); named for shutdown intent.
    async fn flush(
        &self,
        name: &DocName,
        text: &str,
        replica_state: Option<&[u8]>,
    ) -> Result<(), StorageError> {
        self.save(name, text, replica_state).await
    }

    /// Write only the crash-recovery replica state, if this backend keeps a
    /// separate snapshot slot.
    async fn write_snapshot(
        &self,
        name: &DocName,
        replica_state: &[u8],
    ) -> Result<(), StorageError> {
        let _ = (name, replica_state);
        Ok(())
    }

    /// Whether periodic snapshots make sense for this backend.
    fn supports_snapshots(&self) -> bool {
        false
    }

    /// Whether this backend resolves loads asynchronously, after clients may
    /// already be connected (the relational backend does).
    fn loads_are_deferred(&self) -> bool {
        false
    }

    /// Subscribe to out-of-band changes, when the backend can observe them.
    fn external_changes(&self) -> Option<broadcast::Receiver<ExternalChange>> {
        None
    }

    /// The text file behind a name, when the backend is file-based. Used to
    /// route external-change events back to the owning coordinator.
    fn text_path(&self, name: &DocName) -> Option<PathBuf> {
        let _ = name;
        None
    }

    /// Human-readable storage location for `/stats`.
    fn locate(&self, name: &DocName) -> String;
}

/// Hex SHA-256 of a text snapshot, the currency of `lastPersistedHash` and
/// the table backend's `content_hash` column.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// First 12 hex chars of SHA-256, used to key per-base-directory slot
/// directories in the process-private temp area.
pub fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hex_encode(&hasher.finalize());
    digest[..12].to_string()
}
