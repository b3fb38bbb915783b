//! External-table storage: one row per document.
//!
//! The SQL itself lives outside this crate. [`TableBackend`] is the
//! capability a database adapter implements: fetch one row, upsert one row
//! in a single statement. [`TableStorage`] turns that into the
//! [`DocStorage`] contract, computing the content hash and byte size
//! columns. [`MemoryTable`] is the in-process backend used by tests.
//!
//! Loads through this backend are *deferred*: the coordinator returns to
//! callers before the row arrives, and reconciles once it does.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::name::DocName;
use crate::storage::{content_hash, DocStorage, Loaded, StorageError};

/// Primary key of the document table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableKey {
    pub user: String,
    pub project: String,
    pub path: String,
}

/// One row of the document table.
#[derive(Debug, Clone, Default)]
pub struct TableRow {
    pub opaque_state: Option<Vec<u8>>,
    pub content_text: Option<String>,
    pub content_hash: Option<String>,
    pub byte_size: u64,
    /// Unix seconds of the last upsert.
    pub updated_at: i64,
}

/// Row-level capability a concrete database adapter provides.
///
/// `upsert` must be a single atomic statement on the backing database
/// (`INSERT … ON CONFLICT (user, project, path) DO UPDATE` or equivalent).
#[async_trait]
pub trait TableBackend: Send + Sync {
    async fn fetch(&self, key: &TableKey) -> Result<Option<TableRow>, StorageError>;
    async fn upsert(&self, key: &TableKey, row: TableRow) -> Result<(), StorageError>;
}

#[async_trait]
impl<T: TableBackend + ?Sized> TableBackend for Arc<T> {
    async fn fetch(&self, key: &TableKey) -> Result<Option<TableRow>, StorageError> {
        (**self).fetch(key).await
    }

    async fn upsert(&self, key: &TableKey, row: TableRow) -> Result<(), StorageError> {
        (**self).upsert(key, row).await
    }
}

/// Document storage over a [`TableBackend`].
pub struct TableStorage<B> {
    backend: B,
    user: String,
    project: String,
}

impl<B: TableBackend> TableStorage<B> {
    pub fn new(backend: B, user: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            backend,
            user: user.into(),
            project: project.into(),
        }
    }

    fn key(&self, name: &DocName) -> TableKey {
        TableKey {
            user: self.user.clone(),
            project: self.project.clone(),
            path: name.as_str().to_string(),
        }
    }
}

#[async_trait]
impl<B: TableBackend> DocStorage for TableStorage<B> {
    async fn load(&self, name: &DocName) -> Result<Loaded, StorageError> {
        let row = self.backend.fetch(&self.key(name)).await?;
        Ok(match row {
            Some(row) => Loaded {
                text: row.content_text,
                replica_state: row.opaque_state,
            },
            None => Loaded::default(),
        })
    }

    async fn save(
        &self,
        name: &DocName,
        text: &str,
        replica_state: Option<&[u8]>,
    ) -> Result<(), StorageError> {
        let row = TableRow {
            opaque_state: replica_state.map(|s| s.to_vec()),
            content_text: Some(text.to_string()),
            content_hash: Some(content_hash(text)),
            byte_size: text.len() as u64,
            updated_at: chrono::Utc::now().timestamp(),
        };
        self.backend.upsert(&self.key(name), row).await
    }

    fn loads_are_deferred(&self) -> bool {
        true
    }

    fn locate(&self, name: &DocName) -> String {
        format!("{}/{}/{}", self.user, self.project, name.as_str())
    }
}

/// In-memory table backend for tests and embedding.
#[derive(Default)]
pub struct MemoryTable {
    rows: Mutex<HashMap<TableKey, TableRow>>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row directly, as an out-of-band writer would.
    pub async fn seed(&self, key: TableKey, row: TableRow) {
        self.rows.lock().await.insert(key, row);
    }

    pub async fn row(&self, key: &TableKey) -> Option<TableRow> {
        self.rows.lock().await.get(key).cloned()
    }
}

#[async_trait]
impl TableBackend for MemoryTable {
    async fn fetch(&self, key: &TableKey) -> Result<Option<TableRow>, StorageError> {
        Ok(self.rows.lock().await.get(key).cloned())
    }

    async fn upsert(&self, key: &TableKey, row: TableRow) -> Result<(), StorageError> {
        self.rows.lock().await.insert(key.clone(), row);
        Ok(())
    }
}
