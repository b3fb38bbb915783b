//! # mrmd-sync — real-time collaborative synchronization hub
//!
//! Multiple remote editors speak a framed CRDT protocol over WebSocket; the
//! hub mediates their updates per document, persists the rendered text to a
//! pluggable backing store, and feeds out-of-band edits of that store back
//! into the live replica.
//!
//! ## Architecture
//!
//! ```text
//! Client A ──┐
//!            ├── SyncHub ── DocCoordinator (per document)
//! Client B ──┘                 │
//!                              ├── Replica (CRDT, "content" register)
//!                              ├── PresenceState (cursors, broadcast only)
//!                              ├── debounce ──► DocStorage
//!                              │                 ├── FsStorage (+ watcher)
//!                              │                 └── TableStorage
//!                              └── snapshot slot (crash recovery)
//! ```
//!
//! The same TCP port serves the control plane (`/health`, `/healthz`,
//! `/metrics`, `/stats`) and the document socket upgrade; any other path
//! names a document.
//!
//! ## Modules
//!
//! - [`protocol`] — varuint-framed binary wire protocol
//! - [`replica`] — CRDT replica wrapper (one `content` text register)
//! - [`presence`] — per-document presence map and wire codec
//! - [`diff`] — code-point edit scripts for external reconciliation
//! - [`storage`] — the storage capability: filesystem and table backends
//! - [`watch`] — debounced filesystem change stream
//! - [`coordinator`] — per-document owner of replica, clients, and timers
//! - [`hub`] — socket multiplexing, admission control, control plane
//! - [`client`] — programmatic client used by embedders and tests
//! - [`lock`] — single-instance lock per base directory
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use mrmd_sync::{HubConfig, SyncHub};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hub = SyncHub::new(HubConfig {
//!         dir: "/srv/docs".into(),
//!         port: 9090,
//!         ..HubConfig::default()
//!     })?;
//!     let addr = hub.serve().await?;
//!     println!("listening on {addr}");
//!     tokio::signal::ctrl_c().await?;
//!     hub.close().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod coordinator;
pub mod diff;
pub mod error;
pub mod hub;
pub mod lock;
pub mod metrics;
pub mod name;
pub mod presence;
pub mod protocol;
pub mod replica;
pub mod storage;
pub mod watch;

// Re-exports for convenience
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use config::{AdmissionHooks, AllowAll, HookResponse, Hooks, HubConfig, LogLevel, RequestInfo};
pub use coordinator::{ClientId, CoordinatorState, DocCoordinator};
pub use error::{HubError, Result};
pub use hub::SyncHub;
pub use metrics::MetricsSnapshot;
pub use name::{DocName, NameError};
pub use presence::{PresenceDelta, PresenceState};
pub use replica::Replica;
pub use storage::{
    DocStorage, ExternalChange, FsStorage, FsStorageConfig, Loaded, MemoryTable, StorageError,
    TableBackend, TableKey, TableRow, TableStorage,
};
