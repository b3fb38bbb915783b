//! Filesystem storage: one text file per document plus a snapshot slot.
//!
//! Layout for base directory `D`:
//!
//! ```text
//! D/<name>.<ext>                                  document text
//! <tmp>/mrmd-sync-<sha12(D)>/<flat-name>.<snap>   base64 replica state
//! <target>.tmp.<pid>.<unix-ms>                    in-flight atomic write
//! ```
//!
//! Every write goes to a sibling temp path first and is renamed over the
//! target, so readers never observe a torn file. Temp files orphaned by a
//! crashed predecessor are collected on open: a temp file is stale iff its
//! embedded PID no longer names a live process or its timestamp is older
//! than one hour.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::broadcast;

use crate::lock::pid_alive;
use crate::name::DocName;
use crate::storage::{short_hash, DocStorage, ExternalChange, Loaded, StorageError};
use crate::watch::{FileWatcher, WatchConfig};

/// Temp files older than this are stale regardless of PID.
const STALE_TEMP_AGE: Duration = Duration::from_secs(60 * 60);

/// Capacity of the external-change fan-out channel.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Filesystem backend configuration.
#[derive(Debug, Clone)]
pub struct FsStorageConfig {
    pub base_dir: PathBuf,
    pub doc_extensions: Vec<String>,
    pub snapshot_extension: String,
    pub max_file_size: u64,
    /// Stability window for the change stream.
    pub watch_debounce_ms: u64,
    /// Whether to watch the base directory at all.
    pub watch: bool,
}

impl FsStorageConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            doc_extensions: vec!["md".to_string()],
            snapshot_extension: "ysnap".to_string(),
            max_file_size: 10 * 1024 * 1024,
            watch_debounce_ms: 500,
            watch: true,
        }
    }

    /// Short stability window for tests.
    pub fn for_testing(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            watch_debounce_ms: 100,
            ..Self::new(base_dir)
        }
    }
}

/// Filesystem-backed document storage.
pub struct FsStorage {
    config: FsStorageConfig,
    /// Resolved base directory.
    base_dir: PathBuf,
    /// Process-private directory for snapshot slots and the instance lock.
    slot_dir: PathBuf,
    changes: broadcast::Sender<ExternalChange>,
}

impl FsStorage {
    /// Open the backend: create directories, collect stale temp files, and
    /// start the change watcher. Must run inside a tokio runtime.
    pub fn open(config: FsStorageConfig) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&config.base_dir)?;
        let base_dir = config
            .base_dir
            .canonicalize()
            .unwrap_or_else(|_| config.base_dir.clone());

        let slot_dir = slot_dir_for(&base_dir);
        std::fs::create_dir_all(&slot_dir)?;

        let removed = collect_stale_temp_files(&base_dir);
        if removed > 0 {
            log::info!("removed {removed} stale temp files under {}", base_dir.display());
        }

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let storage = Self { config, base_dir, slot_dir, changes };
        if storage.config.watch {
            storage.spawn_watch_task()?;
        }
        Ok(storage)
    }

    /// The resolved base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// The process-private slot directory (snapshots, instance lock).
    pub fn slot_dir(&self) -> &Path {
        &self.slot_dir
    }

    fn spawn_watch_task(&self) -> Result<(), StorageError> {
        let mut watcher = FileWatcher::new(
            &self.base_dir,
            WatchConfig {
                debounce_ms: self.config.watch_debounce_ms,
                extensions: self.config.doc_extensions.clone(),
            },
        )?;
        let tx = self.changes.clone();
        let limit = self.config.max_file_size;
        tokio::spawn(async move {
            while let Some(path) = watcher.recv().await {
                let text = read_text_bounded(&path, limit).await;
                // Nobody listening is fine; coordinators come and go
                let _ = tx.send(ExternalChange { path, text: text.map_err(|e| e.to_string()) });
            }
        });
        Ok(())
    }

    fn snapshot_path(&self, name: &DocName) -> PathBuf {
        self.slot_dir
            .join(format!("{}.{}", name.flattened(), self.config.snapshot_extension))
    }

    async fn read_snapshot(&self, name: &DocName) -> Option<Vec<u8>> {
        let path = self.snapshot_path(name);
        let encoded = match tokio::fs::read_to_string(&path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                log::warn!("snapshot read failed for {}: {e}", path.display());
                return None;
            }
        };
        match BASE64.decode(encoded.trim()) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                log::warn!("snapshot slot {} is corrupt: {e}", path.display());
                None
            }
        }
    }
}

#[async_trait]
impl DocStorage for FsStorage {
    async fn load(&self, name: &DocName) -> Result<Loaded, StorageError> {
        let path = name.file_path(&self.base_dir, &self.config.doc_extensions);
        let text = match read_text_bounded(&path, self.config.max_file_size).await {
            Ok(text) => Some(text),
            Err(StorageError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };
        let replica_state = self.read_snapshot(name).await;
        Ok(Loaded { text, replica_state })
    }

    async fn save(
        &self,
        name: &DocName,
        text: &str,
        replica_state: Option<&[u8]>,
    ) -> Result<(), StorageError> {
        let path = name.file_path(&self.base_dir, &self.config.doc_extensions);
        write_atomic(&path, text.as_bytes()).await?;
        if let Some(state) = replica_state {
            self.write_snapshot(name, state).await?;
        }
        Ok(())
    }

    async fn write_snapshot(
        &self,
        name: &DocName,
        replica_state: &[u8],
    ) -> Result<(), StorageError> {
        let encoded = BASE64.encode(replica_state);
        write_atomic(&self.snapshot_path(name), encoded.as_bytes()).await
    }

    fn supports_snapshots(&self) -> bool {
        true
    }

    fn external_changes(&self) -> Option<broadcast::Receiver<ExternalChange>> {
        Some(self.changes.subscribe())
    }

    fn text_path(&self, name: &DocName) -> Option<PathBuf> {
        Some(name.file_path(&self.base_dir, &self.config.doc_extensions))
    }

    fn locate(&self, name: &DocName) -> String {
        name.file_path(&self.base_dir, &self.config.doc_extensions)
            .display()
            .to_string()
    }
}

/// Slot directory for a resolved base directory.
pub fn slot_dir_for(base_dir: &Path) -> PathBuf {
    std::env::temp_dir().join(format!("mrmd-sync-{}", short_hash(&base_dir.display().to_string())))
}

async fn read_text_bounded(path: &Path, limit: u64) -> Result<String, StorageError> {
    let meta = tokio::fs::metadata(path).await?;
    if meta.len() > limit {
        return Err(StorageError::Oversize {
            path: path.to_path_buf(),
            size: meta.len(),
            limit,
        });
    }
    Ok(tokio::fs::read_to_string(path).await?)
}

/// Write via sibling temp file + rename.
async fn write_atomic(target: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp = temp_path_for(target);
    tokio::fs::write(&temp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&temp, target).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e.into());
    }
    Ok(())
}

fn temp_path_for(target: &Path) -> PathBuf {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    PathBuf::from(format!(
        "{}.tmp.{}.{}",
        target.display(),
        std::process::id(),
        now_ms
    ))
}

/// Recursively remove stale temp files under `dir`; returns how many.
fn collect_stale_temp_files(dir: &Path) -> usize {
    let mut removed = 0;
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            removed += collect_stale_temp_files(&path);
            continue;
        }
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };
        if let Some((pid, written_ms)) = parse_temp_suffix(name) {
            if is_stale_temp(pid, written_ms) {
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        log::debug!("removed stale temp file {}", path.display());
                        removed += 1;
                    }
                    Err(e) => log::warn!("failed to remove stale temp {}: {e}", path.display()),
                }
            }
        }
    }
    removed
}

/// Extract `(pid, unix-ms)` from a `<base>.tmp.<pid>.<ms>` file name.
fn parse_temp_suffix(file_name: &str) -> Option<(u32, u128)> {
    let (_, suffix) = file_name.rsplit_once(".tmp.")?;
    let (pid, ms) = suffix.split_once('.')?;
    Some((pid.parse().ok()?, ms.parse().ok()?))
}

fn is_stale_temp(pid: u32, written_ms: u128) -> bool {
    if !pid_alive(pid) {
        return true;
    }
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    now_ms.saturating_sub(written_ms) > STALE_TEMP_AGE.as_millis()
}
