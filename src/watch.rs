//! Filesystem watching for out-of-band document edits.
//!
//! Watches the base directory recursively and reports modified document
//! files after a stability window, so a burst of saves from an external
//! editor coalesces into one event. Temp files from our own atomic writes
//! are filtered out here; the coordinator's echo suppression handles the
//! rename of the target itself.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, Debouncer};
use tokio::sync::mpsc;

use crate::storage::StorageError;

/// Default stability window before a change is reported.
pub const DEFAULT_WATCH_DEBOUNCE_MS: u64 = 500;

/// Watcher configuration.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Stability window in milliseconds.
    pub debounce_ms: u64,
    /// File extensions that count as documents.
    pub extensions: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_WATCH_DEBOUNCE_MS,
            extensions: vec!["md".to_string()],
        }
    }
}

/// Debounced watcher over one base directory.
pub struct FileWatcher {
    _debouncer: Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<PathBuf>,
}

impl FileWatcher {
    /// Watch `root` recursively for modified document files.
    pub fn new(root: &Path, config: WatchConfig) -> Result<Self, StorageError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let extensions = config.extensions.clone();

        let mut debouncer = new_debouncer(
            Duration::from_millis(config.debounce_ms),
            move |res: std::result::Result<Vec<DebouncedEvent>, notify::Error>| match res {
                Ok(events) => {
                    for event in events {
                        if is_watched_file(&event.path, &extensions) {
                            log::debug!("file change detected: {}", event.path.display());
                            if event_tx.send(event.path).is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    log::warn!("filesystem watch error: {e}");
                }
            },
        )
        .map_err(|e| StorageError::Backend(format!("failed to create watcher: {e}")))?;

        debouncer
            .watcher()
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| StorageError::Backend(format!("failed to watch {}: {e}", root.display())))?;

        log::info!(
            "watching {} (debounce {}ms)",
            root.display(),
            config.debounce_ms
        );

        Ok(Self { _debouncer: debouncer, event_rx })
    }

    /// Next modified path, or `None` once the watcher has stopped.
    pub async fn recv(&mut self) -> Option<PathBuf> {
        self.event_rx.recv().await
    }
}

/// A path counts iff it has a watched extension and is not one of our own
/// in-flight temp files.
fn is_watched_file(path: &Path, extensions: &[String]) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return false,
    };
    if name.contains(".tmp.") {
        return false;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)))
}
