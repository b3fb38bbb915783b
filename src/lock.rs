//! Single-instance lock for a base directory.
//!
//! Exactly one process may own the filesystem for a given base directory.
//! The lock is a JSON file in the process-private slot directory; holding it
//! is advisory, but a live PID in the file refuses startup outright. A dead
//! PID (crash) or unparsable file is overwritten.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::HubError;

/// File name of the lock inside the slot directory.
pub const LOCK_FILE_NAME: &str = "server.pid";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    port: u16,
    #[serde(rename = "startedAt")]
    started_at: String,
}

/// Held instance lock. Released on [`release`](InstanceLock::release) or drop,
/// but only while the file still names this process.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    pid: u32,
}

impl InstanceLock {
    /// Acquire the lock for a slot directory, refusing if a live process
    /// holds it.
    pub fn acquire(slot_dir: &Path, port: u16) -> Result<Self, HubError> {
        std::fs::create_dir_all(slot_dir)?;
        let path = slot_dir.join(LOCK_FILE_NAME);

        if let Ok(existing) = std::fs::read_to_string(&path) {
            match serde_json::from_str::<LockInfo>(&existing) {
                Ok(info) if pid_alive(info.pid) => {
                    return Err(HubError::AlreadyRunning {
                        pid: info.pid,
                        lock_path: path,
                    });
                }
                Ok(info) => {
                    log::info!(
                        "replacing instance lock left by dead process {} ({})",
                        info.pid,
                        path.display()
                    );
                }
                Err(e) => {
                    log::warn!("instance lock {} is unparsable ({e}); overwriting", path.display());
                }
            }
        }

        let info = LockInfo {
            pid: std::process::id(),
            port,
            started_at: chrono::Utc::now().to_rfc3339(),
        };
        std::fs::write(&path, serde_json::to_string_pretty(&info).map_err(std::io::Error::other)?)?;
        Ok(Self { path, pid: info.pid })
    }

    /// Remove the lock file iff it still names this process.
    pub fn release(&self) {
        let current = match std::fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(_) => return,
        };
        match serde_json::from_str::<LockInfo>(&current) {
            Ok(info) if info.pid == self.pid => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    log::warn!("failed to remove instance lock {}: {e}", self.path.display());
                }
            }
            _ => {
                log::debug!(
                    "instance lock {} no longer ours; leaving in place",
                    self.path.display()
                );
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Does a PID name a live process on this host?
#[cfg(target_os = "linux")]
pub fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

/// Non-Linux Unix: probe with `kill -0`.
#[cfg(all(unix, not(target_os = "linux")))]
pub fn pid_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Unsupported hosts: assume alive so we never clobber a peer.
#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_writes_lock_file() {
        let temp = TempDir::new().unwrap();
        let lock = InstanceLock::acquire(temp.path(), 8080).unwrap();
        let raw = std::fs::read_to_string(lock.path()).unwrap();
        let info: LockInfo = serde_json::from_str(&raw).unwrap();
        assert_eq!(info.pid, std::process::id());
        assert_eq!(info.port, 8080);
        assert!(!info.started_at.is_empty());
    }

    #[test]
    fn test_live_pid_refuses_second_acquire() {
        let temp = TempDir::new().unwrap();
        let _held = InstanceLock::acquire(temp.path(), 1).unwrap();

        // The lock names this process, which is alive, so a second acquire
        // for the same directory is refused
        match InstanceLock::acquire(temp.path(), 2) {
            Err(HubError::AlreadyRunning { pid, .. }) => {
                assert_eq!(pid, std::process::id());
            }
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
    }

    #[test]
    fn test_dead_pid_is_overwritten() {
        let temp = TempDir::new().unwrap();
        let info = LockInfo {
            pid: 4_294_000_222, // far beyond any real PID
            port: 1,
            started_at: "2026-01-01T00:00:00Z".into(),
        };
        std::fs::write(
            temp.path().join(LOCK_FILE_NAME),
            serde_json::to_string(&info).unwrap(),
        )
        .unwrap();

        let lock = InstanceLock::acquire(temp.path(), 9).unwrap();
        let raw = std::fs::read_to_string(lock.path()).unwrap();
        let now: LockInfo = serde_json::from_str(&raw).unwrap();
        assert_eq!(now.pid, std::process::id());
    }

    #[test]
    fn test_unparsable_lock_overwritten_with_warning() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(LOCK_FILE_NAME), "not json at all").unwrap();
        assert!(InstanceLock::acquire(temp.path(), 3).is_ok());
    }

    #[test]
    fn test_release_removes_only_own_lock() {
        let temp = TempDir::new().unwrap();
        let lock = InstanceLock::acquire(temp.path(), 4).unwrap();
        let path = lock.path().to_path_buf();

        // Someone else overwrote the lock; release must leave it alone
        let foreign = LockInfo {
            pid: 1,
            port: 5,
            started_at: "2026-01-01T00:00:00Z".into(),
        };
        std::fs::write(&path, serde_json::to_string(&foreign).unwrap()).unwrap();
        lock.release();
        assert!(path.exists());

        // Restore ownership; drop removes it
        let ours = LockInfo {
            pid: std::process::id(),
            port: 5,
            started_at: "2026-01-01T00:00:00Z".into(),
        };
        std::fs::write(&path, serde_json::to_string(&ours).unwrap()).unwrap();
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_pid_alive_self() {
        assert!(pid_alive(std::process::id()));
    }
}
