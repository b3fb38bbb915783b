//! Hub-wide counters, lock-free on the hot path.
//!
//! Counters are plain atomics so the socket loops never take a lock to
//! account for a message. `/metrics` and `/stats` read a point-in-time
//! snapshot.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Process-wide metrics for one hub.
#[derive(Debug)]
pub struct Metrics {
    started_at: Instant,
    connections_total: AtomicU64,
    connections_active: AtomicU64,
    messages_total: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    saves: AtomicU64,
    loads: AtomicU64,
    errors: AtomicU64,
    save_errors: AtomicU64,
    load_errors: AtomicU64,
    /// Unix milliseconds of the last observed activity.
    last_activity_ms: AtomicI64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            messages_total: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            saves: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            save_errors: AtomicU64::new(0),
            load_errors: AtomicU64::new(0),
            last_activity_ms: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
        }
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn connection_closed(&self) {
        // Saturating: a refused socket is never counted active
        let _ = self.connections_active.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |n| n.checked_sub(1),
        );
    }

    pub fn active_connections(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }

    pub fn message_in(&self, bytes: usize) {
        self.messages_total.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        self.touch();
    }

    pub fn message_out(&self, bytes: usize) {
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn save_ok(&self) {
        self.saves.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn save_failed(&self) {
        self.save_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn load_ok(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn load_failed(&self) {
        self.load_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time snapshot for the control plane.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let last_ms = self.last_activity_ms.load(Ordering::Relaxed);
        let last_activity = chrono::DateTime::from_timestamp_millis(last_ms)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        MetricsSnapshot {
            uptime: self.started_at.elapsed().as_secs(),
            connections: ConnectionCounts {
                total: self.connections_total.load(Ordering::Relaxed),
                active: self.connections_active.load(Ordering::Relaxed),
            },
            messages: MessageCounts {
                total: self.messages_total.load(Ordering::Relaxed),
                bytes_in: self.bytes_in.load(Ordering::Relaxed),
                bytes_out: self.bytes_out.load(Ordering::Relaxed),
            },
            files: FileCounts {
                saves: self.saves.load(Ordering::Relaxed),
                loads: self.loads.load(Ordering::Relaxed),
                save_errors: self.save_errors.load(Ordering::Relaxed),
                load_errors: self.load_errors.load(Ordering::Relaxed),
            },
            errors: self.errors.load(Ordering::Relaxed),
            last_activity,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionCounts {
    pub total: u64,
    pub active: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageCounts {
    pub total: u64,
    #[serde(rename = "bytesIn")]
    pub bytes_in: u64,
    #[serde(rename = "bytesOut")]
    pub bytes_out: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileCounts {
    pub saves: u64,
    pub loads: u64,
    #[serde(rename = "saveErrors")]
    pub save_errors: u64,
    #[serde(rename = "loadErrors")]
    pub load_errors: u64,
}

/// The `/metrics` response body.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime: u64,
    pub connections: ConnectionCounts,
    pub messages: MessageCounts,
    pub files: FileCounts,
    pub errors: u64,
    #[serde(rename = "lastActivity")]
    pub last_activity: String,
}
