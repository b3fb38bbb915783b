//! Hub configuration and admission hooks.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::name::DocName;

/// System paths a base directory may not touch without the explicit opt-in.
const SYSTEM_PATHS: &[&str] = &["/etc", "/usr", "/var", "/bin", "/sbin", "/root"];

/// Log verbosity for the hub's own records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Everything the hub can be told.
#[derive(Debug, Clone, Serialize)]
pub struct HubConfig {
    /// Base directory for relative document names (filesystem mode).
    pub dir: PathBuf,
    /// TCP port; 0 binds an ephemeral port.
    pub port: u16,
    /// Quiet interval before a replica change is written to storage.
    pub debounce_ms: u64,
    /// Total socket cap across all documents.
    pub max_connections: usize,
    /// Socket cap per document.
    pub max_connections_per_doc: usize,
    /// Maximum inbound frame size in bytes.
    pub max_message_size: usize,
    /// Maximum file size `load` will accept, in bytes.
    pub max_file_size: u64,
    /// Heartbeat ping interval.
    pub ping_interval_ms: u64,
    /// Idle delay before an empty coordinator is evicted.
    pub doc_cleanup_delay_ms: u64,
    /// Opt-in to base directories at or around system paths.
    pub dangerously_allow_system_paths: bool,
    /// Hub log verbosity.
    pub log_level: LogLevel,
    /// Whether encoded replica state is persisted (snapshot slot / table column).
    pub persist_replica_state: bool,
    /// Interval between crash-recovery snapshots (filesystem mode).
    pub snapshot_interval_ms: u64,
    /// URL prefix stripped from request paths before name derivation.
    pub path_prefix: Option<String>,
    /// Recognized document extensions; the first is appended when absent.
    pub doc_extensions: Vec<String>,
    /// Extension of snapshot-slot files.
    pub snapshot_extension: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            port: 0,
            debounce_ms: 1_000,
            max_connections: 100,
            max_connections_per_doc: 20,
            max_message_size: 1024 * 1024,
            max_file_size: 10 * 1024 * 1024,
            ping_interval_ms: 30_000,
            doc_cleanup_delay_ms: 30_000,
            dangerously_allow_system_paths: false,
            log_level: LogLevel::Info,
            persist_replica_state: true,
            snapshot_interval_ms: 30_000,
            path_prefix: None,
            doc_extensions: vec!["md".to_string()],
            snapshot_extension: "ysnap".to_string(),
        }
    }
}

impl HubConfig {
    /// Config for tests: short timers, a given base directory.
    pub fn for_testing(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            debounce_ms: 50,
            ping_interval_ms: 5_000,
            doc_cleanup_delay_ms: 200,
            snapshot_interval_ms: 500,
            ..Self::default()
        }
    }
}

/// Is this base directory a system path, an ancestor of one, or a shallow
/// descendant of one? `/home/<user>` counts; anything deeper under `/home`
/// does not.
pub fn is_dangerous_base_dir(dir: &Path) -> bool {
    let dir = normalize(dir);
    if dir == Path::new("/") {
        return true;
    }
    for sys in SYSTEM_PATHS {
        let sys = Path::new(sys);
        if dir == sys || sys.starts_with(&dir) || dir.starts_with(sys) {
            return true;
        }
    }
    let home = Path::new("/home");
    if dir == home {
        return true;
    }
    if let Ok(rest) = dir.strip_prefix(home) {
        // /home/<user> is still dangerous; deeper is fine
        return rest.components().count() <= 1;
    }
    false
}

/// Lexical normalization: drop `.` components and trailing separators.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            std::path::Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

/// Information about the HTTP request behind a connection or route, as
/// exposed to [`AdmissionHooks`].
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl RequestInfo {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A response produced by an `on_request` hook.
#[derive(Debug, Clone)]
pub struct HookResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Capability interface injected into the hub instead of raw callbacks:
/// authentication plus the two interception points for custom HTTP routes
/// and custom socket handling.
pub trait AdmissionHooks: Send + Sync {
    /// Admission predicate for a new document socket. `Ok(false)` refuses
    /// with a policy close; `Err` refuses with an internal-error close.
    fn authorize(
        &self,
        request: &RequestInfo,
        doc: &DocName,
    ) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
        let _ = (request, doc);
        Ok(true)
    }

    /// Invoked before built-in HTTP routes; `Some` means handled.
    fn on_request(&self, request: &RequestInfo) -> Option<HookResponse> {
        let _ = request;
        None
    }

    /// Invoked before the built-in upgrade path; `true` means the hook has
    /// taken the connection and the hub must not.
    fn on_connection(&self, request: &RequestInfo) -> bool {
        let _ = request;
        false
    }
}

/// Default hooks: everything admitted, nothing intercepted.
pub struct AllowAll;

impl AdmissionHooks for AllowAll {}

/// Shared hook handle.
pub type Hooks = Arc<dyn AdmissionHooks>;
