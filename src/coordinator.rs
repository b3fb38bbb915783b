//! Per-document coordinator: the owner of one replica and everything that
//! may change it.
//!
//! ```text
//!  client frames ──► Replica ──► update events ──► fan-out to other clients
//!                      ▲   │                          │
//!   external edits ────┘   └── debounce ──► storage   └── (origin filtered)
//!   (watcher)                      │
//!                                  ▼
//!                      snapshot slot (periodic, crash recovery)
//! ```
//!
//! Three producers touch the replica: the network, the debounced write path,
//! and the external-change path. The *writer gate* serializes every block
//! that does storage I/O or external→replica mutation; the `writing_in` /
//! `writing_out` flags break the reentrancy triangle replica↔storage:
//!
//! - `writing_out` is set around our own `save`, so the watcher event caused
//!   by our rename is recognized and dropped.
//! - `writing_in` is set while an external change is replayed into the
//!   replica, so the update events it emits never schedule a write of the
//!   text they came from.
//!
//! `last_persisted_hash` makes writes idempotent: a debounce firing with an
//! unchanged document is a no-op, and an inbound watcher event whose content
//! hash equals it has already been integrated.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::HubConfig;
use crate::diff::edit_script;
use crate::metrics::Metrics;
use crate::name::DocName;
use crate::presence::PresenceState;
use crate::protocol::{self, Frame, SyncMessage};
use crate::replica::{Replica, Subscription, UpdateEvent, EXTERNAL_ORIGIN, HYDRATE_ORIGIN};
use crate::storage::{content_hash, DocStorage, ExternalChange};

/// Socket identity within the hub.
pub type ClientId = Uuid;

/// Per-socket outbound queue depth. A slow client starts dropping frames
/// once it falls this far behind; it can resynchronize via a fresh step-1.
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Coordinator lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoordinatorState {
    Opening = 0,
    Ready = 1,
    IdleArmed = 2,
    Evicting = 3,
    Gone = 4,
}

impl CoordinatorState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Opening,
            1 => Self::Ready,
            2 => Self::IdleArmed,
            3 => Self::Evicting,
            _ => Self::Gone,
        }
    }
}

/// The slice of hub configuration a coordinator acts on.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub debounce_ms: u64,
    pub snapshot_interval_ms: u64,
    pub doc_cleanup_delay_ms: u64,
    pub persist_replica_state: bool,
}

impl From<&HubConfig> for CoordinatorSettings {
    fn from(config: &HubConfig) -> Self {
        Self {
            debounce_ms: config.debounce_ms,
            snapshot_interval_ms: config.snapshot_interval_ms,
            doc_cleanup_delay_ms: config.doc_cleanup_delay_ms,
            persist_replica_state: config.persist_replica_state,
        }
    }
}

struct ClientHandle {
    sender: mpsc::Sender<Vec<u8>>,
    /// Presence client ids this socket has announced; cleaned up on leave.
    presence_ids: HashSet<u64>,
}

/// One active document.
pub struct DocCoordinator {
    name: DocName,
    replica: Replica,
    presence: StdMutex<PresenceState>,
    clients: StdMutex<HashMap<ClientId, ClientHandle>>,
    storage: Arc<dyn DocStorage>,
    settings: CoordinatorSettings,
    metrics: Arc<Metrics>,

    writer_gate: Mutex<()>,
    writing_in: AtomicBool,
    writing_out: AtomicBool,
    last_persisted_hash: StdMutex<Option<String>>,

    dirty_tx: mpsc::UnboundedSender<()>,
    pending_write: AtomicBool,
    shutting_down: AtomicBool,
    state: AtomicU8,
    idle_generation: AtomicU64,
    evict_tx: mpsc::UnboundedSender<DocName>,

    _update_sub: StdMutex<Option<Subscription>>,
}

impl DocCoordinator {
    /// Build and hydrate a coordinator. With a deferred-load backend this
    /// returns before the load resolves; reconciliation happens when it does.
    pub async fn open(
        name: DocName,
        storage: Arc<dyn DocStorage>,
        settings: CoordinatorSettings,
        metrics: Arc<Metrics>,
        evict_tx: mpsc::UnboundedSender<DocName>,
    ) -> Arc<Self> {
        let (dirty_tx, dirty_rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(Self {
            name: name.clone(),
            replica: Replica::new(),
            presence: StdMutex::new(PresenceState::new()),
            clients: StdMutex::new(HashMap::new()),
            storage,
            settings,
            metrics,
            writer_gate: Mutex::new(()),
            writing_in: AtomicBool::new(false),
            writing_out: AtomicBool::new(false),
            last_persisted_hash: StdMutex::new(None),
            dirty_tx,
            pending_write: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            state: AtomicU8::new(CoordinatorState::Opening as u8),
            idle_generation: AtomicU64::new(0),
            evict_tx,
            _update_sub: StdMutex::new(None),
        });

        let weak = Arc::downgrade(&coordinator);
        match coordinator.replica.observe(move |event| {
            if let Some(co) = weak.upgrade() {
                co.on_replica_update(event);
            }
        }) {
            Ok(sub) => *coordinator._update_sub.lock().unwrap() = Some(sub),
            Err(e) => log::error!("failed to observe replica for {name}: {e}"),
        }

        log::info!("opening document {name}");
        if coordinator.storage.loads_are_deferred() {
            let weak = Arc::downgrade(&coordinator);
            tokio::spawn(async move {
                if let Some(co) = weak.upgrade() {
                    co.hydrate().await;
                }
            });
        } else {
            coordinator.hydrate().await;
        }
        coordinator.set_state(CoordinatorState::Ready);

        Self::spawn_debounce_task(&coordinator, dirty_rx);
        if coordinator.storage.supports_snapshots() && coordinator.settings.persist_replica_state {
            Self::spawn_snapshot_task(&coordinator);
        }
        coordinator
    }

    pub fn name(&self) -> &DocName {
        &self.name
    }

    pub fn state(&self) -> CoordinatorState {
        CoordinatorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: CoordinatorState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub fn has_pending_write(&self) -> bool {
        self.pending_write.load(Ordering::SeqCst)
    }

    /// Current rendered text (test and stats surface).
    pub fn text(&self) -> String {
        self.replica.text()
    }

    /// Does this coordinator own the given storage file?
    pub fn owns_path(&self, path: &Path) -> bool {
        self.storage.text_path(&self.name).is_some_and(|own| own == path)
    }

    #[cfg(test)]
    pub(crate) fn last_persisted_hash(&self) -> Option<String> {
        self.last_persisted_hash.lock().unwrap().clone()
    }

    // ── construction ────────────────────────────────────────────────

    async fn hydrate(&self) {
        let loaded = match self.storage.load(&self.name).await {
            Ok(loaded) => {
                self.metrics.load_ok();
                loaded
            }
            Err(e) => {
                log::warn!("load failed for {}; starting empty: {e}", self.name);
                self.metrics.load_failed();
                return;
            }
        };

        let _gate = self.writer_gate.lock().await;
        let deferred = self.storage.loads_are_deferred();

        if let Some(state) = loaded.replica_state.as_deref() {
            // Hash the *stored* text via a throwaway replica: with a deferred
            // load the live replica may already hold newer client edits, and
            // recording their hash would suppress the next save.
            let stored_text = Replica::from_state(state).map(|r| r.text());
            self.writing_in.store(true, Ordering::SeqCst);
            if let Err(e) = self.replica.apply_update(state, HYDRATE_ORIGIN) {
                log::warn!("stored state for {} is unusable: {e}", self.name);
            }
            self.writing_in.store(false, Ordering::SeqCst);
            if deferred {
                if let Ok(text) = stored_text {
                    *self.last_persisted_hash.lock().unwrap() = Some(content_hash(&text));
                }
            }
        }

        if !deferred {
            // Filesystem mode: the text file is the source of truth; replace
            // the register when the snapshot disagrees with it.
            if let Some(text) = loaded.text {
                self.writing_in.store(true, Ordering::SeqCst);
                if self.replica.text() != text {
                    self.replica.replace_text(&text, HYDRATE_ORIGIN);
                }
                self.writing_in.store(false, Ordering::SeqCst);
                *self.last_persisted_hash.lock().unwrap() = Some(content_hash(&text));
            }
        } else if loaded.replica_state.is_none() {
            if let Some(text) = loaded.text {
                self.writing_in.store(true, Ordering::SeqCst);
                if self.replica.text().is_empty() {
                    self.replica.replace_text(&text, HYDRATE_ORIGIN);
                }
                self.writing_in.store(false, Ordering::SeqCst);
                *self.last_persisted_hash.lock().unwrap() = Some(content_hash(&text));
            }
        }
    }

    // ── update events ───────────────────────────────────────────────

    fn on_replica_update(&self, event: UpdateEvent) {
        // Fan-out first, in integration order, skipping the origin socket
        let frame = protocol::sync_update(&event.update);
        let except = event
            .origin
            .as_deref()
            .and_then(|origin| Uuid::parse_str(origin).ok());
        self.broadcast(&frame, except);

        // Debounce scheduling, unless this event is storage flowing back in
        let origin_is_inbound = matches!(
            event.origin.as_deref(),
            Some(EXTERNAL_ORIGIN) | Some(HYDRATE_ORIGIN)
        );
        if origin_is_inbound || self.writing_in.load(Ordering::SeqCst) {
            return;
        }
        self.pending_write.store(true, Ordering::SeqCst);
        let _ = self.dirty_tx.send(());
    }

    fn broadcast(&self, frame: &[u8], except: Option<ClientId>) {
        let clients = self.clients.lock().unwrap();
        for (id, handle) in clients.iter() {
            if Some(*id) == except {
                continue;
            }
            match handle.sender.try_send(frame.to_vec()) {
                Ok(()) => self.metrics.message_out(frame.len()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!(
                        "outbound queue full for client {id} on {}; dropping frame",
                        self.name
                    );
                    self.metrics.error();
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    // ── write path (replica → storage) ──────────────────────────────

    fn spawn_debounce_task(coordinator: &Arc<Self>, mut dirty_rx: mpsc::UnboundedReceiver<()>) {
        let weak = Arc::downgrade(coordinator);
        let window = Duration::from_millis(coordinator.settings.debounce_ms);
        tokio::spawn(async move {
            while dirty_rx.recv().await.is_some() {
                // Every further pulse restarts the quiet window
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(window) => break,
                        more = dirty_rx.recv() => {
                            if more.is_none() {
                                return;
                            }
                        }
                    }
                }
                let Some(co) = weak.upgrade() else { return };
                co.pending_write.store(false, Ordering::SeqCst);
                co.debounced_write().await;
            }
        });
    }

    async fn debounced_write(&self) {
        let _gate = self.writer_gate.lock().await;
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        self.persist_locked(false).await;
    }

    /// Write if dirty. Caller holds the writer gate.
    async fn persist_locked(&self, is_flush: bool) {
        let text = self.replica.text();
        let hash = content_hash(&text);
        if self.last_persisted_hash.lock().unwrap().as_deref() == Some(hash.as_str()) {
            return;
        }
        let state = self
            .settings
            .persist_replica_state
            .then(|| self.replica.encode_state_as_update());

        self.writing_out.store(true, Ordering::SeqCst);
        let result = if is_flush {
            self.storage.flush(&self.name, &text, state.as_deref()).await
        } else {
            self.storage.save(&self.name, &text, state.as_deref()).await
        };
        self.writing_out.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                self.metrics.save_ok();
                *self.last_persisted_hash.lock().unwrap() = Some(hash);
                log::debug!("persisted {} ({} bytes)", self.name, text.len());
            }
            Err(e) => {
                // Hash not advanced; the next trigger retries
                log::error!("save failed for {}: {e}", self.name);
                self.metrics.save_failed();
            }
        }
    }

    // ── external-change path (storage → replica) ────────────────────

    /// Apply a watcher event for this coordinator's file.
    pub async fn apply_external_change(&self, change: ExternalChange) {
        let text = match change.text {
            Ok(text) => text,
            Err(e) => {
                log::warn!("external read failed for {}: {e}", change.path.display());
                self.metrics.load_failed();
                return;
            }
        };

        let _gate = self.writer_gate.lock().await;
        if self.writing_out.load(Ordering::SeqCst) {
            return; // the event is our own rename
        }
        let hash = content_hash(&text);
        if self.last_persisted_hash.lock().unwrap().as_deref() == Some(hash.as_str()) {
            return; // already integrated
        }
        let old = self.replica.text();
        if old == text {
            *self.last_persisted_hash.lock().unwrap() = Some(hash);
            return;
        }

        self.writing_in.store(true, Ordering::SeqCst);
        let script = edit_script(&old, &text);
        self.replica.apply_edit_script(&script, EXTERNAL_ORIGIN);
        *self.last_persisted_hash.lock().unwrap() = Some(hash);
        self.writing_in.store(false, Ordering::SeqCst);
        log::info!(
            "applied external change to {} ({} script ops)",
            self.name,
            script.len()
        );
    }

    // ── snapshots ───────────────────────────────────────────────────

    fn spawn_snapshot_task(coordinator: &Arc<Self>) {
        let weak = Arc::downgrade(coordinator);
        let interval = Duration::from_millis(coordinator.settings.snapshot_interval_ms);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(co) = weak.upgrade() else { return };
                if co.shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                co.write_snapshot().await;
            }
        });
    }

    async fn write_snapshot(&self) {
        let state = self.replica.encode_state_as_update();
        if let Err(e) = self.storage.write_snapshot(&self.name, &state).await {
            log::warn!("snapshot write failed for {}: {e}", self.name);
        }
    }

    // ── clients ─────────────────────────────────────────────────────

    /// Register a socket; returns its outbound frame queue. Cancels any
    /// armed idle timer.
    pub fn register_client(&self, id: ClientId) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        self.clients.lock().unwrap().insert(
            id,
            ClientHandle { sender: tx, presence_ids: HashSet::new() },
        );
        self.idle_generation.fetch_add(1, Ordering::SeqCst);
        self.set_state(CoordinatorState::Ready);
        rx
    }

    /// Frames to send a client right after registration: one sync-step-1
    /// with our state vector, plus a presence snapshot when non-empty.
    pub fn handshake_frames(&self) -> Vec<Vec<u8>> {
        let mut frames = vec![protocol::sync_step1(&self.replica.state_vector())];
        let presence = self.presence.lock().unwrap();
        if !presence.is_empty() {
            frames.push(protocol::presence_frame(&presence.encode_full()));
        }
        frames
    }

    /// Process one inbound frame from a socket. Returns the direct reply,
    /// if any; errors are per-socket processing errors, not fatal.
    pub fn handle_frame(&self, client: ClientId, raw: &[u8]) -> Result<Option<Vec<u8>>, String> {
        let frame = Frame::decode(raw).map_err(|e| e.to_string())?;
        match frame {
            Frame::Sync(SyncMessage::Step1(sv)) => {
                let diff = self.replica.diff(&sv).map_err(|e| e.to_string())?;
                // An already-synced peer gets no reply, not an empty one
                if diff.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(protocol::sync_step2(&diff)))
                }
            }
            Frame::Sync(SyncMessage::Step2(update)) | Frame::Sync(SyncMessage::Update(update)) => {
                self.replica
                    .apply_update(&update, &client.to_string())
                    .map_err(|e| e.to_string())?;
                Ok(None)
            }
            Frame::Presence(update) => {
                let (delta, relay) = {
                    let mut presence = self.presence.lock().unwrap();
                    let delta = presence.apply_update(&update).map_err(|e| e.to_string())?;
                    let relay = presence.encode_update(&delta.touched());
                    (delta, relay)
                };
                if !delta.is_empty() {
                    {
                        let mut clients = self.clients.lock().unwrap();
                        if let Some(handle) = clients.get_mut(&client) {
                            for id in delta.added.iter().chain(delta.updated.iter()) {
                                handle.presence_ids.insert(*id);
                            }
                            for id in &delta.removed {
                                handle.presence_ids.remove(id);
                            }
                        }
                    }
                    self.broadcast(&protocol::presence_frame(&relay), None);
                }
                Ok(None)
            }
            Frame::Unknown(t) => Err(format!("unknown frame discriminant {t}")),
        }
    }

    /// Drop a departed socket: detach its queue, announce its presence ids
    /// as gone, and arm idle eviction when the set becomes empty.
    pub fn unregister_client(self: &Arc<Self>, id: ClientId) {
        let handle = self.clients.lock().unwrap().remove(&id);
        if let Some(handle) = handle {
            for presence_id in handle.presence_ids {
                let departure = self.presence.lock().unwrap().remove_client(presence_id);
                if let Some(update) = departure {
                    self.broadcast(&protocol::presence_frame(&update), None);
                }
            }
        }
        if self.client_count() == 0 {
            self.arm_idle_timer();
        }
    }

    // ── lifecycle ───────────────────────────────────────────────────

    fn arm_idle_timer(self: &Arc<Self>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let generation = self.idle_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(CoordinatorState::IdleArmed);
        let weak = Arc::downgrade(self);
        let delay = Duration::from_millis(self.settings.doc_cleanup_delay_ms);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(co) = weak.upgrade() else { return };
            if co.idle_generation.load(Ordering::SeqCst) == generation && co.client_count() == 0 {
                let _ = co.evict_tx.send(co.name.clone());
            }
        });
    }

    /// Cancel timers, flush pending state, write a final snapshot.
    /// Idempotent: the first call wins, later calls return immediately.
    pub async fn shutdown_flush(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(CoordinatorState::Evicting);
        let _gate = self.writer_gate.lock().await;
        self.pending_write.store(false, Ordering::SeqCst);
        self.persist_locked(true).await;
        if self.storage.supports_snapshots() && self.settings.persist_replica_state {
            self.write_snapshot().await;
        }
        self.set_state(CoordinatorState::Gone);
        log::info!("closed document {}", self.name);
    }
}
