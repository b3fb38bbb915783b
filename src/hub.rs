//! The hub: one listener, every document.
//!
//! A single TCP port terminates both the control-plane HTTP surface and the
//! WebSocket upgrade for document sockets. Any request path names a
//! document; `/health`, `/healthz`, `/metrics` and `/stats` are reserved for
//! the control plane, everything else answers with a plain banner unless it
//! is an upgrade.
//!
//! Admission control runs before a socket joins a coordinator, in order:
//! shutting-down (1001), total capacity (1013), name validation (1008),
//! the auth hook (1008 / 1011), per-document capacity (1013). A refused
//! socket completes the handshake, receives only the close frame, and never
//! sees a sync-step-1.
//!
//! The hub holds no global state: everything hangs off the [`SyncHub`]
//! value, so several hubs can coexist in one process on distinct ports and
//! base directories.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

use crate::config::{is_dangerous_base_dir, AllowAll, HookResponse, Hooks, HubConfig, RequestInfo};
use crate::coordinator::{ClientId, CoordinatorSettings, DocCoordinator};
use crate::error::{HubError, Result};
use crate::lock::InstanceLock;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::name::DocName;
use crate::storage::fs::{slot_dir_for, FsStorage, FsStorageConfig};
use crate::storage::DocStorage;

/// Close codes used by the server.
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;
/// Reserved for forcing clients to refresh; never sent by this hub.
pub const CLOSE_FORCE_REFRESH: u16 = 4000;

struct HubInner {
    config: HubConfig,
    storage: Arc<dyn DocStorage>,
    hooks: Hooks,
    metrics: Arc<Metrics>,
    coordinators: Mutex<HashMap<DocName, Arc<DocCoordinator>>>,
    evict_tx: mpsc::UnboundedSender<DocName>,
    shutting_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

/// The synchronization hub. Built per process-instance; `serve` binds the
/// port, `close` flushes and releases everything.
pub struct SyncHub {
    inner: Arc<HubInner>,
    evict_rx: StdMutex<Option<mpsc::UnboundedReceiver<DocName>>>,
    instance_lock: StdMutex<Option<InstanceLock>>,
    local_addr: StdMutex<Option<SocketAddr>>,
}

impl SyncHub {
    /// Build a hub over filesystem storage rooted at `config.dir`.
    ///
    /// Refuses dangerous base directories without the explicit opt-in and
    /// acquires the per-directory instance lock. Must be called inside a
    /// tokio runtime (the storage watcher starts here).
    pub fn new(config: HubConfig) -> Result<Self> {
        if !config.dangerously_allow_system_paths && is_dangerous_base_dir(&config.dir) {
            return Err(HubError::DangerousBaseDir(config.dir.clone()));
        }
        // Take the instance lock before anything starts watching the
        // directory; a refused hub must leave no machinery behind.
        std::fs::create_dir_all(&config.dir)?;
        let resolved = config.dir.canonicalize().unwrap_or_else(|_| config.dir.clone());
        let lock = InstanceLock::acquire(&slot_dir_for(&resolved), config.port)?;

        let fs = FsStorage::open(FsStorageConfig {
            base_dir: config.dir.clone(),
            doc_extensions: config.doc_extensions.clone(),
            snapshot_extension: config.snapshot_extension.clone(),
            max_file_size: config.max_file_size,
            watch_debounce_ms: 500,
            watch: true,
        })?;
        Ok(Self::build(config, Arc::new(fs), Some(lock)))
    }

    /// Build a hub over any storage backend (no instance lock; that concern
    /// is filesystem-specific).
    pub fn with_storage(config: HubConfig, storage: Arc<dyn DocStorage>) -> Self {
        Self::build(config, storage, None)
    }

    fn build(
        config: HubConfig,
        storage: Arc<dyn DocStorage>,
        instance_lock: Option<InstanceLock>,
    ) -> Self {
        let (evict_tx, evict_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let inner = Arc::new(HubInner {
            config,
            storage,
            hooks: Arc::new(AllowAll),
            metrics: Arc::new(Metrics::new()),
            coordinators: Mutex::new(HashMap::new()),
            evict_tx,
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
        });
        Self {
            inner,
            evict_rx: StdMutex::new(Some(evict_rx)),
            instance_lock: StdMutex::new(instance_lock),
            local_addr: StdMutex::new(None),
        }
    }

    /// Replace the admission hooks. Call before [`serve`](Self::serve).
    pub fn hooks(self, hooks: Hooks) -> Self {
        // Hooks live in HubInner which is already shared; rebuild the inner
        // with the new hooks (no sockets exist before serve).
        let inner = Arc::new(HubInner {
            config: self.inner.config.clone(),
            storage: self.inner.storage.clone(),
            hooks,
            metrics: self.inner.metrics.clone(),
            coordinators: Mutex::new(HashMap::new()),
            evict_tx: self.inner.evict_tx.clone(),
            shutting_down: AtomicBool::new(false),
            shutdown_tx: self.inner.shutdown_tx.clone(),
        });
        Self {
            inner,
            evict_rx: self.evict_rx,
            instance_lock: self.instance_lock,
            local_addr: self.local_addr,
        }
    }

    /// Bind the listener and start serving. Returns the bound address.
    pub async fn serve(&self) -> Result<SocketAddr> {
        let listener =
            tokio::net::TcpListener::bind(("0.0.0.0", self.inner.config.port)).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock().unwrap() = Some(addr);

        if let Some(evict_rx) = self.evict_rx.lock().unwrap().take() {
            tokio::spawn(evict_loop(self.inner.clone(), evict_rx));
        }
        if let Some(changes) = self.inner.storage.external_changes() {
            tokio::spawn(watch_dispatch(self.inner.clone(), changes));
        }

        let app = Router::new()
            .fallback(root_handler)
            .with_state(self.inner.clone());

        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|closing| *closing).await;
            });
            if let Err(e) = serve.await {
                log::error!("listener failed: {e}");
            }
        });

        log::info!("hub listening on {addr}");
        Ok(addr)
    }

    /// The bound address, once serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    /// Point-in-time metrics.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Number of live coordinators.
    pub async fn document_count(&self) -> usize {
        self.inner.coordinators.lock().await.len()
    }

    /// Whether a coordinator currently exists for `name`.
    pub async fn has_document(&self, name: &DocName) -> bool {
        self.inner.coordinators.lock().await.contains_key(name)
    }

    /// Get or lazily create the coordinator for a document.
    pub async fn get_or_create(&self, name: &DocName) -> Arc<DocCoordinator> {
        self.inner.get_or_create(name).await
    }

    /// Graceful close: stop accepting, flush every coordinator, release the
    /// instance lock. Idempotent; later calls return immediately.
    pub async fn close(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("hub shutting down");
        let _ = self.inner.shutdown_tx.send(true);

        let drained: Vec<(DocName, Arc<DocCoordinator>)> = {
            let mut index = self.inner.coordinators.lock().await;
            index.drain().collect()
        };
        for (_, coordinator) in drained {
            coordinator.shutdown_flush().await;
        }

        // Drop removes the lock file iff it is still ours
        self.instance_lock.lock().unwrap().take();
        log::info!("hub closed");
    }
}

impl HubInner {
    async fn get_or_create(self: &Arc<Self>, name: &DocName) -> Arc<DocCoordinator> {
        let mut index = self.coordinators.lock().await;
        if let Some(coordinator) = index.get(name) {
            return coordinator.clone();
        }
        let coordinator = DocCoordinator::open(
            name.clone(),
            self.storage.clone(),
            CoordinatorSettings::from(&self.config),
            self.metrics.clone(),
            self.evict_tx.clone(),
        )
        .await;
        index.insert(name.clone(), coordinator.clone());
        coordinator
    }
}

/// Routes idle-eviction requests: re-checks emptiness under the index lock
/// so a client racing the timer wins.
async fn evict_loop(hub: Arc<HubInner>, mut evict_rx: mpsc::UnboundedReceiver<DocName>) {
    while let Some(name) = evict_rx.recv().await {
        let evicted = {
            let mut index = hub.coordinators.lock().await;
            match index.get(&name) {
                Some(co) if co.client_count() == 0 => index.remove(&name),
                _ => None,
            }
        };
        if let Some(coordinator) = evicted {
            coordinator.shutdown_flush().await;
            log::info!("evicted idle document {name}");
        }
    }
}

/// Routes watcher events to the owning coordinator.
async fn watch_dispatch(
    hub: Arc<HubInner>,
    mut changes: tokio::sync::broadcast::Receiver<crate::storage::ExternalChange>,
) {
    loop {
        let change = match changes.recv().await {
            Ok(change) => change,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("external-change stream lagged by {n} events");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        };
        let owner = {
            let index = hub.coordinators.lock().await;
            index.values().find(|co| co.owns_path(&change.path)).cloned()
        };
        match owner {
            Some(coordinator) => coordinator.apply_external_change(change).await,
            None => {
                log::warn!("external change for unowned path {}", change.path.display());
            }
        }
    }
}

// ── HTTP + upgrade handling ─────────────────────────────────────────

async fn root_handler(
    State(hub): State<Arc<HubInner>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, <WebSocketUpgrade as axum::extract::FromRequestParts<Arc<HubInner>>>::Rejection>,
) -> Response {
    let ws = ws.ok();
    let info = RequestInfo {
        method: method.to_string(),
        path: uri.path().to_string(),
        headers: headers
            .iter()
            .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect(),
    };

    if let Some(handled) = hub.hooks.on_request(&info) {
        return hook_response(handled);
    }

    match ws {
        Some(ws) => {
            if hub.hooks.on_connection(&info) {
                // The hook owns this connection path; answer plainly and
                // leave the socket unupgraded.
                return with_cors((StatusCode::OK, "handled").into_response());
            }
            handle_upgrade(hub, ws, info).await
        }
        None => control_plane(hub, info).await,
    }
}

/// Admission decision for one socket.
enum Admission {
    Join(Arc<DocCoordinator>),
    Refuse(u16, &'static str),
}

async fn handle_upgrade(hub: Arc<HubInner>, ws: WebSocketUpgrade, info: RequestInfo) -> Response {
    let admission = admit(&hub, &info).await;
    let max_message_size = hub.config.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| socket_loop(hub, socket, admission))
}

async fn admit(hub: &Arc<HubInner>, info: &RequestInfo) -> Admission {
    if hub.shutting_down.load(Ordering::SeqCst) {
        return Admission::Refuse(CLOSE_GOING_AWAY, "shutting down");
    }
    if hub.metrics.active_connections() >= hub.config.max_connections as u64 {
        return Admission::Refuse(CLOSE_TRY_AGAIN_LATER, "connection limit reached");
    }
    let name = match DocName::from_request_path(&info.path, hub.config.path_prefix.as_deref()) {
        Ok(name) => name,
        Err(e) => {
            log::info!("refused socket for invalid name {:?}: {e}", info.path);
            return Admission::Refuse(CLOSE_POLICY_VIOLATION, "invalid document name");
        }
    };
    match hub.hooks.authorize(info, &name) {
        Ok(true) => {}
        Ok(false) => return Admission::Refuse(CLOSE_POLICY_VIOLATION, "unauthorized"),
        Err(e) => {
            log::error!("auth hook failed for {name}: {e}");
            hub.metrics.error();
            return Admission::Refuse(CLOSE_INTERNAL_ERROR, "authorization error");
        }
    }
    let coordinator = hub.get_or_create(&name).await;
    if coordinator.client_count() >= hub.config.max_connections_per_doc {
        return Admission::Refuse(CLOSE_TRY_AGAIN_LATER, "document connection limit reached");
    }
    Admission::Join(coordinator)
}

async fn socket_loop(hub: Arc<HubInner>, socket: WebSocket, admission: Admission) {
    let (mut sink, mut stream) = socket.split();

    let coordinator = match admission {
        Admission::Refuse(code, reason) => {
            let _ = sink
                .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
                .await;
            return;
        }
        Admission::Join(coordinator) => coordinator,
    };

    hub.metrics.connection_opened();
    let client_id: ClientId = Uuid::new_v4();
    let mut outbound = coordinator.register_client(client_id);
    log::info!("client {client_id} joined {}", coordinator.name());

    // Initial handshake: our state vector, then presence if any
    for frame in coordinator.handshake_frames() {
        hub.metrics.message_out(frame.len());
        if sink.send(Message::Binary(frame.into())).await.is_err() {
            coordinator.unregister_client(client_id);
            hub.metrics.connection_closed();
            return;
        }
    }

    let mut shutdown_rx = hub.shutdown_tx.subscribe();
    let mut ping_timer =
        tokio::time::interval(Duration::from_millis(hub.config.ping_interval_ms));
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_timer.tick().await; // the first tick is immediate
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Binary(data))) => {
                    hub.metrics.message_in(data.len());
                    match coordinator.handle_frame(client_id, &data) {
                        Ok(Some(reply)) => {
                            hub.metrics.message_out(reply.len());
                            if sink.send(Message::Binary(reply.into())).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            log::warn!("frame error from {client_id}: {e}");
                            hub.metrics.error();
                        }
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if sink.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    awaiting_pong = false;
                }
                Some(Ok(Message::Text(_))) => {
                    log::warn!("client {client_id} sent a text frame; ignoring");
                    hub.metrics.error();
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    log::debug!("socket error from {client_id}: {e}");
                    break;
                }
            },
            frame = outbound.recv() => match frame {
                Some(data) => {
                    if sink.send(Message::Binary(data.into())).await.is_err() {
                        break;
                    }
                }
                // Coordinator gone (evicted or hub closing)
                None => break,
            },
            _ = ping_timer.tick() => {
                if awaiting_pong {
                    log::info!("client {client_id} missed heartbeat; terminating");
                    break;
                }
                awaiting_pong = true;
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            },
            changed = shutdown_rx.changed() => {
                if changed.is_err() || !*shutdown_rx.borrow() {
                    continue;
                }
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_GOING_AWAY,
                        reason: "shutting down".into(),
                    })))
                    .await;
                break;
            }
        }
    }

    coordinator.unregister_client(client_id);
    hub.metrics.connection_closed();
    log::info!("client {client_id} left {}", coordinator.name());
}

// ── control plane ───────────────────────────────────────────────────

async fn control_plane(hub: Arc<HubInner>, info: RequestInfo) -> Response {
    if info.method == "OPTIONS" {
        return with_cors(StatusCode::NO_CONTENT.into_response());
    }
    match info.path.as_str() {
        "/health" | "/healthz" => {
            let shutting_down = hub.shutting_down.load(Ordering::SeqCst);
            let status = if shutting_down {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::OK
            };
            json_response(
                status,
                serde_json::json!({
                    "status": if shutting_down { "shutting_down" } else { "healthy" },
                    "shutting_down": shutting_down,
                }),
            )
        }
        "/metrics" => json_response(
            StatusCode::OK,
            serde_json::to_value(hub.metrics.snapshot()).unwrap_or_default(),
        ),
        "/stats" => {
            let documents: Vec<serde_json::Value> = {
                let index = hub.coordinators.lock().await;
                index
                    .values()
                    .map(|co| {
                        serde_json::json!({
                            "name": co.name().as_str(),
                            "connections": co.client_count(),
                            "path": hub.storage.locate(co.name()),
                        })
                    })
                    .collect()
            };
            let mut body =
                serde_json::to_value(hub.metrics.snapshot()).unwrap_or_default();
            if let Some(map) = body.as_object_mut() {
                map.insert("documents".into(), serde_json::Value::Array(documents));
                map.insert(
                    "config".into(),
                    serde_json::to_value(&hub.config).unwrap_or_default(),
                );
            }
            json_response(StatusCode::OK, body)
        }
        _ => with_cors(
            (
                StatusCode::OK,
                "mrmd-sync: collaborative markdown synchronization hub\n",
            )
                .into_response(),
        ),
    }
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    with_cors((status, axum::Json(body)).into_response())
}

fn hook_response(handled: HookResponse) -> Response {
    let status = StatusCode::from_u16(handled.status).unwrap_or(StatusCode::OK);
    let mut response = (status, handled.body).into_response();
    if let Ok(value) = HeaderValue::from_str(&handled.content_type) {
        response.headers_mut().insert(axum::http::header::CONTENT_TYPE, value);
    }
    with_cors(response)
}

fn with_cors(mut response: Response) -> Response {
    response.headers_mut().insert(
        axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}
