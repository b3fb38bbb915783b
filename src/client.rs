//! Programmatic sync client.
//!
//! Connects to a hub, completes the sync handshake, mirrors the document in
//! a local replica, and pushes local edits as update frames. This is the
//! crate's own reference client; the integration tests drive the full
//! server pipeline with it.
//!
//! Offline replay is deliberately absent: a disconnected client simply
//! reconnects and resynchronizes through the step-1/step-2 handshake.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::presence::{self, PresenceState};
use crate::protocol::{self, Frame, SyncMessage};
use crate::replica::{Replica, Subscription};

/// Origin tag for this client's own edits.
const LOCAL_ORIGIN: &str = "local";
/// Origin tag for updates received from the hub.
const REMOTE_ORIGIN: &str = "remote";

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events surfaced to the embedding application (and the tests).
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// WebSocket established.
    Connected,
    /// The server announced its state vector (sync-step-1 observed).
    ServerStep1,
    /// A state diff was applied; the replica now mirrors the server.
    Synced,
    /// A remote incremental update was applied.
    RemoteUpdate,
    /// Presence changed; carries the number of present peers.
    PresenceChanged(usize),
    /// Server closed the socket with this close code.
    Closed(Option<u16>),
    /// Transport gone.
    Disconnected,
}

/// Outbound instruction for the writer task.
enum OutMsg {
    Frame(Vec<u8>),
    Close,
}

/// A WebSocket client for one document.
pub struct SyncClient {
    url: String,
    replica: Arc<Replica>,
    presence: Arc<Mutex<PresenceState>>,
    presence_clock: AtomicU64,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: Option<mpsc::Sender<OutMsg>>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    _update_sub: Option<Subscription>,
}

impl SyncClient {
    /// Create a client for `ws://host:port/<doc-name>`.
    pub fn new(url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            url: url.into(),
            replica: Arc::new(Replica::new()),
            presence: Arc::new(Mutex::new(PresenceState::new())),
            presence_clock: AtomicU64::new(0),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
            _update_sub: None,
        }
    }

    /// Take the event receiver (once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and start the sync handshake.
    pub async fn connect(&mut self) -> Result<(), String> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|e| e.to_string())?;
        let (mut ws_sink, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<OutMsg>(256);
        self.outgoing_tx = Some(out_tx.clone());
        let event_tx = self.event_tx.clone();

        // Writer task: forward outgoing frames to the socket
        tokio::spawn(async move {
            use tokio_tungstenite::tungstenite::Message;
            while let Some(msg) = out_rx.recv().await {
                let result = match msg {
                    OutMsg::Frame(data) => ws_sink.send(Message::Binary(data.into())).await,
                    OutMsg::Close => {
                        let _ = ws_sink.send(Message::Close(None)).await;
                        break;
                    }
                };
                if result.is_err() {
                    break;
                }
            }
        });

        // Local edits become update frames
        let out_for_updates = out_tx.clone();
        let sub = self
            .replica
            .observe(move |event| {
                if event.origin.as_deref() == Some(LOCAL_ORIGIN) {
                    let _ = out_for_updates
                        .try_send(OutMsg::Frame(protocol::sync_update(&event.update)));
                }
            })
            .map_err(|e| e.to_string())?;
        self._update_sub = Some(sub);

        // Announce our state so the server can diff against it
        let _ = out_tx
            .send(OutMsg::Frame(protocol::sync_step1(&self.replica.state_vector())))
            .await;

        *self.state.write().await = ConnectionState::Connected;
        let _ = event_tx.send(SyncEvent::Connected).await;

        // Reader task
        let replica = self.replica.clone();
        let presence = self.presence.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            use tokio_tungstenite::tungstenite::Message;
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let frame = match Frame::decode(&bytes) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("undecodable frame from server: {e}");
                                continue;
                            }
                        };
                        match frame {
                            Frame::Sync(SyncMessage::Step1(sv)) => {
                                let _ = event_tx.send(SyncEvent::ServerStep1).await;
                                if let Ok(diff) = replica.diff(&sv) {
                                    let _ =
                                        out_tx.send(OutMsg::Frame(protocol::sync_step2(&diff))).await;
                                }
                            }
                            Frame::Sync(SyncMessage::Step2(update)) => {
                                if replica.apply_update(&update, REMOTE_ORIGIN).is_ok() {
                                    let _ = event_tx.send(SyncEvent::Synced).await;
                                }
                            }
                            Frame::Sync(SyncMessage::Update(update)) => {
                                if replica.apply_update(&update, REMOTE_ORIGIN).is_ok() {
                                    let _ = event_tx.send(SyncEvent::RemoteUpdate).await;
                                }
                            }
                            Frame::Presence(update) => {
                                let mut presence = presence.lock().await;
                                if presence.apply_update(&update).is_ok() {
                                    let _ = event_tx
                                        .send(SyncEvent::PresenceChanged(presence.len()))
                                        .await;
                                }
                            }
                            Frame::Unknown(_) => {}
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let code = frame.map(|f| u16::from(f.code));
                        let _ = event_tx.send(SyncEvent::Closed(code)).await;
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::debug!("client socket error: {e}");
                        break;
                    }
                }
            }
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Current text of the mirrored document.
    pub fn text(&self) -> String {
        self.replica.text()
    }

    /// Insert text at a byte offset; the update is pushed to the hub.
    pub fn insert(&self, index: u32, chunk: &str) {
        self.replica.insert(index, chunk, LOCAL_ORIGIN);
    }

    /// Delete a byte range; the update is pushed to the hub.
    pub fn delete(&self, index: u32, len: u32) {
        self.replica.delete(index, len, LOCAL_ORIGIN);
    }

    /// This client's replica id, used as its presence identity.
    pub fn client_id(&self) -> u64 {
        self.replica.client_id()
    }

    /// Announce a presence payload (cursor, selection) to the hub.
    pub async fn send_presence(&self, payload: &[u8]) -> Result<(), String> {
        let clock = self.presence_clock.fetch_add(1, Ordering::SeqCst) + 1;
        let update = presence::encode_single(self.client_id(), clock, payload);
        self.send_raw(protocol::presence_frame(&update)).await
    }

    /// Peers currently present according to the hub.
    pub async fn presence_len(&self) -> usize {
        self.presence.lock().await.len()
    }

    /// Current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Send a close frame and stop writing. The server observes a clean
    /// disconnect; events keep flowing until the socket fully drops.
    pub async fn close(&self) {
        if let Some(tx) = &self.outgoing_tx {
            let _ = tx.send(OutMsg::Close).await;
        }
    }

    async fn send_raw(&self, frame: Vec<u8>) -> Result<(), String> {
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(OutMsg::Frame(frame))
                .await
                .map_err(|_| "connection closed".to_string()),
            None => Err("not connected".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = SyncClient::new("ws://127.0.0.1:9999/doc");
        assert_eq!(client.text(), "");
    }

    #[tokio::test]
    async fn test_initial_state_disconnected() {
        let client = SyncClient::new("ws://127.0.0.1:9999/doc");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_local_edits_apply_offline() {
        let client = SyncClient::new("ws://127.0.0.1:9999/doc");
        client.insert(0, "hello");
        client.insert(5, " world");
        assert_eq!(client.text(), "hello world");
        client.delete(0, 6);
        assert_eq!(client.text(), "world");
    }

    #[tokio::test]
    async fn test_connect_to_nothing_fails() {
        let mut client = SyncClient::new("ws://127.0.0.1:1/doc");
        assert!(client.connect().await.is_err());
    }
}
