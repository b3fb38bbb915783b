//! End-to-end tests: a real hub on an ephemeral port, real WebSocket
//! clients, real files on disk.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use mrmd_sync::{
    AdmissionHooks, DocName, HubConfig, RequestInfo, SyncClient, SyncEvent, SyncHub,
};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

async fn start_hub(dir: &Path) -> (SyncHub, SocketAddr) {
    start_hub_with(dir, |_| {}).await
}

async fn start_hub_with(
    dir: &Path,
    tweak: impl FnOnce(&mut HubConfig),
) -> (SyncHub, SocketAddr) {
    let mut config = HubConfig::for_testing(dir);
    tweak(&mut config);
    let hub = SyncHub::new(config).expect("hub should start");
    let addr = hub.serve().await.expect("hub should bind");
    (hub, addr)
}

fn doc_url(addr: SocketAddr, name: &str) -> String {
    format!("ws://127.0.0.1:{}/{name}", addr.port())
}

async fn connect(url: &str) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.expect("client should connect");
    wait_for(&mut events, |e| matches!(e, SyncEvent::Connected)).await;
    (client, events)
}

/// Drain events until one matches, with a 2 s guard.
async fn wait_for(
    events: &mut mpsc::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> Vec<SyncEvent> {
    let mut seen = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for event; saw {seen:?}"))
            .expect("event channel closed");
        let done = pred(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

/// Minimal HTTP GET against the hub's control plane.
async fn http_get(addr: SocketAddr, path: &str) -> (u16, String) {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response).into_owned();
    let status: u16 = text
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_default();
    (status, body)
}

// ── the six literal scenarios ───────────────────────────────────────

#[tokio::test]
async fn test_pre_existing_file_is_read_on_first_connect() {
    let temp = TempDir::new().unwrap();
    std::fs::write(
        temp.path().join("existing.md"),
        "# Existing Content\n\nHello world!",
    )
    .unwrap();

    let (hub, addr) = start_hub(temp.path()).await;
    let (client, mut events) = connect(&doc_url(addr, "existing")).await;
    wait_for(&mut events, |e| matches!(e, SyncEvent::Synced)).await;

    assert_eq!(client.text(), "# Existing Content\n\nHello world!");
    hub.close().await;
}

#[tokio::test]
async fn test_new_document_is_created_on_first_edit() {
    let temp = TempDir::new().unwrap();
    let (hub, addr) = start_hub_with(temp.path(), |c| c.debounce_ms = 100).await;

    let (client, mut events) = connect(&doc_url(addr, "newfile")).await;
    wait_for(&mut events, |e| matches!(e, SyncEvent::Synced)).await;
    client.insert(0, "New content created!");

    tokio::time::sleep(Duration::from_millis(500)).await;
    let path = temp.path().join("newfile.md");
    assert!(path.exists(), "debounce should have created the file");
    assert!(std::fs::read_to_string(&path)
        .unwrap()
        .contains("New content created"));
    hub.close().await;
}

#[tokio::test]
async fn test_atomic_write_leaves_no_temp_files() {
    let temp = TempDir::new().unwrap();
    let (hub, addr) = start_hub_with(temp.path(), |c| c.debounce_ms = 50).await;

    let (client, mut events) = connect(&doc_url(addr, "atomic")).await;
    wait_for(&mut events, |e| matches!(e, SyncEvent::Synced)).await;
    client.insert(0, "some text worth writing");

    tokio::time::sleep(Duration::from_millis(300)).await;
    let leftovers: Vec<String> = std::fs::read_dir(temp.path())
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(".tmp."))
        .collect();
    assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
    hub.close().await;
}

#[tokio::test]
async fn test_two_clients_converge() {
    let temp = TempDir::new().unwrap();
    let (hub, addr) = start_hub(temp.path()).await;
    let url = doc_url(addr, "collab");

    let (client1, mut events1) = connect(&url).await;
    wait_for(&mut events1, |e| matches!(e, SyncEvent::Synced)).await;
    let (client2, mut events2) = connect(&url).await;
    wait_for(&mut events2, |e| matches!(e, SyncEvent::Synced)).await;

    client1.insert(0, "Hello from client 1");

    wait_for(&mut events2, |e| matches!(e, SyncEvent::RemoteUpdate)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client2.text(), "Hello from client 1");
    hub.close().await;
}

#[tokio::test]
async fn test_capacity_rejection() {
    let temp = TempDir::new().unwrap();
    let (hub, addr) = start_hub_with(temp.path(), |c| c.max_connections = 2).await;
    let url = doc_url(addr, "busy");

    let (_c1, mut e1) = connect(&url).await;
    wait_for(&mut e1, |e| matches!(e, SyncEvent::Synced)).await;
    let (_c2, mut e2) = connect(&url).await;
    wait_for(&mut e2, |e| matches!(e, SyncEvent::Synced)).await;

    // Third connection: handshake completes, then the server closes with a
    // try-again code and never sends a sync-step-1
    let (_c3, mut e3) = connect(&url).await;
    let seen = wait_for(&mut e3, |e| matches!(e, SyncEvent::Closed(_))).await;
    assert!(
        seen.iter()
            .any(|e| matches!(e, SyncEvent::Closed(Some(1013)))),
        "expected close 1013, saw {seen:?}"
    );
    assert!(
        !seen.iter().any(|e| matches!(e, SyncEvent::ServerStep1)),
        "a refused socket must never observe sync-step-1"
    );
    hub.close().await;
}

#[tokio::test]
async fn test_shutdown_flush_preserves_late_edits() {
    let temp = TempDir::new().unwrap();
    let (hub, addr) = start_hub_with(temp.path(), |c| c.debounce_ms = 5_000).await;

    let (client, mut events) = connect(&doc_url(addr, "parting")).await;
    wait_for(&mut events, |e| matches!(e, SyncEvent::Synced)).await;
    client.insert(0, "Content before shutdown!");

    // Let the frame reach the coordinator, then close before the debounce
    // could possibly fire
    tokio::time::sleep(Duration::from_millis(200)).await;
    hub.close().await;

    let persisted = std::fs::read_to_string(temp.path().join("parting.md")).unwrap();
    assert!(persisted.contains("Content before shutdown!"));
}

// ── properties ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_edit_ordering_preserved_across_clients() {
    let temp = TempDir::new().unwrap();
    let (hub, addr) = start_hub(temp.path()).await;
    let url = doc_url(addr, "ordered");

    let (writer, mut we) = connect(&url).await;
    wait_for(&mut we, |e| matches!(e, SyncEvent::Synced)).await;
    let (reader, mut re) = connect(&url).await;
    wait_for(&mut re, |e| matches!(e, SyncEvent::Synced)).await;

    // Two causally ordered edits from the same client
    writer.insert(0, "first");
    writer.insert(5, " second");

    wait_for(&mut re, |e| matches!(e, SyncEvent::RemoteUpdate)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(reader.text(), "first second");
    hub.close().await;
}

#[tokio::test]
async fn test_idle_eviction_removes_coordinator() {
    let temp = TempDir::new().unwrap();
    let (hub, addr) = start_hub_with(temp.path(), |c| c.doc_cleanup_delay_ms = 150).await;

    let (client, mut events) = connect(&doc_url(addr, "fleeting")).await;
    wait_for(&mut events, |e| matches!(e, SyncEvent::Synced)).await;
    let name = DocName::parse("fleeting").unwrap();
    assert!(hub.has_document(&name).await);

    client.close().await;
    wait_for(&mut events, |e| matches!(e, SyncEvent::Disconnected)).await;

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(
        !hub.has_document(&name).await,
        "idle coordinator should be evicted"
    );
    hub.close().await;
}

#[tokio::test]
async fn test_invalid_names_rejected_with_policy_code() {
    let temp = TempDir::new().unwrap();
    let (hub, addr) = start_hub(temp.path()).await;

    for bad in ["..%2Fescape", "bad%20name", "semi;colon"] {
        let url = doc_url(addr, bad);
        let (_client, mut events) = connect(&url).await;
        let seen = wait_for(&mut events, |e| matches!(e, SyncEvent::Closed(_))).await;
        assert!(
            seen.iter()
                .any(|e| matches!(e, SyncEvent::Closed(Some(1008)))),
            "{bad}: expected close 1008, saw {seen:?}"
        );
        assert!(!seen.iter().any(|e| matches!(e, SyncEvent::ServerStep1)));
    }
    hub.close().await;
}

#[tokio::test]
async fn test_presence_broadcast_and_departure() {
    let temp = TempDir::new().unwrap();
    let (hub, addr) = start_hub(temp.path()).await;
    let url = doc_url(addr, "cursors");

    let (mover, mut me) = connect(&url).await;
    wait_for(&mut me, |e| matches!(e, SyncEvent::Synced)).await;
    let (observer, mut oe) = connect(&url).await;
    wait_for(&mut oe, |e| matches!(e, SyncEvent::Synced)).await;

    mover.send_presence(b"{\"cursor\":7}").await.unwrap();
    wait_for(&mut oe, |e| matches!(e, SyncEvent::PresenceChanged(1))).await;
    assert_eq!(observer.presence_len().await, 1);

    // Departure clears the mover's presence at the observer
    mover.close().await;
    wait_for(&mut oe, |e| matches!(e, SyncEvent::PresenceChanged(0))).await;
    assert_eq!(observer.presence_len().await, 0);
    hub.close().await;
}

#[tokio::test]
async fn test_late_joiner_receives_presence_snapshot() {
    let temp = TempDir::new().unwrap();
    let (hub, addr) = start_hub(temp.path()).await;
    let url = doc_url(addr, "late-presence");

    let (early, mut ee) = connect(&url).await;
    wait_for(&mut ee, |e| matches!(e, SyncEvent::Synced)).await;
    early.send_presence(b"here").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (_late, mut le) = connect(&url).await;
    wait_for(&mut le, |e| matches!(e, SyncEvent::PresenceChanged(1))).await;
    hub.close().await;
}

#[tokio::test]
async fn test_auth_hook_denial_closes_with_policy_code() {
    struct DenyAll;
    impl AdmissionHooks for DenyAll {
        fn authorize(
            &self,
            _request: &RequestInfo,
            _doc: &DocName,
        ) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
            Ok(false)
        }
    }

    let temp = TempDir::new().unwrap();
    let hub = SyncHub::new(HubConfig::for_testing(temp.path()))
        .unwrap()
        .hooks(Arc::new(DenyAll));
    let addr = hub.serve().await.unwrap();

    let (_client, mut events) = connect(&doc_url(addr, "secret")).await;
    let seen = wait_for(&mut events, |e| matches!(e, SyncEvent::Closed(_))).await;
    assert!(seen
        .iter()
        .any(|e| matches!(e, SyncEvent::Closed(Some(1008)))));
    hub.close().await;
}

// ── control plane ───────────────────────────────────────────────────

#[tokio::test]
async fn test_health_endpoints() {
    let temp = TempDir::new().unwrap();
    let (hub, addr) = start_hub(temp.path()).await;

    for path in ["/health", "/healthz"] {
        let (status, body) = http_get(addr, path).await;
        assert_eq!(status, 200, "{path}");
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["shutting_down"], false);
    }
    hub.close().await;
}

#[tokio::test]
async fn test_metrics_endpoint_counts_connections() {
    let temp = TempDir::new().unwrap();
    let (hub, addr) = start_hub(temp.path()).await;

    let (_client, mut events) = connect(&doc_url(addr, "counted")).await;
    wait_for(&mut events, |e| matches!(e, SyncEvent::Synced)).await;

    let (status, body) = http_get(addr, "/metrics").await;
    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["connections"]["active"], 1);
    assert_eq!(json["connections"]["total"], 1);
    assert!(json["lastActivity"].is_string());
    hub.close().await;
}

#[tokio::test]
async fn test_stats_lists_documents() {
    let temp = TempDir::new().unwrap();
    let (hub, addr) = start_hub(temp.path()).await;

    let (_client, mut events) = connect(&doc_url(addr, "visible")).await;
    wait_for(&mut events, |e| matches!(e, SyncEvent::Synced)).await;

    let (status, body) = http_get(addr, "/stats").await;
    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    let docs = json["documents"].as_array().unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["name"], "visible");
    assert_eq!(docs[0]["connections"], 1);
    assert!(docs[0]["path"].as_str().unwrap().ends_with("visible.md"));
    assert!(json["config"]["debounce_ms"].is_u64());
    hub.close().await;
}

#[tokio::test]
async fn test_unmatched_path_serves_banner() {
    let temp = TempDir::new().unwrap();
    let (hub, addr) = start_hub(temp.path()).await;
    let (status, body) = http_get(addr, "/definitely/not/an/endpoint").await;
    assert_eq!(status, 200);
    assert!(body.contains("mrmd-sync"));
    hub.close().await;
}
