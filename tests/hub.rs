//! End-to-end tests driving a real hub over a loopback WebSocket, mirroring
//! the literal scenarios in the design notes: connect listing, table
//! replication, fetch-after-restart, endpoint RPC, and session replacement.

use std::net::SocketAddr;
use std::path::Path;

use apphub::config::Config;
use apphub::server::Server;
use apphub::wire::App;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_hub(data_path: &Path) -> (Server, SocketAddr) {
    let mut config = Config::default();
    config.address.host = "127.0.0.1".into();
    config.address.port = 0;
    config.data_path = data_path.to_path_buf();

    let server = Server::new(&config).await.expect("server builds");
    let addr = server.start().await.expect("server starts");
    (server, addr)
}

async fn connect(addr: SocketAddr, app: &App) -> WsStream {
    let url = format!("ws://{addr}/ws");
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.expect("ws connects");
    ws.send(Message::Text(serde_json::to_string(app).unwrap().into())).await.unwrap();
    ws
}

async fn send_event(ws: &mut WsStream, kind: &str, data: Value) {
    let envelope = json!({ "type": kind, "data": data });
    ws.send(Message::Text(serde_json::to_string(&envelope).unwrap().into())).await.unwrap();
}

/// Reads frames until one decodes to `kind`, ignoring anything else (the
/// hub may interleave other housekeeping frames a given scenario doesn't
/// care about).
async fn recv_event(ws: &mut WsStream, kind: &str) -> Value {
    loop {
        let msg = ws.next().await.expect("stream open").expect("frame read");
        let Message::Text(text) = msg else { continue };
        let envelope: Value = serde_json::from_str(&text).unwrap();
        if envelope["type"] == kind {
            return envelope["data"].clone();
        }
    }
}

fn test_app(name: &str, group: &str) -> App {
    App { name: name.into(), group: group.into(), version: "1".into() }
}

#[tokio::test]
async fn handshake_and_connect_listing() {
    let dir = tempfile::tempdir().unwrap();
    let (_server, addr) = spawn_hub(dir.path()).await;

    let mut client = connect(addr, &test_app("a", "g")).await;
    send_event(
        &mut client,
        "endpoint/call",
        json!({"type": "table/item_get", "key": "1", "data": {"type": "server:apps", "key": "g/a", "keys": ["g/a"]}}),
    )
    .await;
    let data = recv_event(&mut client, "endpoint/receive").await;
    let items = data["items"].as_object().unwrap();
    assert!(items.contains_key("g/a"), "connecting app should appear under server:apps");

    client.close(None).await.ok();
    // give the disconnect hook a turn to run before asserting removal
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let mut checker = connect(addr, &test_app("checker", "g")).await;
    send_event(
        &mut checker,
        "endpoint/call",
        json!({"type": "table/item_get", "key": "2", "data": {"type": "server:apps", "key": "g/a", "keys": ["g/a"]}}),
    )
    .await;
    let data = recv_event(&mut checker, "endpoint/receive").await;
    assert!(!data["items"].as_object().unwrap().contains_key("g/a"), "disconnected app should be removed");
}

#[tokio::test]
async fn table_echo_replicates_between_two_clients() {
    let dir = tempfile::tempdir().unwrap();
    let (_server, addr) = spawn_hub(dir.path()).await;

    let mut a = connect(addr, &test_app("a", "g")).await;
    send_event(&mut a, "table/register", json!({"extension": "ext", "name": "t", "use_database": false})).await;
    send_event(&mut a, "table/listen", json!("ext:t")).await;

    let mut b = connect(addr, &test_app("b", "g")).await;
    send_event(&mut b, "table/register", json!({"extension": "ext", "name": "t", "use_database": false})).await;
    send_event(&mut b, "table/item_add", json!({"type": "ext:t", "items": {"k": {"v": 1}}})).await;

    let data = recv_event(&mut a, "table/item_add").await;
    assert_eq!(data["type"], "ext:t");
    assert_eq!(data["items"]["k"]["v"], 1);
}

#[tokio::test]
async fn fetch_after_restart_returns_persisted_items() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (server, addr) = spawn_hub(dir.path()).await;
        let mut a = connect(addr, &test_app("a", "g")).await;
        send_event(&mut a, "table/register", json!({"extension": "ext", "name": "t", "use_database": true})).await;
        send_event(&mut a, "table/item_add", json!({"type": "ext:t", "items": {"k": {"v": 1}}})).await;
        // let the add land before tearing the hub down
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        server.shutdown().await;
    }

    let (_server, addr) = spawn_hub(dir.path()).await;
    let mut c = connect(addr, &test_app("c", "g")).await;
    send_event(&mut c, "table/register", json!({"extension": "ext", "name": "t", "use_database": true})).await;
    send_event(
        &mut c,
        "endpoint/call",
        json!({"type": "table/item_fetch", "key": "1", "data": {"type": "ext:t", "key": "req1", "limit": 10, "cursor": null}}),
    )
    .await;

    let data = recv_event(&mut c, "endpoint/receive").await;
    assert_eq!(data["key"], "req1");
    assert_eq!(data["items"]["k"]["v"], 1);
}

#[tokio::test]
async fn endpoint_rpc_round_trips_between_provider_and_caller() {
    let dir = tempfile::tempdir().unwrap();
    let (_server, addr) = spawn_hub(dir.path()).await;

    let mut provider = connect(addr, &test_app("p", "g")).await;
    send_event(&mut provider, "endpoint/register", json!({"key": "svc:ping"})).await;

    let mut caller = connect(addr, &test_app("c", "g")).await;
    send_event(&mut caller, "endpoint/call", json!({"type": "svc:ping", "key": "1", "data": null})).await;

    let call = recv_event(&mut provider, "endpoint/call").await;
    assert_eq!(call["type"], "svc:ping");

    send_event(&mut provider, "endpoint/receive", json!({"type": "svc:ping", "key": "1", "data": "pong"})).await;

    let data = recv_event(&mut caller, "endpoint/receive").await;
    assert_eq!(data["data"], "pong");
}

#[tokio::test]
async fn endpoint_call_with_no_provider_yields_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let (_server, addr) = spawn_hub(dir.path()).await;

    let mut caller = connect(addr, &test_app("c", "g")).await;
    send_event(&mut caller, "endpoint/call", json!({"type": "svc:ping", "key": "2", "data": null})).await;

    let data = recv_event(&mut caller, "endpoint/error").await;
    assert_eq!(data["error"], "Endpoint not found");
}

#[tokio::test]
async fn session_replacement_closes_the_older_socket() {
    let dir = tempfile::tempdir().unwrap();
    let (_server, addr) = spawn_hub(dir.path()).await;

    let mut older = connect(addr, &test_app("a", "g")).await;
    let mut newer = connect(addr, &test_app("a", "g")).await;

    let closed = tokio::time::timeout(std::time::Duration::from_secs(2), async {
        loop {
            match older.next().await {
                Some(Ok(Message::Close(_))) | None => return true,
                Some(Ok(_)) => continue,
                Some(Err(_)) => return true,
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(closed, "the replaced session should observe a close");

    send_event(&mut newer, "endpoint/call", json!({"type": "svc:missing", "key": "1", "data": null})).await;
    let data = recv_event(&mut newer, "endpoint/error").await;
    assert_eq!(data["error"], "Endpoint not found");
}
