//! End-to-end checks against a live listener over TCP.

use futures_util::{SinkExt, StreamExt};
use hostlink_core::{decode_frame, msg, Envelope};
use hostlink_server::{register_builtin_handlers, start_listener, GatewayConfig, SessionGateway};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn serve() -> (SessionGateway, SocketAddr) {
    let gateway = SessionGateway::new(GatewayConfig {
        port_monitor_enabled: false,
        shell: "/bin/sh".into(),
        cwd: std::env::temp_dir(),
        ..GatewayConfig::default()
    });
    register_builtin_handlers(&gateway);
    let (addr, _task) = start_listener(gateway.clone(), "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    (gateway, addr)
}

async fn dial(addr: SocketAddr, target: &str) -> Client {
    let (ws, _resp) = tokio_tungstenite::connect_async(format!("ws://{addr}{target}"))
        .await
        .unwrap();
    ws
}

async fn expect(client: &mut Client, msg_type: &str) -> Envelope {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => {
                    let env = decode_frame(&text).unwrap();
                    if env.msg_type == msg_type {
                        return env;
                    }
                }
                Some(Ok(_)) => {}
                other => panic!("stream ended waiting for {msg_type}: {other:?}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {msg_type}"))
}

/// Wait until the gateway has registered `n` connections.
async fn wait_for_connections(gateway: &SessionGateway, n: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while gateway.connection_count() != n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection count never reached");
}

#[tokio::test]
async fn upgrade_request_target_is_captured() {
    let (gateway, addr) = serve().await;
    let _a = dial(addr, "/workspace?project=demo&mode=edit").await;
    wait_for_connections(&gateway, 1).await;

    let id = gateway.connections().pop().unwrap();
    assert_eq!(gateway.path(&id).as_deref(), Some("/workspace"));
    let params = gateway.params(&id).unwrap();
    assert_eq!(params.get("project").map(String::as_str), Some("demo"));
    assert_eq!(params.get("mode").map(String::as_str), Some("edit"));
}

#[tokio::test]
async fn ping_and_listing_over_tcp() {
    let (_gateway, addr) = serve().await;
    let mut client = dial(addr, "/").await;

    client
        .send(Message::Text(json!({ "type": "ping", "requestId": "live" }).to_string()))
        .await
        .unwrap();
    assert_eq!(expect(&mut client, msg::PONG).await.request_id, "live");

    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("src")).unwrap();
    client
        .send(Message::Text(
            json!({ "type": "fs.list", "path": dir.path().to_string_lossy() }).to_string(),
        ))
        .await
        .unwrap();
    let listing = expect(&mut client, msg::FS_LISTING).await;
    assert_eq!(listing.payload["entries"][0]["name"], json!("src"));
    assert_eq!(listing.payload["entries"][0]["isDirectory"], json!(true));
}

#[tokio::test]
async fn last_client_leaving_shuts_the_gateway_down() {
    let (gateway, addr) = serve().await;
    let mut a = dial(addr, "/").await;
    let mut b = dial(addr, "/").await;
    wait_for_connections(&gateway, 2).await;

    a.close(None).await.unwrap();
    wait_for_connections(&gateway, 1).await;
    assert!(!gateway.is_shut_down());

    b.close(None).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !gateway.is_shut_down() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("gateway never shut down");

    // The acceptor is closed: new clients are refused.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(tokio_tungstenite::connect_async(format!("ws://{addr}/")).await.is_err());
}
