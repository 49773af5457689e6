#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use sandshell::config::{Config, ShellConfig};
use sandshell::server::{RunningServer, Server};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// A running server over a throwaway workspace.
pub struct TestServer {
    pub server: RunningServer,
    pub dir: tempfile::TempDir,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.server.local_addr(), path)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.server.local_addr())
    }

    pub fn workspace(&self) -> &std::path::Path {
        self.server.workspace()
    }
}

pub fn test_config(dir: &tempfile::TempDir) -> Config {
    Config {
        bind: "127.0.0.1:0".parse().unwrap(),
        workspace: dir.path().join("user"),
        debounce_ms: 100,
        shell: ShellConfig {
            program: Some("/bin/sh".into()),
            ..ShellConfig::default()
        },
        ..Config::default()
    }
}

pub async fn start() -> TestServer {
    start_with(|_| {}).await
}

pub async fn start_with(tweak: impl FnOnce(&mut Config)) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    tweak(&mut config);
    let server = Server::start(config).await.expect("server should start");
    TestServer { server, dir }
}

/// Open a WebSocket and consume the initial tree snapshot.
pub async fn connect(server: &TestServer) -> Ws {
    let (mut ws, _response) = connect_async(server.ws_url())
        .await
        .expect("WebSocket connect failed");
    let first = next_event(&mut ws).await;
    assert_eq!(first["event"], "tree:snapshot", "got {first}");
    ws
}

/// Next JSON event, skipping terminal output.
pub async fn next_event(ws: &mut Ws) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for event")
            .expect("stream ended")
            .expect("ws error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).expect("invalid JSON"),
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message {other:?}"),
        }
    }
}

/// Next JSON event within `wait`, or `None`.
pub async fn try_next_event(ws: &mut Ws, wait: Duration) -> Option<serde_json::Value> {
    tokio::time::timeout(wait, next_event(ws)).await.ok()
}

/// Collect terminal output until it contains `needle`.
pub async fn read_terminal_until(ws: &mut Ws, needle: &str) -> String {
    let mut collected = Vec::new();
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let msg = tokio::time::timeout_at(deadline, ws.next())
            .await
            .unwrap_or_else(|_| {
                panic!(
                    "timeout waiting for {needle:?}, got {:?}",
                    String::from_utf8_lossy(&collected)
                )
            })
            .expect("stream ended")
            .expect("ws error");
        if let Message::Binary(data) = msg {
            collected.extend_from_slice(&data);
            let text = String::from_utf8_lossy(&collected);
            if text.contains(needle) {
                return text.into_owned();
            }
        }
    }
}

pub async fn send_json(ws: &mut Ws, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("send failed");
}

pub async fn send_input(ws: &mut Ws, data: &str) {
    ws.send(Message::Binary(bytes::Bytes::copy_from_slice(data.as_bytes())))
        .await
        .expect("send failed");
}
