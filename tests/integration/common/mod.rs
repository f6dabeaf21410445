//! Shared harness for relay integration tests

#![allow(dead_code)]

use anyhow::Result;
use fanout_relay::connection::ConnectionRegistry;
use fanout_relay::{Config, Server, ShutdownHandle};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A relay running on an ephemeral loopback port
pub struct TestRelay {
    pub addr: SocketAddr,
    pub registry: Arc<ConnectionRegistry>,
    pub shutdown: ShutdownHandle,
    pub task: JoinHandle<Result<()>>,
}

impl TestRelay {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Open a client and wait until the relay has registered it
    pub async fn connect(&self) -> WsClient {
        let before = self.registry.len();
        let (ws, _) = connect_async(self.ws_url()).await.expect("connect");
        self.wait_for_count(before + 1).await;
        ws
    }

    /// Poll until the registry holds exactly `expected` connections
    pub async fn wait_for_count(&self, expected: usize) {
        let registry = self.registry.clone();
        tokio::time::timeout(Duration::from_secs(5), async move {
            while registry.len() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "registry never reached {} connections (has {})",
                expected,
                self.registry.len()
            )
        });
    }
}

/// Start a relay with heartbeats off and the given tweaks applied
pub async fn start_relay(tweak: impl FnOnce(&mut Config)) -> TestRelay {
    let mut config = Config::with_bind_addr("127.0.0.1:0".parse().unwrap());
    config.heartbeat.enabled = false;
    tweak(&mut config);
    config.validate().expect("valid test config");

    let server = Server::new(Arc::new(config)).await.expect("bind relay");
    let addr = server.local_addr().expect("local addr");
    let registry = server.registry().clone();
    let shutdown = server.shutdown_handle();
    let task = tokio::spawn(server.run());

    TestRelay {
        addr,
        registry,
        shutdown,
        task,
    }
}

pub async fn send_text(ws: &mut WsClient, text: &str) {
    ws.send(Message::text(text)).await.expect("send");
}

/// Next text frame, skipping control frames; `None` on close or timeout
pub async fn recv_text(ws: &mut WsClient) -> Option<String> {
    recv_text_within(ws, Duration::from_secs(2)).await
}

pub async fn recv_text_within(ws: &mut WsClient, wait: Duration) -> Option<String> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let next = tokio::time::timeout_at(deadline, ws.next()).await.ok()??;
        match next.ok()? {
            Message::Text(text) => return Some(text.as_str().to_string()),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

/// Next close frame code, skipping anything else
pub async fn recv_close_code(ws: &mut WsClient) -> Option<u16> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let next = tokio::time::timeout_at(deadline, ws.next()).await.ok()??;
        if let Message::Close(frame) = next.ok()? {
            return frame.map(|f| u16::from(f.code));
        }
    }
}
