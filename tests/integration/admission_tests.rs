//! Upgrade admission checks and the monitoring routes on the shared listener

mod common;

use common::{recv_text, send_text, start_relay};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Error as WsError;

fn upgrade_status(err: WsError) -> u16 {
    match err {
        WsError::Http(response) => response.status().as_u16(),
        other => panic!("expected an HTTP rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_disallowed_origin_is_forbidden() {
    let relay = start_relay(|config| {
        config.server.allowed_origins = vec!["http://app.example".to_string()];
    })
    .await;

    let mut request = relay.ws_url().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", HeaderValue::from_static("http://evil.example"));

    let err = connect_async(request).await.unwrap_err();
    assert_eq!(upgrade_status(err), 403);
    assert!(relay.registry.is_empty());
}

#[tokio::test]
async fn test_allowed_origin_is_accepted() {
    let relay = start_relay(|config| {
        config.server.allowed_origins = vec!["http://app.example".to_string()];
    })
    .await;

    let mut request = relay.ws_url().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", HeaderValue::from_static("http://app.example"));

    let (_ws, response) = connect_async(request).await.unwrap();
    assert_eq!(response.status().as_u16(), 101);
    relay.wait_for_count(1).await;
}

#[tokio::test]
async fn test_capacity_limit_rejects_extra_peers() {
    let relay = start_relay(|config| {
        config.server.max_connections = 2;
    })
    .await;

    let mut a = relay.connect().await;
    let mut b = relay.connect().await;

    let err = connect_async(relay.ws_url()).await.unwrap_err();
    assert_eq!(upgrade_status(err), 503);
    assert_eq!(relay.registry.len(), 2);

    // Existing peers are unaffected
    send_text(&mut a, "still here").await;
    assert_eq!(recv_text(&mut b).await.as_deref(), Some("still here"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_upgrades_never_exceed_capacity() {
    let relay = start_relay(|config| {
        config.server.max_connections = 1;
    })
    .await;

    let attempts = (0..32).map(|_| connect_async(relay.ws_url()));
    let results = futures::future::join_all(attempts).await;

    let mut accepted = Vec::new();
    for result in results {
        match result {
            Ok((ws, _)) => accepted.push(ws),
            Err(err) => assert_eq!(upgrade_status(err), 503),
        }
    }

    assert_eq!(accepted.len(), 1);
    relay.wait_for_count(1).await;
}

#[tokio::test]
async fn test_capacity_frees_up_after_disconnect() {
    let relay = start_relay(|config| {
        config.server.max_connections = 1;
    })
    .await;

    let first = relay.connect().await;
    assert!(connect_async(relay.ws_url()).await.is_err());

    drop(first);
    relay.wait_for_count(0).await;

    let _second = relay.connect().await;
}

#[tokio::test]
async fn test_healthz_on_relay_port() {
    let relay = start_relay(|_| {}).await;

    let mut stream = TcpStream::connect(relay.addr).await.unwrap();
    stream
        .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with(r#"{"status":"ok"}"#));
}
