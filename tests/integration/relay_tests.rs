//! End-to-end fan-out behaviour over real WebSocket connections

mod common;

use common::{recv_close_code, recv_text, recv_text_within, send_text, start_relay};
use futures::SinkExt;
use std::time::Duration;

/// A message reaches every other peer once and never echoes to the sender
#[tokio::test]
async fn test_broadcast_excludes_sender() {
    let relay = start_relay(|_| {}).await;
    let mut a = relay.connect().await;
    let mut b = relay.connect().await;
    let mut c = relay.connect().await;

    send_text(&mut a, "hello").await;

    assert_eq!(recv_text(&mut b).await.as_deref(), Some("hello"));
    assert_eq!(recv_text(&mut c).await.as_deref(), Some("hello"));
    assert_eq!(
        recv_text_within(&mut a, Duration::from_millis(200)).await,
        None
    );

    // Nothing arrives twice
    assert_eq!(
        recv_text_within(&mut b, Duration::from_millis(200)).await,
        None
    );
}

/// A peer that drops without a close handshake is pruned and never blocks others
#[tokio::test]
async fn test_disconnected_peer_is_pruned() {
    let relay = start_relay(|_| {}).await;
    let mut a = relay.connect().await;
    let b = relay.connect().await;
    let mut c = relay.connect().await;

    drop(b);
    relay.wait_for_count(2).await;

    send_text(&mut a, "ping").await;
    assert_eq!(recv_text(&mut c).await.as_deref(), Some("ping"));
    assert_eq!(relay.registry.len(), 2);
}

/// Messages from one sender arrive in the order they were sent
#[tokio::test]
async fn test_single_sender_order() {
    let relay = start_relay(|_| {}).await;
    let mut a = relay.connect().await;
    let mut b = relay.connect().await;

    for i in 0..100 {
        send_text(&mut a, &format!("m{i}")).await;
    }

    for i in 0..100 {
        assert_eq!(recv_text(&mut b).await, Some(format!("m{i}")));
    }
}

/// A lone sender gets nothing back and stays connected
#[tokio::test]
async fn test_lone_sender() {
    let relay = start_relay(|_| {}).await;
    let mut a = relay.connect().await;

    send_text(&mut a, "solo").await;

    assert_eq!(
        recv_text_within(&mut a, Duration::from_millis(200)).await,
        None
    );
    assert_eq!(relay.registry.len(), 1);
}

/// A peer that joins later only sees messages sent after it registered
#[tokio::test]
async fn test_late_joiner_gets_no_history() {
    let relay = start_relay(|_| {}).await;
    let mut a = relay.connect().await;
    let mut b = relay.connect().await;

    send_text(&mut a, "before").await;
    assert_eq!(recv_text(&mut b).await.as_deref(), Some("before"));

    let mut late = relay.connect().await;
    send_text(&mut a, "after").await;

    assert_eq!(recv_text(&mut late).await.as_deref(), Some("after"));
    assert_eq!(recv_text(&mut b).await.as_deref(), Some("after"));
}

/// Every peer can send and everyone else hears it
#[tokio::test]
async fn test_all_peers_are_senders() {
    let relay = start_relay(|_| {}).await;
    let mut clients = Vec::new();
    for _ in 0..4 {
        clients.push(relay.connect().await);
    }

    for (i, client) in clients.iter_mut().enumerate() {
        send_text(client, &format!("from-{i}")).await;
    }

    for (i, client) in clients.iter_mut().enumerate() {
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(recv_text(client).await.expect("message"));
        }
        seen.sort();
        let mut expected: Vec<String> = (0..4)
            .filter(|j| *j != i)
            .map(|j| format!("from-{j}"))
            .collect();
        expected.sort();
        assert_eq!(seen, expected);
    }
}

/// A graceful client close unregisters the peer
#[tokio::test]
async fn test_client_close_unregisters() {
    let relay = start_relay(|_| {}).await;
    let mut a = relay.connect().await;
    let _b = relay.connect().await;

    a.close(None).await.expect("close");
    relay.wait_for_count(1).await;
}

/// Binary frames are refused with 1003 and the peer is removed
#[tokio::test]
async fn test_binary_frame_closes_connection() {
    let relay = start_relay(|_| {}).await;
    let mut a = relay.connect().await;
    let mut b = relay.connect().await;

    a.send(tokio_tungstenite::tungstenite::Message::binary(vec![1u8, 2, 3]))
        .await
        .expect("send binary");

    assert_eq!(recv_close_code(&mut a).await, Some(1003));
    relay.wait_for_count(1).await;
    assert_eq!(
        recv_text_within(&mut b, Duration::from_millis(200)).await,
        None
    );
}

/// A client that never answers pings is closed by the heartbeat
#[tokio::test]
async fn test_silent_peer_is_closed_by_heartbeat() {
    let relay = start_relay(|config| {
        config.heartbeat.enabled = true;
        config.heartbeat.interval_secs = 1;
        config.heartbeat.timeout_secs = 1;
    })
    .await;

    // Never polled, so pings go unanswered
    let _silent = relay.connect().await;

    relay.wait_for_count(0).await;
}

/// Shutdown closes every peer with 1001 and `run` returns cleanly
#[tokio::test]
async fn test_shutdown_closes_peers() {
    let relay = start_relay(|_| {}).await;
    let mut a = relay.connect().await;
    let mut b = relay.connect().await;

    relay.shutdown.shutdown();

    assert_eq!(recv_close_code(&mut a).await, Some(1001));
    assert_eq!(recv_close_code(&mut b).await, Some(1001));

    let result = tokio::time::timeout(Duration::from_secs(10), relay.task)
        .await
        .expect("server stopped")
        .expect("join");
    assert!(result.is_ok());
    assert!(relay.registry.is_empty());
}

/// A peer that never reads is evicted once its queue fills; a healthy peer
/// still gets every message in order
#[tokio::test]
async fn test_stuck_reader_is_evicted_without_starving_others() {
    let relay = start_relay(|config| {
        config.relay.outbound_queue = 16;
    })
    .await;
    let mut sender = relay.connect().await;
    let stuck = relay.connect().await;
    let mut healthy = relay.connect().await;

    // Well beyond what the stuck peer's socket buffers and queue can hold
    let body = "x".repeat(256 * 1024);
    for i in 0..200 {
        let message = format!("{i}:{body}");
        send_text(&mut sender, &message).await;
        assert_eq!(
            recv_text(&mut healthy).await.as_deref(),
            Some(message.as_str()),
            "healthy peer missed message {i}"
        );
    }

    relay.wait_for_count(2).await;
    assert_eq!(relay.registry.len(), 2);
    drop(stuck);
}
