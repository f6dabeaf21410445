//! Ping/pong liveness probe

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tracing::trace;

use crate::connection::Connection;
use crate::error::SendError;

/// Why the heartbeat loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// No inbound frame for the whole timeout window
    TimedOut,
    /// The connection closed first
    Cancelled,
}

/// Ping a connection every `interval` until it closes or goes quiet.
///
/// Any inbound frame (pongs included) marks the connection alive. A tick
/// that finds it not alive counts as a miss; `timeout / interval` misses in
/// a row (at least one) end the loop with `TimedOut`. Closing the connection
/// itself is left to the caller.
pub async fn run_heartbeat(
    connection: Arc<Connection>,
    interval: Duration,
    timeout: Duration,
) -> HeartbeatResult {
    let interval = interval.max(Duration::from_millis(1));
    let max_missed = (timeout.as_millis() / interval.as_millis()).max(1) as u32;

    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if connection.take_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= max_missed {
                        return HeartbeatResult::TimedOut;
                    }
                }

                match connection.try_send_ping() {
                    Ok(()) => trace!(conn_id = %connection.id, missed, "Ping queued"),
                    // Writer is behind on relayed frames; the next tick retries
                    Err(SendError::Backpressure) => {}
                    Err(SendError::Closed) => return HeartbeatResult::Cancelled,
                }
            }
            _ = connection.closed() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionId, Outbound};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn make_connection() -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let (conn, rx) = Connection::new(
            ConnectionId::from_raw(1),
            "127.0.0.1:9000".parse().unwrap(),
            16,
            CancellationToken::new(),
        );
        conn.set_open();
        (Arc::new(conn), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let (conn, _rx) = make_connection();

        let started = time::Instant::now();
        let result = run_heartbeat(conn, Duration::from_secs(20), Duration::from_secs(60)).await;

        assert_eq!(result, HeartbeatResult::TimedOut);
        // First tick consumes the initial alive flag, then three misses
        assert_eq!(started.elapsed(), Duration::from_secs(80));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pings_are_queued_each_tick() {
        let (conn, mut rx) = make_connection();
        let handle = tokio::spawn(run_heartbeat(
            conn.clone(),
            Duration::from_secs(10),
            Duration::from_secs(30),
        ));

        time::sleep(Duration::from_secs(25)).await;
        assert!(matches!(rx.try_recv(), Ok(Outbound::Ping(_))));
        assert!(matches!(rx.try_recv(), Ok(Outbound::Ping(_))));
        assert!(rx.try_recv().is_err());

        conn.close();
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_peer_stays_alive() {
        let (conn, _rx) = make_connection();
        let handle = tokio::spawn(run_heartbeat(
            conn.clone(),
            Duration::from_secs(10),
            Duration::from_secs(10),
        ));

        for _ in 0..10 {
            time::sleep(Duration::from_secs(5)).await;
            conn.mark_alive();
        }
        assert!(!handle.is_finished());

        conn.close();
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_before_close_is_bounded_by_timeout_plus_interval() {
        let (conn, _rx) = make_connection();
        let interval = Duration::from_secs(20);
        let timeout = Duration::from_secs(60);
        let started = time::Instant::now();
        let handle = tokio::spawn(run_heartbeat(conn.clone(), interval, timeout));

        // Last frame lands just before the first tick
        time::sleep(Duration::from_secs(19)).await;
        conn.mark_alive();
        let last_seen = time::Instant::now();

        assert_eq!(handle.await.unwrap(), HeartbeatResult::TimedOut);
        let silence = last_seen.elapsed();
        assert!(silence >= timeout, "closed after {silence:?}");
        assert!(silence <= timeout + interval, "closed after {silence:?}");
        assert_eq!(started.elapsed(), Duration::from_secs(80));
    }

    #[tokio::test]
    async fn test_close_cancels_immediately() {
        let (conn, _rx) = make_connection();
        conn.close();

        let result = run_heartbeat(conn, Duration::from_secs(100), Duration::from_secs(300)).await;
        assert_eq!(result, HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_shorter_than_interval_allows_one_miss() {
        let (conn, _rx) = make_connection();
        conn.take_alive();

        let started = time::Instant::now();
        let result = run_heartbeat(conn, Duration::from_secs(10), Duration::from_secs(1)).await;

        assert_eq!(result, HeartbeatResult::TimedOut);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }
}
