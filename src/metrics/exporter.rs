//! Prometheus metrics exporter
//!
//! HTTP endpoint for Prometheus scraping.

use anyhow::{Context, Result};
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::time::Duration;

use super::counters::{MetricsSnapshot, METRICS};
use crate::config::MetricsConfig;

/// Initialize the Prometheus metrics exporter
pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    describe_counter!("fanout_connections_total", "Total connections accepted");
    describe_gauge!("fanout_connections_active", "Currently registered connections");
    describe_counter!("fanout_connections_failed", "Failed WebSocket upgrades");
    describe_counter!("fanout_connections_rejected", "Upgrades refused by admission checks");
    describe_counter!("fanout_messages_received", "Text messages received from peers");
    describe_counter!("fanout_messages_relayed", "Per-recipient deliveries queued");
    describe_counter!("fanout_bytes_received", "Payload bytes received");
    describe_counter!("fanout_bytes_relayed", "Payload bytes queued for delivery");
    describe_counter!("fanout_deliveries_failed", "Per-recipient send failures");
    describe_counter!("fanout_evictions", "Peers removed by the dispatcher");
    describe_counter!("fanout_heartbeat_timeouts", "Peers closed for missing pongs");

    PrometheusBuilder::new()
        .with_http_listener(config.bind_addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    tokio::spawn(sync_metrics_task());

    Ok(())
}

/// Background task that periodically syncs our atomic counters to the metrics crate
async fn sync_metrics_task() {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut last = METRICS.snapshot();

    loop {
        interval.tick().await;

        let current = METRICS.snapshot();
        for (name, delta) in counter_deltas(&last, &current) {
            if delta > 0 {
                counter!(name).increment(delta);
            }
        }
        gauge!("fanout_connections_active").set(current.connections_active as f64);

        last = current;
    }
}

/// Counter increments between two snapshots
fn counter_deltas(last: &MetricsSnapshot, current: &MetricsSnapshot) -> [(&'static str, u64); 10] {
    [
        (
            "fanout_connections_total",
            current.connections_total.saturating_sub(last.connections_total),
        ),
        (
            "fanout_connections_failed",
            current.connections_failed.saturating_sub(last.connections_failed),
        ),
        (
            "fanout_connections_rejected",
            current.connections_rejected.saturating_sub(last.connections_rejected),
        ),
        (
            "fanout_messages_received",
            current.messages_received.saturating_sub(last.messages_received),
        ),
        (
            "fanout_messages_relayed",
            current.messages_relayed.saturating_sub(last.messages_relayed),
        ),
        (
            "fanout_bytes_received",
            current.bytes_received.saturating_sub(last.bytes_received),
        ),
        (
            "fanout_bytes_relayed",
            current.bytes_relayed.saturating_sub(last.bytes_relayed),
        ),
        (
            "fanout_deliveries_failed",
            current.deliveries_failed.saturating_sub(last.deliveries_failed),
        ),
        (
            "fanout_evictions",
            current.evictions.saturating_sub(last.evictions),
        ),
        (
            "fanout_heartbeat_timeouts",
            current.heartbeat_timeouts.saturating_sub(last.heartbeat_timeouts),
        ),
    ]
}
