//! Helpers for producers talking to a local agent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;

/// Address a default-configured agent listens on
pub const DEFAULT_ADDR: &str = "127.0.0.1:7777";

const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_millis(250);
const PROBE_HEALTH_TIMEOUT: Duration = Duration::from_millis(300);

/// Progress event envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event kind, e.g. `session_start` or `part_done`
    #[serde(rename = "type")]
    pub kind: String,
    /// Producer-chosen run identifier
    #[serde(rename = "runId")]
    pub run_id: String,
    pub ts: DateTime<Utc>,
    /// Free-form JSON
    pub payload: serde_json::Value,
}

impl Event {
    /// New event stamped with the current time
    pub fn new(kind: impl Into<String>, run_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            run_id: run_id.into(),
            ts: Utc::now(),
            payload,
        }
    }
}

/// Failure to hand an event to the agent
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("agent request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("agent returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Post any JSON-serializable event to the agent at `addr`
pub async fn send_event<T: Serialize + ?Sized>(addr: &str, event: &T) -> Result<(), ClientError> {
    let client = reqwest::Client::builder().timeout(SEND_TIMEOUT).build()?;
    let response = client
        .post(format!("http://{}/event", addr))
        .json(event)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::Rejected {
            status: status.as_u16(),
            body: body.trim().to_string(),
        });
    }
    Ok(())
}

/// Whether an agent is answering at `addr`.
///
/// A quick TCP probe runs first so a dead address costs at most a few
/// hundred milliseconds.
pub async fn is_running_at(addr: &str) -> bool {
    match tokio::time::timeout(PROBE_CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => {}
        _ => return false,
    }

    let Ok(client) = reqwest::Client::builder()
        .timeout(PROBE_HEALTH_TIMEOUT)
        .build()
    else {
        return false;
    };

    matches!(
        client.get(format!("http://{}/healthz", addr)).send().await,
        Ok(response) if response.status().is_success()
    )
}
