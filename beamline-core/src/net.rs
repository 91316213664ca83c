//! Network boundary: transport, connectivity, and clock seams
//!
//! The delivery worker depends on three host-environment inputs: the HTTP
//! transport, a network-reachability query, and a wall-clock source. Each is
//! a trait here so tests can substitute deterministic implementations.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::EndpointConfig;
use crate::error::{Error, Result};
use crate::event::EventRecord;

/// Wall-clock source.
pub trait Clock: Send + Sync {
    /// Current time in epoch milliseconds.
    fn now_ms(&self) -> i64;
}

/// System wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Network-reachability query.
#[async_trait]
pub trait Connectivity: Send + Sync {
    /// True if the collection endpoint is currently reachable.
    async fn is_reachable(&self) -> bool;
}

/// Reachability probe that attempts a TCP connect to the endpoint host.
pub struct SocketProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl SocketProbe {
    pub fn new(host: &str, https: bool) -> Self {
        Self {
            host: host.to_string(),
            port: if https { 443 } else { 80 },
            timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl Connectivity for SocketProbe {
    async fn is_reachable(&self) -> bool {
        let connect = tokio::net::TcpStream::connect((self.host.as_str(), self.port));
        matches!(tokio::time::timeout(self.timeout, connect).await, Ok(Ok(_)))
    }
}

/// Terminal classification of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The endpoint accepted the record (2xx, or 304). Remove it.
    Accepted,
    /// Permanent client error (4xx). The record will never be accepted;
    /// discard it rather than retry forever.
    Rejected,
    /// Transient failure: 5xx, non-304 redirects, transport errors,
    /// timeouts. The record stays at the head of the queue.
    Retry,
}

impl Delivery {
    /// Map an HTTP status code to an outcome.
    ///
    /// Generic 3xx responses are treated as retryable rather than silently
    /// dropped: the endpoint is not expected to redirect, so a redirect is a
    /// misconfiguration that should heal, not discard data.
    pub fn from_status(status: u16) -> Delivery {
        match status {
            200..=299 | 304 => Delivery::Accepted,
            400..=499 => Delivery::Rejected,
            _ => Delivery::Retry,
        }
    }

    /// True if the record is finished (delivered or discarded).
    pub fn is_terminal(self) -> bool {
        !matches!(self, Delivery::Retry)
    }
}

/// One-record-at-a-time delivery to the collection endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Attempt to deliver a single record. Must not panic; all failures
    /// collapse into [`Delivery::Retry`].
    async fn deliver(&self, record: &EventRecord) -> Delivery;
}

/// Production transport: HTTP GET with the record as the query string.
pub struct HttpTransport {
    client: reqwest::Client,
    event_url: String,
}

impl HttpTransport {
    /// Build the transport for the configured endpoint, honoring the debug
    /// host flag and the connect/read timeouts.
    pub fn new(endpoint: &EndpointConfig, debug: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(endpoint.connect_timeout_secs))
            .timeout(Duration::from_secs(endpoint.read_timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            event_url: endpoint.event_url(debug),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&self, record: &EventRecord) -> Delivery {
        let url = format!("{}?{}", self.event_url, record.query_string());
        tracing::debug!(url = %url, "Calling event endpoint");

        match self.client.get(&url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                // Drain the body before the connection drops; the server
                // reuses connections more cleanly when the client reads the
                // response first.
                let _ = response.bytes().await;
                tracing::debug!(status, "Event endpoint responded");
                Delivery::from_status(status)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Event delivery failed");
                Delivery::Retry
            }
        }
    }
}

/// Response body of the channel content endpoint.
#[derive(Debug, Deserialize)]
struct ChannelResponse {
    content: Vec<serde_json::Value>,
}

/// Fetch content for a channel: one-off GET against the channel endpoint.
pub async fn fetch_channel(
    client: &reqwest::Client,
    channel_url: &str,
    api_key: &str,
    uid: &str,
    channel_id: u32,
) -> Result<Vec<serde_json::Value>> {
    let url = format!(
        "{}?api_key={}&uid={}&channel_id={}",
        channel_url,
        urlencoding::encode(api_key),
        urlencoding::encode(uid),
        channel_id
    );

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| Error::Channel(format!("HTTP request failed: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::Channel(format!("invalid http response code: {}", status)));
    }

    let body: ChannelResponse = response
        .json()
        .await
        .map_err(|e| Error::Channel(format!("failed to parse response: {}", e)))?;
    Ok(body.content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(Delivery::from_status(200), Delivery::Accepted);
        assert_eq!(Delivery::from_status(204), Delivery::Accepted);
        assert_eq!(Delivery::from_status(304), Delivery::Accepted);
        assert_eq!(Delivery::from_status(301), Delivery::Retry);
        assert_eq!(Delivery::from_status(404), Delivery::Rejected);
        assert_eq!(Delivery::from_status(400), Delivery::Rejected);
        assert_eq!(Delivery::from_status(500), Delivery::Retry);
        assert_eq!(Delivery::from_status(503), Delivery::Retry);
        assert_eq!(Delivery::from_status(100), Delivery::Retry);
    }

    #[test]
    fn test_terminal_outcomes() {
        assert!(Delivery::Accepted.is_terminal());
        assert!(Delivery::Rejected.is_terminal());
        assert!(!Delivery::Retry.is_terminal());
    }

    #[test]
    fn test_channel_response_shape() {
        let body = r#"{"content": [{"id": 1}, {"id": 2}]}"#;
        let parsed: ChannelResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.content.len(), 2);
    }
}
