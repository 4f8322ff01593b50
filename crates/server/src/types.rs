//! Request and response bodies of the HTTP API.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tidestream_core::{AccessGrant, EventId, NewEvent, PoolStats, StreamEvent, StreamStatus};

/// Server options.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Port to listen on (0 for auto-assign)
    pub port: u16,
    /// Host to bind to
    pub host: String,
    /// Key required in `X-API-KEY` on control endpoints (None disables the check)
    pub api_key: Option<String>,
    /// Interval between SSE keep-alive comments
    pub keep_alive: Duration,
    /// Origins allowed by CORS (None allows any origin)
    pub allowed_origins: Option<Vec<String>>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            port: 4437,
            host: "127.0.0.1".to_string(),
            api_key: None,
            keep_alive: Duration::from_secs(15),
            allowed_origins: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateStreamRequest {
    pub key: String,
    /// Lifetime in seconds
    #[serde(default)]
    pub ttl: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct CreateStreamResponse {
    pub status: StreamStatus,
    #[serde(flatten)]
    pub grant: AccessGrant,
}

#[derive(Debug, Deserialize)]
pub struct KeyRequest {
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct AddEventsRequest {
    pub key: String,
    pub events: Vec<NewEvent>,
}

#[derive(Debug, Deserialize)]
pub struct EndStreamRequest {
    pub key: String,
    #[serde(default)]
    pub cancel: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: StreamStatus,
}

#[derive(Debug, Deserialize)]
pub struct KeyQuery {
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub pattern: Option<String>,
}

/// Query of the subscription endpoints.
#[derive(Debug, Deserialize)]
pub struct ClientQuery {
    pub key: String,
    pub token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InfoResponse {
    pub url: String,
    pub version: &'static str,
    pub streams: usize,
    pub pool: PoolStats,
}

/// Frames sent to WebSocket subscribers.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame<'a> {
    Event(&'a StreamEvent),
    Status { status: &'a str },
    Error { code: &'a str, message: String },
}

/// Replies to WebSocket ingestion frames.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IngestReply {
    Success { id: EventId },
    Error { message: String },
}
