//! Core types for the stream service.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of per-line error messages kept in an [`IngestReport`].
pub const MAX_REPORTED_ERRORS: usize = 20;

/// Identifier of an event within one stream.
///
/// Assigned by the log backend on append, strictly increasing per stream and
/// never reused while the stream exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl EventId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(EventId)
    }
}

/// Lifecycle status of a stream.
///
/// Transitions are monotonic: `Active` may become `Ended` or `Cancelled`,
/// terminal statuses never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Active,
    Ended,
    Cancelled,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStatus::Active => "active",
            StreamStatus::Ended => "ended",
            StreamStatus::Cancelled => "cancelled",
        }
    }

    /// Whether the stream no longer accepts events.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamStatus::Active)
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event as supplied by a producer.
///
/// Unknown fields are accepted and ignored so that newer producers can talk
/// to older servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
    /// Name/type of the event (must not be empty)
    pub event: String,
    /// Opaque payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl NewEvent {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Check the event is well-formed, returning the reason if it is not.
    pub fn validate(&self) -> Result<(), String> {
        if self.event.trim().is_empty() {
            return Err("event name must not be empty".to_string());
        }
        // Names travel as SSE field values
        if self.event.contains(['\n', '\r']) {
            return Err("event name must not contain line breaks".to_string());
        }
        Ok(())
    }
}

/// The record persisted by the log backend (everything but the id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    /// Append time (milliseconds since epoch)
    pub time: i64,
    pub event: String,
    pub data: Option<String>,
}

impl EventRecord {
    pub fn stamp(event: &NewEvent) -> Self {
        Self {
            time: Utc::now().timestamp_millis(),
            event: event.event.clone(),
            data: event.data.clone(),
        }
    }

    pub fn with_id(self, id: EventId) -> StreamEvent {
        StreamEvent {
            id,
            time: self.time,
            event: self.event,
            data: self.data,
        }
    }
}

/// An event stored in a stream, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub id: EventId,
    /// Append time (milliseconds since epoch)
    pub time: i64,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Public view of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Caller-chosen stream key
    pub key: String,
    pub status: StreamStatus,
    /// Number of events ever appended
    pub length: u64,
    /// Number of events the backend still retains
    pub retained: u64,
    /// Remaining lifetime in whole seconds
    pub ttl: i64,
    pub created_at: DateTime<Utc>,
    /// Identifies this incarnation of the key; access tokens are bound to it
    pub instance: Uuid,
}

/// Outcome of an ingestion request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    /// Number of events recorded
    pub added: u64,
    /// Number of events (or upload lines) rejected
    pub rejected: u64,
    /// Ids of the recorded events, in append order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<EventId>,
    /// First few rejection reasons
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// The upload ended with a transport error before its end
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub interrupted: bool,
}

impl IngestReport {
    pub fn record_added(&mut self, id: EventId) {
        self.added += 1;
        self.ids.push(id);
    }

    pub fn record_rejected(&mut self, line: u64, reason: impl fmt::Display) {
        self.rejected += 1;
        if self.errors.len() < MAX_REPORTED_ERRORS {
            self.errors.push(format!("line {line}: {reason}"));
        }
    }
}
