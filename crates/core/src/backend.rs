//! Log backends.
//!
//! The core only needs an ordered, append-only log per key with TTL expiry:
//! append, read a range, refresh expiry and report the retained length.
//! [`MemoryBackend`] keeps everything in process memory.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

pub use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::types::{EventId, EventRecord, StreamEvent};

/// Backend errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Ordered append-only log storage keyed by stream key.
#[async_trait]
pub trait LogBackend: Send + Sync + 'static {
    /// Append a record and return the id the backend assigned to it.
    ///
    /// Ids are strictly increasing per key. Appending to an unknown key
    /// starts a new log.
    async fn append(&self, key: &str, record: EventRecord) -> Result<EventId, BackendError>;

    /// Read every retained event with an id greater than `after`, in id order.
    async fn read_range(
        &self,
        key: &str,
        after: Option<EventId>,
    ) -> Result<Vec<StreamEvent>, BackendError>;

    /// Expire the log `ttl` from now. A zero `ttl` deletes it immediately.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BackendError>;

    /// Number of events currently retained for the key.
    async fn length(&self, key: &str) -> Result<u64, BackendError>;
}

/// How many events a backend keeps per log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Keep every event until the log expires
    #[default]
    Unbounded,
    /// Keep at most this many events, dropping the oldest first
    MaxLen(usize),
}

#[derive(Debug)]
struct MemoryLog {
    events: VecDeque<StreamEvent>,
    next_id: u64,
    expires_at: Option<Instant>,
}

impl MemoryLog {
    fn new() -> Self {
        Self {
            events: VecDeque::new(),
            next_id: 1,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory log backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    logs: RwLock<HashMap<String, MemoryLog>>,
    retention: RetentionPolicy,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: RetentionPolicy) -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// Number of logs currently held (expired ones included until touched).
    pub fn log_count(&self) -> usize {
        self.logs.read().len()
    }
}

#[async_trait]
impl LogBackend for MemoryBackend {
    async fn append(&self, key: &str, record: EventRecord) -> Result<EventId, BackendError> {
        let now = Instant::now();
        let mut logs = self.logs.write();

        if logs.get(key).is_some_and(|log| log.is_expired(now)) {
            logs.remove(key);
        }
        let log = logs.entry(key.to_string()).or_insert_with(MemoryLog::new);

        let id = EventId(log.next_id);
        log.next_id += 1;
        log.events.push_back(record.with_id(id));

        if let RetentionPolicy::MaxLen(max) = self.retention {
            while log.events.len() > max {
                log.events.pop_front();
            }
        }

        Ok(id)
    }

    async fn read_range(
        &self,
        key: &str,
        after: Option<EventId>,
    ) -> Result<Vec<StreamEvent>, BackendError> {
        let now = Instant::now();
        let logs = self.logs.read();

        let Some(log) = logs.get(key).filter(|log| !log.is_expired(now)) else {
            return Ok(Vec::new());
        };

        // Events are ordered by id, so skip the prefix at or before `after`
        let start = match after {
            Some(after) => log.events.partition_point(|event| event.id <= after),
            None => 0,
        };
        Ok(log.events.range(start..).cloned().collect())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BackendError> {
        let mut logs = self.logs.write();

        if ttl.is_zero() {
            if logs.remove(key).is_some() {
                debug!(key = %key, "Deleted log");
            }
            return Ok(());
        }

        if let Some(log) = logs.get_mut(key) {
            log.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn length(&self, key: &str) -> Result<u64, BackendError> {
        let now = Instant::now();
        let logs = self.logs.read();
        Ok(logs
            .get(key)
            .filter(|log| !log.is_expired(now))
            .map(|log| log.events.len() as u64)
            .unwrap_or(0))
    }
}
