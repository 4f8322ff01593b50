//! Stream registry.
//!
//! The registry is the single source of truth for which streams exist, their
//! status, length and expiry. Each key owns one slot guarded by its own async
//! mutex, so create, append and end on one key serialize while unrelated keys
//! never contend.
//!
//! A slot is unlinked from the map only while its lock is held, after being
//! marked `Retired`. Whoever locks a retired slot looks the key up again.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::{
    sync::{Mutex, OwnedMutexGuard},
    time::Instant,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::ServiceConfig,
    error::{Result, StreamError},
    fanout::{Attachment, FanoutHub},
    pool::{ConnectionClass, ConnectionPool},
    types::{EventId, EventRecord, NewEvent, StreamEvent, StreamInfo, StreamStatus},
};

/// Smallest TTL a caller may ask for.
pub const MIN_STREAM_TTL: Duration = Duration::from_secs(1);

type Slot = Arc<Mutex<SlotState>>;

enum SlotState {
    /// Reserved by a create in progress
    Vacant,
    Live(StreamEntry),
    /// Unlinked from the map
    Retired,
}

struct StreamEntry {
    instance: Uuid,
    status: StreamStatus,
    length: u64,
    last_id: Option<EventId>,
    created_at: DateTime<Utc>,
    /// Window refreshed by every append
    ttl: Duration,
    expires_at: Instant,
    hub: FanoutHub,
}

impl StreamEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    fn info(&self, key: &str, retained: u64, now: Instant) -> StreamInfo {
        StreamInfo {
            key: key.to_string(),
            status: self.status,
            length: self.length,
            retained,
            ttl: self.expires_at.saturating_duration_since(now).as_secs() as i64,
            created_at: self.created_at,
            instance: self.instance,
        }
    }
}

/// Registry of live streams.
pub struct StreamRegistry {
    slots: DashMap<String, Slot>,
    pool: Arc<ConnectionPool>,
    default_ttl: Duration,
    end_grace: Duration,
    subscriber_buffer: usize,
    cleanup_interval: Duration,
}

impl StreamRegistry {
    pub fn new(pool: Arc<ConnectionPool>, config: &ServiceConfig) -> Self {
        Self {
            slots: DashMap::new(),
            pool,
            default_ttl: config.default_ttl,
            end_grace: config.end_grace,
            subscriber_buffer: config.subscriber_buffer,
            cleanup_interval: config.cleanup_interval,
        }
    }

    /// Create a stream, replacing any expired, ended or cancelled one under
    /// the same key.
    pub async fn create(&self, key: &str, ttl: Option<Duration>) -> Result<StreamInfo> {
        if key.trim().is_empty() {
            return Err(StreamError::Validation("stream key must not be empty".into()));
        }
        let ttl = ttl.unwrap_or(self.default_ttl);
        if ttl < MIN_STREAM_TTL {
            return Err(StreamError::Validation(format!(
                "ttl must be at least {} second",
                MIN_STREAM_TTL.as_secs()
            )));
        }

        let mut guard = self.lock_or_reserve(key).await;
        let now = Instant::now();

        if let SlotState::Live(entry) = &*guard {
            if entry.status == StreamStatus::Active && !entry.is_expired(now) {
                return Err(StreamError::AlreadyExists(key.to_string()));
            }
        }

        // Whatever the backend still holds under this key belongs to a
        // previous stream
        if let Err(err) = self.purge_log(key).await {
            if matches!(*guard, SlotState::Vacant) {
                self.unlink(guard, key);
            }
            return Err(err);
        }

        let entry = StreamEntry {
            instance: Uuid::new_v4(),
            status: StreamStatus::Active,
            length: 0,
            last_id: None,
            created_at: Utc::now(),
            ttl,
            expires_at: now + ttl,
            hub: FanoutHub::new(self.subscriber_buffer),
        };
        let info = entry.info(key, 0, now);

        if let SlotState::Live(mut previous) = std::mem::replace(&mut *guard, SlotState::Live(entry)) {
            previous.hub.shutdown();
            info!(key = %key, previous = %previous.status, "Replaced stream");
        }

        info!(key = %key, ttl_secs = ttl.as_secs(), "Created stream");
        Ok(info)
    }

    /// Info for an active stream, or an ended one inside its grace window.
    pub async fn get(&self, key: &str) -> Result<StreamInfo> {
        let guard = self.lock_live(key).await?;
        let SlotState::Live(entry) = &*guard else {
            return Err(StreamError::NotFound(key.to_string()));
        };

        let conn = self.pool.acquire(ConnectionClass::Static).await?;
        let retained = conn.length(key).await?;
        Ok(entry.info(key, retained, Instant::now()))
    }

    /// Active streams whose key matches the glob `pattern` (all when `None`),
    /// sorted by key.
    pub async fn list(&self, pattern: Option<&str>) -> Result<Vec<StreamInfo>> {
        let pattern = pattern
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| StreamError::Validation(format!("invalid pattern: {e}")))?;

        let candidates: Vec<(String, Slot)> = self
            .slots
            .iter()
            .filter(|slot| pattern.as_ref().is_none_or(|p| p.matches(slot.key())))
            .map(|slot| (slot.key().clone(), Arc::clone(slot.value())))
            .collect();

        let mut snapshots = Vec::with_capacity(candidates.len());
        for (key, slot) in candidates {
            let state = slot.lock().await;
            let now = Instant::now();
            if let SlotState::Live(entry) = &*state {
                if entry.status == StreamStatus::Active && !entry.is_expired(now) {
                    snapshots.push(entry.info(&key, 0, now));
                }
            }
        }

        if !snapshots.is_empty() {
            let conn = self.pool.acquire(ConnectionClass::Static).await?;
            for info in &mut snapshots {
                info.retained = conn.length(&info.key).await?;
            }
        }

        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(snapshots)
    }

    /// End (or cancel) an active stream and start its grace window.
    pub async fn end(&self, key: &str, cancel: bool) -> Result<StreamStatus> {
        let mut guard = self.lock_live(key).await?;
        let SlotState::Live(entry) = &mut *guard else {
            return Err(StreamError::NotFound(key.to_string()));
        };
        if entry.status.is_terminal() {
            return Err(StreamError::AlreadyEnded {
                key: key.to_string(),
                status: entry.status,
            });
        }

        {
            let conn = self.pool.acquire(ConnectionClass::Static).await?;
            conn.expire(key, self.end_grace).await?;
        }

        let status = if cancel {
            StreamStatus::Cancelled
        } else {
            StreamStatus::Ended
        };
        entry.status = status;
        entry.expires_at = Instant::now() + self.end_grace;
        let subscribers = entry.hub.subscriber_count();
        entry.hub.finish(status);

        info!(
            key = %key,
            status = %status,
            subscribers,
            grace_secs = self.end_grace.as_secs(),
            "Stream closed"
        );
        Ok(status)
    }

    /// Append events in order, one streaming connection per event.
    ///
    /// Length and last id move only after the backend confirmed each write. A
    /// backend failure stops the batch; events before it stay appended.
    pub async fn append_batch(&self, key: &str, events: &[NewEvent]) -> Result<Vec<EventId>> {
        let mut guard = self.lock_live(key).await?;
        let entry = active_entry(&mut guard, key)?;

        let mut ids = Vec::with_capacity(events.len());
        for event in events {
            let stored = self.persist(key, entry, event).await?;
            ids.push(stored.id);
        }
        Ok(ids)
    }

    /// Append a single event.
    pub async fn append_one(&self, key: &str, event: &NewEvent) -> Result<StreamEvent> {
        let mut guard = self.lock_live(key).await?;
        let entry = active_entry(&mut guard, key)?;

        let stored = self.persist(key, entry, event).await?;
        Ok(StreamEvent::clone(&stored))
    }

    /// Fail unless the stream exists and accepts events.
    pub async fn ensure_active(&self, key: &str) -> Result<()> {
        self.active_instance(key).await.map(|_| ())
    }

    /// Instance id of an active stream.
    pub async fn active_instance(&self, key: &str) -> Result<Uuid> {
        let mut guard = self.lock_live(key).await?;
        active_entry(&mut guard, key).map(|entry| entry.instance)
    }

    /// Number of tracked streams, ended ones in their grace window included.
    pub fn stream_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of live subscribers of a stream.
    pub async fn subscriber_count(&self, key: &str) -> usize {
        match self.lock_live(key).await {
            Ok(guard) => match &*guard {
                SlotState::Live(entry) => entry.hub.subscriber_count(),
                _ => 0,
            },
            Err(_) => 0,
        }
    }

    pub(crate) async fn attach(&self, key: &str) -> Result<Attachment> {
        let guard = self.lock_live(key).await?;
        let SlotState::Live(entry) = &*guard else {
            return Err(StreamError::NotFound(key.to_string()));
        };
        Ok(Attachment {
            feed: entry.hub.subscribe(),
            status: entry.status,
            instance: entry.instance,
            last_id: entry.last_id,
        })
    }

    /// Retire every stream whose TTL or grace window elapsed. Returns how
    /// many were removed.
    pub async fn purge_expired(&self) -> usize {
        let slots: Vec<(String, Slot)> = self
            .slots
            .iter()
            .map(|slot| (slot.key().clone(), Arc::clone(slot.value())))
            .collect();

        let mut purged = 0;
        for (key, slot) in slots {
            // A locked slot is in use, so it is not idle
            let Ok(guard) = slot.try_lock_owned() else {
                continue;
            };
            let expired = matches!(&*guard, SlotState::Live(entry) if entry.is_expired(Instant::now()));
            if expired {
                self.retire(guard, &key).await;
                purged += 1;
            }
        }

        if purged > 0 {
            info!(purged, remaining = self.slots.len(), "Purged expired streams");
        }
        purged
    }

    /// Spawn a background task running [`purge_expired`](Self::purge_expired)
    /// on the configured interval.
    pub fn spawn_cleanup_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = registry.cleanup_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.purge_expired().await;
            }
        })
    }

    async fn persist(
        &self,
        key: &str,
        entry: &mut StreamEntry,
        event: &NewEvent,
    ) -> Result<Arc<StreamEvent>> {
        let conn = self.pool.acquire(ConnectionClass::Streaming).await?;
        let record = EventRecord::stamp(event);

        let id = conn
            .append(key, record.clone())
            .await
            .inspect_err(|err| error!(key = %key, error = %err, "Append failed"))?;

        // The event is durable from here on
        if let Err(err) = conn.expire(key, entry.ttl).await {
            warn!(key = %key, error = %err, "Failed to refresh log expiry");
        }
        drop(conn);

        entry.length += 1;
        entry.last_id = Some(id);
        entry.expires_at = Instant::now() + entry.ttl;

        let stored = Arc::new(record.with_id(id));
        entry.hub.publish(Arc::clone(&stored));
        debug!(key = %key, id = %id, event = %stored.event, "Appended event");
        Ok(stored)
    }

    async fn purge_log(&self, key: &str) -> Result<()> {
        let conn = self.pool.acquire(ConnectionClass::Static).await?;
        conn.expire(key, Duration::ZERO).await?;
        Ok(())
    }

    /// Lock the slot for `key`, reserving a vacant one if none exists.
    async fn lock_or_reserve(&self, key: &str) -> OwnedMutexGuard<SlotState> {
        loop {
            let slot = Arc::clone(
                self.slots
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(SlotState::Vacant)))
                    .value(),
            );
            let guard = slot.lock_owned().await;
            if !matches!(*guard, SlotState::Retired) {
                return guard;
            }
        }
    }

    /// Lock the slot for `key` if the key is tracked.
    async fn lock_existing(&self, key: &str) -> Option<OwnedMutexGuard<SlotState>> {
        loop {
            let slot = self.slots.get(key).map(|slot| Arc::clone(slot.value()))?;
            let guard = slot.lock_owned().await;
            if !matches!(*guard, SlotState::Retired) {
                return Some(guard);
            }
        }
    }

    /// Lock a live, unexpired stream. Expired streams are retired on the way.
    async fn lock_live(&self, key: &str) -> Result<OwnedMutexGuard<SlotState>> {
        let Some(guard) = self.lock_existing(key).await else {
            return Err(StreamError::NotFound(key.to_string()));
        };

        let live = matches!(&*guard, SlotState::Live(entry) if !entry.is_expired(Instant::now()));
        if live {
            return Ok(guard);
        }
        if matches!(*guard, SlotState::Live(_)) {
            self.retire(guard, key).await;
        }
        Err(StreamError::NotFound(key.to_string()))
    }

    /// Purge the stream's log, close its subscribers and unlink the slot.
    async fn retire(&self, mut guard: OwnedMutexGuard<SlotState>, key: &str) {
        if let Err(err) = self.purge_log(key).await {
            warn!(key = %key, error = %err, "Failed to purge expired log");
        }
        if let SlotState::Live(mut entry) = std::mem::replace(&mut *guard, SlotState::Vacant) {
            entry.hub.shutdown();
            info!(key = %key, status = %entry.status, length = entry.length, "Stream expired");
        }
        self.unlink(guard, key);
    }

    fn unlink(&self, mut guard: OwnedMutexGuard<SlotState>, key: &str) {
        *guard = SlotState::Retired;
        let slot = Arc::clone(OwnedMutexGuard::mutex(&guard));
        self.slots
            .remove_if(key, |_, current| Arc::ptr_eq(current, &slot));
    }
}

fn active_entry<'a>(
    guard: &'a mut OwnedMutexGuard<SlotState>,
    key: &str,
) -> Result<&'a mut StreamEntry> {
    match &mut **guard {
        SlotState::Live(entry) if entry.status.is_terminal() => Err(StreamError::StreamClosed {
            key: key.to_string(),
            status: entry.status,
        }),
        SlotState::Live(entry) => Ok(entry),
        _ => Err(StreamError::NotFound(key.to_string())),
    }
}
