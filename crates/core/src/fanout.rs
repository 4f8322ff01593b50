//! Delivery fan-out.
//!
//! Every live stream owns a [`FanoutHub`], a `tokio::sync::broadcast` channel
//! the registry publishes to after each durable append. Subscribers attach a
//! receiver under the stream's lock, replay the retained backlog up to the id
//! they attached at, then follow the live channel.
//!
//! ```text
//!  append ──► registry ──► hub.publish() ──┬──► Subscription (SSE)
//!                                          ├──► Subscription (WebSocket)
//!                                          └──► Subscription (...)
//! ```
//!
//! Publishing never waits for readers. A subscriber that falls more than the
//! channel capacity behind is closed with [`CloseReason::Overflow`]. The
//! terminal status travels on a separate `watch` channel, so ending a stream
//! never pushes buffered events out of a full ring.
//!
//! A subscription holds one streaming connection from attach to close.

use std::{collections::VecDeque, sync::Arc};

use futures::Stream;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    watch,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    access::{AccessIssuer, AuthError},
    error::{Result, StreamError},
    pool::{ConnectionClass, ConnectionPool, PooledConnection},
    registry::StreamRegistry,
    types::{EventId, StreamEvent, StreamStatus},
};

/// Broadcast side of one stream.
#[derive(Debug)]
pub(crate) struct FanoutHub {
    tx: Option<broadcast::Sender<Arc<StreamEvent>>>,
    /// Terminal status, set before `tx` is dropped
    closed: watch::Sender<Option<StreamStatus>>,
}

impl FanoutHub {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        let (closed, _) = watch::channel(None);
        Self {
            tx: Some(tx),
            closed,
        }
    }

    pub(crate) fn publish(&self, event: Arc<StreamEvent>) {
        if let Some(tx) = &self.tx {
            // No receivers is not an error
            let _ = tx.send(event);
        }
    }

    pub(crate) fn subscribe(&self) -> Option<LiveFeed> {
        self.tx.as_ref().map(|tx| LiveFeed {
            events: tx.subscribe(),
            closed: self.closed.subscribe(),
        })
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.tx.as_ref().map_or(0, broadcast::Sender::receiver_count)
    }

    /// Record the terminal status, then close the event channel. Subscribers
    /// drain what they already buffered before they see the status.
    pub(crate) fn finish(&mut self, status: StreamStatus) {
        self.closed.send_replace(Some(status));
        self.tx = None;
    }

    /// Close without a status notice; subscribers see the stream expire.
    pub(crate) fn shutdown(&mut self) {
        self.tx = None;
    }
}

/// Receiving side of a [`FanoutHub`].
pub(crate) struct LiveFeed {
    events: broadcast::Receiver<Arc<StreamEvent>>,
    closed: watch::Receiver<Option<StreamStatus>>,
}

impl LiveFeed {
    /// Why the event channel closed.
    fn close_reason(&self) -> CloseReason {
        match *self.closed.borrow() {
            Some(status) => CloseReason::StreamEnded(status),
            None => CloseReason::StreamExpired,
        }
    }
}

/// A subscriber's view of a stream taken under the stream's lock.
pub(crate) struct Attachment {
    /// Live feed, absent once the stream is terminal
    pub feed: Option<LiveFeed>,
    pub status: StreamStatus,
    /// Incarnation of the stream under its key
    pub instance: Uuid,
    /// Last id appended before the receiver was attached
    pub last_id: Option<EventId>,
}

/// Why a subscription closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The subscriber closed it
    Client,
    /// The stream was ended or cancelled
    StreamEnded(StreamStatus),
    /// The stream expired or was replaced
    StreamExpired,
    /// The subscriber fell too far behind
    Overflow { missed: u64 },
}

/// Subscriber lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    /// Replaying retained events
    Connecting,
    /// Following live events
    Subscribed,
    Closed(CloseReason),
}

/// One item handed to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Event(Arc<StreamEvent>),
    /// Always the last delivery unless the subscriber closed
    Closed(CloseReason),
}

/// Subscription entry point.
#[derive(Clone)]
pub struct Fanout {
    registry: Arc<StreamRegistry>,
    access: Arc<AccessIssuer>,
    pool: Arc<ConnectionPool>,
}

impl Fanout {
    pub fn new(
        registry: Arc<StreamRegistry>,
        access: Arc<AccessIssuer>,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        Self {
            registry,
            access,
            pool,
        }
    }

    /// Subscribe to a stream with a token scoped to it.
    ///
    /// Retained events with an id greater than `last_event_id` (all retained
    /// events when `None`) are delivered first, then live events. A stream in
    /// its terminal grace window yields its backlog followed by the terminal
    /// status.
    ///
    /// The subscription holds a streaming connection until it closes, so the
    /// streaming pool caps concurrent subscribers.
    pub async fn subscribe(
        &self,
        key: &str,
        token: &str,
        last_event_id: Option<EventId>,
    ) -> Result<Subscription> {
        let claims = self.access.verify(token, key)?;

        let conn = self.pool.acquire(ConnectionClass::Streaming).await?;
        let attachment = self.registry.attach(key).await?;

        if claims.sid != attachment.instance.to_string() {
            return Err(StreamError::Unauthorized(AuthError::StaleToken));
        }

        let backlog = match attachment.last_id {
            Some(snapshot) => conn
                .read_range(key, last_event_id)
                .await?
                .into_iter()
                .take_while(|event| event.id <= snapshot)
                .map(Arc::new)
                .collect(),
            None => VecDeque::new(),
        };

        let terminal = attachment.feed.is_none().then_some(attachment.status);

        info!(
            key = %key,
            backlog = backlog.len(),
            status = %attachment.status,
            "Subscriber attached"
        );

        Ok(Subscription {
            key: key.to_string(),
            backlog,
            feed: attachment.feed,
            terminal,
            last_delivered: last_event_id,
            state: SubscriberState::Connecting,
            _connection: Some(conn),
        })
    }
}

/// A live subscription to one stream.
///
/// Dropping it (or calling [`close`](Self::close)) detaches it from the stream
/// and returns its connection to the pool immediately.
pub struct Subscription {
    key: String,
    backlog: VecDeque<Arc<StreamEvent>>,
    feed: Option<LiveFeed>,
    terminal: Option<StreamStatus>,
    last_delivered: Option<EventId>,
    state: SubscriberState,
    _connection: Option<PooledConnection>,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> SubscriberState {
        self.state
    }

    /// Id of the last event handed out (or the resume point).
    pub fn last_event_id(&self) -> Option<EventId> {
        self.last_delivered
    }

    /// Next delivery, or `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<Delivery> {
        if matches!(self.state, SubscriberState::Closed(_)) {
            return None;
        }

        if let Some(event) = self.backlog.pop_front() {
            self.last_delivered = Some(event.id);
            return Some(Delivery::Event(event));
        }

        if let Some(status) = self.terminal.take() {
            return Some(self.finish(CloseReason::StreamEnded(status)));
        }

        self.state = SubscriberState::Subscribed;

        let reason = loop {
            let Some(feed) = self.feed.as_mut() else {
                break CloseReason::StreamExpired;
            };
            match feed.events.recv().await {
                Ok(event) => {
                    // Already delivered from the backlog
                    if self.last_delivered.is_some_and(|last| event.id <= last) {
                        continue;
                    }
                    self.last_delivered = Some(event.id);
                    return Some(Delivery::Event(event));
                }
                Err(RecvError::Lagged(missed)) => break CloseReason::Overflow { missed },
                Err(RecvError::Closed) => break feed.close_reason(),
            }
        };

        Some(self.finish(reason))
    }

    /// Close the subscription. Calling it again has no effect.
    pub fn close(&mut self) {
        if matches!(self.state, SubscriberState::Closed(_)) {
            return;
        }
        self.release(CloseReason::Client);
        debug!(key = %self.key, "Subscriber closed");
    }

    /// Turn the subscription into a stream of deliveries.
    pub fn into_stream(mut self) -> impl Stream<Item = Delivery> + Send {
        async_stream::stream! {
            while let Some(delivery) = self.next().await {
                yield delivery;
            }
        }
    }

    fn finish(&mut self, reason: CloseReason) -> Delivery {
        self.release(reason);
        debug!(key = %self.key, reason = ?reason, "Subscription closed");
        Delivery::Closed(reason)
    }

    fn release(&mut self, reason: CloseReason) {
        self.feed = None;
        self._connection = None;
        self.backlog.clear();
        self.terminal = None;
        self.state = SubscriberState::Closed(reason);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;
    use crate::{
        config::ServiceConfig,
        pool::{AcquireMode, PoolConfig},
        service::StreamService,
        types::NewEvent,
    };

    fn config(buffer: usize) -> ServiceConfig {
        ServiceConfig::new(
            "fanout-test-secret-0123456789",
            "http://localhost:4437".parse().unwrap(),
        )
        .subscriber_buffer(buffer)
    }

    fn service(buffer: usize) -> StreamService {
        StreamService::in_memory(config(buffer)).unwrap()
    }

    async fn token(service: &StreamService, key: &str) -> String {
        service.access().issue(key).await.unwrap().token
    }

    fn event_name(delivery: Option<Delivery>) -> String {
        match delivery {
            Some(Delivery::Event(event)) => event.event.clone(),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_replay_then_live() {
        let service = service(16);
        service.registry().create("s", None).await.unwrap();
        service
            .ingest()
            .add_batch("s", vec![NewEvent::new("a"), NewEvent::new("b")])
            .await
            .unwrap();

        let token = token(&service, "s").await;
        let mut sub = service.fanout().subscribe("s", &token, None).await.unwrap();
        assert_eq!(sub.state(), SubscriberState::Connecting);

        assert_eq!(event_name(sub.next().await), "a");
        assert_eq!(event_name(sub.next().await), "b");

        service
            .ingest()
            .add_batch("s", vec![NewEvent::new("c")])
            .await
            .unwrap();
        assert_eq!(event_name(sub.next().await), "c");
        assert_eq!(sub.state(), SubscriberState::Subscribed);
        assert_eq!(sub.last_event_id(), Some(EventId(3)));
    }

    #[tokio::test]
    async fn test_resume_after_last_event_id() {
        let service = service(16);
        service.registry().create("s", None).await.unwrap();
        service
            .ingest()
            .add_batch(
                "s",
                vec![NewEvent::new("a"), NewEvent::new("b"), NewEvent::new("c")],
            )
            .await
            .unwrap();

        let token = token(&service, "s").await;
        let mut sub = service
            .fanout()
            .subscribe("s", &token, Some(EventId(2)))
            .await
            .unwrap();

        assert_eq!(event_name(sub.next().await), "c");
    }

    #[tokio::test]
    async fn test_end_delivers_terminal_status() {
        let service = service(16);
        service.registry().create("s", None).await.unwrap();
        let token = token(&service, "s").await;
        let mut sub = service.fanout().subscribe("s", &token, None).await.unwrap();

        service
            .ingest()
            .add_batch("s", vec![NewEvent::new("last")])
            .await
            .unwrap();
        service.registry().end("s", true).await.unwrap();

        assert_eq!(event_name(sub.next().await), "last");
        assert_eq!(
            sub.next().await,
            Some(Delivery::Closed(CloseReason::StreamEnded(
                StreamStatus::Cancelled
            )))
        );
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn test_grace_window_replays_and_closes() {
        let service = service(16);
        service.registry().create("s", None).await.unwrap();
        let token = token(&service, "s").await;
        service
            .ingest()
            .add_batch("s", vec![NewEvent::new("a")])
            .await
            .unwrap();
        service.registry().end("s", false).await.unwrap();

        let mut sub = service.fanout().subscribe("s", &token, None).await.unwrap();
        assert_eq!(event_name(sub.next().await), "a");
        assert_eq!(
            sub.next().await,
            Some(Delivery::Closed(CloseReason::StreamEnded(StreamStatus::Ended)))
        );
        assert_eq!(
            sub.state(),
            SubscriberState::Closed(CloseReason::StreamEnded(StreamStatus::Ended))
        );

        // Same deliveries through the stream adapter
        let sub = service.fanout().subscribe("s", &token, None).await.unwrap();
        let deliveries: Vec<_> = sub.into_stream().collect().await;
        assert_eq!(deliveries.len(), 2);
        assert_eq!(
            deliveries.last(),
            Some(&Delivery::Closed(CloseReason::StreamEnded(StreamStatus::Ended)))
        );
    }

    #[tokio::test]
    async fn test_slow_subscriber_overflows() {
        let service = service(2);
        service.registry().create("s", None).await.unwrap();
        let token = token(&service, "s").await;
        let mut slow = service.fanout().subscribe("s", &token, None).await.unwrap();

        let events: Vec<_> = (0..5).map(|i| NewEvent::new(format!("e{i}"))).collect();
        service.ingest().add_batch("s", events).await.unwrap();

        assert!(matches!(
            slow.next().await,
            Some(Delivery::Closed(CloseReason::Overflow { missed: 3 }))
        ));
        assert_eq!(slow.next().await, None);
    }

    #[tokio::test]
    async fn test_end_with_full_buffer_keeps_events() {
        let service = service(2);
        service.registry().create("s", None).await.unwrap();
        let token = token(&service, "s").await;
        let mut sub = service.fanout().subscribe("s", &token, None).await.unwrap();

        service
            .ingest()
            .add_batch("s", vec![NewEvent::new("a"), NewEvent::new("b")])
            .await
            .unwrap();
        service.registry().end("s", false).await.unwrap();

        assert_eq!(event_name(sub.next().await), "a");
        assert_eq!(event_name(sub.next().await), "b");
        assert_eq!(
            sub.next().await,
            Some(Delivery::Closed(CloseReason::StreamEnded(StreamStatus::Ended)))
        );
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn test_subscriptions_hold_streaming_connections() {
        let config = config(16).pool(PoolConfig {
            static_size: 2,
            streaming_size: 1,
            streaming_acquire: AcquireMode::FailFast,
        });
        let service = StreamService::in_memory(config).unwrap();
        service.registry().create("s", None).await.unwrap();
        let token = token(&service, "s").await;

        let mut first = service.fanout().subscribe("s", &token, None).await.unwrap();
        assert_eq!(service.pool_stats().streaming.in_use, 1);

        let second = service.fanout().subscribe("s", &token, None).await;
        assert!(matches!(
            second,
            Err(StreamError::PoolExhausted(ConnectionClass::Streaming))
        ));
        assert_eq!(service.registry().subscriber_count("s").await, 1);

        first.close();
        assert_eq!(service.pool_stats().streaming.in_use, 0);

        let third = service.fanout().subscribe("s", &token, None).await.unwrap();
        assert_eq!(service.pool_stats().streaming.in_use, 1);
        drop(third);
        assert_eq!(service.pool_stats().streaming.in_use, 0);
    }

    #[tokio::test]
    async fn test_token_from_replaced_stream_rejected() {
        let service = service(16);
        service.registry().create("s", None).await.unwrap();
        let old_token = token(&service, "s").await;
        service.registry().end("s", false).await.unwrap();
        service.registry().create("s", None).await.unwrap();

        let result = service.fanout().subscribe("s", &old_token, None).await;
        assert!(matches!(
            result,
            Err(StreamError::Unauthorized(AuthError::StaleToken))
        ));
        assert_eq!(service.pool_stats().streaming.in_use, 0);

        let new_token = token(&service, "s").await;
        assert!(service.fanout().subscribe("s", &new_token, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_detaches() {
        let service = service(16);
        service.registry().create("s", None).await.unwrap();
        let token = token(&service, "s").await;
        let mut sub = service.fanout().subscribe("s", &token, None).await.unwrap();
        assert_eq!(service.registry().subscriber_count("s").await, 1);

        sub.close();
        sub.close();
        assert_eq!(sub.state(), SubscriberState::Closed(CloseReason::Client));
        assert_eq!(sub.next().await, None);
        assert_eq!(service.registry().subscriber_count("s").await, 0);
    }

    #[tokio::test]
    async fn test_wrong_stream_token_rejected() {
        let service = service(16);
        service.registry().create("a", None).await.unwrap();
        service.registry().create("b", None).await.unwrap();
        let token_a = token(&service, "a").await;

        let result = service.fanout().subscribe("b", &token_a, None).await;
        assert!(matches!(
            result,
            Err(crate::StreamError::Unauthorized(crate::AuthError::WrongStream))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_closes_subscribers() {
        let service = service(16);
        service
            .registry()
            .create("s", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        let token = token(&service, "s").await;
        let mut sub = service.fanout().subscribe("s", &token, None).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(service.registry().purge_expired().await, 1);

        assert_eq!(
            sub.next().await,
            Some(Delivery::Closed(CloseReason::StreamExpired))
        );
    }
}
