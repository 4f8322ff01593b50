//! Tidestream core
//!
//! The server-side core of a TTL-bound event streaming service: callers create a
//! named stream, append events to it (in batches or as a newline-delimited JSON
//! upload), obtain a stream-scoped token plus subscription URLs, and end the stream.
//!
//! # Components
//!
//! - **Connection pool** ([`pool`]): bounded backend connections, split into a
//!   static (control-plane) and a streaming (data-plane) class
//! - **Log backend** ([`backend`]): the narrow storage interface the core drives,
//!   with an in-memory implementation
//! - **Stream registry** ([`registry`]): the single source of truth for stream
//!   existence, status, length and expiry
//! - **Ingestion** ([`ingest`]): batch and continuous appends
//! - **Access** ([`access`]): stream-scoped bearer tokens and subscription URLs
//! - **Fan-out** ([`fanout`]): in-order delivery of new events to subscribers
//!
//! # Example
//!
//! ```rust,no_run
//! use tidestream_core::{NewEvent, ServiceConfig, StreamService};
//!
//! # async fn run() -> Result<(), tidestream_core::StreamError> {
//! let config = ServiceConfig::new("a-long-enough-signing-secret", "http://localhost:4437".parse().unwrap());
//! let service = StreamService::in_memory(config)?;
//!
//! service.registry().create("orders", None).await?;
//! let grant = service.access().issue("orders").await?;
//!
//! let mut subscription = service.fanout().subscribe("orders", &grant.token, None).await?;
//! service
//!     .ingest()
//!     .add_batch("orders", vec![NewEvent::new("created").with_data("{\"id\":1}")])
//!     .await?;
//!
//! let delivery = subscription.next().await;
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod backend;
pub mod config;
pub mod error;
pub mod fanout;
pub mod ingest;
pub mod pool;
pub mod registry;
pub mod service;
pub mod types;

// Re-export commonly used items
pub use access::{AccessGrant, AccessIssuer, AuthError};
pub use backend::{BackendError, LogBackend, MemoryBackend, RetentionPolicy};
pub use config::ServiceConfig;
pub use error::{Result, StreamError};
pub use fanout::{CloseReason, Delivery, Fanout, SubscriberState, Subscription};
pub use ingest::Ingestor;
pub use pool::{AcquireMode, ConnectionClass, ConnectionPool, PoolConfig, PoolStats};
pub use registry::StreamRegistry;
pub use service::StreamService;
pub use types::{EventId, EventRecord, IngestReport, NewEvent, StreamEvent, StreamInfo, StreamStatus};
