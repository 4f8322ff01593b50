//! Tidestream HTTP server
//!
//! Serves a [`StreamService`](tidestream_core::StreamService) over HTTP:
//!
//! - Control endpoints under `/api/stream` (create, token, info, list, add, end),
//!   guarded by an optional `X-API-KEY`
//! - Subscriber endpoints under `/api/client` (Server-Sent Events and WebSocket),
//!   authorized by the stream-scoped bearer token
//!
//! # Example
//!
//! ```rust,no_run
//! use tidestream_core::{ServiceConfig, StreamService};
//! use tidestream_server::{ServerOptions, start_server};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServiceConfig::new("a-long-enough-signing-secret", "http://localhost:4437".parse()?);
//! let service = StreamService::in_memory(config)?;
//! service.spawn_cleanup_task();
//!
//! start_server(service, ServerOptions::default()).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod server;
pub mod types;

pub use error::ApiError;
pub use server::{AppState, create_router, start_server};
pub use types::ServerOptions;
