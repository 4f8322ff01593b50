//! Bounded pool of backend connections.
//!
//! Connections come in two classes with independent capacity: `Static` for
//! short control-plane work (create, end, info, list) and `Streaming` for the
//! data plane (appends and subscription replay). Saturating one class never
//! affects the other.

use std::{fmt, ops::Deref, sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::{
    backend::LogBackend,
    error::{Result, StreamError},
};

/// Default number of static connections.
pub const DEFAULT_STATIC_SIZE: usize = 4;
/// Default number of streaming connections.
pub const DEFAULT_STREAMING_SIZE: usize = 20;
/// Default wait for a streaming connection.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(6);

/// Connection class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionClass {
    Static,
    Streaming,
}

impl fmt::Display for ConnectionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionClass::Static => f.write_str("static"),
            ConnectionClass::Streaming => f.write_str("streaming"),
        }
    }
}

/// What to do when a class is saturated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Fail with `PoolExhausted` immediately
    FailFast,
    /// Wait up to the given duration, then fail with `PoolExhausted`
    Wait(Duration),
}

/// Pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub static_size: usize,
    pub streaming_size: usize,
    /// Acquisition policy of the streaming class (static is always fail-fast)
    pub streaming_acquire: AcquireMode,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            static_size: DEFAULT_STATIC_SIZE,
            streaming_size: DEFAULT_STREAMING_SIZE,
            streaming_acquire: AcquireMode::Wait(DEFAULT_ACQUIRE_TIMEOUT),
        }
    }
}

/// Usage of one connection class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClassStats {
    pub max: usize,
    pub in_use: usize,
    pub available: usize,
}

/// Usage of the whole pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    #[serde(rename = "static")]
    pub static_class: ClassStats,
    pub streaming: ClassStats,
}

struct ClassPool {
    class: ConnectionClass,
    max: usize,
    mode: AcquireMode,
    permits: Arc<Semaphore>,
    /// Ids of idle connections; always at least as long as the free permits
    idle: Arc<Mutex<Vec<usize>>>,
}

impl ClassPool {
    fn new(class: ConnectionClass, max: usize, mode: AcquireMode) -> Self {
        Self {
            class,
            max,
            mode,
            permits: Arc::new(Semaphore::new(max)),
            idle: Arc::new(Mutex::new((0..max).rev().collect())),
        }
    }

    async fn permit(&self) -> Option<OwnedSemaphorePermit> {
        match self.mode {
            AcquireMode::FailFast => self.permits.clone().try_acquire_owned().ok(),
            AcquireMode::Wait(timeout) => {
                tokio::time::timeout(timeout, self.permits.clone().acquire_owned())
                    .await
                    .ok()
                    .and_then(|permit| permit.ok())
            }
        }
    }

    fn stats(&self) -> ClassStats {
        let available = self.permits.available_permits();
        ClassStats {
            max: self.max,
            in_use: self.max - available,
            available,
        }
    }
}

/// Bounded, two-class connection pool over a log backend.
pub struct ConnectionPool {
    backend: Arc<dyn LogBackend>,
    static_class: ClassPool,
    streaming: ClassPool,
}

impl ConnectionPool {
    /// Create the pool with every connection of both classes up front.
    pub fn new(backend: Arc<dyn LogBackend>, config: PoolConfig) -> Self {
        Self {
            backend,
            static_class: ClassPool::new(
                ConnectionClass::Static,
                config.static_size,
                AcquireMode::FailFast,
            ),
            streaming: ClassPool::new(
                ConnectionClass::Streaming,
                config.streaming_size,
                config.streaming_acquire,
            ),
        }
    }

    fn class_pool(&self, class: ConnectionClass) -> &ClassPool {
        match class {
            ConnectionClass::Static => &self.static_class,
            ConnectionClass::Streaming => &self.streaming,
        }
    }

    /// Borrow a connection of the given class.
    ///
    /// The connection goes back to the pool when the returned guard is dropped.
    pub async fn acquire(&self, class: ConnectionClass) -> Result<PooledConnection> {
        let pool = self.class_pool(class);

        let Some(permit) = pool.permit().await else {
            warn!(class = %class, max = pool.max, "Connection pool exhausted");
            return Err(StreamError::PoolExhausted(class));
        };

        let Some(id) = pool.idle.lock().pop() else {
            warn!(class = %class, "Idle list out of sync with permits");
            return Err(StreamError::PoolExhausted(class));
        };

        debug!(class = %class, connection = id, "Acquired connection");
        Ok(PooledConnection {
            id,
            class,
            backend: Arc::clone(&self.backend),
            idle: Arc::clone(&pool.idle),
            _permit: permit,
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            static_class: self.static_class.stats(),
            streaming: self.streaming.stats(),
        }
    }
}

/// A borrowed backend connection.
pub struct PooledConnection {
    id: usize,
    class: ConnectionClass,
    backend: Arc<dyn LogBackend>,
    idle: Arc<Mutex<Vec<usize>>>,
    // Released after `drop` has returned the id to the idle list
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn class(&self) -> ConnectionClass {
        self.class
    }
}

impl Deref for PooledConnection {
    type Target = dyn LogBackend;

    fn deref(&self) -> &Self::Target {
        self.backend.as_ref()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.idle.lock().push(self.id);
    }
}
