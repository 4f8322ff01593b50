//! The assembled stream service.

use std::sync::Arc;

use tracing::info;

use crate::{
    access::AccessIssuer,
    backend::{LogBackend, MemoryBackend},
    config::ServiceConfig,
    error::Result,
    fanout::Fanout,
    ingest::Ingestor,
    pool::{ConnectionPool, PoolStats},
    registry::StreamRegistry,
};

/// Every core component wired from one [`ServiceConfig`].
///
/// Cloning is cheap; clones share the same streams.
#[derive(Clone)]
pub struct StreamService {
    config: Arc<ServiceConfig>,
    pool: Arc<ConnectionPool>,
    registry: Arc<StreamRegistry>,
    ingest: Ingestor,
    access: Arc<AccessIssuer>,
    fanout: Fanout,
}

impl StreamService {
    /// Build the service over an existing backend.
    pub fn new(backend: Arc<dyn LogBackend>, config: ServiceConfig) -> Result<Self> {
        let pool = Arc::new(ConnectionPool::new(backend, config.pool.clone()));
        let registry = Arc::new(StreamRegistry::new(Arc::clone(&pool), &config));
        let ingest = Ingestor::new(Arc::clone(&registry), config.max_line_length);
        let access = Arc::new(AccessIssuer::new(
            Arc::clone(&registry),
            &config.secret,
            config.public_url.clone(),
            config.token_ttl,
        )?);
        let fanout = Fanout::new(Arc::clone(&registry), Arc::clone(&access), Arc::clone(&pool));

        let stats = pool.stats();
        info!(
            static_connections = stats.static_class.max,
            streaming_connections = stats.streaming.max,
            default_ttl_secs = config.default_ttl.as_secs(),
            "Stream service ready"
        );

        Ok(Self {
            config: Arc::new(config),
            pool,
            registry,
            ingest,
            access,
            fanout,
        })
    }

    /// Build the service over a fresh [`MemoryBackend`].
    pub fn in_memory(config: ServiceConfig) -> Result<Self> {
        let backend = Arc::new(MemoryBackend::with_retention(config.retention));
        Self::new(backend, config)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn ingest(&self) -> &Ingestor {
        &self.ingest
    }

    pub fn access(&self) -> &AccessIssuer {
        &self.access
    }

    pub fn fanout(&self) -> &Fanout {
        &self.fanout
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Start the periodic expiry sweep.
    pub fn spawn_cleanup_task(&self) -> tokio::task::JoinHandle<()> {
        self.registry.spawn_cleanup_task()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::RetentionPolicy, types::NewEvent};

    #[tokio::test]
    async fn test_retention_reaches_backend() {
        let config = ServiceConfig::new(
            "service-test-secret-0123456789",
            "http://localhost:4437".parse().unwrap(),
        )
        .retention(RetentionPolicy::MaxLen(2));
        let service = StreamService::in_memory(config).unwrap();

        service.registry().create("s", None).await.unwrap();
        let events: Vec<_> = (0..5).map(|i| NewEvent::new(format!("e{i}"))).collect();
        service.ingest().add_batch("s", events).await.unwrap();

        let info = service.registry().get("s").await.unwrap();
        assert_eq!(info.length, 5);
        assert_eq!(info.retained, 2);
    }

    #[test]
    fn test_rejects_short_secret() {
        let config = ServiceConfig::new("short", "http://localhost:4437".parse().unwrap());
        assert!(StreamService::in_memory(config).is_err());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let config = ServiceConfig::new(
            "service-test-secret-0123456789",
            "http://localhost:4437".parse().unwrap(),
        );
        let service = StreamService::in_memory(config).unwrap();
        let clone = service.clone();

        service.registry().create("s", None).await.unwrap();
        assert!(clone.registry().get("s").await.is_ok());
        assert_eq!(clone.pool_stats().static_class.in_use, 0);
    }
}
