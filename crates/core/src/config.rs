//! Service configuration.

use std::time::Duration;

use url::Url;

use crate::{backend::RetentionPolicy, pool::PoolConfig};

/// Default lifetime of a stream without activity.
pub const DEFAULT_STREAM_TTL: Duration = Duration::from_secs(600);
/// Default time an ended stream stays observable.
pub const DEFAULT_END_GRACE: Duration = Duration::from_secs(60);
/// Default lifetime of an access token.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(600);
/// Default per-subscriber delivery buffer, in events.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;
/// Default maximum length of one continuous-upload line, in bytes.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;
/// Default interval between expiry sweeps.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Configuration for a [`StreamService`](crate::StreamService).
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// HS256 signing secret for access tokens
    pub secret: String,
    /// Externally reachable base URL used to build subscription URLs
    pub public_url: Url,
    /// TTL applied on create and refreshed by every append
    pub default_ttl: Duration,
    /// TTL applied when a stream is ended or cancelled
    pub end_grace: Duration,
    pub token_ttl: Duration,
    pub subscriber_buffer: usize,
    pub max_line_length: usize,
    pub pool: PoolConfig,
    pub cleanup_interval: Duration,
    /// Trimming policy handed to the log backend
    pub retention: RetentionPolicy,
}

impl ServiceConfig {
    pub fn new(secret: impl Into<String>, public_url: Url) -> Self {
        Self {
            secret: secret.into(),
            public_url,
            default_ttl: DEFAULT_STREAM_TTL,
            end_grace: DEFAULT_END_GRACE,
            token_ttl: DEFAULT_TOKEN_TTL,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            pool: PoolConfig::default(),
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            retention: RetentionPolicy::default(),
        }
    }

    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn end_grace(mut self, grace: Duration) -> Self {
        self.end_grace = grace;
        self
    }

    pub fn token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    pub fn subscriber_buffer(mut self, capacity: usize) -> Self {
        self.subscriber_buffer = capacity;
        self
    }

    pub fn max_line_length(mut self, length: usize) -> Self {
        self.max_line_length = length;
        self
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }
}
