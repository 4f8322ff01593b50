use std::time::Duration;

use anyhow::{Context as _, bail};
use console::style;
use tidestream_core::{AcquireMode, PoolConfig, RetentionPolicy, ServiceConfig, StreamService};
use tidestream_server::{ServerOptions, start_server};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Debug, Clone, PartialEq, clap::Args)]
pub struct ServeCommand {
    /// Host to bind to
    #[arg(long, env = "TIDESTREAM_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to run the server on
    #[arg(long, env = "TIDESTREAM_PORT", default_value = "4437")]
    pub port: u16,

    /// Externally reachable base URL used in subscription URLs
    /// (default: http://<host>:<port>)
    #[arg(long, env = "TIDESTREAM_PUBLIC_URL")]
    pub public_url: Option<Url>,

    /// Secret used to sign access tokens (at least 16 bytes)
    #[arg(long, env = "TIDESTREAM_SECRET", hide_env_values = true)]
    pub secret: String,

    /// Key required in X-API-KEY on control endpoints
    #[arg(long, env = "TIDESTREAM_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Default stream lifetime in seconds
    #[arg(long, env = "TIDESTREAM_TTL", default_value = "600")]
    pub ttl: u64,

    /// Seconds an ended stream stays readable
    #[arg(long, env = "TIDESTREAM_END_GRACE", default_value = "60")]
    pub end_grace: u64,

    /// Access token lifetime in seconds
    #[arg(long, env = "TIDESTREAM_TOKEN_TTL", default_value = "600")]
    pub token_ttl: u64,

    /// Connections reserved for control operations
    #[arg(long, env = "TIDESTREAM_STATIC_POOL", default_value = "4")]
    pub static_pool: usize,

    /// Connections reserved for appends and subscriptions
    #[arg(long, env = "TIDESTREAM_STREAMING_POOL", default_value = "20")]
    pub streaming_pool: usize,

    /// How long a streaming acquisition waits, in milliseconds (0 fails fast)
    #[arg(long, env = "TIDESTREAM_ACQUIRE_TIMEOUT_MS", default_value = "6000")]
    pub acquire_timeout_ms: u64,

    /// Undelivered events buffered per subscriber before it is dropped
    #[arg(long, env = "TIDESTREAM_SUBSCRIBER_BUFFER", default_value = "256")]
    pub subscriber_buffer: usize,

    /// Longest accepted upload line in bytes
    #[arg(long, env = "TIDESTREAM_MAX_LINE_LENGTH", default_value = "65536")]
    pub max_line_length: usize,

    /// Events retained per stream (0 keeps all)
    #[arg(long, env = "TIDESTREAM_MAX_LOG_LEN", default_value = "0")]
    pub max_log_len: usize,

    /// Seconds between expiry sweeps
    #[arg(long, env = "TIDESTREAM_CLEANUP_INTERVAL", default_value = "30")]
    pub cleanup_interval: u64,

    /// Seconds between SSE keep-alive comments
    #[arg(long, env = "TIDESTREAM_KEEP_ALIVE", default_value = "15")]
    pub keep_alive: u64,

    /// Comma-separated origins allowed by CORS (default: any origin)
    #[arg(long, env = "TIDESTREAM_ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,

    /// Emit logs as JSON lines
    #[arg(long, env = "TIDESTREAM_LOG_JSON")]
    pub log_json: bool,
}

impl ServeCommand {
    pub async fn execute(&self) -> anyhow::Result<()> {
        let config = self.service_config()?;
        let options = self.server_options();
        let public_url = config.public_url.clone();

        init_tracing(self.log_json);

        let service = StreamService::in_memory(config)?;
        service.spawn_cleanup_task();

        info!(
            host = %self.host,
            port = self.port,
            public_url = %public_url,
            streaming_pool = self.streaming_pool,
            "Stream service ready"
        );
        if options.api_key.is_none() {
            warn!("Control endpoints are not protected by an API key");
        }
        match &options.allowed_origins {
            Some(origins) => info!(origins = ?origins, "CORS restricted"),
            None => info!("CORS allows any origin"),
        }

        println!();
        println!("{}{}", style("Tide").white(), style("stream").cyan());
        println!("{}", style("Starting stream server").dim());
        println!();
        println!("  Listening on {}:{}", self.host, self.port);
        println!("  Public URL   {}", public_url);
        if options.api_key.is_none() {
            println!("  {} no API key set", style("Warning:").yellow());
        }
        println!();
        println!("{}", style("Press Ctrl+C to stop").dim());
        println!();

        start_server(service, options)
            .await
            .context("Failed to start server")
    }

    fn service_config(&self) -> anyhow::Result<ServiceConfig> {
        if self.ttl == 0 {
            bail!("--ttl must be at least 1 second");
        }
        if self.static_pool == 0 || self.streaming_pool == 0 {
            bail!("connection pools need at least one connection per class");
        }

        let public_url = match &self.public_url {
            Some(url) => url.clone(),
            None => format!("http://{}:{}", self.host, self.port)
                .parse()
                .with_context(|| format!("Invalid host {}", self.host))?,
        };

        let streaming_acquire = match self.acquire_timeout_ms {
            0 => AcquireMode::FailFast,
            ms => AcquireMode::Wait(Duration::from_millis(ms)),
        };
        let retention = match self.max_log_len {
            0 => RetentionPolicy::Unbounded,
            len => RetentionPolicy::MaxLen(len),
        };

        Ok(ServiceConfig::new(self.secret.clone(), public_url)
            .default_ttl(Duration::from_secs(self.ttl))
            .end_grace(Duration::from_secs(self.end_grace))
            .token_ttl(Duration::from_secs(self.token_ttl))
            .subscriber_buffer(self.subscriber_buffer)
            .max_line_length(self.max_line_length)
            .pool(PoolConfig {
                static_size: self.static_pool,
                streaming_size: self.streaming_pool,
                streaming_acquire,
            })
            .cleanup_interval(Duration::from_secs(self.cleanup_interval))
            .retention(retention))
    }

    fn server_options(&self) -> ServerOptions {
        ServerOptions {
            port: self.port,
            host: self.host.clone(),
            api_key: self.api_key.clone(),
            keep_alive: Duration::from_secs(self.keep_alive),
            allowed_origins: self.allowed_origins(),
        }
    }

    fn allowed_origins(&self) -> Option<Vec<String>> {
        let origins: Vec<String> = self
            .allowed_origins
            .iter()
            .map(|origin| origin.trim())
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect();
        (!origins.is_empty()).then_some(origins)
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info,axum::rejection=trace"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
