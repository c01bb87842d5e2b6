use std::sync::OnceLock;
use std::time::Duration;

use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

use crate::error::{CacheError, Result};
use crate::retry::RetryPolicy;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

pub const DEFAULT_DATABASE_URL: &str = "sqlite:hoard.db?mode=rwc";

/// Default number of resources fetched concurrently per download.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Default number of completions between two progress checkpoints.
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 10;

/// HTTP client options used by the fetcher.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Overall timeout for a single request (zero disables it)
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Headers sent with every request, on top of the defaults
    pub headers: HeaderMap,

    /// Maximum idle connections to keep per host
    pub pool_max_idle_per_host: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HttpConfig::get_default_headers(),
            pool_max_idle_per_host: 10,
        }
    }
}

impl HttpConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate"),
        );

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        default_headers
    }

    /// Insert or replace a header, validating both name and value.
    pub fn insert_header(&mut self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| CacheError::configuration(format!("invalid header name `{name}`: {e}")))?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            CacheError::configuration(format!("invalid value for header `{name}`: {e}"))
        })?;
        self.headers.insert(name, value);
        Ok(())
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Worker budget per download
    pub concurrency: usize,

    /// Completions between progress checkpoints of the root record
    pub checkpoint_interval: u64,

    /// Retry behaviour for every network fetch
    pub retry: RetryPolicy,

    pub http: HttpConfig,

    /// SQLite database URL (e.g. "sqlite:hoard.db?mode=rwc")
    pub database_url: String,

    /// Maximum connections in the SQLite pool
    pub max_connections: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            retry: RetryPolicy::default(),
            http: HttpConfig::default(),
            database_url: DEFAULT_DATABASE_URL.to_owned(),
            max_connections: 4,
        }
    }
}

impl CacheConfig {
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(CacheError::configuration("concurrency must be at least 1"));
        }
        if self.checkpoint_interval == 0 {
            return Err(CacheError::configuration(
                "checkpoint interval must be at least 1",
            ));
        }
        if self.max_connections == 0 {
            return Err(CacheError::configuration(
                "max_connections must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Fluent builder for [`CacheConfig`].
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    pub fn checkpoint_interval(mut self, interval: u64) -> Self {
        self.config.checkpoint_interval = interval;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.retry.max_retries = max_retries;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.http.timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.http.connect_timeout = timeout;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.http.user_agent = user_agent.into();
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        self.config.http.insert_header(name, value)?;
        Ok(self)
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.config.database_url = url.into();
        self
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.config.max_connections = max;
        self
    }

    pub fn build(self) -> Result<CacheConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate installed one first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the shared `reqwest::Client` from [`HttpConfig`].
pub fn create_client(config: &HttpConfig) -> Result<Client> {
    install_rustls_provider();

    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .pool_max_idle_per_host(config.pool_max_idle_per_host);

    if config.timeout > Duration::ZERO {
        builder = builder.timeout(config.timeout);
    }

    if !config.follow_redirects {
        builder = builder.redirect(reqwest::redirect::Policy::none());
    }

    builder.build().map_err(CacheError::from)
}
