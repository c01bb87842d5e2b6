use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("download cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("fetch of {url} gave up after {attempts} attempts: {reason}")]
    FetchExhausted {
        url: String,
        attempts: u32,
        reason: String,
    },

    #[error("storage write failed during {operation}: {reason}")]
    StorageWrite {
        operation: &'static str,
        reason: String,
    },

    #[error("storage read failed during {operation}: {reason}")]
    StorageRead {
        operation: &'static str,
        reason: String,
    },

    #[error("database migration failed: {source}")]
    Migration {
        #[from]
        source: sqlx::migrate::MigrateError,
    },

    #[error("invalid record `{key}`: {reason}")]
    InvalidRecord { key: String, reason: String },

    #[error("manifest discovery failed for {url}: {reason}")]
    ManifestDiscovery { url: String, reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl CacheError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(status: StatusCode, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
        }
    }

    pub fn fetch_exhausted(url: impl Into<String>, attempts: u32, last: &CacheError) -> Self {
        Self::FetchExhausted {
            url: url.into(),
            attempts,
            reason: last.to_string(),
        }
    }

    pub fn storage_write(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::StorageWrite {
            operation,
            reason: err.to_string(),
        }
    }

    pub fn storage_read(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::StorageRead {
            operation,
            reason: err.to_string(),
        }
    }

    pub fn invalid_record(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn manifest_discovery(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ManifestDiscovery {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Whether another attempt of the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { source } => {
                source.is_connect()
                    || source.is_timeout()
                    || source.is_request()
                    || source.is_body()
                    || source.is_decode()
            }
            // Origins answer 403 and 404 for segments that are not published yet.
            Self::HttpStatus { .. } => true,
            Self::Cancelled
            | Self::InvalidUrl { .. }
            | Self::FetchExhausted { .. }
            | Self::StorageWrite { .. }
            | Self::StorageRead { .. }
            | Self::Migration { .. }
            | Self::InvalidRecord { .. }
            | Self::ManifestDiscovery { .. }
            | Self::Configuration { .. }
            | Self::Internal { .. } => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
