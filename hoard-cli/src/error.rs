use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] hoard_engine::CacheError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Nothing cached for {0}")]
    NotCached(String),

    #[error("Download of {url} did not complete: {reason}")]
    Incomplete { url: String, reason: String },

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Interrupted")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, AppError>;
