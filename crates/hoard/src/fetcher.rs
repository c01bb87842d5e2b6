// Network fetch of single resources, with bounded retries.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::config::{HttpConfig, create_client};
use crate::error::{CacheError, Result};
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};

/// Reads one URL into memory.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `url`, retrying transient failures. Once the retry budget is
    /// spent the error is [`CacheError::FetchExhausted`].
    async fn fetch(&self, url: &str) -> Result<Bytes>;
}

/// `reqwest`-backed fetcher.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    policy: RetryPolicy,
    shutdown: CancellationToken,
}

impl HttpFetcher {
    pub fn new(client: Client, policy: RetryPolicy) -> Self {
        Self {
            client,
            policy,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_config(http: &HttpConfig, policy: RetryPolicy) -> Result<Self> {
        Ok(Self::new(create_client(http)?, policy))
    }

    /// Abort pending backoff sleeps when `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn attempt(&self, url: &reqwest::Url) -> RetryAction<Bytes> {
        let response = match self.client.get(url.clone()).send().await {
            Ok(response) => response,
            Err(e) => {
                let err = CacheError::from(e);
                return if err.is_retryable() {
                    RetryAction::Retry(err)
                } else {
                    RetryAction::Fail(err)
                };
            }
        };

        let status = response.status();
        if !status.is_success() {
            // Any status the origin rejects gets the full retry budget.
            return RetryAction::Retry(CacheError::http_status(status, url.as_str()));
        }

        match response.bytes().await {
            Ok(body) => RetryAction::Success(body),
            // A body cut short is worth another request.
            Err(e) => RetryAction::Retry(CacheError::from(e)),
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip(self), level = "debug")]
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        let parsed =
            reqwest::Url::parse(url).map_err(|e| CacheError::invalid_url(url, e.to_string()))?;

        let result = retry_with_backoff(&self.policy, &self.shutdown, |_| {
            self.attempt(&parsed)
        })
        .await;

        match result {
            Ok(body) => {
                debug!(bytes = body.len(), "Fetched resource");
                Ok(body)
            }
            Err(err) if err.is_retryable() => Err(CacheError::fetch_exhausted(
                url,
                self.policy.attempts(),
                &err,
            )),
            Err(err) => Err(err),
        }
    }
}
