use std::time::Duration;

use anyhow::Context;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{info_span, Instrument};

use crate::RunLogStore;

const ZIP_LOCAL_HEADER: &[u8] = b"PK\x03\x04";
const ZIP_EMPTY_ARCHIVE: &[u8] = b"PK\x05\x06";

/// A feed body is only handed to the importer when it starts like a ZIP.
pub fn looks_like_zip(body: &[u8]) -> bool {
    body.starts_with(ZIP_LOCAL_HEADER) || body.starts_with(ZIP_EMPTY_ARCHIVE)
}

/// Statuses worth asking the feed host for again.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Parses a `Retry-After` header given in delay-seconds. HTTP-date values are
/// ignored and the policy delay applies instead.
pub fn retry_after(value: Option<&str>) -> Option<Duration> {
    value?.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total requests per fetch, including the first.
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry` (0 for the first retry). A server hint
    /// wins over the doubling schedule; both are capped at `max_delay`.
    pub fn delay(&self, retry: usize, server_hint: Option<Duration>) -> Duration {
        let scheduled = match u32::try_from(retry).ok().and_then(|r| 2u32.checked_pow(r)) {
            Some(factor) => self.initial_delay.saturating_mul(factor),
            None => self.max_delay,
        };
        server_hint.unwrap_or(scheduled).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub retry: RetryPolicy,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: format!("tfi/{}", env!("CARGO_PKG_VERSION")),
            retry: RetryPolicy::default(),
        }
    }
}

/// A downloaded feed archive plus what the run log records about it.
#[derive(Debug, Clone)]
pub struct FetchedFeed {
    pub final_url: String,
    pub content_type: Option<String>,
    pub attempts: usize,
    pub content_hash: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetching {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("feed host answered {status} for {url}")]
    Status { status: u16, url: String },
    #[error("{url} did not return a ZIP archive (content-type {content_type:?})")]
    NotAnArchive {
        url: String,
        content_type: Option<String>,
    },
}

/// Downloads a published GTFS archive for `import --url`.
#[derive(Debug)]
pub struct FeedFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl FeedFetcher {
    pub fn new(config: FetchConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .context("building feed download client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    pub async fn fetch_archive(&self, url: &str) -> Result<FetchedFeed, FetchError> {
        self.fetch_until_settled(url)
            .instrument(info_span!("feed_fetch", url))
            .await
    }

    async fn fetch_until_settled(&self, url: &str) -> Result<FetchedFeed, FetchError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let resp = match self.client.get(url).send().await {
                Ok(resp) => resp,
                Err(source) if attempt < max_attempts && is_transient_error(&source) => {
                    let wait = self.retry.delay(attempt - 1, None);
                    tracing::warn!(error = %source, attempt, ?wait, "feed host unreachable, retrying");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                    continue;
                }
                Err(source) => {
                    return Err(FetchError::Transport {
                        url: url.to_string(),
                        source,
                    })
                }
            };

            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                if attempt < max_attempts && is_transient_status(status) {
                    let hint = retry_after(
                        resp.headers()
                            .get(RETRY_AFTER)
                            .and_then(|v| v.to_str().ok()),
                    );
                    let wait = self.retry.delay(attempt - 1, hint);
                    tracing::warn!(%status, attempt, ?wait, "feed host busy, retrying");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                    continue;
                }
                return Err(FetchError::Status {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let content_type = resp
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = resp
                .bytes()
                .await
                .map_err(|source| FetchError::Transport {
                    url: final_url.clone(),
                    source,
                })?
                .to_vec();

            if !looks_like_zip(&body) {
                return Err(FetchError::NotAnArchive {
                    url: final_url,
                    content_type,
                });
            }

            let content_hash = RunLogStore::sha256_hex(&body);
            tracing::info!(bytes = body.len(), %final_url, attempts = attempt, "feed archive downloaded");
            return Ok(FetchedFeed {
                final_url,
                content_type,
                attempts: attempt,
                content_hash,
                body,
            });
        }
    }
}
