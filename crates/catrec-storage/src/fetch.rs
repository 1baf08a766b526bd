use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

use crate::retry::{BackoffPolicy, RetryDisposition};

/// Listing servers that are overloaded or throttling get another attempt;
/// anything else the server says is final.
fn status_disposition(status: StatusCode) -> RetryDisposition {
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => RetryDisposition::Retryable,
        s if s.is_server_error() => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

/// Transport failures before or while reading the body.
fn transport_disposition(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Fetches remote source listings with a per-request timeout and bounded,
/// backed-off retries.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.fetch_once(url).await {
                Ok(body) => return Ok(body),
                Err((err, RetryDisposition::Retryable)) if attempt < self.backoff.max_retries => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(attempt, ?delay, error = %err, "listing fetch failed; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err((err, _)) => return Err(err),
            }
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<u8>, (FetchError, RetryDisposition)> {
        let transport = |err: reqwest::Error| {
            let disposition = transport_disposition(&err);
            (FetchError::Request(err), disposition)
        };

        let resp = self.client.get(url).send().await.map_err(transport)?;
        let status = resp.status();
        if !status.is_success() {
            let err = FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            };
            return Err((err, status_disposition(status)));
        }
        let body = resp.bytes().await.map_err(transport)?;
        Ok(body.to_vec())
    }
}
