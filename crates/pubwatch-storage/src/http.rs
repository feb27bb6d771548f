//! Outbound HTTP plumbing: retry classification, exponential backoff and a
//! process-wide courtesy gate for the scraped origin.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info_span;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Single-slot "wait until the interval elapsed" gate.
///
/// Shared across every task that talks to the scraped origin, independent of
/// per-tenant locking: the courtesy rate holds no matter how many tenants run
/// concurrently.
#[derive(Debug)]
pub struct MinIntervalGate {
    min_interval: Duration,
    last_pass: Mutex<Option<Instant>>,
}

impl MinIntervalGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_pass: Mutex::new(None),
        }
    }

    /// Sleep until at least `min_interval` has passed since the previous
    /// caller went through, then claim the slot.
    pub async fn wait(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        loop {
            let sleep_for = {
                let mut last = self.last_pass.lock().await;
                match *last {
                    Some(prev) => {
                        let elapsed = prev.elapsed();
                        if elapsed >= self.min_interval {
                            *last = Some(Instant::now());
                            return;
                        }
                        self.min_interval - elapsed
                    }
                    None => {
                        *last = Some(Instant::now());
                        return;
                    }
                }
            };
            tokio::time::sleep(sleep_for).await;
        }
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
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Every outbound call gets an explicit timeout floor so a misconfigured
/// zero-second timeout can never slip through.
pub const TIMEOUT_FLOOR: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
    gate: Option<Arc<MinIntervalGate>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout.max(TIMEOUT_FLOOR));

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
            gate: None,
        })
    }

    /// Route every fetch through a shared courtesy gate.
    pub fn with_gate(mut self, gate: Arc<MinIntervalGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub async fn fetch_text(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        if let Some(gate) = &self.gate {
            gate.wait().await;
        }

        let span = info_span!("http_fetch", url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}
