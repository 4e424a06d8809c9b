//! HTTP page fetching
//!
//! The dispatcher consumes the [`Fetcher`] trait; [`HttpFetcher`] is the
//! reqwest-backed implementation. Outcomes are classified into the retry
//! taxonomy the dispatcher acts on:
//!
//! | Condition | Outcome |
//! |-----------|---------|
//! | 2xx | `FetchedPage` |
//! | 429 / 503 | `Throttled` (carries Retry-After when parsable) |
//! | other 5xx | `Http { retryable: true }` |
//! | other 4xx | `Http { retryable: false }` |
//! | timeout / connect | `Network { retryable: true }` |
//! | body read error | `Network { retryable: false }` |

use async_trait::async_trait;
use reqwest::{redirect::Policy, Client, StatusCode};
use std::time::{Duration, Instant};

/// A successfully fetched page
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Final URL after redirects
    pub final_url: String,
    pub http_status: u16,
    pub content_type: Option<String>,
    pub content_length: Option<i64>,
    pub body: String,
    pub duration: Duration,
}

/// A failed fetch attempt
#[derive(Debug, Clone)]
pub enum FetchError {
    /// The origin asked us to back off (HTTP 429 or 503)
    Throttled {
        status: u16,
        retry_after: Option<Duration>,
    },
    /// Definitive HTTP error response
    Http { status: u16, retryable: bool },
    /// Transport-level failure
    Network { message: String, retryable: bool },
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Throttled { .. } => true,
            Self::Http { retryable, .. } => *retryable,
            Self::Network { retryable, .. } => *retryable,
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Throttled { status, .. } | Self::Http { status, .. } => Some(*status),
            Self::Network { .. } => None,
        }
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Throttled { status, .. } => write!(f, "throttled (HTTP {})", status),
            Self::Http { status, .. } => write!(f, "HTTP {}", status),
            Self::Network { message, .. } => write!(f, "network error: {}", message),
        }
    }
}

/// The seam between the dispatcher and whatever does the fetching
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

/// Plain HTTP fetcher built on reqwest
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .redirect(Policy::limited(10))
            .gzip(true)
            .brotli(true)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let started = Instant::now();
        let response = self.client.get(url).send().await.map_err(|e| {
            let retryable = e.is_timeout() || e.is_connect();
            FetchError::Network {
                message: e.to_string(),
                retryable,
            }
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
            let retry_after = parse_retry_after(&response);
            return Err(FetchError::Throttled {
                status: status.as_u16(),
                retry_after,
            });
        }
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                retryable: status.is_server_error(),
            });
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let content_length = response.content_length().map(|n| n as i64);

        let body = response.text().await.map_err(|e| FetchError::Network {
            message: e.to_string(),
            retryable: false,
        })?;

        Ok(FetchedPage {
            final_url,
            http_status: status.as_u16(),
            content_type,
            content_length: content_length.or(Some(body.len() as i64)),
            body,
            duration: started.elapsed(),
        })
    }
}

/// Parses a `Retry-After` header given as delay-seconds. HTTP-date forms are
/// rare from throttling middlewares and are ignored.
fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
