//! Process-level runtime configuration
//!
//! Everything here governs transport and tuning only: where the store lives,
//! where the API binds, and the default knobs applied to jobs that do not
//! override them. Per-job crawl semantics live in [`crate::job::JobConfig`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime settings shared by the job manager, dispatchers, and the API.
///
/// The intervals are real defaults in production and are tightened by the
/// integration tests so full crawl cycles finish quickly.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Path to the SQLite database file
    pub database_path: PathBuf,

    /// Address the control API binds to
    pub bind_addr: SocketAddr,

    /// Contact URL advertised in the User-Agent header
    pub contact_url: String,

    /// Default worker concurrency for jobs that do not specify one
    pub default_workers: u32,

    /// Default per-domain crawl delay in milliseconds
    pub default_crawl_delay_ms: u64,

    /// Default page budget
    pub default_max_pages: u32,

    /// Default maximum crawl depth
    pub default_max_depth: u32,

    /// Per-request fetch timeout
    pub request_timeout: Duration,

    /// robots.txt fetch timeout
    pub robots_timeout: Duration,

    /// Maximum retry attempts for a retryable page failure
    pub max_retries: u32,

    /// Base delay for the exponential retry back-off
    pub retry_backoff_base: Duration,

    /// Throttle window applied on 429/503 without a Retry-After header
    pub default_throttle: Duration,

    /// Completion detector probe interval
    pub detector_interval: Duration,

    /// How often parked workers re-check a paused job's status
    pub pause_poll: Duration,
}

impl RuntimeConfig {
    /// Builds the User-Agent string used for both page and robots fetches.
    ///
    /// Format: `kumo/<version> (+<contact-url>)`
    pub fn user_agent(&self) -> String {
        format!(
            "kumo/{} (+{})",
            env!("CARGO_PKG_VERSION"),
            self.contact_url
        )
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./kumo.db"),
            bind_addr: "0.0.0.0:8080".parse().expect("static addr"),
            contact_url: "https://github.com/kumo-crawler/kumo".to_string(),
            default_workers: 10,
            default_crawl_delay_ms: 1000,
            default_max_pages: 100_000,
            default_max_depth: 10,
            request_timeout: Duration::from_secs(30),
            robots_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_backoff_base: Duration::from_secs(2),
            default_throttle: Duration::from_secs(60),
            detector_interval: Duration::from_secs(10),
            pause_poll: Duration::from_millis(500),
        }
    }
}
