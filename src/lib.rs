//! Kumo: a durable, resumable, polite web crawler
//!
//! This crate implements a crawl service that explores a single domain (plus
//! its subdomains) up to bounded depth and page counts, persisting every
//! discovered URL and every fetched page so that a job can be paused,
//! resumed, cancelled, or restarted after process death without losing work
//! or re-crawling pages.

pub mod api;
pub mod config;
pub mod crawler;
pub mod frontier;
pub mod job;
pub mod limiter;
pub mod robots;
pub mod storage;
pub mod url;

use thiserror::Error;

/// Main error type for Kumo operations
#[derive(Debug, Error)]
pub enum KumoError {
    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Job error: {0}")]
    Job(#[from] job::JobError),

    #[error("URL error: {0}")]
    Url(#[from] UrlError),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// URL-specific errors
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Failed to parse URL: {0}")]
    Parse(String),

    #[error("Invalid URL scheme: {0}")]
    InvalidScheme(String),

    #[error("Missing host in URL")]
    MissingHost,
}

/// Result type alias for Kumo operations
pub type Result<T> = std::result::Result<T, KumoError>;

/// Result type alias for URL operations
pub type UrlResult<T> = std::result::Result<T, UrlError>;

// Re-export commonly used types
pub use config::RuntimeConfig;
pub use job::{JobConfig, JobManager, JobRecord, JobStatus};
pub use storage::SqliteStore;
pub use url::{extract_domain, in_scope, normalize_url};
