//! Storage module for persisting crawl state
//!
//! All durable shared state lives here: jobs, pages, the frontier, and the
//! robots cache. Every mutation goes through a transactional operation and
//! counter updates are atomic SQL increments, never read-modify-write.

mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// State of a page through its crawl lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageStatus {
    /// Discovered, waiting in the frontier
    Pending,
    /// Claimed by a worker
    Claimed,
    /// Fetched and persisted
    Completed,
    /// Exhausted retries or hit a fatal error
    Failed,
    /// Filtered by robots or the page budget
    Skipped,
}

impl PageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "claimed" => Some(Self::Claimed),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

impl std::fmt::Display for PageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// Job counters advanced via atomic increments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterField {
    Discovered,
    Crawled,
    Failed,
    Skipped,
}

impl CounterField {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Crawled => "crawled",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// A page row: one per `(job_id, normalized_url)`
#[derive(Debug, Clone)]
pub struct PageRecord {
    pub id: i64,
    pub job_id: Uuid,
    pub url: String,
    pub normalized_url: String,
    pub depth: u32,
    pub status: PageStatus,
    pub http_status: Option<u16>,
    pub content_type: Option<String>,
    pub content_length: Option<i64>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub links_found: u32,
    pub crawled_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub retry_count: u32,
}

/// Fields persisted when a fetch attempt settles
#[derive(Debug, Clone, Default)]
pub struct PagePatch {
    pub http_status: Option<u16>,
    pub content_type: Option<String>,
    pub content_length: Option<i64>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub links_found: Option<u32>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
}

/// A claimed unit of work from the frontier
#[derive(Debug, Clone)]
pub struct FrontierEntry {
    pub id: i64,
    pub job_id: Uuid,
    pub url: String,
    pub normalized_url: String,
    pub depth: u32,
    pub priority: i64,
    pub retry_count: u32,
}

/// A link accepted for discovery, ready to batch-insert
#[derive(Debug, Clone)]
pub struct NewLink {
    pub url: String,
    pub normalized_url: String,
    pub depth: u32,
    pub priority: i64,
}

impl NewLink {
    /// Shallow pages drain first: priority `10 - min(depth, 9)`.
    pub fn priority_for_depth(depth: u32) -> i64 {
        10 - depth.min(9) as i64
    }
}

/// Frontier composition for one job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub claimed: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// Cached robots.txt for one domain, shared across jobs
#[derive(Debug, Clone)]
pub struct RobotsRecord {
    pub domain: String,
    /// Raw body; `None` means the file was absent and everything is allowed
    pub body: Option<String>,
    /// Crawl-delay declared for our user agent, in seconds
    pub crawl_delay_secs: Option<f64>,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_status_roundtrip() {
        for status in [
            PageStatus::Pending,
            PageStatus::Claimed,
            PageStatus::Completed,
            PageStatus::Failed,
            PageStatus::Skipped,
        ] {
            assert_eq!(
                PageStatus::from_db_string(status.to_db_string()),
                Some(status)
            );
        }
        assert_eq!(PageStatus::from_db_string("bogus"), None);
    }

    #[test]
    fn test_page_status_terminality() {
        assert!(!PageStatus::Pending.is_terminal());
        assert!(!PageStatus::Claimed.is_terminal());
        assert!(PageStatus::Completed.is_terminal());
        assert!(PageStatus::Failed.is_terminal());
        assert!(PageStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_priority_for_depth() {
        assert_eq!(NewLink::priority_for_depth(0), 10);
        assert_eq!(NewLink::priority_for_depth(1), 9);
        assert_eq!(NewLink::priority_for_depth(9), 1);
        // Deeper than 9 never sorts below 1
        assert_eq!(NewLink::priority_for_depth(10), 1);
        assert_eq!(NewLink::priority_for_depth(40), 1);
    }
}
