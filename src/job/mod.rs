//! Job model: configuration, status state machine, and the persisted record

mod manager;

pub use manager::{JobError, JobManager};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a crawl job
///
/// ```text
///             ┌──────────► paused ──────┐
///             │                         ▼
/// pending ──► running ──► completed
///    │          │   │    ╲
///    │          │   └──► failed
///    └──────────┴──────► cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses are absorbing: no transition ever leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Checks whether the state machine permits `self -> to`.
    pub fn can_transition(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// Immutable per-job crawl configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Maximum link depth from the seed (1..=50)
    pub max_depth: u32,

    /// Page budget for the whole job (1..=150_000)
    pub max_pages: u32,

    /// Target worker concurrency (1..=50)
    pub max_workers: u32,

    /// Base delay between requests to one domain (100..=10_000 ms)
    pub crawl_delay_ms: u64,

    /// Whether robots.txt directives are honored
    pub respect_robots: bool,

    /// URLs must match at least one of these when non-empty
    pub include_patterns: Vec<String>,

    /// URLs matching any of these are rejected
    pub exclude_patterns: Vec<String>,
}

impl JobConfig {
    /// Validates every field against its allowed range and compiles the
    /// filter patterns once to reject bad regexes up front.
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=50).contains(&self.max_depth) {
            return Err(format!("maxDepth must be 1..=50, got {}", self.max_depth));
        }
        if !(1..=150_000).contains(&self.max_pages) {
            return Err(format!(
                "maxPages must be 1..=150000, got {}",
                self.max_pages
            ));
        }
        if !(1..=50).contains(&self.max_workers) {
            return Err(format!(
                "maxConcurrentWorkers must be 1..=50, got {}",
                self.max_workers
            ));
        }
        if !(100..=10_000).contains(&self.crawl_delay_ms) {
            return Err(format!(
                "crawlDelayMs must be 100..=10000, got {}",
                self.crawl_delay_ms
            ));
        }
        for pattern in self.include_patterns.iter().chain(&self.exclude_patterns) {
            regex::Regex::new(pattern)
                .map_err(|e| format!("invalid pattern {:?}: {}", pattern, e))?;
        }
        Ok(())
    }
}

/// A crawl job as persisted in the store
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: Uuid,
    pub seed_url: String,
    pub domain: String,
    pub status: JobStatus,
    pub config: JobConfig,
    pub discovered: u64,
    pub crawled: u64,
    pub failed: u64,
    pub skipped: u64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Pages crawled per second since the job started.
    pub fn crawl_rate(&self) -> Option<f64> {
        let started = self.started_at?;
        let elapsed = (Utc::now() - started).num_milliseconds();
        if elapsed <= 0 || self.crawled == 0 {
            return None;
        }
        Some(self.crawled as f64 / (elapsed as f64 / 1000.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> JobConfig {
        JobConfig {
            max_depth: 10,
            max_pages: 100_000,
            max_workers: 10,
            crawl_delay_ms: 1000,
            respect_robots: true,
            include_patterns: vec![],
            exclude_patterns: vec![],
        }
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Paused,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(
                JobStatus::from_db_string(status.to_db_string()),
                Some(status)
            );
        }
        assert_eq!(JobStatus::from_db_string("bogus"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
    }

    #[test]
    fn test_terminal_is_absorbing() {
        for from in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            for to in [
                JobStatus::Pending,
                JobStatus::Running,
                JobStatus::Paused,
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ] {
                assert!(!from.can_transition(to), "{:?} -> {:?} escaped", from, to);
            }
        }
    }

    #[test]
    fn test_allowed_transitions() {
        assert!(JobStatus::Pending.can_transition(JobStatus::Running));
        assert!(JobStatus::Running.can_transition(JobStatus::Paused));
        assert!(JobStatus::Paused.can_transition(JobStatus::Running));
        assert!(JobStatus::Paused.can_transition(JobStatus::Cancelled));
        assert!(JobStatus::Running.can_transition(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition(JobStatus::Failed));
    }

    #[test]
    fn test_disallowed_transitions() {
        assert!(!JobStatus::Pending.can_transition(JobStatus::Paused));
        assert!(!JobStatus::Paused.can_transition(JobStatus::Completed));
        assert!(!JobStatus::Paused.can_transition(JobStatus::Failed));
    }

    #[test]
    fn test_config_valid() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_config_depth_out_of_range() {
        let mut config = valid_config();
        config.max_depth = 0;
        assert!(config.validate().is_err());
        config.max_depth = 51;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_pages_out_of_range() {
        let mut config = valid_config();
        config.max_pages = 150_001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_workers_out_of_range() {
        let mut config = valid_config();
        config.max_workers = 0;
        assert!(config.validate().is_err());
        config.max_workers = 51;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_delay_out_of_range() {
        let mut config = valid_config();
        config.crawl_delay_ms = 99;
        assert!(config.validate().is_err());
        config.crawl_delay_ms = 10_001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_bad_regex() {
        let mut config = valid_config();
        config.exclude_patterns = vec!["[unclosed".to_string()];
        assert!(config.validate().is_err());
    }
}
