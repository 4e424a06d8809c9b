//! Job lifecycle management
//!
//! The manager owns the state machine, spawns a dispatcher plus a completion
//! detector per running job, and rebinds orphaned jobs on process start so no
//! job is ever left `running` without an owner.

use crate::config::RuntimeConfig;
use crate::crawler::{Dispatcher, Fetcher};
use crate::frontier::Frontier;
use crate::job::{JobConfig, JobRecord, JobStatus};
use crate::robots::RobotsPolicy;
use crate::storage::{CounterField, SqliteStore, StorageError};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

/// Errors surfaced by job operations
#[derive(Debug, Error)]
pub enum JobError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("job not found: {0}")]
    NotFound(Uuid),

    #[error("cannot {action} a {status} job")]
    InvalidState {
        status: JobStatus,
        action: &'static str,
    },

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("pattern error: {0}")]
    Pattern(#[from] regex::Error),
}

impl From<StorageError> for JobError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::JobNotFound(id) => Self::NotFound(id),
            other => Self::Storage(other),
        }
    }
}

struct ManagerInner {
    store: SqliteStore,
    robots: Arc<RobotsPolicy>,
    fetcher: Arc<dyn Fetcher>,
    runtime: RuntimeConfig,
    /// Cancellation handles for jobs this process is dispatching
    active: Mutex<HashMap<Uuid, CancellationToken>>,
    shutdown: CancellationToken,
}

/// Owns every job's lifecycle in this process
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<ManagerInner>,
}

impl JobManager {
    pub fn new(
        store: SqliteStore,
        fetcher: Arc<dyn Fetcher>,
        runtime: RuntimeConfig,
    ) -> Result<Self, reqwest::Error> {
        let robots = Arc::new(RobotsPolicy::new(
            store.clone(),
            runtime.user_agent(),
            runtime.robots_timeout,
        )?);
        Ok(Self {
            inner: Arc::new(ManagerInner {
                store,
                robots,
                fetcher,
                runtime,
                active: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn store(&self) -> &SqliteStore {
        &self.inner.store
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.inner.runtime
    }

    /// Validates and persists a new job, then starts it asynchronously.
    /// The returned record is in `pending`; dispatch begins immediately.
    pub fn create_job(&self, seed_url: &str, config: JobConfig) -> Result<JobRecord, JobError> {
        let parsed = Url::parse(seed_url)
            .map_err(|e| JobError::Validation(format!("invalid seed URL: {}", e)))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(JobError::Validation(format!(
                "seed URL must be http or https, got {}",
                parsed.scheme()
            )));
        }
        let domain = parsed
            .host_str()
            .map(|h| h.to_lowercase())
            .ok_or_else(|| JobError::Validation("seed URL has no host".to_string()))?;
        config.validate().map_err(JobError::Validation)?;

        let now = Utc::now();
        let job = JobRecord {
            id: Uuid::new_v4(),
            seed_url: seed_url.to_string(),
            domain,
            status: JobStatus::Pending,
            config,
            discovered: 0,
            crawled: 0,
            failed: 0,
            skipped: 0,
            last_error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        };
        self.inner.store.insert_job(&job)?;
        tracing::info!(job_id = %job.id, domain = %job.domain, "job created");

        let manager = self.clone();
        let id = job.id;
        tokio::spawn(async move { manager.start_job(id).await });

        Ok(job)
    }

    pub fn get_job(&self, id: Uuid) -> Result<JobRecord, JobError> {
        Ok(self.inner.store.get_job(id)?)
    }

    /// Pauses a running job. Takes effect at worker loop heads; in-flight
    /// fetches complete and persist first.
    pub fn pause_job(&self, id: Uuid) -> Result<JobRecord, JobError> {
        let job = self.get_job(id)?;
        if !self
            .inner
            .store
            .transition_job(id, JobStatus::Paused, None)?
        {
            return Err(JobError::InvalidState {
                status: job.status,
                action: "pause",
            });
        }
        tracing::info!(job_id = %id, "job paused");
        self.get_job(id)
    }

    /// Resumes a paused job, rebinding a dispatcher if this process does not
    /// have one for it (the paused job may predate a restart).
    pub fn resume_job(&self, id: Uuid) -> Result<JobRecord, JobError> {
        let job = self.get_job(id)?;
        if !self
            .inner
            .store
            .transition_job(id, JobStatus::Running, None)?
        {
            return Err(JobError::InvalidState {
                status: job.status,
                action: "resume",
            });
        }
        tracing::info!(job_id = %id, "job resumed");

        let has_dispatcher = {
            let active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
            active.contains_key(&id)
        };
        if !has_dispatcher {
            self.spawn_dispatch(self.get_job(id)?)?;
        }
        self.get_job(id)
    }

    /// Records cancel intent immediately; in-flight workers drain on their
    /// own and their fetched pages are still persisted.
    pub fn cancel_job(&self, id: Uuid) -> Result<JobRecord, JobError> {
        let job = self.get_job(id)?;
        if !self
            .inner
            .store
            .transition_job(id, JobStatus::Cancelled, None)?
        {
            return Err(JobError::InvalidState {
                status: job.status,
                action: "cancel",
            });
        }
        self.inner.store.clear_frontier(id)?;
        self.detach(id);
        tracing::info!(job_id = %id, "job cancelled");
        self.get_job(id)
    }

    /// Rebinds jobs left over from a previous process: `running` jobs get a
    /// fresh dispatcher, `pending` jobs are started. Returns the number of
    /// jobs picked up.
    pub fn recover(&self) -> Result<usize, JobError> {
        let mut recovered = 0;

        for job in self.inner.store.jobs_in_status(JobStatus::Running)? {
            tracing::info!(job_id = %job.id, "rebinding running job after restart");
            self.spawn_dispatch(job)?;
            recovered += 1;
        }
        for job in self.inner.store.jobs_in_status(JobStatus::Pending)? {
            tracing::info!(job_id = %job.id, "starting pending job after restart");
            let manager = self.clone();
            let id = job.id;
            tokio::spawn(async move { manager.start_job(id).await });
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Signals every dispatcher to drain. Jobs stay `running` in the store
    /// and are rebound by `recover` on the next start.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    async fn start_job(&self, id: Uuid) {
        if let Err(e) = self.try_start(id).await {
            tracing::error!(job_id = %id, error = %e, "job start failed");
            let _ = self
                .inner
                .store
                .transition_job(id, JobStatus::Failed, Some(&e.to_string()));
        }
    }

    async fn try_start(&self, id: Uuid) -> Result<(), JobError> {
        if !self
            .inner
            .store
            .transition_job(id, JobStatus::Running, None)?
        {
            // Cancelled (or otherwise moved on) before dispatch began
            return Ok(());
        }
        let job = self.get_job(id)?;

        if job.config.respect_robots {
            if let Ok(seed) = Url::parse(&job.seed_url) {
                self.inner.robots.warm(&seed).await;
            }
        }

        let seeded = Frontier::new(self.inner.store.clone()).seed(id, &job.seed_url)?;
        if seeded > 0 {
            self.inner
                .store
                .increment_counter(id, CounterField::Discovered, seeded)?;
        }

        self.spawn_dispatch(job)
    }

    fn spawn_dispatch(&self, job: JobRecord) -> Result<(), JobError> {
        let cancel = self.inner.shutdown.child_token();
        {
            let mut active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
            active.insert(job.id, cancel.clone());
        }

        let dispatcher = Dispatcher::new(
            &job,
            self.inner.store.clone(),
            self.inner.robots.clone(),
            self.inner.fetcher.clone(),
            self.inner.runtime.clone(),
            cancel.clone(),
        )?;

        tokio::spawn(async move { dispatcher.run().await });

        let manager = self.clone();
        let id = job.id;
        tokio::spawn(async move { manager.detector_loop(id, cancel).await });
        Ok(())
    }

    /// The completion detector: a periodic probe that commits the terminal
    /// transition only after two consecutive idle observations (a claim's
    /// discovery writes lag the claim itself, so a single transient zero
    /// must not complete the job). The budget branch commits immediately.
    async fn detector_loop(&self, id: Uuid, cancel: CancellationToken) {
        let interval = self.inner.runtime.detector_interval;
        let mut was_idle = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let job = match self.inner.store.get_job(id) {
                Ok(job) => job,
                Err(e) => {
                    tracing::warn!(job_id = %id, error = %e, "detector read failed");
                    continue;
                }
            };
            if job.status.is_terminal() {
                break;
            }
            if job.status == JobStatus::Paused {
                was_idle = false;
                continue;
            }
            if job.status != JobStatus::Running {
                continue;
            }

            let stats = match self.inner.store.queue_stats(id) {
                Ok(stats) => stats,
                Err(e) => {
                    tracing::warn!(job_id = %id, error = %e, "detector stats failed");
                    continue;
                }
            };

            let budget_reached = job.crawled >= u64::from(job.config.max_pages);
            let idle = stats.pending == 0 && stats.claimed == 0;

            if budget_reached || (idle && was_idle) {
                let outcome = if job.crawled == 0 && job.failed > 0 {
                    JobStatus::Failed
                } else {
                    JobStatus::Completed
                };
                let error = match outcome {
                    JobStatus::Failed => Some("every attempted page failed"),
                    _ => None,
                };
                match self.inner.store.transition_job(id, outcome, error) {
                    Ok(true) => {
                        tracing::info!(
                            job_id = %id,
                            status = %outcome,
                            crawled = job.crawled,
                            failed = job.failed,
                            skipped = job.skipped,
                            "job finished"
                        );
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(job_id = %id, error = %e, "terminal transition failed")
                    }
                }
                break;
            }
            was_idle = idle;
        }

        self.detach(id);
    }

    /// Cancels and forgets this process's dispatcher for a job.
    fn detach(&self, id: Uuid) {
        let token = {
            let mut active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
            active.remove(&id)
        };
        if let Some(token) = token {
            token.cancel();
        }
    }
}
