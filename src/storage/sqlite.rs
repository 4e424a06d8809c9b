//! SQLite store implementation
//!
//! A single WAL-mode connection guarded by a mutex. Because every claim runs
//! inside one transaction that flips matched rows to `claimed` before the
//! lock is released, concurrent claimers can never observe (or double-claim)
//! a row another worker holds; this is the skip-locked guarantee the
//! dispatcher relies on.

use crate::job::{JobConfig, JobRecord, JobStatus};
use crate::storage::schema::initialize_schema;
use crate::storage::{
    CounterField, FrontierEntry, NewLink, PagePatch, PageRecord, PageStatus, QueueStats,
    RobotsRecord, StorageError, StorageResult,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Shared handle to the SQLite store
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path` and initializes the schema.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        ",
        )?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates an in-memory store. The database lives as long as any clone
    /// of the returned handle.
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock only means another thread panicked mid-operation;
        // the connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ===== Jobs =====

    pub fn insert_job(&self, job: &JobRecord) -> StorageResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO jobs (id, seed_url, domain, status, max_depth, max_pages,
             max_workers, crawl_delay_ms, respect_robots, include_patterns,
             exclude_patterns, discovered, crawled, failed, skipped, last_error,
             created_at, started_at, completed_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
             ?15, ?16, ?17, ?18, ?19, ?20)",
            params![
                job.id.to_string(),
                job.seed_url,
                job.domain,
                job.status.to_db_string(),
                job.config.max_depth,
                job.config.max_pages,
                job.config.max_workers,
                job.config.crawl_delay_ms,
                job.config.respect_robots,
                serde_json::to_string(&job.config.include_patterns)?,
                serde_json::to_string(&job.config.exclude_patterns)?,
                job.discovered,
                job.crawled,
                job.failed,
                job.skipped,
                job.last_error,
                job.created_at.to_rfc3339(),
                job.started_at.map(|t| t.to_rfc3339()),
                job.completed_at.map(|t| t.to_rfc3339()),
                job.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_job(&self, id: Uuid) -> StorageResult<JobRecord> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", JOB_SELECT))?;
        stmt.query_row(params![id.to_string()], job_from_row)
            .optional()?
            .ok_or(StorageError::JobNotFound(id))
    }

    pub fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: u32,
        offset: u32,
    ) -> StorageResult<(Vec<JobRecord>, u64)> {
        let conn = self.lock();
        let (jobs, total) = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
                    JOB_SELECT
                ))?;
                let jobs = stmt
                    .query_map(
                        params![status.to_db_string(), limit, offset],
                        job_from_row,
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                let total: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM jobs WHERE status = ?1",
                    params![status.to_db_string()],
                    |row| row.get(0),
                )?;
                (jobs, total)
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "{} ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
                    JOB_SELECT
                ))?;
                let jobs = stmt
                    .query_map(params![limit, offset], job_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                let total: u64 =
                    conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?;
                (jobs, total)
            }
        };
        Ok((jobs, total))
    }

    /// All jobs currently in `status` (used for startup recovery).
    pub fn jobs_in_status(&self, status: JobStatus) -> StorageResult<Vec<JobRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE status = ?1 ORDER BY created_at ASC",
            JOB_SELECT
        ))?;
        let jobs = stmt
            .query_map(params![status.to_db_string()], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// Atomically transitions a job to `to` if the state machine allows it
    /// from the job's current status.
    ///
    /// Sets `started_at` on the first entry into `running`, `completed_at`
    /// on any terminal status, and always refreshes `updated_at`. Returns
    /// `false` when the transition is not permitted (terminal statuses are
    /// absorbing).
    pub fn transition_job(
        &self,
        id: Uuid,
        to: JobStatus,
        last_error: Option<&str>,
    ) -> StorageResult<bool> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM jobs WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let current = match current.and_then(|s| JobStatus::from_db_string(&s)) {
            Some(status) => status,
            None => return Err(StorageError::JobNotFound(id)),
        };

        if !current.can_transition(to) {
            return Ok(false);
        }

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "UPDATE jobs SET status = ?1,
                 started_at = CASE WHEN ?1 = 'running' AND started_at IS NULL
                              THEN ?2 ELSE started_at END,
                 completed_at = CASE WHEN ?1 IN ('completed', 'failed', 'cancelled')
                                THEN ?2 ELSE completed_at END,
                 last_error = COALESCE(?3, last_error),
                 updated_at = ?2
             WHERE id = ?4",
            params![to.to_db_string(), now, last_error, id.to_string()],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Atomic counter increment: `field = field + delta`.
    pub fn increment_counter(
        &self,
        id: Uuid,
        field: CounterField,
        delta: u64,
    ) -> StorageResult<()> {
        let conn = self.lock();
        conn.execute(
            &format!(
                "UPDATE jobs SET {col} = {col} + ?1, updated_at = ?2 WHERE id = ?3",
                col = field.column()
            ),
            params![delta, Utc::now().to_rfc3339(), id.to_string()],
        )?;
        Ok(())
    }

    // ===== Pages =====

    pub fn get_page(&self, job_id: Uuid, page_id: i64) -> StorageResult<Option<PageRecord>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare(&format!("{} WHERE job_id = ?1 AND id = ?2", PAGE_SELECT))?;
        let page = stmt
            .query_row(params![job_id.to_string(), page_id], page_from_row)
            .optional()?;
        Ok(page)
    }

    pub fn list_pages(
        &self,
        job_id: Uuid,
        status: Option<PageStatus>,
        limit: u32,
        offset: u32,
    ) -> StorageResult<(Vec<PageRecord>, u64)> {
        let conn = self.lock();
        let (pages, total) = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE job_id = ?1 AND status = ?2 ORDER BY id ASC LIMIT ?3 OFFSET ?4",
                    PAGE_SELECT
                ))?;
                let pages = stmt
                    .query_map(
                        params![job_id.to_string(), status.to_db_string(), limit, offset],
                        page_from_row,
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                let total: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM pages WHERE job_id = ?1 AND status = ?2",
                    params![job_id.to_string(), status.to_db_string()],
                    |row| row.get(0),
                )?;
                (pages, total)
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE job_id = ?1 ORDER BY id ASC LIMIT ?2 OFFSET ?3",
                    PAGE_SELECT
                ))?;
                let pages = stmt
                    .query_map(params![job_id.to_string(), limit, offset], page_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                let total: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM pages WHERE job_id = ?1",
                    params![job_id.to_string()],
                    |row| row.get(0),
                )?;
                (pages, total)
            }
        };
        Ok((pages, total))
    }

    /// Next batch of completed pages with `id > after_id`, for streaming
    /// export without buffering the full result set.
    pub fn completed_pages_after(
        &self,
        job_id: Uuid,
        after_id: i64,
        limit: u32,
    ) -> StorageResult<Vec<PageRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE job_id = ?1 AND status = 'completed' AND id > ?2
             ORDER BY id ASC LIMIT ?3",
            PAGE_SELECT
        ))?;
        let pages = stmt
            .query_map(params![job_id.to_string(), after_id, limit], page_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pages)
    }

    /// Settles a page keyed by `(job_id, normalized_url)`.
    pub fn update_page(
        &self,
        job_id: Uuid,
        normalized_url: &str,
        status: PageStatus,
        patch: &PagePatch,
    ) -> StorageResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE pages SET
                 status = ?1,
                 http_status = COALESCE(?2, http_status),
                 content_type = COALESCE(?3, content_type),
                 content_length = COALESCE(?4, content_length),
                 title = COALESCE(?5, title),
                 description = COALESCE(?6, description),
                 content = COALESCE(?7, content),
                 links_found = COALESCE(?8, links_found),
                 duration_ms = COALESCE(?9, duration_ms),
                 error_message = ?10,
                 crawled_at = CASE WHEN ?1 = 'completed' THEN ?11 ELSE crawled_at END
             WHERE job_id = ?12 AND normalized_url = ?13",
            params![
                status.to_db_string(),
                patch.http_status,
                patch.content_type,
                patch.content_length,
                patch.title,
                patch.description,
                patch.content,
                patch.links_found,
                patch.duration_ms,
                patch.error_message,
                Utc::now().to_rfc3339(),
                job_id.to_string(),
                normalized_url,
            ],
        )?;
        Ok(())
    }

    // ===== Frontier =====

    /// Batch insert-if-absent of discovered links.
    ///
    /// Each link lands as a page row and a frontier row under the
    /// `(job_id, normalized_url)` key. Returns how many were actually new;
    /// this is the job's `discovered` delta, so concurrent overlapping calls
    /// never double-count.
    pub fn enqueue_links(&self, job_id: Uuid, links: &[NewLink]) -> StorageResult<u64> {
        if links.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        let job = job_id.to_string();
        let mut inserted = 0u64;
        {
            let mut page_stmt = tx.prepare(
                "INSERT OR IGNORE INTO pages (job_id, url, normalized_url, depth)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            let mut frontier_stmt = tx.prepare(
                "INSERT OR IGNORE INTO frontier
                 (job_id, url, normalized_url, depth, priority, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)",
            )?;
            for link in links {
                let new = page_stmt.execute(params![
                    job,
                    link.url,
                    link.normalized_url,
                    link.depth
                ])?;
                if new == 1 {
                    frontier_stmt.execute(params![
                        job,
                        link.url,
                        link.normalized_url,
                        link.depth,
                        link.priority,
                        now
                    ])?;
                    inserted += 1;
                }
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Atomically claims up to `n` pending entries, highest priority first,
    /// oldest first within a priority. Entries with `not_before` in the
    /// future are invisible. Claimed rows (and their pages) flip to
    /// `claimed` inside the same transaction.
    pub fn claim_pending(&self, job_id: Uuid, n: u32) -> StorageResult<Vec<FrontierEntry>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        let entries = {
            let mut stmt = tx.prepare(
                "SELECT id, job_id, url, normalized_url, depth, priority, retry_count
                 FROM frontier
                 WHERE job_id = ?1 AND status = 'pending'
                   AND (not_before IS NULL OR not_before <= ?2)
                 ORDER BY priority DESC, created_at ASC, id ASC
                 LIMIT ?3",
            )?;
            let result = stmt
                .query_map(params![job_id.to_string(), now, n], |row| {
                    Ok(FrontierEntry {
                        id: row.get(0)?,
                        job_id: parse_uuid(row.get::<_, String>(1)?),
                        url: row.get(2)?,
                        normalized_url: row.get(3)?,
                        depth: row.get(4)?,
                        priority: row.get(5)?,
                        retry_count: row.get(6)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            result
        };
        for entry in &entries {
            tx.execute(
                "UPDATE frontier SET status = 'claimed' WHERE id = ?1",
                params![entry.id],
            )?;
            tx.execute(
                "UPDATE pages SET status = 'claimed'
                 WHERE job_id = ?1 AND normalized_url = ?2 AND status = 'pending'",
                params![entry.job_id.to_string(), entry.normalized_url],
            )?;
        }
        tx.commit()?;
        Ok(entries)
    }

    /// Marks a frontier entry with a terminal status. A no-op when the row
    /// was already removed (e.g. the job was cancelled mid-fetch).
    pub fn mark_frontier(&self, entry_id: i64, status: PageStatus) -> StorageResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE frontier SET status = ?1 WHERE id = ?2",
            params![status.to_db_string(), entry_id],
        )?;
        Ok(())
    }

    /// Returns a failed attempt to the pending pool with a retry back-off.
    ///
    /// The `not_before` stamp keeps the entry invisible to `claim_pending`
    /// until the back-off elapses. Frontier and page rows move together.
    pub fn requeue_entry(
        &self,
        entry: &FrontierEntry,
        retry_count: u32,
        not_before: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE frontier SET status = 'pending', retry_count = ?1, not_before = ?2
             WHERE id = ?3",
            params![retry_count, not_before.to_rfc3339(), entry.id],
        )?;
        tx.execute(
            "UPDATE pages SET status = 'pending', retry_count = ?1
             WHERE job_id = ?2 AND normalized_url = ?3",
            params![retry_count, entry.job_id.to_string(), entry.normalized_url],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Skips everything still pending once the page budget is reached.
    /// Claimed in-flight entries are left alone so finished fetches are
    /// never discarded. Returns the number of entries skipped.
    pub fn skip_pending(&self, job_id: Uuid) -> StorageResult<u64> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let skipped = tx.execute(
            "UPDATE frontier SET status = 'skipped'
             WHERE job_id = ?1 AND status = 'pending'",
            params![job_id.to_string()],
        )?;
        tx.execute(
            "UPDATE pages SET status = 'skipped'
             WHERE job_id = ?1 AND status = 'pending'",
            params![job_id.to_string()],
        )?;
        tx.commit()?;
        Ok(skipped as u64)
    }

    /// Drops every frontier entry of a job (cancellation / deletion).
    pub fn clear_frontier(&self, job_id: Uuid) -> StorageResult<()> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM frontier WHERE job_id = ?1",
            params![job_id.to_string()],
        )?;
        Ok(())
    }

    pub fn count_pending(&self, job_id: Uuid) -> StorageResult<u64> {
        let conn = self.lock();
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM frontier WHERE job_id = ?1 AND status = 'pending'",
            params![job_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn queue_stats(&self, job_id: Uuid) -> StorageResult<QueueStats> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM frontier WHERE job_id = ?1 GROUP BY status",
        )?;
        let rows = stmt.query_map(params![job_id.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;

        let mut stats = QueueStats::default();
        for row in rows {
            let (status, count) = row?;
            match PageStatus::from_db_string(&status) {
                Some(PageStatus::Pending) => stats.pending = count,
                Some(PageStatus::Claimed) => stats.claimed = count,
                Some(PageStatus::Completed) => stats.completed = count,
                Some(PageStatus::Failed) => stats.failed = count,
                Some(PageStatus::Skipped) => stats.skipped = count,
                None => {}
            }
        }
        Ok(stats)
    }

    // ===== Robots =====

    pub fn upsert_robots(&self, record: &RobotsRecord) -> StorageResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO robots
             (domain, body, crawl_delay_secs, fetched_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.domain,
                record.body,
                record.crawl_delay_secs,
                record.fetched_at.to_rfc3339(),
                record.expires_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Fetches the robots record for `domain`, but only while it is fresh.
    pub fn get_robots(&self, domain: &str) -> StorageResult<Option<RobotsRecord>> {
        let conn = self.lock();
        let record = conn
            .query_row(
                "SELECT domain, body, crawl_delay_secs, fetched_at, expires_at
                 FROM robots WHERE domain = ?1 AND expires_at > ?2",
                params![domain, Utc::now().to_rfc3339()],
                |row| {
                    Ok(RobotsRecord {
                        domain: row.get(0)?,
                        body: row.get(1)?,
                        crawl_delay_secs: row.get(2)?,
                        fetched_at: parse_ts(&row.get::<_, String>(3)?),
                        expires_at: parse_ts(&row.get::<_, String>(4)?),
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    // ===== Health =====

    /// Probes the store connection.
    pub fn ping(&self) -> bool {
        let conn = self.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }

    /// Probes the frontier relation specifically.
    pub fn ping_frontier(&self) -> bool {
        let conn = self.lock();
        conn.query_row("SELECT COUNT(*) FROM frontier WHERE 0", [], |row| {
            row.get::<_, i64>(0)
        })
        .is_ok()
    }
}

const JOB_SELECT: &str = "SELECT id, seed_url, domain, status, max_depth, max_pages,
     max_workers, crawl_delay_ms, respect_robots, include_patterns, exclude_patterns,
     discovered, crawled, failed, skipped, last_error, created_at, started_at,
     completed_at, updated_at FROM jobs";

const PAGE_SELECT: &str = "SELECT id, job_id, url, normalized_url, depth, status,
     http_status, content_type, content_length, title, description, content,
     links_found, crawled_at, duration_ms, error_message, retry_count FROM pages";

fn parse_uuid(s: String) -> Uuid {
    Uuid::parse_str(&s).unwrap_or_default()
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    let include: String = row.get(9)?;
    let exclude: String = row.get(10)?;
    Ok(JobRecord {
        id: parse_uuid(row.get::<_, String>(0)?),
        seed_url: row.get(1)?,
        domain: row.get(2)?,
        status: JobStatus::from_db_string(&row.get::<_, String>(3)?)
            .unwrap_or(JobStatus::Failed),
        config: JobConfig {
            max_depth: row.get(4)?,
            max_pages: row.get(5)?,
            max_workers: row.get(6)?,
            crawl_delay_ms: row.get(7)?,
            respect_robots: row.get(8)?,
            include_patterns: serde_json::from_str(&include).unwrap_or_default(),
            exclude_patterns: serde_json::from_str(&exclude).unwrap_or_default(),
        },
        discovered: row.get(11)?,
        crawled: row.get(12)?,
        failed: row.get(13)?,
        skipped: row.get(14)?,
        last_error: row.get(15)?,
        created_at: parse_ts(&row.get::<_, String>(16)?),
        started_at: row.get::<_, Option<String>>(17)?.map(|s| parse_ts(&s)),
        completed_at: row.get::<_, Option<String>>(18)?.map(|s| parse_ts(&s)),
        updated_at: parse_ts(&row.get::<_, String>(19)?),
    })
}

fn page_from_row(row: &Row<'_>) -> rusqlite::Result<PageRecord> {
    Ok(PageRecord {
        id: row.get(0)?,
        job_id: parse_uuid(row.get::<_, String>(1)?),
        url: row.get(2)?,
        normalized_url: row.get(3)?,
        depth: row.get(4)?,
        status: PageStatus::from_db_string(&row.get::<_, String>(5)?)
            .unwrap_or(PageStatus::Failed),
        http_status: row.get(6)?,
        content_type: row.get(7)?,
        content_length: row.get(8)?,
        title: row.get(9)?,
        description: row.get(10)?,
        content: row.get(11)?,
        links_found: row.get(12)?,
        crawled_at: row.get::<_, Option<String>>(13)?.map(|s| parse_ts(&s)),
        duration_ms: row.get(14)?,
        error_message: row.get(15)?,
        retry_count: row.get(16)?,
    })
}
