//! The crawl dispatcher: a pool of workers draining one job's frontier
//!
//! Workers are cooperative with respect to pause and cancel: the job status
//! is re-read at the top of every loop iteration, but an in-flight fetch is
//! never aborted; its result is always persisted before the status change is
//! observed. No fetched page is ever discarded.

use crate::config::RuntimeConfig;
use crate::crawler::fetcher::{FetchError, Fetcher};
use crate::crawler::parser::{extract_links, extract_metadata};
use crate::frontier::{Frontier, LinkFilter};
use crate::job::{JobRecord, JobStatus};
use crate::limiter::LimiterMap;
use crate::robots::RobotsPolicy;
use crate::storage::{CounterField, FrontierEntry, PagePatch, PageStatus, SqliteStore};
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

/// Stored page content is capped at this many characters, applied before
/// persistence.
const MAX_CONTENT_CHARS: usize = 50_000;

/// Consecutive empty claims tolerated on the fast (jittered) poll before a
/// worker falls back to the slow idle poll.
const EMPTY_CLAIMS_BEFORE_IDLE: u32 = 8;

const IDLE_POLL: Duration = Duration::from_secs(1);

struct Inner {
    job_id: Uuid,
    config: crate::job::JobConfig,
    store: SqliteStore,
    frontier: Frontier,
    robots: Arc<RobotsPolicy>,
    fetcher: Arc<dyn Fetcher>,
    limiters: LimiterMap,
    filter: LinkFilter,
    runtime: RuntimeConfig,
    cancel: CancellationToken,
}

/// Drives one running job
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        job: &JobRecord,
        store: SqliteStore,
        robots: Arc<RobotsPolicy>,
        fetcher: Arc<dyn Fetcher>,
        runtime: RuntimeConfig,
        cancel: CancellationToken,
    ) -> Result<Self, regex::Error> {
        let filter = LinkFilter::compile(&job.domain, &job.config)?;
        Ok(Self {
            inner: Arc::new(Inner {
                job_id: job.id,
                config: job.config.clone(),
                frontier: Frontier::new(store.clone()),
                store,
                robots,
                fetcher,
                limiters: LimiterMap::new(Duration::from_millis(job.config.crawl_delay_ms)),
                filter,
                runtime,
                cancel,
            }),
        })
    }

    /// Runs `max_workers` worker loops to completion. Returns once every
    /// worker has drained, which happens on cancel, terminal job status, or
    /// budget exhaustion.
    pub async fn run(&self) {
        let workers = self.inner.config.max_workers as usize;
        tracing::info!(job_id = %self.inner.job_id, workers, "dispatcher starting");

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let inner = self.inner.clone();
            handles.push(tokio::spawn(worker_loop(inner, worker)));
        }
        for handle in handles {
            let _ = handle.await;
        }

        tracing::info!(job_id = %self.inner.job_id, "dispatcher stopped");
    }
}

async fn worker_loop(inner: Arc<Inner>, worker: usize) {
    let mut empty_claims = 0u32;

    loop {
        if inner.cancel.is_cancelled() {
            break;
        }

        let job = match inner.store.get_job(inner.job_id) {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(job_id = %inner.job_id, worker, error = %e, "job read failed");
                sleep_or_cancel(&inner, inner.runtime.pause_poll).await;
                continue;
            }
        };

        match job.status {
            JobStatus::Running => {}
            JobStatus::Paused => {
                sleep_or_cancel(&inner, inner.runtime.pause_poll).await;
                continue;
            }
            _ => break,
        }

        // Budget gate: everything still pending is skipped; claimed
        // in-flight fetches on other workers are honored.
        if job.crawled >= u64::from(inner.config.max_pages) {
            match inner.store.skip_pending(inner.job_id) {
                Ok(0) => {}
                Ok(skipped) => {
                    tracing::info!(job_id = %inner.job_id, skipped, "page budget reached");
                    log_err(
                        inner
                            .store
                            .increment_counter(inner.job_id, CounterField::Skipped, skipped),
                        "skip counter",
                    );
                }
                Err(e) => {
                    tracing::warn!(job_id = %inner.job_id, error = %e, "budget skip failed")
                }
            }
            break;
        }

        let claimed = match inner.frontier.claim(inner.job_id, 1) {
            Ok(mut entries) => entries.pop(),
            Err(e) => {
                tracing::warn!(job_id = %inner.job_id, worker, error = %e, "claim failed");
                None
            }
        };

        match claimed {
            Some(entry) => {
                empty_claims = 0;
                process_entry(&inner, worker, entry).await;
            }
            None => {
                // Jittered back-off avoids a thundering-herd poll against
                // the store when the frontier runs dry.
                empty_claims += 1;
                let wait = if empty_claims > EMPTY_CLAIMS_BEFORE_IDLE {
                    IDLE_POLL
                } else {
                    Duration::from_millis(rand::thread_rng().gen_range(250..=750))
                };
                sleep_or_cancel(&inner, wait).await;
            }
        }
    }
}

async fn process_entry(inner: &Inner, worker: usize, entry: FrontierEntry) {
    let url = match Url::parse(&entry.url) {
        Ok(url) => url,
        Err(e) => {
            settle_failed(inner, &entry, format!("unparsable URL: {}", e), None);
            return;
        }
    };
    let domain = url
        .host_str()
        .map(|h| h.to_lowercase())
        .unwrap_or_else(|| entry.normalized_url.clone());

    if inner.config.respect_robots && !inner.robots.is_allowed(&url).await {
        tracing::debug!(job_id = %inner.job_id, url = %entry.url, "denied by robots.txt");
        log_err(inner.frontier.skip(entry.id), "frontier skip");
        log_err(
            inner.store.update_page(
                inner.job_id,
                &entry.normalized_url,
                PageStatus::Skipped,
                &PagePatch::default(),
            ),
            "page skip",
        );
        log_err(
            inner
                .store
                .increment_counter(inner.job_id, CounterField::Skipped, 1),
            "skip counter",
        );
        return;
    }

    let limiter = inner.limiters.for_domain(&domain);
    if inner.config.respect_robots {
        if let Some(declared) = inner.robots.crawl_delay(&url).await {
            let base = Duration::from_millis(inner.config.crawl_delay_ms);
            if declared > base {
                limiter.set_delay(declared);
            }
        }
    }
    limiter.acquire().await;

    tracing::debug!(job_id = %inner.job_id, worker, url = %entry.url, depth = entry.depth, "fetching");

    match inner.fetcher.fetch(&entry.url).await {
        Ok(page) => {
            let base = Url::parse(&page.final_url).unwrap_or(url);
            settle_completed(inner, &entry, &base, page).await;
        }
        Err(FetchError::Throttled {
            status,
            retry_after,
        }) => {
            let window = retry_after.unwrap_or(inner.runtime.default_throttle);
            tracing::info!(
                job_id = %inner.job_id,
                domain = %domain,
                status,
                window_secs = window.as_secs(),
                "origin throttled us"
            );
            limiter.throttle(window);
            settle_retryable(inner, &entry, format!("throttled (HTTP {})", status), Some(status));
        }
        Err(e) if e.is_retryable() => {
            settle_retryable(inner, &entry, e.to_string(), e.http_status());
        }
        Err(e) => {
            settle_failed(inner, &entry, e.to_string(), e.http_status());
        }
    }
}

async fn settle_completed(
    inner: &Inner,
    entry: &FrontierEntry,
    base: &Url,
    page: crate::crawler::fetcher::FetchedPage,
) {
    let metadata = extract_metadata(&page.body);
    let links = if entry.depth < inner.config.max_depth {
        extract_links(&page.body, base)
    } else {
        Vec::new()
    };

    let patch = PagePatch {
        http_status: Some(page.http_status),
        content_type: page.content_type.clone(),
        content_length: page.content_length,
        title: metadata.title,
        description: metadata.description,
        content: Some(truncate_content(&page.body, MAX_CONTENT_CHARS)),
        links_found: Some(links.len() as u32),
        duration_ms: Some(page.duration.as_millis() as i64),
        error_message: None,
    };
    log_err(
        inner
            .store
            .update_page(inner.job_id, &entry.normalized_url, PageStatus::Completed, &patch),
        "page complete",
    );
    log_err(inner.frontier.complete(entry.id), "frontier complete");
    log_err(
        inner
            .store
            .increment_counter(inner.job_id, CounterField::Crawled, 1),
        "crawl counter",
    );

    if !links.is_empty() {
        match inner
            .frontier
            .discover(inner.job_id, &inner.filter, entry.depth, &links)
        {
            Ok(0) => {}
            Ok(discovered) => {
                tracing::debug!(
                    job_id = %inner.job_id,
                    url = %entry.url,
                    discovered,
                    "new links enqueued"
                );
                log_err(
                    inner.store.increment_counter(
                        inner.job_id,
                        CounterField::Discovered,
                        discovered,
                    ),
                    "discover counter",
                );
            }
            Err(e) => {
                tracing::warn!(job_id = %inner.job_id, error = %e, "discovery failed")
            }
        }
    }
}

fn settle_retryable(inner: &Inner, entry: &FrontierEntry, message: String, status: Option<u16>) {
    if entry.retry_count < inner.runtime.max_retries {
        let backoff = inner.runtime.retry_backoff_base * 2u32.pow(entry.retry_count);
        let not_before = Utc::now()
            + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::seconds(60));
        tracing::debug!(
            job_id = %inner.job_id,
            url = %entry.url,
            attempt = entry.retry_count + 1,
            backoff_ms = backoff.as_millis() as u64,
            "retrying: {}",
            message
        );
        log_err(
            inner.frontier.retry(entry, entry.retry_count + 1, not_before),
            "frontier retry",
        );
    } else {
        settle_failed(
            inner,
            entry,
            format!("retries exhausted: {}", message),
            status,
        );
    }
}

fn settle_failed(inner: &Inner, entry: &FrontierEntry, message: String, status: Option<u16>) {
    tracing::debug!(job_id = %inner.job_id, url = %entry.url, "failed: {}", message);
    log_err(
        inner.store.update_page(
            inner.job_id,
            &entry.normalized_url,
            PageStatus::Failed,
            &PagePatch {
                http_status: status,
                error_message: Some(message),
                ..Default::default()
            },
        ),
        "page fail",
    );
    log_err(inner.frontier.fail(entry.id), "frontier fail");
    log_err(
        inner
            .store
            .increment_counter(inner.job_id, CounterField::Failed, 1),
        "fail counter",
    );
}

async fn sleep_or_cancel(inner: &Inner, wait: Duration) {
    tokio::select! {
        _ = inner.cancel.cancelled() => {}
        _ = tokio::time::sleep(wait) => {}
    }
}

fn log_err<E: std::fmt::Display>(result: Result<(), E>, what: &str) {
    if let Err(e) = result {
        tracing::warn!(error = %e, "{} write failed", what);
    }
}

/// Truncates to a character budget without splitting a code point.
fn truncate_content(body: &str, max_chars: usize) -> String {
    match body.char_indices().nth(max_chars) {
        Some((byte_index, _)) => body[..byte_index].to_string(),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobConfig;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Canned in-memory fetcher: maps URL -> outcome, counts attempts.
    struct ScriptedFetcher {
        pages: HashMap<String, Result<String, FetchError>>,
        attempts: Mutex<HashMap<String, u32>>,
    }

    impl ScriptedFetcher {
        fn new() -> Self {
            Self {
                pages: HashMap::new(),
                attempts: Mutex::new(HashMap::new()),
            }
        }

        fn page(mut self, url: &str, html: &str) -> Self {
            self.pages.insert(url.to_string(), Ok(html.to_string()));
            self
        }

        fn failing(mut self, url: &str, error: FetchError) -> Self {
            self.pages.insert(url.to_string(), Err(error));
            self
        }

        fn attempts_for(&self, url: &str) -> u32 {
            *self.attempts.lock().unwrap().get(url).unwrap_or(&0)
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, url: &str) -> Result<crate::crawler::FetchedPage, FetchError> {
            *self
                .attempts
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_insert(0) += 1;
            match self.pages.get(url) {
                Some(Ok(body)) => Ok(crate::crawler::FetchedPage {
                    final_url: url.to_string(),
                    http_status: 200,
                    content_type: Some("text/html".to_string()),
                    content_length: Some(body.len() as i64),
                    body: body.clone(),
                    duration: Duration::from_millis(1),
                }),
                Some(Err(e)) => Err(e.clone()),
                None => Err(FetchError::Http {
                    status: 404,
                    retryable: false,
                }),
            }
        }
    }

    fn fast_runtime() -> RuntimeConfig {
        RuntimeConfig {
            retry_backoff_base: Duration::from_millis(20),
            default_throttle: Duration::from_millis(50),
            pause_poll: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn job_record(id: Uuid, max_depth: u32, max_pages: u32) -> JobRecord {
        let now = Utc::now();
        JobRecord {
            id,
            seed_url: "https://a.test/".to_string(),
            domain: "a.test".to_string(),
            status: JobStatus::Pending,
            config: JobConfig {
                max_depth,
                max_pages,
                max_workers: 2,
                crawl_delay_ms: 100,
                respect_robots: false,
                include_patterns: vec![],
                exclude_patterns: vec![],
            },
            discovered: 0,
            crawled: 0,
            failed: 0,
            skipped: 0,
            last_error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Spins up a dispatcher and waits until the frontier has no pending or
    /// claimed work, then cancels it.
    async fn run_until_drained(
        store: &SqliteStore,
        job: &JobRecord,
        fetcher: Arc<dyn Fetcher>,
    ) {
        let robots = Arc::new(
            RobotsPolicy::new(store.clone(), "kumo-test/1.0".to_string(), Duration::from_secs(1))
                .unwrap(),
        );
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            job,
            store.clone(),
            robots,
            fetcher,
            fast_runtime(),
            cancel.clone(),
        )
        .unwrap();

        let runner = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.run().await })
        };

        for _ in 0..400 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            let stats = store.queue_stats(job.id).unwrap();
            let current = store.get_job(job.id).unwrap();
            if (stats.pending == 0 && stats.claimed == 0) || current.status != JobStatus::Running
            {
                break;
            }
        }
        // One extra beat so late counter writes land
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let _ = runner.await;
    }

    fn seeded_job(store: &SqliteStore, max_depth: u32, max_pages: u32) -> JobRecord {
        let id = Uuid::new_v4();
        let job = job_record(id, max_depth, max_pages);
        store.insert_job(&job).unwrap();
        store.transition_job(id, JobStatus::Running, None).unwrap();
        let seeded = Frontier::new(store.clone()).seed(id, &job.seed_url).unwrap();
        store
            .increment_counter(id, CounterField::Discovered, seeded)
            .unwrap();
        store.get_job(id).unwrap()
    }

    #[tokio::test]
    async fn test_crawls_seed_and_links() {
        let store = SqliteStore::open_in_memory().unwrap();
        let job = seeded_job(&store, 1, 100);
        let fetcher = ScriptedFetcher::new()
            .page(
                "https://a.test/",
                r#"<a href="/x">x</a><a href="/y">y</a>"#,
            )
            .page("https://a.test/x", "<title>X</title>")
            .page("https://a.test/y", "<title>Y</title>");

        run_until_drained(&store, &job, Arc::new(fetcher)).await;

        let job = store.get_job(job.id).unwrap();
        assert_eq!(job.discovered, 3);
        assert_eq!(job.crawled, 3);
        assert_eq!(job.failed, 0);
        assert_eq!(job.skipped, 0);
    }

    #[tokio::test]
    async fn test_depth_gate_stops_discovery() {
        let store = SqliteStore::open_in_memory().unwrap();
        let job = seeded_job(&store, 1, 100);
        // /x links further, but it sits at max_depth already
        let fetcher = ScriptedFetcher::new()
            .page("https://a.test/", r#"<a href="/x">x</a>"#)
            .page("https://a.test/x", r#"<a href="/deeper">d</a>"#);

        run_until_drained(&store, &job, Arc::new(fetcher)).await;

        let job = store.get_job(job.id).unwrap();
        assert_eq!(job.discovered, 2);
        assert_eq!(job.crawled, 2);
        let (pages, total) = store.list_pages(job.id, None, 100, 0).unwrap();
        assert_eq!(total, 2);
        assert!(pages.iter().all(|p| p.depth <= 1));
    }

    #[tokio::test]
    async fn test_fatal_error_counts_failed() {
        let store = SqliteStore::open_in_memory().unwrap();
        let job = seeded_job(&store, 1, 100);
        let fetcher = ScriptedFetcher::new()
            .page("https://a.test/", r#"<a href="/gone">gone</a>"#)
            .failing(
                "https://a.test/gone",
                FetchError::Http {
                    status: 404,
                    retryable: false,
                },
            );

        run_until_drained(&store, &job, Arc::new(fetcher)).await;

        let job = store.get_job(job.id).unwrap();
        assert_eq!(job.crawled, 1);
        assert_eq!(job.failed, 1);
        let (pages, _) = store
            .list_pages(job.id, Some(PageStatus::Failed), 10, 0)
            .unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].http_status, Some(404));
        assert!(pages[0].error_message.is_some());
    }

    #[tokio::test]
    async fn test_retryable_error_retries_then_fails() {
        let store = SqliteStore::open_in_memory().unwrap();
        let job = seeded_job(&store, 1, 100);
        let fetcher = Arc::new(
            ScriptedFetcher::new().failing(
                "https://a.test/",
                FetchError::Http {
                    status: 500,
                    retryable: true,
                },
            ),
        );

        run_until_drained(&store, &job, fetcher.clone() as Arc<dyn Fetcher>).await;

        let job = store.get_job(job.id).unwrap();
        assert_eq!(job.failed, 1);
        assert_eq!(job.crawled, 0);
        // max_retries = 3 means up to 4 attempts
        assert_eq!(fetcher.attempts_for("https://a.test/"), 4);
        let (pages, _) = store.list_pages(job.id, None, 10, 0).unwrap();
        assert_eq!(pages[0].retry_count, 3);
    }

    #[tokio::test]
    async fn test_budget_skips_remaining() {
        let store = SqliteStore::open_in_memory().unwrap();
        let job = seeded_job(&store, 3, 2);
        let fetcher = ScriptedFetcher::new()
            .page(
                "https://a.test/",
                r#"<a href="/a">a</a><a href="/b">b</a><a href="/c">c</a><a href="/d">d</a>"#,
            )
            .page("https://a.test/a", "")
            .page("https://a.test/b", "")
            .page("https://a.test/c", "")
            .page("https://a.test/d", "");

        run_until_drained(&store, &job, Arc::new(fetcher)).await;

        let job = store.get_job(job.id).unwrap();
        assert!(job.crawled >= 2);
        assert!(job.skipped > 0, "expected residual skipped pages");
        assert!(job.crawled + job.failed + job.skipped <= job.discovered);
    }

    #[tokio::test]
    async fn test_robots_denial_skips() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        let mut record = job_record(id, 1, 100);
        record.config.respect_robots = true;
        store.insert_job(&record).unwrap();
        store.transition_job(id, JobStatus::Running, None).unwrap();
        let seeded = Frontier::new(store.clone()).seed(id, &record.seed_url).unwrap();
        store
            .increment_counter(id, CounterField::Discovered, seeded)
            .unwrap();

        // Pre-cache the robots decision so no network fetch happens
        let now = Utc::now();
        store
            .upsert_robots(&crate::storage::RobotsRecord {
                domain: "a.test".to_string(),
                body: Some("User-agent: *\nDisallow: /private".to_string()),
                crawl_delay_secs: None,
                fetched_at: now,
                expires_at: now + chrono::Duration::hours(24),
            })
            .unwrap();

        let job = store.get_job(id).unwrap();
        let fetcher = ScriptedFetcher::new()
            .page(
                "https://a.test/",
                r#"<a href="/private/x">p</a><a href="/open">o</a>"#,
            )
            .page("https://a.test/open", "");

        run_until_drained(&store, &job, Arc::new(fetcher)).await;

        let job = store.get_job(id).unwrap();
        assert_eq!(job.crawled, 2);
        assert_eq!(job.skipped, 1);
        assert_eq!(job.failed, 0);
        let (skipped, _) = store
            .list_pages(id, Some(PageStatus::Skipped), 10, 0)
            .unwrap();
        assert_eq!(skipped.len(), 1);
        assert!(skipped[0].normalized_url.contains("/private"));
    }

    #[test]
    fn test_truncate_content_char_boundary() {
        let ascii = "a".repeat(60_000);
        assert_eq!(truncate_content(&ascii, MAX_CONTENT_CHARS).len(), 50_000);

        let short = "short";
        assert_eq!(truncate_content(short, MAX_CONTENT_CHARS), "short");

        // Multibyte content must not split a code point
        let wide = "é".repeat(50_010);
        let truncated = truncate_content(&wide, MAX_CONTENT_CHARS);
        assert_eq!(truncated.chars().count(), 50_000);
    }
}
