//! robots.txt policy: fetch, parse, and two-tier caching
//!
//! A process-local map sits in front of the store's shared robots table.
//! Records expire after 24 hours in both tiers. Every fetch or parse failure
//! degrades to allow-all; the policy is advisory and politeness is enforced
//! by the rate limiter regardless.

mod rules;

pub use rules::RobotsRules;

use crate::storage::{RobotsRecord, SqliteStore};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

const ROBOTS_TTL_HOURS: i64 = 24;

#[derive(Clone)]
struct CachedRules {
    rules: Arc<RobotsRules>,
    crawl_delay: Option<Duration>,
    expires_at: DateTime<Utc>,
}

/// Shared robots.txt oracle for all jobs in a process
pub struct RobotsPolicy {
    store: SqliteStore,
    client: reqwest::Client,
    user_agent: String,
    local: Mutex<HashMap<String, CachedRules>>,
}

impl RobotsPolicy {
    pub fn new(
        store: SqliteStore,
        user_agent: String,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent.clone())
            .timeout(timeout)
            .build()?;
        Ok(Self {
            store,
            client,
            user_agent,
            local: Mutex::new(HashMap::new()),
        })
    }

    /// Checks whether `url` may be fetched. Queried before every fetch when
    /// the job respects robots; a deny maps to `skipped`, never `failed`.
    pub async fn is_allowed(&self, url: &Url) -> bool {
        let entry = self.entry_for(url).await;
        entry.rules.is_allowed(url.as_str(), &self.user_agent)
    }

    /// The crawl delay the origin declared for us, if any.
    pub async fn crawl_delay(&self, url: &Url) -> Option<Duration> {
        self.entry_for(url).await.crawl_delay
    }

    /// Pre-populates the cache for a URL's domain (used at job start).
    pub async fn warm(&self, url: &Url) {
        let _ = self.entry_for(url).await;
    }

    async fn entry_for(&self, url: &Url) -> CachedRules {
        let domain = match url.host_str() {
            Some(host) => host.to_lowercase(),
            None => return permissive_entry(),
        };

        // Tier 1: process-local map
        {
            let local = self.local.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = local.get(&domain) {
                if entry.expires_at > Utc::now() {
                    return entry.clone();
                }
            }
        }

        // Tier 2: the shared store
        match self.store.get_robots(&domain) {
            Ok(Some(record)) => {
                let entry = entry_from_record(&record);
                self.remember(&domain, entry.clone());
                return entry;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(domain = %domain, error = %e, "robots cache read failed");
            }
        }

        // Miss: fetch, parse once, persist both tiers
        let body = self.fetch_body(url, &domain).await;
        let rules = Arc::new(RobotsRules::from_body(body.clone()));
        let delay_secs = rules.crawl_delay(&self.user_agent);
        let now = Utc::now();
        let record = RobotsRecord {
            domain: domain.clone(),
            body,
            crawl_delay_secs: delay_secs,
            fetched_at: now,
            expires_at: now + ChronoDuration::hours(ROBOTS_TTL_HOURS),
        };
        if let Err(e) = self.store.upsert_robots(&record) {
            tracing::warn!(domain = %domain, error = %e, "robots cache write failed");
        }

        let entry = CachedRules {
            rules,
            crawl_delay: delay_secs.map(Duration::from_secs_f64),
            expires_at: record.expires_at,
        };
        self.remember(&domain, entry.clone());
        entry
    }

    /// Fetches robots.txt from the URL's origin. A 404 means the file is
    /// absent (allow all); any other failure gets one retry on the alternate
    /// scheme before degrading to allow-all.
    async fn fetch_body(&self, url: &Url, domain: &str) -> Option<String> {
        let origin = url.origin().ascii_serialization();
        let primary = format!("{}/robots.txt", origin);
        let fallback_scheme = if url.scheme() == "https" { "http" } else { "https" };
        let fallback = format!("{}://{}/robots.txt", fallback_scheme, domain);

        for robots_url in [primary, fallback] {
            match self.client.get(&robots_url).send().await {
                Ok(response) if response.status().is_success() => {
                    match response.text().await {
                        Ok(body) => {
                            tracing::debug!(domain = %domain, "fetched robots.txt");
                            return Some(body);
                        }
                        Err(e) => {
                            tracing::debug!(domain = %domain, error = %e, "robots body unreadable");
                            return None;
                        }
                    }
                }
                Ok(response) if response.status() == reqwest::StatusCode::NOT_FOUND => {
                    tracing::debug!(domain = %domain, "no robots.txt, allowing all");
                    return None;
                }
                Ok(response) => {
                    tracing::debug!(
                        url = %robots_url,
                        status = %response.status(),
                        "robots fetch rejected"
                    );
                }
                Err(e) => {
                    tracing::debug!(url = %robots_url, error = %e, "robots fetch failed");
                }
            }
        }
        None
    }

    fn remember(&self, domain: &str, entry: CachedRules) {
        let mut local = self.local.lock().unwrap_or_else(|e| e.into_inner());
        local.insert(domain.to_string(), entry);
    }
}

fn permissive_entry() -> CachedRules {
    CachedRules {
        rules: Arc::new(RobotsRules::allow_all()),
        crawl_delay: None,
        expires_at: Utc::now() + ChronoDuration::hours(ROBOTS_TTL_HOURS),
    }
}

fn entry_from_record(record: &RobotsRecord) -> CachedRules {
    CachedRules {
        rules: Arc::new(RobotsRules::from_body(record.body.clone())),
        crawl_delay: record
            .crawl_delay_secs
            .filter(|d| d.is_finite() && *d >= 0.0)
            .map(Duration::from_secs_f64),
        expires_at: record.expires_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RobotsPolicy {
        RobotsPolicy::new(
            SqliteStore::open_in_memory().unwrap(),
            "kumo-test/1.0".to_string(),
            Duration::from_secs(2),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_store_record_is_used_without_fetching() {
        let policy = policy();
        let now = Utc::now();
        policy
            .store
            .upsert_robots(&RobotsRecord {
                domain: "cached.test".to_string(),
                body: Some("User-agent: *\nDisallow: /private".to_string()),
                crawl_delay_secs: Some(2.0),
                fetched_at: now,
                expires_at: now + ChronoDuration::hours(24),
            })
            .unwrap();

        let denied = Url::parse("https://cached.test/private/x").unwrap();
        let allowed = Url::parse("https://cached.test/public").unwrap();
        assert!(!policy.is_allowed(&denied).await);
        assert!(policy.is_allowed(&allowed).await);
        assert_eq!(
            policy.crawl_delay(&denied).await,
            Some(Duration::from_secs(2))
        );
    }

    #[tokio::test]
    async fn test_local_tier_caches_store_reads() {
        let policy = policy();
        let now = Utc::now();
        policy
            .store
            .upsert_robots(&RobotsRecord {
                domain: "tiered.test".to_string(),
                body: Some("User-agent: *\nDisallow: /x".to_string()),
                crawl_delay_secs: None,
                fetched_at: now,
                expires_at: now + ChronoDuration::hours(24),
            })
            .unwrap();

        let url = Url::parse("https://tiered.test/x").unwrap();
        assert!(!policy.is_allowed(&url).await);
        assert!(policy
            .local
            .lock()
            .unwrap()
            .contains_key("tiered.test"));
    }

    #[tokio::test]
    async fn test_null_record_allows_all() {
        let policy = policy();
        let now = Utc::now();
        policy
            .store
            .upsert_robots(&RobotsRecord {
                domain: "open.test".to_string(),
                body: None,
                crawl_delay_secs: None,
                fetched_at: now,
                expires_at: now + ChronoDuration::hours(24),
            })
            .unwrap();

        let url = Url::parse("https://open.test/anything").unwrap();
        assert!(policy.is_allowed(&url).await);
    }
}
