//! The URL frontier: exactly-once discovery over the durable store
//!
//! A thin facade over [`SqliteStore`]. Discovery filters, normalizes, and
//! batch-inserts links; the store's `(job_id, normalized_url)` uniqueness
//! makes re-discovery a no-op and the returned delta is exact.

mod filter;

pub use filter::LinkFilter;

use crate::storage::{FrontierEntry, NewLink, PageStatus, SqliteStore, StorageResult};
use crate::url::normalize_url;
use std::collections::HashSet;
use uuid::Uuid;

/// Frontier operations for one store
#[derive(Clone)]
pub struct Frontier {
    store: SqliteStore,
}

impl Frontier {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    /// Seeds a job's frontier with its (already validated) seed URL at
    /// depth 0. Returns the discovered delta (1, or 0 on a re-seed).
    pub fn seed(&self, job_id: Uuid, seed_url: &str) -> StorageResult<u64> {
        let normalized = match normalize_url(seed_url) {
            Ok(url) => url.to_string(),
            // The manager validated the seed already; keep the raw form if
            // normalization disagrees so the job can fail visibly downstream.
            Err(_) => seed_url.to_string(),
        };
        self.store.enqueue_links(
            job_id,
            &[NewLink {
                url: seed_url.to_string(),
                normalized_url: normalized,
                depth: 0,
                priority: NewLink::priority_for_depth(0),
            }],
        )
    }

    /// Runs extracted links through the job filter, normalizes survivors,
    /// dedups within the batch, and batch-inserts at `parent_depth + 1`.
    ///
    /// Returns only the count of rows actually inserted; links already known
    /// to the job contribute nothing to the discovered counter.
    pub fn discover(
        &self,
        job_id: Uuid,
        filter: &LinkFilter,
        parent_depth: u32,
        links: &[String],
    ) -> StorageResult<u64> {
        let depth = parent_depth + 1;
        let mut seen = HashSet::new();
        let mut batch = Vec::new();

        for raw in links {
            let parsed = match url::Url::parse(raw) {
                Ok(url) => url,
                Err(_) => continue,
            };
            if !filter.accepts(&parsed) {
                continue;
            }
            let normalized = match normalize_url(raw) {
                Ok(url) => url.to_string(),
                Err(_) => continue,
            };
            if !seen.insert(normalized.clone()) {
                continue;
            }
            batch.push(NewLink {
                url: raw.clone(),
                normalized_url: normalized,
                depth,
                priority: NewLink::priority_for_depth(depth),
            });
        }

        self.store.enqueue_links(job_id, &batch)
    }

    /// Claims up to `batch_size` pending entries for exclusive processing.
    pub fn claim(&self, job_id: Uuid, batch_size: u32) -> StorageResult<Vec<FrontierEntry>> {
        self.store.claim_pending(job_id, batch_size)
    }

    pub fn complete(&self, entry_id: i64) -> StorageResult<()> {
        self.store.mark_frontier(entry_id, PageStatus::Completed)
    }

    pub fn fail(&self, entry_id: i64) -> StorageResult<()> {
        self.store.mark_frontier(entry_id, PageStatus::Failed)
    }

    pub fn skip(&self, entry_id: i64) -> StorageResult<()> {
        self.store.mark_frontier(entry_id, PageStatus::Skipped)
    }

    /// Returns a retryable failure to the pending pool, invisible to
    /// claimers until `not_before`.
    pub fn retry(
        &self,
        entry: &FrontierEntry,
        retry_count: u32,
        not_before: chrono::DateTime<chrono::Utc>,
    ) -> StorageResult<()> {
        self.store.requeue_entry(entry, retry_count, not_before)
    }

    pub fn clear(&self, job_id: Uuid) -> StorageResult<()> {
        self.store.clear_frontier(job_id)
    }
}
