//! Job endpoints: create, inspect, list, pause/resume/cancel, pages, export

use crate::api::{ApiError, AppState};
use crate::job::{JobConfig, JobRecord, JobStatus};
use crate::storage::{PageRecord, PageStatus, QueueStats};
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Rows fetched per round-trip while streaming an export
const EXPORT_BATCH: u32 = 200;

// ===== DTOs =====

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    pub seed_url: String,
    pub max_depth: Option<u32>,
    pub max_pages: Option<u32>,
    pub max_concurrent_workers: Option<u32>,
    pub crawl_delay_ms: Option<u64>,
    pub respect_robots_txt: Option<bool>,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub id: Uuid,
    pub seed_url: String,
    pub domain: String,
    pub status: JobStatus,
    pub max_depth: u32,
    pub max_pages: u32,
    pub max_concurrent_workers: u32,
    pub crawl_delay_ms: u64,
    pub respect_robots_txt: bool,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub discovered: u64,
    pub crawled: u64,
    pub failed: u64,
    pub skipped: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<JobRecord> for JobResponse {
    fn from(job: JobRecord) -> Self {
        Self {
            id: job.id,
            seed_url: job.seed_url,
            domain: job.domain,
            status: job.status,
            max_depth: job.config.max_depth,
            max_pages: job.config.max_pages,
            max_concurrent_workers: job.config.max_workers,
            crawl_delay_ms: job.config.crawl_delay_ms,
            respect_robots_txt: job.config.respect_robots,
            include_patterns: job.config.include_patterns,
            exclude_patterns: job.config.exclude_patterns,
            discovered: job.discovered,
            crawled: job.crawled,
            failed: job.failed,
            skipped: job.skipped,
            last_error: job.last_error,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDetailResponse {
    #[serde(flatten)]
    pub job: JobResponse,
    pub queue: QueueStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crawl_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResponse {
    pub id: i64,
    pub url: String,
    pub normalized_url: String,
    pub depth: u32,
    pub status: String,
    pub http_status: Option<u16>,
    pub content_type: Option<String>,
    pub content_length: Option<i64>,
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub links_found: u32,
    pub crawled_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub retry_count: u32,
}

impl PageResponse {
    fn from_record(page: PageRecord, with_content: bool) -> Self {
        Self {
            id: page.id,
            url: page.url,
            normalized_url: page.normalized_url,
            depth: page.depth,
            status: page.status.to_db_string().to_string(),
            http_status: page.http_status,
            content_type: page.content_type,
            content_length: page.content_length,
            title: page.title,
            description: page.description,
            content: if with_content { page.content } else { None },
            links_found: page.links_found,
            crawled_at: page.crawled_at,
            duration_ms: page.duration_ms,
            error_message: page.error_message,
            retry_count: page.retry_count,
        }
    }
}

#[derive(Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    pub format: Option<String>,
}

// ===== Handlers =====

pub async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<JobResponse>), ApiError> {
    let runtime = state.manager.runtime();
    let defaults = JobConfig {
        max_depth: request.max_depth.unwrap_or(runtime.default_max_depth),
        max_pages: request.max_pages.unwrap_or(runtime.default_max_pages),
        max_workers: request
            .max_concurrent_workers
            .unwrap_or(runtime.default_workers),
        crawl_delay_ms: request
            .crawl_delay_ms
            .unwrap_or(runtime.default_crawl_delay_ms),
        respect_robots: request.respect_robots_txt.unwrap_or(true),
        include_patterns: request.include_patterns,
        exclude_patterns: request.exclude_patterns,
    };
    let job = state.manager.create_job(&request.seed_url, defaults)?;
    Ok((StatusCode::ACCEPTED, Json(job.into())))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobDetailResponse>, ApiError> {
    let job = state.manager.get_job(id)?;
    let queue = state.store().queue_stats(id)?;

    let crawl_rate = job.crawl_rate();
    let eta_seconds = crawl_rate
        .filter(|rate| *rate > 0.0)
        .map(|rate| (queue.pending as f64 / rate).ceil() as u64);

    Ok(Json(JobDetailResponse {
        job: job.into(),
        queue,
        crawl_rate,
        eta_seconds,
    }))
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse<JobResponse>>, ApiError> {
    let (page, limit) = paging(&query, 100)?;
    let status = parse_status_filter::<JobStatus>(&query.status, JobStatus::from_db_string)?;

    let (jobs, total) = state
        .store()
        .list_jobs(status, limit, (page - 1).saturating_mul(limit))?;
    Ok(Json(ListResponse {
        items: jobs.into_iter().map(JobResponse::from).collect(),
        total,
        page,
        limit,
    }))
}

pub async fn pause_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobResponse>, ApiError> {
    Ok(Json(state.manager.pause_job(id)?.into()))
}

pub async fn resume_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobResponse>, ApiError> {
    Ok(Json(state.manager.resume_job(id)?.into()))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobResponse>, ApiError> {
    Ok(Json(state.manager.cancel_job(id)?.into()))
}

pub async fn list_pages(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse<PageResponse>>, ApiError> {
    // 404 before paging errors so a bad job id reads as missing, not invalid
    state.manager.get_job(id)?;
    let (page, limit) = paging(&query, 1000)?;
    let status = parse_status_filter::<PageStatus>(&query.status, PageStatus::from_db_string)?;

    let (pages, total) = state
        .store()
        .list_pages(id, status, limit, (page - 1).saturating_mul(limit))?;
    Ok(Json(ListResponse {
        items: pages
            .into_iter()
            .map(|p| PageResponse::from_record(p, false))
            .collect(),
        total,
        page,
        limit,
    }))
}

/// Direct indexed lookup by page id, validated against the job id.
pub async fn get_page(
    State(state): State<AppState>,
    Path((id, page_id)): Path<(Uuid, i64)>,
) -> Result<Json<PageResponse>, ApiError> {
    state.manager.get_job(id)?;
    let page = state
        .store()
        .get_page(id, page_id)?
        .ok_or_else(|| ApiError::NotFound(format!("page {} not found", page_id)))?;
    Ok(Json(PageResponse::from_record(page, true)))
}

#[derive(Clone, Copy)]
enum ExportFormat {
    Json,
    Csv,
}

/// Streams completed pages without buffering the full result set: rows are
/// pulled in batches of [`EXPORT_BATCH`] keyed by last-seen page id.
pub async fn export_pages(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    state.manager.get_job(id)?;
    let format = match query.format.as_deref() {
        None | Some("json") => ExportFormat::Json,
        Some("csv") => ExportFormat::Csv,
        Some(other) => {
            return Err(ApiError::BadRequest(format!(
                "unknown export format {:?}, expected json or csv",
                other
            )))
        }
    };

    let (content_type, filename) = match format {
        ExportFormat::Json => ("application/json", format!("pages-{}.json", id)),
        ExportFormat::Csv => ("text/csv", format!("pages-{}.csv", id)),
    };

    let store = state.store().clone();
    let stream = futures::stream::unfold(Cursor::Start, move |cursor| {
        let store = store.clone();
        async move {
            match cursor {
                Cursor::Start => {
                    let chunk = match format {
                        ExportFormat::Json => Bytes::from_static(b"["),
                        ExportFormat::Csv => Bytes::from_static(
                            b"id,url,normalizedUrl,depth,httpStatus,contentType,title,description,linksFound,crawledAt,durationMs\n",
                        ),
                    };
                    Some((Ok(chunk), Cursor::Rows { after_id: 0, first: true }))
                }
                Cursor::Rows { after_id, first } => {
                    let batch = match store.completed_pages_after(id, after_id, EXPORT_BATCH) {
                        Ok(batch) => batch,
                        Err(e) => {
                            return Some((
                                Err(std::io::Error::other(e.to_string())),
                                Cursor::Done,
                            ))
                        }
                    };
                    if batch.is_empty() {
                        let footer = match format {
                            ExportFormat::Json => Bytes::from_static(b"]"),
                            ExportFormat::Csv => Bytes::new(),
                        };
                        return Some((Ok(footer), Cursor::Done));
                    }
                    let last_id = batch.last().map(|p| p.id).unwrap_or(after_id);
                    let mut out = String::new();
                    for page in batch {
                        match format {
                            ExportFormat::Json => {
                                if !(first && out.is_empty()) {
                                    out.push(',');
                                }
                                let body = serde_json::to_string(&PageResponse::from_record(
                                    page, true,
                                ))
                                .unwrap_or_else(|_| "null".to_string());
                                out.push_str(&body);
                            }
                            ExportFormat::Csv => {
                                out.push_str(&csv_row(&page));
                            }
                        }
                    }
                    Some((
                        Ok(Bytes::from(out)),
                        Cursor::Rows { after_id: last_id, first: false },
                    ))
                }
                Cursor::Done => None,
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename),
        )
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

enum Cursor {
    Start,
    Rows { after_id: i64, first: bool },
    Done,
}

fn csv_row(page: &PageRecord) -> String {
    let fields = [
        page.id.to_string(),
        page.url.clone(),
        page.normalized_url.clone(),
        page.depth.to_string(),
        page.http_status.map(|s| s.to_string()).unwrap_or_default(),
        page.content_type.clone().unwrap_or_default(),
        page.title.clone().unwrap_or_default(),
        page.description.clone().unwrap_or_default(),
        page.links_found.to_string(),
        page.crawled_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        page.duration_ms.map(|d| d.to_string()).unwrap_or_default(),
    ];
    let mut row = fields
        .iter()
        .map(|f| csv_escape(f))
        .collect::<Vec<_>>()
        .join(",");
    row.push('\n');
    row
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn paging(query: &ListQuery, max_limit: u32) -> Result<(u32, u32), ApiError> {
    let page = query.page.unwrap_or(1);
    if page < 1 {
        return Err(ApiError::BadRequest("page must be >= 1".to_string()));
    }
    let limit = query.limit.unwrap_or(20.min(max_limit));
    if limit < 1 || limit > max_limit {
        return Err(ApiError::BadRequest(format!(
            "limit must be 1..={}",
            max_limit
        )));
    }
    Ok((page, limit))
}

fn parse_status_filter<T>(
    raw: &Option<String>,
    parse: fn(&str) -> Option<T>,
) -> Result<Option<T>, ApiError> {
    match raw {
        None => Ok(None),
        Some(s) => parse(s)
            .map(Some)
            .ok_or_else(|| ApiError::BadRequest(format!("unknown status filter {:?}", s))),
    }
}
