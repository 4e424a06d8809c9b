//! Control API: a thin axum adapter over the job manager
//!
//! Every handler maps straight onto a manager or store operation; no crawl
//! logic lives here.

mod health;
mod jobs;

pub use health::health_handler;

use crate::job::{JobError, JobManager};
use crate::storage::{SqliteStore, StorageError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: JobManager,
}

impl AppState {
    fn store(&self) -> &SqliteStore {
        self.manager.store()
    }
}

/// Builds the API router.
pub fn build_router(manager: JobManager) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/jobs", post(jobs::create_job).get(jobs::list_jobs))
        .route("/jobs/:id", get(jobs::get_job))
        .route("/jobs/:id/pause", post(jobs::pause_job))
        .route("/jobs/:id/resume", post(jobs::resume_job))
        .route("/jobs/:id/cancel", post(jobs::cancel_job))
        .route("/jobs/:id/pages", get(jobs::list_pages))
        .route("/jobs/:id/pages/:page_id", get(jobs::get_page))
        .route("/jobs/:id/export", get(jobs::export_pages))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { manager })
}

/// API-boundary errors with their HTTP mapping
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Internal(msg) => {
                tracing::error!("internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::Validation(msg) => Self::BadRequest(msg),
            JobError::NotFound(id) => Self::NotFound(format!("job {} not found", id)),
            e @ JobError::InvalidState { .. } => Self::BadRequest(e.to_string()),
            JobError::Storage(e) => Self::Internal(e.to_string()),
            JobError::Pattern(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::JobNotFound(id) => Self::NotFound(format!("job {} not found", id)),
            other => Self::Internal(other.to_string()),
        }
    }
}
