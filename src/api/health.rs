use crate::api::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    database: &'static str,
    #[serde(rename = "queue-store")]
    queue_store: &'static str,
}

/// Health probe: reports the store connection and the frontier relation
/// separately. 503 when either is down.
pub async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let database = state.store().ping();
    let queue_store = state.store().ping_frontier();
    let healthy = database && queue_store;

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status_code,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "unhealthy" },
            database: if database { "up" } else { "down" },
            queue_store: if queue_store { "up" } else { "down" },
        }),
    )
}
