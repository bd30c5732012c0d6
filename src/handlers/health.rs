use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum ComponentStatus {
    Up,
    Down,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: ComponentStatus,
    version: &'static str,
    database: ComponentStatus,
    timestamp: String,
}

/// GET /health
///
/// Readiness probe: reports 503 when the database is unreachable.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = match crate::db::check_connection(&state.db).await {
        Ok(()) => ComponentStatus::Up,
        Err(_) => ComponentStatus::Down,
    };

    let (status, code) = match database {
        ComponentStatus::Up => (ComponentStatus::Up, StatusCode::OK),
        ComponentStatus::Down => (ComponentStatus::Down, StatusCode::SERVICE_UNAVAILABLE),
    };

    (
        code,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION"),
            database,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }),
    )
}
