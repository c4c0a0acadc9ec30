use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::json;

use crate::handlers::AppState;

pub async fn liveness() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let (status, db_status) = match state.store.ping().await {
        Ok(()) => (StatusCode::OK, "healthy"),
        Err(e) => {
            tracing::warn!(error = %e, "readiness check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
        }
    };

    let overall_status = if status == StatusCode::OK {
        "ready"
    } else {
        "not_ready"
    };

    (
        status,
        Json(json!({
            "status": overall_status,
            "checks": {
                "database": db_status,
                "data_root": state.layout.root().display().to_string()
            },
            "active_uploads": state.metrics.active_uploads(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        })),
    )
}
