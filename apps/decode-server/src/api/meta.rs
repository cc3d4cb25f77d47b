use axum::extract::State;
use axum::response::Response;
use serde_json::json;

use crate::api::blocking;
use crate::responses::{json_ok, ApiError};
use crate::AppState;

pub async fn healthz() -> Response {
    json_ok(json!({"ok": true}))
}

/// Ready once the warehouse answers a trivial query.
pub async fn readyz(State(state): State<AppState>) -> Result<Response, ApiError> {
    let warehouse = state.warehouse.clone();
    blocking(move || warehouse.ping().map_err(ApiError::from)).await?;
    Ok(json_ok(json!({
        "ok": true,
        "jobs": state.jobs.len(),
        "max_jobs": state.jobs.max_concurrent(),
    })))
}
