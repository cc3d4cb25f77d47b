use axum::extract::State;
use axum::response::Response;
use decode_core::schema_for;
use serde_json::json;

use crate::api::blocking;
use crate::responses::{json_ok, ApiError};
use crate::security::CurrentUser;
use crate::AppState;

/// Tables the caller's runs have built in their own schema.
pub async fn tables(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Response, ApiError> {
    let warehouse = state.warehouse.clone();
    let schema = schema_for(&user);
    let name = schema.clone();
    let tables = blocking(move || warehouse.list_tables(&name).map_err(ApiError::from)).await?;
    Ok(json_ok(json!({"success": true, "schema": schema, "tables": tables})))
}
