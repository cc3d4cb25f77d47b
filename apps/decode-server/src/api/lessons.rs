use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use decode_core::{ModelSelection, SeedLaunch, SeedOutcome, Workspace, WorkspaceError};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::api::blocking;
use crate::responses::{json_ok, json_status, ApiError};
use crate::security::CurrentUser;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RunRequest {
    pub models: Vec<String>,
    pub include_children: bool,
    pub full_refresh: bool,
    pub stream: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SeedRequest {
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
pub struct SaveModelRequest {
    pub sql: String,
}

fn workspace_for(state: &AppState, user: &str, lesson: &str) -> Result<Workspace, ApiError> {
    Ok(state.workspaces.resolve(user, lesson)?)
}

pub async fn list(State(state): State<AppState>) -> Response {
    json_ok(json!({"success": true, "lessons": state.workspaces.lessons()}))
}

/// Copy the project template in unless the workspace already exists.
pub async fn init_workspace(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(lesson): Path<String>,
) -> Result<Response, ApiError> {
    let ws = workspace_for(&state, &user, &lesson)?;
    let workspaces = state.workspaces.clone();
    let warehouse = state.warehouse.clone();
    let created = blocking(move || {
        let created = !ws.is_initialized();
        if created {
            workspaces.initialize(&ws)?;
        }
        // A missing schema is recreated on the next init; the workspace itself is usable.
        if let Err(err) = warehouse.ensure_schema(&ws.schema_name()) {
            warn!(
                target: "decode::warehouse",
                user = ws.user_id(),
                error = %err,
                "could not create user schema"
            );
        }
        Ok(created)
    })
    .await?;
    Ok(json_ok(json!({
        "success": true,
        "lesson": lesson,
        "created": created,
    })))
}

pub async fn list_models(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(lesson): Path<String>,
) -> Result<Response, ApiError> {
    let ws = workspace_for(&state, &user, &lesson)?;
    let workspaces = state.workspaces.clone();
    let models = blocking(move || Ok(workspaces.list_models(&ws)?)).await?;
    Ok(json_ok(json!({"success": true, "models": models})))
}

pub async fn get_model(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((lesson, model)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let ws = workspace_for(&state, &user, &lesson)?;
    let workspaces = state.workspaces.clone();
    let name = model.clone();
    let (sql, original) = blocking(move || match workspaces.load_model(&ws, &name) {
        Ok(sql) => Ok((sql, false)),
        Err(WorkspaceError::ModelNotFound(_)) => {
            Ok((workspaces.load_original_model(&ws, &name)?, true))
        }
        Err(err) => Err(err.into()),
    })
    .await?;
    Ok(json_ok(json!({
        "success": true,
        "model": model,
        "sql": sql,
        "original": original,
    })))
}

pub async fn put_model(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((lesson, model)): Path<(String, String)>,
    Json(req): Json<SaveModelRequest>,
) -> Result<Response, ApiError> {
    let ws = workspace_for(&state, &user, &lesson)?;
    let workspaces = state.workspaces.clone();
    let name = model.clone();
    blocking(move || Ok(workspaces.save_model(&ws, &name, &req.sql)?)).await?;
    Ok(json_ok(json!({"success": true, "model": model})))
}

pub async fn run(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(lesson): Path<String>,
    Json(req): Json<RunRequest>,
) -> Result<Response, ApiError> {
    let ws = workspace_for(&state, &user, &lesson)?;
    let selection = ModelSelection::new(req.models)
        .include_descendants(req.include_children)
        .full_refresh(req.full_refresh);

    if req.stream {
        let job_id = state.runner.start_models(&ws, &selection)?;
        info!(
            target: "decode::http",
            %job_id,
            user = %user,
            lesson = %lesson,
            "run started"
        );
        return Ok(json_status(
            StatusCode::ACCEPTED,
            json!({
                "success": true,
                "job_id": job_id,
                "models": selection.normalized_targets(),
            }),
        ));
    }

    let report = state.runner.run_models(&ws, &selection).await?;
    Ok(json_ok(json!({
        "success": report.success,
        "models": report.targets,
        "exit_code": report.exit_code,
        "output": report.output,
    })))
}

pub async fn seed(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(lesson): Path<String>,
    Json(req): Json<SeedRequest>,
) -> Result<Response, ApiError> {
    let ws = workspace_for(&state, &user, &lesson)?;

    if req.stream {
        return Ok(match state.runner.start_seeds(&ws)? {
            SeedLaunch::Started(job_id) => {
                info!(target: "decode::http", %job_id, user = %user, lesson = %lesson, "seed started");
                json_status(
                    StatusCode::ACCEPTED,
                    json!({"success": true, "job_id": job_id}),
                )
            }
            SeedLaunch::NothingToLoad(message) => {
                json_ok(json!({"success": true, "message": message}))
            }
        });
    }

    Ok(match state.runner.load_seeds(&ws).await? {
        SeedOutcome::Loaded(report) => json_ok(json!({
            "success": report.success,
            "exit_code": report.exit_code,
            "output": report.output,
        })),
        SeedOutcome::NothingToLoad(message) => {
            json_ok(json!({"success": true, "message": message}))
        }
    })
}
