use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use decode_core::{AdmissionError, RunError, WarehouseError, WorkspaceError};
use serde_json::{json, Value};
use tracing::{error, warn};

pub fn json_ok(value: Value) -> Response {
    (StatusCode::OK, Json(value)).into_response()
}

pub fn json_status(status: StatusCode, value: Value) -> Response {
    (status, Json(value)).into_response()
}

/// Failure surfaced to clients as `{"success": false, "error": ...}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
    #[error("{0}")]
    BadRequest(String),
    #[error("Unauthorized: missing user identity")]
    Unauthorized,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Admission(_) | ApiError::Run(RunError::Admission(_)) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ApiError::Run(RunError::WorkspaceNotInitialized(_)) => StatusCode::CONFLICT,
            ApiError::Run(RunError::EmptySelection | RunError::InvalidTarget(_)) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Run(RunError::TimedOut(_)) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Run(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Workspace(err) => match err {
                WorkspaceError::UnknownLesson(_) | WorkspaceError::ModelNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                WorkspaceError::InvalidUser(_) | WorkspaceError::InvalidModelName(_) => {
                    StatusCode::BAD_REQUEST
                }
                WorkspaceError::TemplateMissing(_) | WorkspaceError::Io(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::Warehouse(WarehouseError::InvalidSchema(_)) => StatusCode::BAD_REQUEST,
            ApiError::Warehouse(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn admission(&self) -> Option<&AdmissionError> {
        match self {
            ApiError::Admission(err) | ApiError::Run(RunError::Admission(err)) => Some(err),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(target: "decode::http", error = %self, "request failed");
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            warn!(target: "decode::http", error = %self, "request rejected");
        }
        let retry_after = self.admission().map(AdmissionError::retry_after_secs);
        let mut res = json_status(status, json!({"success": false, "error": self.to_string()}));
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                res.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        res
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Internal(err.to_string())
    }
}
