use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, HeaderValue};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tokio_stream::StreamExt as _;
use tracing::debug;

use crate::responses::json_ok;
use crate::AppState;

pub async fn list(State(state): State<AppState>) -> Response {
    json_ok(json!({
        "success": true,
        "jobs": state.jobs.snapshot(),
        "max_concurrent": state.jobs.max_concurrent(),
    }))
}

/// Server-sent events carrying one job's output, ending with a sentinel.
pub async fn logs(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    debug!(target: "decode::http", job_id = %id, "log stream attached");
    let stream = state.publisher.stream(&id).map(|event| {
        // SSE framing cannot carry bare carriage returns.
        let data = event.payload().replace('\r', "");
        Ok::<_, Infallible>(SseEvent::default().data(data))
    });
    let mut response = Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(10))
                .text("keep-alive"),
        )
        .into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}
