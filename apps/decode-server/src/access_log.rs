use axum::extract::MatchedPath;
use axum::http::{header, Request};
use axum::middleware::Next;
use axum::response::Response;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::security::extract_client_addr;

/// Sampling for the `http.access` target; off unless an access log is requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Sampling {
    enabled: bool,
    every: u64,
}

impl Sampling {
    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str| lookup(key).map(|v| v.trim() == "1").unwrap_or(false);
        Self {
            enabled: flag("DECODE_ACCESS_LOG") || flag("DECODE_ACCESS_LOG_ROLL"),
            every: lookup("DECODE_ACCESS_SAMPLE_N")
                .and_then(|raw| raw.trim().parse().ok())
                .unwrap_or(1u64)
                .max(1),
        }
    }

    fn keeps(&self, seq: u64) -> bool {
        self.enabled && seq % self.every == 0
    }
}

static SAMPLING: Lazy<Sampling> = Lazy::new(|| Sampling::from_lookup(|k| std::env::var(k).ok()));
static SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Serialize)]
struct AccessLine<'a> {
    ts: String,
    method: &'a str,
    path: &'a str,
    status: u16,
    dur_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    remote: Option<&'a str>,
    /// Set for log streams, whose duration covers only the response head.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

pub async fn access_log_mw(req: Request<axum::body::Body>, next: Next) -> Response {
    if !SAMPLING.enabled {
        return next.run(req).await;
    }
    let started = Instant::now();
    let method = req.method().clone();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let remote = extract_client_addr(&req);
    let res = next.run(req).await;

    if !SAMPLING.keeps(SEQ.fetch_add(1, Ordering::Relaxed) + 1) {
        return res;
    }
    let line = AccessLine {
        ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        method: method.as_str(),
        path: &path,
        status: res.status().as_u16(),
        dur_ms: started.elapsed().as_millis() as u64,
        remote: remote.as_deref(),
        stream: res
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream")),
    };
    match serde_json::to_string(&line) {
        Ok(json) => tracing::info!(target: "http.access", "{json}"),
        Err(err) => tracing::debug!(target: "decode::http", error = %err, "access line encode failed"),
    }
    res
}
