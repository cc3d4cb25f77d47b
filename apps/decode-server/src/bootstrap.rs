use decode_core::{ConfigError, CoreConfig};
use tracing::info;

use crate::{
    access_log,
    app_state::AppState,
    janitor,
    router::build_router,
    security,
    tasks::TaskManager,
};

pub(crate) struct BootstrapOutput {
    pub router: axum::Router<AppState>,
    pub state: AppState,
    pub background_tasks: TaskManager,
}

/// Wire state, routes and background tasks. Must run inside a tokio runtime.
pub(crate) fn build(config: CoreConfig) -> Result<BootstrapOutput, ConfigError> {
    let state = AppState::new(config)?;

    let mut background_tasks = TaskManager::new();
    background_tasks.push(janitor::spawn_job_janitor(
        state.jobs.clone(),
        state.config.jobs.reap_interval(),
        state.config.jobs.reap_grace(),
    ));

    info!(
        target: "decode::http",
        max_jobs = state.config.jobs.max_concurrent,
        workspaces = %state.config.workspace.base_dir.display(),
        tool = %state.config.runner.program,
        "service configured"
    );

    Ok(BootstrapOutput {
        router: build_router(),
        state,
        background_tasks,
    })
}

pub(crate) fn attach_stateful_layers(
    router: axum::Router<AppState>,
    state: AppState,
) -> axum::Router<()> {
    router
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            security::admission_mw,
        ))
        .with_state::<()>(state)
}

pub(crate) fn attach_http_layers(
    router: axum::Router<()>,
    concurrency_limit: usize,
) -> axum::Router<()> {
    use tower::limit::ConcurrencyLimitLayer;
    use tower_http::trace::TraceLayer;

    router
        .layer(TraceLayer::new_for_http())
        .layer(ConcurrencyLimitLayer::new(concurrency_limit))
}

pub(crate) fn attach_global_layers(router: axum::Router<()>) -> axum::Router<()> {
    router
        .layer(axum::middleware::from_fn(access_log::access_log_mw))
        .layer(axum::middleware::from_fn(security::headers_mw))
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum HttpConfigError {
    #[error("invalid DECODE_HTTP_MAX_CONC: {0}")]
    InvalidConcurrency(String),
    #[error("invalid DECODE_PORT: {0}")]
    InvalidPort(String),
    #[error("invalid DECODE_BIND: {0}")]
    InvalidBind(String),
}

pub(crate) struct HttpConfig {
    pub addr: std::net::SocketAddr,
    pub concurrency_limit: usize,
}

pub(crate) fn http_config_from_env() -> Result<HttpConfig, HttpConfigError> {
    http_config_from(|key| std::env::var(key).ok())
}

fn http_config_from<F>(lookup: F) -> Result<HttpConfig, HttpConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let concurrency_limit = match lookup("DECODE_HTTP_MAX_CONC") {
        None => 1024,
        Some(raw) => match raw.trim().parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => return Err(HttpConfigError::InvalidConcurrency(raw)),
        },
    };

    let bind = lookup("DECODE_BIND").unwrap_or_else(|| "127.0.0.1".into());
    let port = match lookup("DECODE_PORT") {
        None => 8090,
        Some(raw) => raw
            .trim()
            .parse::<u16>()
            .map_err(|_| HttpConfigError::InvalidPort(raw))?,
    };
    let ip: std::net::IpAddr = bind
        .trim()
        .parse()
        .map_err(|_| HttpConfigError::InvalidBind(bind.clone()))?;

    Ok(HttpConfig {
        addr: std::net::SocketAddr::new(ip, port),
        concurrency_limit,
    })
}
