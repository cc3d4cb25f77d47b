use std::sync::Arc;

use axum::http::HeaderName;
use decode_core::{
    ConcurrencyLimiter, ConfigError, CoreConfig, JobRegistry, LogStreamPublisher, ProcessRunner,
    RateLimiter, Warehouse, WorkspaceManager,
};

#[derive(Clone)]
pub(crate) struct AppState {
    pub config: Arc<CoreConfig>,
    pub workspaces: Arc<WorkspaceManager>,
    pub runner: Arc<ProcessRunner>,
    pub jobs: Arc<JobRegistry>,
    pub publisher: LogStreamPublisher,
    pub warehouse: Arc<Warehouse>,
    pub rate: Arc<RateLimiter>,
    pub inflight: ConcurrencyLimiter,
    pub user_header: HeaderName,
}

impl AppState {
    /// Wire every core component from one config. Fails without a warehouse token.
    pub fn new(config: CoreConfig) -> Result<Self, ConfigError> {
        let user_header = HeaderName::from_bytes(config.limits.user_header.as_bytes()).map_err(
            |_| ConfigError::InvalidValue {
                key: "limits.user_header",
                value: config.limits.user_header.clone(),
            },
        )?;
        let jobs = Arc::new(JobRegistry::new(config.jobs.max_concurrent));
        let runner = ProcessRunner::new(&config, jobs.clone())?;
        let workspaces = WorkspaceManager::new(
            config.workspace.clone(),
            config.runner.token_env.clone(),
            config.pool.share.clone(),
        );
        Ok(Self {
            publisher: LogStreamPublisher::new(jobs.clone(), config.jobs.poll()),
            warehouse: Arc::new(Warehouse::open(&config.pool)),
            rate: Arc::new(RateLimiter::new(&config.limits)),
            inflight: ConcurrencyLimiter::new(config.limits.max_inflight_per_user),
            workspaces: Arc::new(workspaces),
            runner: Arc::new(runner),
            jobs,
            user_header,
            config: Arc::new(config),
        })
    }
}
