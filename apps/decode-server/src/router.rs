use axum::routing::{get, post};
use axum::Router;

use crate::api;
use crate::AppState;

pub(crate) mod paths {
    pub const HEALTHZ: &str = "/healthz";
    pub const READYZ: &str = "/readyz";
    pub const LESSONS: &str = "/api/lessons";
    pub const LESSON_WORKSPACE: &str = "/api/lessons/{lesson}/workspace";
    pub const LESSON_MODELS: &str = "/api/lessons/{lesson}/models";
    pub const LESSON_MODEL: &str = "/api/lessons/{lesson}/models/{model}";
    pub const LESSON_RUN: &str = "/api/lessons/{lesson}/run";
    pub const LESSON_SEED: &str = "/api/lessons/{lesson}/seed";
    pub const JOBS: &str = "/api/jobs";
    pub const JOB_LOGS: &str = "/api/jobs/{id}/logs";
    pub const WAREHOUSE_TABLES: &str = "/api/warehouse/tables";
}

pub(crate) fn build_router() -> Router<AppState> {
    Router::new()
        .route(paths::HEALTHZ, get(api::meta::healthz))
        .route(paths::READYZ, get(api::meta::readyz))
        .route(paths::LESSONS, get(api::lessons::list))
        .route(paths::LESSON_WORKSPACE, post(api::lessons::init_workspace))
        .route(paths::LESSON_MODELS, get(api::lessons::list_models))
        .route(
            paths::LESSON_MODEL,
            get(api::lessons::get_model).put(api::lessons::put_model),
        )
        .route(paths::LESSON_RUN, post(api::lessons::run))
        .route(paths::LESSON_SEED, post(api::lessons::seed))
        .route(paths::JOBS, get(api::jobs::list))
        .route(paths::JOB_LOGS, get(api::jobs::logs))
        .route(paths::WAREHOUSE_TABLES, get(api::warehouse::tables))
}
