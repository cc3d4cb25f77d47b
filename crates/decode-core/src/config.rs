use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::workspace::{default_lessons, Lesson};

const DEFAULT_CONFIG_PATH: &str = "configs/default.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("warehouse token not configured: set DECODE_WAREHOUSE_TOKEN or runner.warehouse_token")]
    MissingCredential,
    #[error("read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Effective configuration for every core component.
///
/// Every field has a default, so an empty TOML document (or no file at all)
/// yields a usable config apart from the warehouse credential.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub runner: RunnerConfig,
    pub jobs: JobsConfig,
    pub limits: LimitsConfig,
    pub pool: PoolConfig,
    pub workspace: WorkspaceConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Transformation tool executable.
    pub program: String,
    /// Arguments placed before the subcommand, for launchers such as `uv run dbt`.
    pub program_args: Vec<String>,
    pub warehouse_token: Option<String>,
    /// Child env var that receives the warehouse token.
    pub token_env: String,
    /// Child env var that points the tool at the workspace profiles.
    pub profiles_env: String,
    pub timeout_secs: u64,
    /// How long to keep reading buffered output after the child exits.
    pub drain_grace_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            program: "dbt".into(),
            program_args: Vec::new(),
            warehouse_token: None,
            token_env: "MOTHERDUCK_TOKEN".into(),
            profiles_env: "DBT_PROFILES_DIR".into(),
            timeout_secs: 300,
            drain_grace_ms: 500,
        }
    }
}

impl RunnerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub max_concurrent: usize,
    pub poll_ms: u64,
    pub reap_grace_secs: u64,
    pub reap_interval_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            poll_ms: 100,
            reap_grace_secs: 600,
            reap_interval_secs: 60,
        }
    }
}

impl JobsConfig {
    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(1))
    }

    pub fn reap_grace(&self) -> Duration {
        Duration::from_secs(self.reap_grace_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub window_secs: u64,
    pub default_limit: u32,
    pub expensive_limit: u32,
    pub expensive_prefixes: Vec<String>,
    pub sweep_interval_secs: u64,
    /// Records idle for `stale_factor` windows are dropped by the sweep.
    pub stale_factor: u32,
    pub max_inflight_per_user: usize,
    /// Header carrying the authenticated user id, set by the fronting proxy.
    pub user_header: String,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            default_limit: 100,
            expensive_limit: 20,
            expensive_prefixes: vec!["/api/lessons/".into(), "/api/jobs/".into()],
            sweep_interval_secs: 300,
            stale_factor: 5,
            max_inflight_per_user: 5,
            user_header: "x-decode-user".into(),
        }
    }
}

impl LimitsConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        self.window() * self.stale_factor.max(1)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_idle: usize,
    pub statement_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    /// Local warehouse database file.
    pub database: PathBuf,
    /// Share (catalog) the tool profile binds to.
    pub share: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 5,
            statement_timeout_secs: 30,
            cleanup_interval_secs: 300,
            database: PathBuf::from("warehouse.db"),
            share: "decode_share".into(),
        }
    }
}

impl PoolConfig {
    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub base_dir: PathBuf,
    /// Project template copied into each new workspace.
    pub template_dir: PathBuf,
    pub profile_name: String,
    pub threads: u32,
    pub lessons: Vec<Lesson>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir().join("dbt_workspaces"),
            template_dir: PathBuf::from("dbt_project"),
            profile_name: "decode_dbt".into(),
            threads: 4,
            lessons: default_lessons(),
        }
    }
}

impl CoreConfig {
    /// Discover, parse and env-override the config.
    pub fn load() -> Result<Self, ConfigError> {
        let (path, source) = discovered_config_path();
        let mut cfg = match path {
            Some(path) => {
                let cfg = Self::from_file(&path)?;
                info!(target: "decode::config", path = %path.display(), source, "loaded config file");
                cfg
            }
            None => Self::default(),
        };
        cfg.apply_env_overrides_from(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply `DECODE_*` overrides using `lookup` as the environment.
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(token) = get("DECODE_WAREHOUSE_TOKEN") {
            self.runner.warehouse_token = Some(token);
        }
        if let Some(program) = get("DECODE_DBT_BIN") {
            self.runner.program = program;
        }
        if let Some(secs) = parse_env(&get, "DECODE_RUN_TIMEOUT_SECS")? {
            self.runner.timeout_secs = secs;
        }
        if let Some(max) = parse_env(&get, "DECODE_MAX_JOBS")? {
            self.jobs.max_concurrent = max;
        }
        if let Some(limit) = parse_env(&get, "DECODE_RATE_LIMIT")? {
            self.limits.default_limit = limit;
        }
        if let Some(limit) = parse_env(&get, "DECODE_RATE_LIMIT_EXPENSIVE")? {
            self.limits.expensive_limit = limit;
        }
        if let Some(secs) = parse_env(&get, "DECODE_RATE_WINDOW_SECS")? {
            self.limits.window_secs = secs;
        }
        if let Some(max) = parse_env(&get, "DECODE_MAX_INFLIGHT")? {
            self.limits.max_inflight_per_user = max;
        }
        if let Some(dir) = get("DECODE_WORKSPACE_DIR") {
            self.workspace.base_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get("DECODE_TEMPLATE_DIR") {
            self.workspace.template_dir = PathBuf::from(dir);
        }
        if let Some(db) = get("DECODE_WAREHOUSE_DB") {
            self.pool.database = PathBuf::from(db);
        }
        if let Some(share) = get("DECODE_SHARE") {
            self.pool.share = share;
        }
        Ok(())
    }

    /// The warehouse credential; its absence is fatal at startup.
    pub fn warehouse_token(&self) -> Result<&str, ConfigError> {
        self.runner
            .warehouse_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or(ConfigError::MissingCredential)
    }
}

fn parse_env<T, G>(get: &G, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|_| ConfigError::InvalidValue { key, value: raw })
        })
        .transpose()
}

fn discovered_config_path() -> (Option<PathBuf>, &'static str) {
    if let Ok(explicit) = std::env::var("DECODE_CONFIG") {
        if !explicit.trim().is_empty() {
            return (Some(PathBuf::from(explicit)), "env");
        }
    }
    let fallback = PathBuf::from(DEFAULT_CONFIG_PATH);
    if fallback.is_file() {
        (Some(fallback), "search")
    } else {
        (None, "defaults")
    }
}
