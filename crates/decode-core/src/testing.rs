//! Fixtures shared by the process-level tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::CoreConfig;
use crate::jobs::JobRegistry;
use crate::runner::ProcessRunner;
use crate::workspace::Workspace;

/// Stand-in tool: `/bin/sh <script> <subcommand> ...`.
pub(crate) fn fake_tool(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("tool.sh");
    std::fs::write(&path, body).expect("write tool script");
    path
}

pub(crate) fn initialized_workspace(dir: &Path, lesson: &str) -> Workspace {
    let root = dir.join("user_7").join(lesson);
    std::fs::create_dir_all(&root).expect("workspace root");
    std::fs::write(root.join("dbt_project.yml"), "name: decode\n").expect("project file");
    Workspace::new("7", lesson, root, format!("models/{lesson}"))
}

pub(crate) fn config(script: &Path) -> CoreConfig {
    let mut cfg = CoreConfig::default();
    cfg.runner.program = "/bin/sh".into();
    cfg.runner.program_args = vec![script.display().to_string()];
    cfg.runner.warehouse_token = Some("test-token".into());
    cfg.runner.timeout_secs = 10;
    cfg.runner.drain_grace_ms = 500;
    cfg
}

pub(crate) fn runner(cfg: &CoreConfig, max_jobs: usize) -> (ProcessRunner, Arc<JobRegistry>) {
    let registry = Arc::new(JobRegistry::new(max_jobs));
    let runner = ProcessRunner::new(cfg, registry.clone()).expect("runner");
    (runner, registry)
}
