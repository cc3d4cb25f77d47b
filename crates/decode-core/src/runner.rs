//! Launches the transformation tool inside a workspace, either to completion
//! or as a tracked job whose output is streamed.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::admission::AdmissionError;
use crate::config::{ConfigError, CoreConfig};
use crate::jobs::{JobId, JobKind, JobRegistry};
use crate::streamer::{self, StreamSettings};
use crate::workspace::{is_safe_token, Workspace};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Workspace not initialized: {}", .0.display())]
    WorkspaceNotInitialized(PathBuf),
    #[error("No models selected")]
    EmptySelection,
    #[error("Invalid model name: {0}")]
    InvalidTarget(String),
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("Execution timed out after {} seconds", .0.as_secs())]
    TimedOut(Duration),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error("tool i/o: {0}")]
    Io(#[from] io::Error),
}

/// Which models to act on and how.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModelSelection {
    pub targets: Vec<String>,
    pub include_descendants: bool,
    pub full_refresh: bool,
}

impl ModelSelection {
    pub fn new<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn include_descendants(mut self, yes: bool) -> Self {
        self.include_descendants = yes;
        self
    }

    pub fn full_refresh(mut self, yes: bool) -> Self {
        self.full_refresh = yes;
        self
    }

    /// Targets with surrounding whitespace removed and blanks dropped.
    pub fn normalized_targets(&self) -> Vec<String> {
        self.trimmed().map(str::to_string).collect()
    }

    fn trimmed(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(|t| t.trim()).filter(|t| !t.is_empty())
    }

    /// One `--select` value covering every target, space separated.
    pub fn selector(&self) -> Result<String, RunError> {
        let targets: Vec<&str> = self.trimmed().collect();
        if targets.is_empty() {
            return Err(RunError::EmptySelection);
        }
        if let Some(bad) = targets.iter().find(|t| !is_safe_token(t)) {
            return Err(RunError::InvalidTarget((*bad).to_string()));
        }
        let suffix = if self.include_descendants { "+" } else { "" };
        Ok(targets
            .iter()
            .map(|t| format!("{t}{suffix}"))
            .collect::<Vec<_>>()
            .join(" "))
    }
}

/// Result of a run awaited to completion. A non-zero exit is reported here,
/// not as an error.
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub targets: Vec<String>,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub output: String,
}

impl RunReport {
    fn from_output(targets: Vec<String>, output: Captured) -> Self {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Self {
            targets,
            success: output.status.success(),
            exit_code: output.status.code(),
            output: format!("{stdout}\n{stderr}"),
        }
    }
}

/// Exit status plus whatever each pipe yielded before the drain deadline.
struct Captured {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// Accumulates one pipe in the background so a partial read survives an abort.
struct PipeCapture {
    buf: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl PipeCapture {
    fn start<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = buf.clone();
        let task = tokio::spawn(async move {
            let Some(mut pipe) = pipe else { return };
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => sink.lock().extend_from_slice(&chunk[..n]),
                    Err(err) => {
                        debug!(target: "decode::runner", error = %err, "pipe read failed");
                        break;
                    }
                }
            }
        });
        Self { buf, task }
    }

    /// Wait for EOF until `deadline`, then keep what was read.
    async fn finish(mut self, deadline: Instant) -> Vec<u8> {
        if tokio::time::timeout_at(deadline, &mut self.task).await.is_err() {
            self.task.abort();
            warn!(
                target: "decode::runner",
                "output pipe still open after exit; remaining output dropped"
            );
        }
        std::mem::take(&mut *self.buf.lock())
    }

    fn cancel(self) {
        self.task.abort();
    }
}

#[derive(Clone, Debug)]
pub enum SeedOutcome {
    Loaded(RunReport),
    NothingToLoad(String),
}

#[derive(Clone, Debug)]
pub enum SeedLaunch {
    Started(JobId),
    NothingToLoad(String),
}

/// Builds tool invocations and hands streaming runs to the output streamer.
pub struct ProcessRunner {
    program: String,
    program_args: Vec<String>,
    token: String,
    token_env: String,
    profiles_env: String,
    timeout: Duration,
    drain_grace: Duration,
    registry: Arc<JobRegistry>,
}

impl ProcessRunner {
    /// Fails when the warehouse credential is missing.
    pub fn new(cfg: &CoreConfig, registry: Arc<JobRegistry>) -> Result<Self, ConfigError> {
        let token = cfg.warehouse_token()?.to_string();
        Ok(Self {
            program: cfg.runner.program.clone(),
            program_args: cfg.runner.program_args.clone(),
            token,
            token_env: cfg.runner.token_env.clone(),
            profiles_env: cfg.runner.profiles_env.clone(),
            timeout: cfg.runner.timeout(),
            drain_grace: cfg.runner.drain_grace(),
            registry,
        })
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run the selected models and wait for the tool to exit.
    pub async fn run_models(
        &self,
        workspace: &Workspace,
        selection: &ModelSelection,
    ) -> Result<RunReport, RunError> {
        ensure_initialized(workspace)?;
        let selector = selection.selector()?;
        let output = self
            .run_to_completion(workspace, "run", &selector, selection.full_refresh)
            .await?;
        Ok(RunReport::from_output(selection.normalized_targets(), output))
    }

    /// Start the selected models as a job and return its id without waiting.
    pub fn start_models(
        &self,
        workspace: &Workspace,
        selection: &ModelSelection,
    ) -> Result<JobId, RunError> {
        ensure_initialized(workspace)?;
        let selector = selection.selector()?;
        self.launch(
            workspace,
            JobKind::Run,
            selection.normalized_targets(),
            "run",
            &selector,
            selection.full_refresh,
        )
    }

    /// Load the lesson's seed files and wait for the tool to exit.
    pub async fn load_seeds(&self, workspace: &Workspace) -> Result<SeedOutcome, RunError> {
        ensure_initialized(workspace)?;
        if let Some(message) = nothing_to_seed(workspace)? {
            return Ok(SeedOutcome::NothingToLoad(message));
        }
        let selector = workspace.seed_selector();
        let output = self
            .run_to_completion(workspace, "seed", &selector, false)
            .await?;
        Ok(SeedOutcome::Loaded(RunReport::from_output(
            vec![selector],
            output,
        )))
    }

    pub fn start_seeds(&self, workspace: &Workspace) -> Result<SeedLaunch, RunError> {
        ensure_initialized(workspace)?;
        if let Some(message) = nothing_to_seed(workspace)? {
            return Ok(SeedLaunch::NothingToLoad(message));
        }
        let selector = workspace.seed_selector();
        self.launch(
            workspace,
            JobKind::Seed,
            vec![selector.clone()],
            "seed",
            &selector,
            false,
        )
        .map(SeedLaunch::Started)
    }

    /// Full argument vector after the program name.
    pub fn args(
        &self,
        subcommand: &str,
        selector: &str,
        root: &Path,
        full_refresh: bool,
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.program_args.iter().map(OsString::from).collect();
        args.extend([
            subcommand.into(),
            "--select".into(),
            selector.into(),
            "--profiles-dir".into(),
            root.as_os_str().to_owned(),
            "--project-dir".into(),
            root.as_os_str().to_owned(),
            "--fail-fast".into(),
        ]);
        if full_refresh {
            args.push("--full-refresh".into());
        }
        args
    }

    fn command(
        &self,
        workspace: &Workspace,
        subcommand: &str,
        selector: &str,
        full_refresh: bool,
    ) -> Command {
        let root = workspace.root();
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args(subcommand, selector, root, full_refresh))
            .env(&self.token_env, &self.token)
            .env(&self.profiles_env, root)
            .current_dir(root)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    async fn run_to_completion(
        &self,
        workspace: &Workspace,
        subcommand: &str,
        selector: &str,
        full_refresh: bool,
    ) -> Result<Captured, RunError> {
        let mut cmd = self.command(workspace, subcommand, selector, full_refresh);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|source| self.spawn_error(source))?;
        info!(
            target: "decode::runner",
            user = workspace.user_id(),
            lesson = workspace.lesson_id(),
            subcommand,
            selector,
            pid = child.id(),
            "tool started"
        );
        let stdout = PipeCapture::start(child.stdout.take());
        let stderr = PipeCapture::start(child.stderr.take());

        // Exit decides completion; a grandchild holding the pipes only costs the drain grace.
        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(
                    target: "decode::runner",
                    user = workspace.user_id(),
                    lesson = workspace.lesson_id(),
                    timeout_secs = self.timeout.as_secs(),
                    "tool timed out"
                );
                if let Err(err) = child.kill().await {
                    debug!(target: "decode::runner", error = %err, "kill failed");
                }
                stdout.cancel();
                stderr.cancel();
                return Err(RunError::TimedOut(self.timeout));
            }
        };
        let deadline = Instant::now() + self.drain_grace;
        Ok(Captured {
            status,
            stdout: stdout.finish(deadline).await,
            stderr: stderr.finish(deadline).await,
        })
    }

    fn launch(
        &self,
        workspace: &Workspace,
        kind: JobKind,
        targets: Vec<String>,
        subcommand: &str,
        selector: &str,
        full_refresh: bool,
    ) -> Result<JobId, RunError> {
        let job = self.registry.try_register(kind, targets)?;
        let spawned = self.spawn_streaming(workspace, subcommand, selector, full_refresh);
        let (child, lines) = match spawned {
            Ok(spawned) => spawned,
            Err(err) => {
                self.registry.remove(job.id().as_str());
                return Err(err);
            }
        };
        if let Some(pid) = child.id() {
            job.set_pid(pid);
        }
        metrics::counter!("decode_jobs_started_total", "kind" => kind.as_str()).increment(1);
        info!(
            target: "decode::runner",
            job_id = %job.id(),
            user = workspace.user_id(),
            lesson = workspace.lesson_id(),
            kind = kind.as_str(),
            selector,
            pid = job.pid(),
            "job started"
        );
        streamer::spawn(
            job.clone(),
            child,
            lines,
            StreamSettings {
                timeout: self.timeout,
                drain_grace: self.drain_grace,
            },
        );
        Ok(job.id().clone())
    }

    fn spawn_streaming(
        &self,
        workspace: &Workspace,
        subcommand: &str,
        selector: &str,
        full_refresh: bool,
    ) -> Result<(tokio::process::Child, streamer::LineReceiver), RunError> {
        let (reader, writer) = io::pipe()?;
        let stderr = writer.try_clone()?;
        let mut cmd = self.command(workspace, subcommand, selector, full_refresh);
        cmd.env("PYTHONUNBUFFERED", "1").stdout(writer).stderr(stderr);
        let child = cmd.spawn().map_err(|source| self.spawn_error(source))?;
        // Close our copies of the write end so EOF follows the child's exit.
        drop(cmd);
        let lines = streamer::spawn_line_reader(reader)?;
        Ok((child, lines))
    }

    fn spawn_error(&self, source: io::Error) -> RunError {
        warn!(target: "decode::runner", program = %self.program, error = %source, "spawn failed");
        RunError::Spawn {
            program: self.program.clone(),
            source,
        }
    }
}

fn ensure_initialized(workspace: &Workspace) -> Result<(), RunError> {
    if workspace.is_initialized() {
        Ok(())
    } else {
        Err(RunError::WorkspaceNotInitialized(workspace.root().to_path_buf()))
    }
}

fn nothing_to_seed(workspace: &Workspace) -> Result<Option<String>, RunError> {
    if !workspace.seed_dir().is_dir() {
        return Ok(Some(format!(
            "No seed directory for lesson {}; nothing to load",
            workspace.lesson_id()
        )));
    }
    if !workspace.has_seed_files()? {
        return Ok(Some(format!(
            "No seed files found for lesson {}; nothing to load",
            workspace.lesson_id()
        )));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn selector_joins_targets_with_descendant_marker() {
        let sel = ModelSelection::new(["stg_orders", " customers "]).include_descendants(true);
        assert_eq!(sel.selector().expect("selector"), "stg_orders+ customers+");
        let plain = ModelSelection::new(["stg_orders"]);
        assert_eq!(plain.selector().expect("selector"), "stg_orders");

        assert!(matches!(
            ModelSelection::new(["", "  "]).selector(),
            Err(RunError::EmptySelection)
        ));
        assert!(matches!(
            ModelSelection::new(["a; rm -rf /"]).selector(),
            Err(RunError::InvalidTarget(_))
        ));
    }

    #[test]
    fn args_follow_invocation_surface() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = testing::config(&dir.path().join("tool.sh"));
        let (runner, _) = testing::runner(&cfg, 3);
        let args = runner.args("run", "a+ b+", Path::new("/ws"), true);
        let args: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let script = dir.path().join("tool.sh").display().to_string();
        assert_eq!(
            args,
            vec![
                script.as_str(),
                "run",
                "--select",
                "a+ b+",
                "--profiles-dir",
                "/ws",
                "--project-dir",
                "/ws",
                "--fail-fast",
                "--full-refresh",
            ]
        );
    }

    #[test]
    fn missing_token_refuses_to_build() {
        let cfg = CoreConfig::default();
        let registry = Arc::new(JobRegistry::new(1));
        assert!(matches!(
            ProcessRunner::new(&cfg, registry),
            Err(ConfigError::MissingCredential)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sync_run_reports_output_env_and_exit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tool = testing::fake_tool(
            dir.path(),
            "echo \"cmd=$1 sel=$3\"\necho \"token=$MOTHERDUCK_TOKEN\"\necho \"profiles=$DBT_PROFILES_DIR\"\necho \"cwd=$(pwd)\"\necho oops 1>&2\nexit 0\n",
        );
        let ws = testing::initialized_workspace(dir.path(), "fintech");
        let (runner, _) = testing::runner(&testing::config(&tool), 3);

        let sel = ModelSelection::new(["stg_payments", "fct_daily"]).include_descendants(true);
        let report = runner.run_models(&ws, &sel).await.expect("run");
        assert!(report.success);
        assert_eq!(report.exit_code, Some(0));
        assert_eq!(report.targets, vec!["stg_payments", "fct_daily"]);
        assert!(report.output.contains("cmd=run sel=stg_payments+ fct_daily+"));
        assert!(report.output.contains("token=test-token"));
        let root = ws.root().canonicalize().expect("canonical root");
        assert!(report.output.contains(&format!("profiles={}", ws.root().display())));
        assert!(report.output.contains(&format!("cwd={}", root.display())));
        assert!(report.output.ends_with("\noops\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sync_run_failure_is_a_report_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tool = testing::fake_tool(dir.path(), "echo 'Compilation Error'\nexit 2\n");
        let ws = testing::initialized_workspace(dir.path(), "fintech");
        let (runner, _) = testing::runner(&testing::config(&tool), 3);

        let report = runner
            .run_models(&ws, &ModelSelection::new(["broken"]))
            .await
            .expect("run");
        assert!(!report.success);
        assert_eq!(report.exit_code, Some(2));
        assert!(report.output.contains("Compilation Error"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sync_run_times_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tool = testing::fake_tool(dir.path(), "exec sleep 30\n");
        let ws = testing::initialized_workspace(dir.path(), "fintech");
        let mut cfg = testing::config(&tool);
        cfg.runner.timeout_secs = 1;
        let (runner, _) = testing::runner(&cfg, 3);

        let started = std::time::Instant::now();
        let err = runner
            .run_models(&ws, &ModelSelection::new(["slow"]))
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(err, RunError::TimedOut(d) if d == Duration::from_secs(1)));
        assert_eq!(err.to_string(), "Execution timed out after 1 seconds");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sync_run_finishes_when_background_child_keeps_pipe_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tool = testing::fake_tool(dir.path(), "sleep 5 &\necho done\nexit 0\n");
        let ws = testing::initialized_workspace(dir.path(), "fintech");
        let mut cfg = testing::config(&tool);
        cfg.runner.timeout_secs = 2;
        let (runner, _) = testing::runner(&cfg, 3);

        let started = std::time::Instant::now();
        let report = runner
            .run_models(&ws, &ModelSelection::new(["quick"]))
            .await
            .expect("exit decides completion");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(report.success);
        assert!(report.output.contains("done"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn report_targets_are_trimmed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tool = testing::fake_tool(dir.path(), "exit 0\n");
        let ws = testing::initialized_workspace(dir.path(), "fintech");
        let (runner, registry) = testing::runner(&testing::config(&tool), 3);

        let sel = ModelSelection::new([" stg_orders ", "", "  "]);
        assert_eq!(sel.normalized_targets(), vec!["stg_orders"]);
        let report = runner.run_models(&ws, &sel).await.expect("run");
        assert_eq!(report.targets, vec!["stg_orders"]);

        let id = runner.start_models(&ws, &sel).expect("start");
        let job = registry.get(id.as_str()).expect("registered");
        assert_eq!(job.targets().to_vec(), vec!["stg_orders".to_string()]);
    }

    #[tokio::test]
    async fn uninitialized_workspace_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = testing::config(&dir.path().join("tool.sh"));
        let (runner, registry) = testing::runner(&cfg, 3);
        let ws = Workspace::new("7", "fintech", dir.path().join("missing"), "models/fintech");

        assert!(matches!(
            runner.run_models(&ws, &ModelSelection::new(["a"])).await,
            Err(RunError::WorkspaceNotInitialized(_))
        ));
        assert!(matches!(
            runner.start_models(&ws, &ModelSelection::new(["a"])),
            Err(RunError::WorkspaceNotInitialized(_))
        ));
        assert!(registry.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn seeds_without_files_are_benign() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tool = testing::fake_tool(dir.path(), "exit 1\n");
        let ws = testing::initialized_workspace(dir.path(), "cafe_chain");
        let (runner, registry) = testing::runner(&testing::config(&tool), 3);

        match runner.load_seeds(&ws).await.expect("seed") {
            SeedOutcome::NothingToLoad(msg) => assert!(msg.contains("No seed directory")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        std::fs::create_dir_all(ws.seed_dir()).expect("seed dir");
        match runner.start_seeds(&ws).expect("seed") {
            SeedLaunch::NothingToLoad(msg) => assert!(msg.contains("No seed files")),
            other => panic!("unexpected launch: {other:?}"),
        }
        assert!(registry.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn seeds_select_lesson_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tool = testing::fake_tool(dir.path(), "echo \"$1 $3\"\n");
        let ws = testing::initialized_workspace(dir.path(), "cafe_chain");
        std::fs::create_dir_all(ws.seed_dir()).expect("seed dir");
        std::fs::write(ws.seed_dir().join("stores.csv"), "id\n1\n").expect("csv");
        let (runner, _) = testing::runner(&testing::config(&tool), 3);

        match runner.load_seeds(&ws).await.expect("seed") {
            SeedOutcome::Loaded(report) => {
                assert!(report.success);
                assert!(report.output.contains("seed path:seeds/cafe_chain"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn async_start_respects_ceiling_and_cleans_up_failed_spawn() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tool = testing::fake_tool(dir.path(), "exec sleep 30\n");
        let ws = testing::initialized_workspace(dir.path(), "fintech");
        let cfg = testing::config(&tool);
        let (runner, registry) = testing::runner(&cfg, 1);

        let id = runner
            .start_models(&ws, &ModelSelection::new(["a"]))
            .expect("start");
        let job = registry.get(id.as_str()).expect("registered");
        assert!(job.pid().is_some());
        assert!(matches!(
            runner.start_models(&ws, &ModelSelection::new(["b"])),
            Err(RunError::Admission(AdmissionError::JobCeiling { limit: 1 }))
        ));
        registry.remove(id.as_str());

        let mut broken = cfg.clone();
        broken.runner.program = dir.path().join("no-such-tool").display().to_string();
        broken.runner.program_args.clear();
        let broken_runner = ProcessRunner::new(&broken, registry.clone()).expect("runner");
        assert!(matches!(
            broken_runner.start_models(&ws, &ModelSelection::new(["a"])),
            Err(RunError::Spawn { .. })
        ));
        assert!(registry.is_empty());
    }
}
