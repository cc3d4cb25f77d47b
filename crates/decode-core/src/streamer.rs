//! Per-job output pump: forwards the child's merged output into the job
//! queue, enforces the wall-clock timeout and records the terminal outcome.

use std::any::Any;
use std::future::Future;
use std::io::{self, BufRead, BufReader, PipeReader};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::jobs::{Job, JobEvent, JobFailure};

#[derive(Clone, Copy, Debug)]
pub(crate) struct StreamSettings {
    pub timeout: Duration,
    /// How long to keep reading after exit before giving up on the pipe.
    pub drain_grace: Duration,
}

pub(crate) type LineReceiver = mpsc::UnboundedReceiver<io::Result<String>>;

/// Start a dedicated thread turning the merged pipe into lines.
pub(crate) fn spawn_line_reader(output: PipeReader) -> io::Result<LineReceiver> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::Builder::new()
        .name("decode-output".into())
        .spawn(move || {
            let mut reader = BufReader::new(output);
            let mut buf = Vec::with_capacity(256);
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf)
                            .trim_end_matches(['\r', '\n'])
                            .to_string();
                        if tx.send(Ok(line)).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        break;
                    }
                }
            }
        })?;
    Ok(rx)
}

/// Sets the finished flag however the pump exits.
struct FinishGuard(Arc<Job>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.mark_finished();
    }
}

pub(crate) fn spawn(
    job: Arc<Job>,
    child: Child,
    lines: LineReceiver,
    settings: StreamSettings,
) -> JoinHandle<()> {
    let work = pump(job.clone(), child, lines, settings);
    supervise(job, work)
}

/// Run `work` to its terminal event, turning a panic into an internal failure.
fn supervise<F>(job: Arc<Job>, work: F) -> JoinHandle<()>
where
    F: Future<Output = JobEvent> + Send + 'static,
{
    tokio::spawn(async move {
        let guard = FinishGuard(job.clone());
        let terminal = match AssertUnwindSafe(work).catch_unwind().await {
            Ok(event) => event,
            Err(panic) => JobEvent::Failed(JobFailure::Internal(panic_text(panic.as_ref()))),
        };
        let outcome = match &terminal {
            JobEvent::Completed => "completed",
            JobEvent::Failed(JobFailure::Exit(_)) => "failed",
            JobEvent::Failed(JobFailure::TimedOut(_)) => "timeout",
            _ => "internal",
        };
        metrics::counter!("decode_jobs_finished_total", "outcome" => outcome).increment(1);
        info!(
            target: "decode::runner",
            job_id = %job.id(),
            outcome,
            elapsed_ms = job.age().as_millis() as u64,
            "job finished"
        );
        job.push(terminal);
        drop(guard);
    })
}

async fn pump(
    job: Arc<Job>,
    mut child: Child,
    mut lines: LineReceiver,
    settings: StreamSettings,
) -> JobEvent {
    let deadline = Instant::now() + settings.timeout;
    let mut eof = false;

    let status = loop {
        tokio::select! {
            biased;
            _ = sleep_until(deadline) => {
                warn!(
                    target: "decode::runner",
                    job_id = %job.id(),
                    timeout_secs = settings.timeout.as_secs(),
                    "job timed out; killing child"
                );
                kill_quietly(&job, &mut child).await;
                return JobEvent::Failed(JobFailure::TimedOut(settings.timeout));
            }
            line = lines.recv(), if !eof => match line {
                Some(Ok(line)) => job.push(JobEvent::Line(line)),
                Some(Err(err)) => {
                    kill_quietly(&job, &mut child).await;
                    return JobEvent::Failed(JobFailure::Internal(format!("reading output: {err}")));
                }
                None => eof = true,
            },
            status = child.wait() => match status {
                Ok(status) => break status,
                Err(err) => {
                    kill_quietly(&job, &mut child).await;
                    return JobEvent::Failed(JobFailure::Internal(format!("waiting for child: {err}")));
                }
            },
        }
    };

    if !eof {
        let drain_deadline = Instant::now() + settings.drain_grace;
        loop {
            match timeout_at(drain_deadline, lines.recv()).await {
                Ok(Some(Ok(line))) => job.push(JobEvent::Line(line)),
                Ok(Some(Err(err))) => {
                    debug!(target: "decode::runner", job_id = %job.id(), error = %err, "output read failed after exit");
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        target: "decode::runner",
                        job_id = %job.id(),
                        "output pipe still open after exit; remaining output dropped"
                    );
                    break;
                }
            }
        }
    }

    match status.code() {
        Some(0) => JobEvent::Completed,
        Some(code) => JobEvent::Failed(JobFailure::Exit(code)),
        None => JobEvent::Failed(JobFailure::Exit(-1)),
    }
}

async fn kill_quietly(job: &Job, child: &mut Child) {
    if let Err(err) = child.kill().await {
        debug!(target: "decode::runner", job_id = %job.id(), error = %err, "kill failed");
    }
}

fn panic_text(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("output streamer panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("output streamer panicked: {msg}")
    } else {
        "output streamer panicked".to_string()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::jobs::{JobKind, JobRegistry};
    use std::process::Stdio;

    fn spawn_sh(script: &str) -> (Child, LineReceiver) {
        let (reader, writer) = std::io::pipe().expect("pipe");
        let stderr = writer.try_clone().expect("clone writer");
        let mut cmd = tokio::process::Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(writer)
            .stderr(stderr)
            .kill_on_drop(true);
        let child = cmd.spawn().expect("spawn sh");
        drop(cmd);
        (child, spawn_line_reader(reader).expect("reader"))
    }

    async fn collect(job: &Job) -> Vec<JobEvent> {
        let rx = job.receiver();
        let mut rx = rx.lock().await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = event.is_terminal();
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    fn settings(timeout: Duration) -> StreamSettings {
        StreamSettings {
            timeout,
            drain_grace: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn merged_output_then_exit_code() {
        let registry = JobRegistry::new(1);
        let job = registry.try_register(JobKind::Run, vec![]).expect("register");
        let (child, lines) = spawn_sh("echo out; echo err 1>&2; printf 'crlf\\r\\n'; exit 3");
        spawn(job.clone(), child, lines, settings(Duration::from_secs(10)))
            .await
            .expect("join");

        assert!(job.is_finished());
        assert_eq!(
            collect(&job).await,
            vec![
                JobEvent::Line("out".into()),
                JobEvent::Line("err".into()),
                JobEvent::Line("crlf".into()),
                JobEvent::Failed(JobFailure::Exit(3)),
            ]
        );
    }

    #[tokio::test]
    async fn timeout_kills_child() {
        let registry = JobRegistry::new(1);
        let job = registry.try_register(JobKind::Run, vec![]).expect("register");
        let (child, lines) = spawn_sh("echo started; exec sleep 30");
        let started = std::time::Instant::now();
        spawn(job.clone(), child, lines, settings(Duration::from_millis(300)))
            .await
            .expect("join");

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(job.is_finished());
        let events = collect(&job).await;
        assert_eq!(events.first(), Some(&JobEvent::Line("started".into())));
        assert_eq!(
            events.last(),
            Some(&JobEvent::Failed(JobFailure::TimedOut(Duration::from_millis(300))))
        );
    }

    fn alive(pid: u32) -> bool {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn read_error_kills_child_and_fails_internally() {
        let registry = JobRegistry::new(1);
        let job = registry.try_register(JobKind::Run, vec![]).expect("register");
        let (child, _real) = spawn_sh("exec sleep 30");
        let pid = child.id().expect("pid");
        let (tx, lines) = mpsc::unbounded_channel();
        tx.send(Err(io::Error::other("boom"))).expect("send");

        let started = std::time::Instant::now();
        spawn(job.clone(), child, lines, settings(Duration::from_secs(10)))
            .await
            .expect("join");

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(job.is_finished());
        assert!(!alive(pid));
        match collect(&job).await.as_slice() {
            [JobEvent::Failed(JobFailure::Internal(msg))] => {
                assert!(msg.contains("reading output: boom"), "{msg}");
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[tokio::test]
    async fn panicking_pump_still_marks_job_finished() {
        let registry = JobRegistry::new(1);
        let job = registry.try_register(JobKind::Run, vec![]).expect("register");

        async fn explode() -> JobEvent {
            panic!("decoder blew up")
        }

        supervise(job.clone(), explode())
            .await
            .expect("panic is caught inside the task");

        assert!(job.is_finished());
        assert_eq!(
            collect(&job).await,
            vec![JobEvent::Failed(JobFailure::Internal(
                "output streamer panicked: decoder blew up".into()
            ))]
        );
    }
}
