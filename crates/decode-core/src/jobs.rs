use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::admission::AdmissionError;

/// Opaque job handle handed to clients.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for JobId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Run,
    Seed,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Run => "run",
            JobKind::Seed => "seed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobFailure {
    Exit(i32),
    TimedOut(Duration),
    Internal(String),
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobFailure::Exit(code) => write!(f, "exit code {code}"),
            JobFailure::TimedOut(after) => write!(f, "timed out after {}s", after.as_secs()),
            JobFailure::Internal(text) => f.write_str(text),
        }
    }
}

/// One entry in a job's output queue. The last two are terminal sentinels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobEvent {
    Line(String),
    Completed,
    Failed(JobFailure),
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobEvent::Line(_))
    }
}

pub(crate) type JobReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<JobEvent>>>;

/// One tracked asynchronous tool invocation.
pub struct Job {
    id: JobId,
    kind: JobKind,
    targets: Vec<String>,
    created_at: Instant,
    pid: OnceLock<u32>,
    tx: mpsc::UnboundedSender<JobEvent>,
    rx: JobReceiver,
    finished: AtomicBool,
    finished_at: Mutex<Option<Instant>>,
}

impl Job {
    fn new(kind: JobKind, targets: Vec<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            id: JobId::generate(),
            kind,
            targets,
            created_at: Instant::now(),
            pid: OnceLock::new(),
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            finished: AtomicBool::new(false),
            finished_at: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn finished_at(&self) -> Option<Instant> {
        *self.finished_at.lock()
    }

    pub(crate) fn set_pid(&self, pid: u32) {
        let _ = self.pid.set(pid);
    }

    /// Append to the queue. Events pushed after the publisher dropped the
    /// receiver are discarded.
    pub(crate) fn push(&self, event: JobEvent) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn mark_finished(&self) {
        *self.finished_at.lock() = Some(Instant::now());
        self.finished.store(true, Ordering::Release);
    }

    pub(crate) fn receiver(&self) -> JobReceiver {
        self.rx.clone()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("targets", &self.targets)
            .field("pid", &self.pid())
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub kind: JobKind,
    pub targets: Vec<String>,
    pub pid: Option<u32>,
    pub finished: bool,
    pub age_ms: u64,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            kind: job.kind,
            targets: job.targets.clone(),
            pid: job.pid(),
            finished: job.is_finished(),
            age_ms: job.age().as_millis().min(u128::from(u64::MAX)) as u64,
        }
    }
}

/// Process-wide table of live jobs with a ceiling on tracked entries.
pub struct JobRegistry {
    max_concurrent: usize,
    jobs: Mutex<HashMap<JobId, Arc<Job>>>,
}

impl JobRegistry {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Create and insert a job unless the ceiling is already reached.
    pub fn try_register(
        &self,
        kind: JobKind,
        targets: Vec<String>,
    ) -> Result<Arc<Job>, AdmissionError> {
        let mut jobs = self.jobs.lock();
        if jobs.len() >= self.max_concurrent {
            drop(jobs);
            let err = AdmissionError::JobCeiling {
                limit: self.max_concurrent,
            };
            err.record();
            return Err(err);
        }
        let job = Arc::new(Job::new(kind, targets));
        jobs.insert(job.id.clone(), job.clone());
        debug!(target: "decode::jobs", job_id = %job.id, kind = kind.as_str(), tracked = jobs.len(), "job registered");
        Ok(job)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Job>> {
        self.jobs.lock().get(id).cloned()
    }

    /// Remove a job; absent ids are ignored.
    pub fn remove(&self, id: &str) -> Option<Arc<Job>> {
        let removed = self.jobs.lock().remove(id);
        if removed.is_some() {
            debug!(target: "decode::jobs", job_id = id, "job removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Summaries ordered oldest first.
    pub fn snapshot(&self) -> Vec<JobSummary> {
        let mut out: Vec<JobSummary> = self
            .jobs
            .lock()
            .values()
            .map(|job| JobSummary::from(job.as_ref()))
            .collect();
        out.sort_by(|a, b| b.age_ms.cmp(&a.age_ms));
        out
    }

    /// Drop jobs that finished at least `grace` ago without being drained.
    pub fn reap_finished(&self, grace: Duration) -> usize {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|_, job| match job.finished_at() {
            Some(at) => at.elapsed() < grace,
            None => true,
        });
        let reaped = before - jobs.len();
        drop(jobs);
        if reaped > 0 {
            metrics::counter!("decode_jobs_reaped_total").increment(reaped as u64);
            info!(target: "decode::jobs", reaped, "reaped undrained jobs");
        }
        reaped
    }
}
