use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, Stream};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::jobs::{Job, JobEvent, JobFailure, JobRegistry};

/// One server-push event for a log stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    Line(String),
    Completed,
    Failed(JobFailure),
    NotFound,
}

impl StreamEvent {
    /// Wire payload; terminal events use reserved markers.
    pub fn payload(&self) -> String {
        match self {
            StreamEvent::Line(line) => line.clone(),
            StreamEvent::Completed => "[DONE]".to_string(),
            StreamEvent::Failed(failure) => format!("[ERROR] {failure}"),
            StreamEvent::NotFound => "[NOT_FOUND]".to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Line(_))
    }
}

impl From<JobEvent> for StreamEvent {
    fn from(event: JobEvent) -> Self {
        match event {
            JobEvent::Line(line) => StreamEvent::Line(line),
            JobEvent::Completed => StreamEvent::Completed,
            JobEvent::Failed(failure) => StreamEvent::Failed(failure),
        }
    }
}

type Queue = OwnedMutexGuard<UnboundedReceiver<JobEvent>>;

enum State {
    Attach(String),
    Draining { job: Arc<Job>, queue: Queue },
    Done,
}

/// Drains job queues into per-request event streams.
#[derive(Clone)]
pub struct LogStreamPublisher {
    registry: Arc<JobRegistry>,
    poll: Duration,
}

impl LogStreamPublisher {
    pub fn new(registry: Arc<JobRegistry>, poll: Duration) -> Self {
        Self { registry, poll }
    }

    /// Events for one job, ending with exactly one terminal event.
    ///
    /// Attaching is exclusive: a second stream for the same job waits until
    /// the first is dropped, then resumes from where it stopped. The job is
    /// removed from the registry when the terminal event is produced.
    pub fn stream(&self, job_id: &str) -> impl Stream<Item = StreamEvent> + Send + 'static {
        let this = self.clone();
        stream::unfold(State::Attach(job_id.to_string()), move |state| {
            let this = this.clone();
            async move {
                match state {
                    State::Attach(id) => {
                        let Some(job) = this.registry.get(&id) else {
                            debug!(target: "decode::jobs", job_id = %id, "log stream for unknown job");
                            return Some((StreamEvent::NotFound, State::Done));
                        };
                        let queue = job.receiver().lock_owned().await;
                        // The stream that held the lock may have finished the job meanwhile.
                        if this.registry.get(&id).is_none() {
                            drop(queue);
                            debug!(target: "decode::jobs", job_id = %id, "job finished while waiting to attach");
                            return Some((StreamEvent::NotFound, State::Done));
                        }
                        debug!(target: "decode::jobs", job_id = %id, "log stream attached");
                        Some(this.next_event(job, queue).await)
                    }
                    State::Draining { job, queue } => Some(this.next_event(job, queue).await),
                    State::Done => None,
                }
            }
        })
    }

    async fn next_event(&self, job: Arc<Job>, mut queue: Queue) -> (StreamEvent, State) {
        loop {
            match tokio::time::timeout(self.poll, queue.recv()).await {
                Ok(Some(event)) => return self.emit(job, queue, event),
                // The job keeps its own sender, so the queue cannot close first.
                Ok(None) => return self.finish(&job, StreamEvent::Completed),
                Err(_) if job.is_finished() => {
                    return match queue.try_recv() {
                        Ok(event) => self.emit(job, queue, event),
                        Err(TryRecvError::Empty | TryRecvError::Disconnected) => {
                            self.finish(&job, StreamEvent::Completed)
                        }
                    };
                }
                Err(_) => continue,
            }
        }
    }

    fn emit(&self, job: Arc<Job>, queue: Queue, event: JobEvent) -> (StreamEvent, State) {
        let event = StreamEvent::from(event);
        if event.is_terminal() {
            drop(queue);
            self.finish(&job, event)
        } else {
            (event, State::Draining { job, queue })
        }
    }

    fn finish(&self, job: &Job, event: StreamEvent) -> (StreamEvent, State) {
        self.registry.remove(job.id().as_str());
        debug!(target: "decode::jobs", job_id = %job.id(), payload = %event.payload(), "log stream finished");
        (event, State::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobKind;
    use futures_util::StreamExt;

    fn publisher(registry: &Arc<JobRegistry>) -> LogStreamPublisher {
        LogStreamPublisher::new(registry.clone(), Duration::from_millis(20))
    }

    #[tokio::test]
    async fn unknown_job_yields_single_not_found() {
        let registry = Arc::new(JobRegistry::new(1));
        let events: Vec<_> = publisher(&registry).stream("nope").collect().await;
        assert_eq!(events, vec![StreamEvent::NotFound]);
        assert_eq!(events[0].payload(), "[NOT_FOUND]");
    }

    #[tokio::test]
    async fn queued_sentinel_ends_stream_and_removes_job() {
        let registry = Arc::new(JobRegistry::new(1));
        let job = registry.try_register(JobKind::Run, vec![]).expect("register");
        job.push(JobEvent::Line("A".into()));
        job.push(JobEvent::Failed(JobFailure::Exit(1)));
        job.mark_finished();

        let events: Vec<_> = publisher(&registry).stream(job.id().as_str()).collect().await;
        assert_eq!(
            events.iter().map(StreamEvent::payload).collect::<Vec<_>>(),
            vec!["A".to_string(), "[ERROR] exit code 1".to_string()]
        );
        assert!(registry.get(job.id().as_str()).is_none());

        let again: Vec<_> = publisher(&registry).stream(job.id().as_str()).collect().await;
        assert_eq!(again, vec![StreamEvent::NotFound]);
    }

    #[tokio::test]
    async fn finished_flag_without_sentinel_synthesizes_completion() {
        let registry = Arc::new(JobRegistry::new(1));
        let job = registry.try_register(JobKind::Run, vec![]).expect("register");
        job.push(JobEvent::Line("only".into()));
        job.mark_finished();

        let events: Vec<_> = publisher(&registry).stream(job.id().as_str()).collect().await;
        assert_eq!(
            events,
            vec![StreamEvent::Line("only".into()), StreamEvent::Completed]
        );
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn dropped_stream_keeps_job_and_later_attach_resumes() {
        let registry = Arc::new(JobRegistry::new(1));
        let job = registry.try_register(JobKind::Run, vec![]).expect("register");
        job.push(JobEvent::Line("first".into()));
        job.push(JobEvent::Line("second".into()));

        {
            let mut stream = Box::pin(publisher(&registry).stream(job.id().as_str()));
            assert_eq!(stream.next().await, Some(StreamEvent::Line("first".into())));
        }
        assert!(registry.get(job.id().as_str()).is_some());

        job.push(JobEvent::Completed);
        let rest: Vec<_> = publisher(&registry).stream(job.id().as_str()).collect().await;
        assert_eq!(
            rest,
            vec![StreamEvent::Line("second".into()), StreamEvent::Completed]
        );
    }

    #[tokio::test]
    async fn waiting_consumer_sees_not_found_after_first_finishes() {
        let registry = Arc::new(JobRegistry::new(1));
        let job = registry.try_register(JobKind::Run, vec![]).expect("register");
        job.push(JobEvent::Line("A".into()));

        let mut first = Box::pin(publisher(&registry).stream(job.id().as_str()));
        assert_eq!(first.next().await, Some(StreamEvent::Line("A".into())));

        let second = tokio::spawn(publisher(&registry).stream(job.id().as_str()).collect::<Vec<_>>());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        job.push(JobEvent::Failed(JobFailure::Exit(3)));
        job.mark_finished();
        let rest: Vec<_> = first.collect().await;
        assert_eq!(rest, vec![StreamEvent::Failed(JobFailure::Exit(3))]);

        let waited = second.await.expect("join");
        assert_eq!(waited, vec![StreamEvent::NotFound]);
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::runner::ModelSelection;
        use crate::testing;

        #[tokio::test]
        async fn lines_arrive_in_order_then_one_completion() {
            let dir = tempfile::tempdir().expect("tempdir");
            let tool = testing::fake_tool(dir.path(), "echo A\necho B 1>&2\necho C\nexit 0\n");
            let ws = testing::initialized_workspace(dir.path(), "hello_dbt");
            let (runner, registry) = testing::runner(&testing::config(&tool), 3);

            let id = runner
                .start_models(&ws, &ModelSelection::new(["stg_orders"]))
                .expect("start");
            let events: Vec<_> = publisher(&registry).stream(id.as_str()).collect().await;
            assert_eq!(
                events,
                vec![
                    StreamEvent::Line("A".into()),
                    StreamEvent::Line("B".into()),
                    StreamEvent::Line("C".into()),
                    StreamEvent::Completed,
                ]
            );
            assert!(registry.get(id.as_str()).is_none());
        }

        #[tokio::test]
        async fn hung_child_is_killed_and_reported_once() {
            let dir = tempfile::tempdir().expect("tempdir");
            let tool = testing::fake_tool(dir.path(), "echo working\nexec sleep 60\n");
            let ws = testing::initialized_workspace(dir.path(), "hello_dbt");
            let mut cfg = testing::config(&tool);
            cfg.runner.timeout_secs = 1;
            let (runner, registry) = testing::runner(&cfg, 3);

            let started = std::time::Instant::now();
            let id = runner
                .start_models(&ws, &ModelSelection::new(["slow"]))
                .expect("start");
            let events: Vec<_> = publisher(&registry).stream(id.as_str()).collect().await;
            assert!(started.elapsed() < Duration::from_secs(5));

            let terminal: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
            assert_eq!(terminal.len(), 1);
            assert_eq!(terminal[0].payload(), "[ERROR] timed out after 1s");
            assert_eq!(events.first(), Some(&StreamEvent::Line("working".into())));
            assert!(registry.is_empty());
        }

        #[tokio::test]
        async fn nonzero_exit_reports_code() {
            let dir = tempfile::tempdir().expect("tempdir");
            let tool = testing::fake_tool(dir.path(), "echo 'Database Error'\nexit 2\n");
            let ws = testing::initialized_workspace(dir.path(), "hello_dbt");
            let (runner, registry) = testing::runner(&testing::config(&tool), 3);

            let id = runner
                .start_models(&ws, &ModelSelection::new(["broken"]))
                .expect("start");
            let events: Vec<_> = publisher(&registry).stream(id.as_str()).collect().await;
            assert_eq!(
                events.last().map(StreamEvent::payload).as_deref(),
                Some("[ERROR] exit code 2")
            );
        }
    }
}
