use std::borrow::Cow;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace};

/// A named background task.
#[derive(Debug)]
pub struct TaskHandle {
    name: Cow<'static, str>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(name: impl Into<Cow<'static, str>>, handle: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Background tasks owned by the server, stopped together on shutdown.
#[derive(Debug, Default)]
pub struct TaskManager {
    tasks: Vec<TaskHandle>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: TaskHandle) {
        trace!(task = task.name(), "task registered");
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Give every task one shared `grace` window to finish, then abort the rest.
    pub async fn shutdown_with_grace(self, grace: Duration) {
        let deadline = Instant::now() + grace;
        for TaskHandle { name, mut handle } in self.tasks {
            let joined = tokio::time::timeout_at(deadline, &mut handle).await;
            let result = match joined {
                Ok(result) => result,
                Err(_) => {
                    handle.abort();
                    handle.await
                }
            };
            match result {
                Ok(()) => debug!(task = %name, "task stopped"),
                Err(err) if err.is_cancelled() => debug!(task = %name, "task aborted"),
                Err(err) => debug!(task = %name, ?err, "task ended with error"),
            }
        }
    }
}

/// Restart delay that doubles per panic, capped, and resets after a quiet spell.
struct Backoff {
    delay: Duration,
    last_panic: Option<Instant>,
}

impl Backoff {
    const INITIAL: Duration = Duration::from_millis(200);
    const MAX: Duration = Duration::from_secs(10);
    const QUIET: Duration = Duration::from_secs(30);

    fn new() -> Self {
        Self {
            delay: Self::INITIAL,
            last_panic: None,
        }
    }

    fn next_delay(&mut self, now: Instant) -> Duration {
        if self
            .last_panic
            .is_some_and(|last| now.duration_since(last) > Self::QUIET)
        {
            self.delay = Self::INITIAL;
        }
        self.last_panic = Some(now);
        let current = self.delay;
        self.delay = (self.delay * 2).min(Self::MAX);
        current
    }
}

/// Run `factory`'s future until it returns, restarting it after a panic.
pub fn spawn_supervised<F, Fut>(name: impl Into<Cow<'static, str>>, mut factory: F) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let name = name.into();
    let task_name = name.clone();
    let handle = tokio::spawn(async move {
        let mut backoff = Backoff::new();
        while AssertUnwindSafe(factory()).catch_unwind().await.is_err() {
            let delay = backoff.next_delay(Instant::now());
            metrics::counter!("decode_task_restarts_total", "task" => task_name.to_string())
                .increment(1);
            error!(
                task = %task_name,
                delay_ms = delay.as_millis() as u64,
                "supervised task panicked; restarting"
            );
            tokio::time::sleep(delay).await;
        }
        debug!(task = %task_name, "supervised task completed");
    });
    TaskHandle::new(name, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn supervised_task_restarts_after_panic() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let task = spawn_supervised("flaky", move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run fails");
                }
            }
        });
        tokio::time::timeout(Duration::from_secs(5), task.handle)
            .await
            .expect("supervisor finished")
            .expect("join");
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_shares_one_grace_window() {
        let mut manager = TaskManager::new();
        for name in ["a", "b", "c"] {
            manager.push(TaskHandle::new(
                name,
                tokio::spawn(async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }),
            ));
        }
        assert_eq!(manager.len(), 3);
        let started = std::time::Instant::now();
        manager
            .shutdown_with_grace(Duration::from_millis(100))
            .await;
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn backoff_doubles_caps_and_resets() {
        let mut backoff = Backoff::new();
        let t0 = Instant::now();
        let delays: Vec<u128> = (0..8)
            .map(|i| backoff.next_delay(t0 + Duration::from_secs(i)).as_millis())
            .collect();
        assert_eq!(delays, [200, 400, 800, 1600, 3200, 6400, 10_000, 10_000]);
        let later = t0 + Duration::from_secs(120);
        assert_eq!(backoff.next_delay(later), Backoff::INITIAL);
    }
}
