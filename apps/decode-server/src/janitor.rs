use std::sync::Arc;
use std::time::Duration;

use decode_core::JobRegistry;
use tokio::time::MissedTickBehavior;

use crate::tasks::{spawn_supervised, TaskHandle};

/// Reclaim jobs whose log stream was never drained.
pub(crate) fn spawn_job_janitor(
    jobs: Arc<JobRegistry>,
    every: Duration,
    grace: Duration,
) -> TaskHandle {
    spawn_supervised("job-janitor", move || {
        let jobs = jobs.clone();
        async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            tick.tick().await;
            loop {
                tick.tick().await;
                jobs.reap_finished(grace);
            }
        }
    })
}
