use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::SchedulerError;

/// Pause between two iterations of a job loop, so a clock that jumps ahead
/// cannot make the loop spin.
const ITERATION_DELAY: Duration = Duration::from_millis(100);

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Runs jobs at wall-clock multiples of their interval.
///
/// Every job runs in its own task: a failing or panicking run is logged and the job
/// keeps its schedule, and other jobs are not affected. Runs of the same job never
/// overlap; a run that outlasts its slot skips the launches it missed.
pub struct JobScheduler {
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    jobs: JoinSet<()>,
}

impl JobScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            shutdown: CancellationToken::new(),
            jobs: JoinSet::new(),
        }
    }

    pub fn schedule_job<F, Fut, E>(
        &mut self,
        name: &str,
        interval: Duration,
        action: F,
    ) -> Result<(), SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        if interval.as_millis() == 0 {
            return Err(SchedulerError::EmptyInterval(name.to_owned()));
        }

        info!(job = name, interval_ms = interval.as_millis() as u64, "scheduling job");
        let job = Job {
            name: name.to_owned(),
            interval,
            clock: self.clock.clone(),
            cancel: self.shutdown.child_token(),
        };
        self.jobs.spawn(job.run(action));
        Ok(())
    }

    /// Stops every job loop at its next wait point and waits for running jobs to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        while let Some(result) = self.jobs.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "job loop terminated abnormally");
            }
        }
    }
}

struct Job {
    name: String,
    interval: Duration,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl Job {
    async fn run<F, Fut, E>(self, action: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        loop {
            let now = self.clock.now();
            let launch = match next_launch_time(&self.name, now, self.interval) {
                Ok(launch) => launch,
                Err(e) => {
                    error!(job = %self.name, error = %e, "stopping job");
                    return;
                }
            };

            debug!(job = %self.name, next_launch = %launch, "waiting for next launch");
            if !self.wait_until(launch).await {
                return;
            }

            let next_boundary = launch + self.interval;
            match tokio::spawn(action()).await {
                Ok(Ok(())) => debug!(job = %self.name, "job finished"),
                Ok(Err(e)) => error!(job = %self.name, error = %e, "job failed"),
                Err(e) => error!(job = %self.name, error = %e, "job panicked"),
            }

            if self.clock.now() >= next_boundary {
                warn!(
                    "Job '{}' has been running for too long and skipped next launch time",
                    self.name
                );
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(ITERATION_DELAY) => {}
            }
        }
    }

    /// Returns false when cancelled before `target` was reached.
    async fn wait_until(&self, target: DateTime<Utc>) -> bool {
        loop {
            let now = self.clock.now();
            if now >= target {
                return true;
            }

            let remaining = (target - now).to_std().unwrap_or_default();
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(job = %self.name, "job cancelled");
                    return false;
                }
                _ = tokio::time::sleep(remaining) => {}
            }
        }
    }
}

/// Smallest multiple of `interval` since the epoch that is not before `now`.
///
/// Fails when that boundary is not strictly after `now`, which happens when `now` sits
/// exactly on a boundary.
pub fn next_launch_time(
    job: &str,
    now: DateTime<Utc>,
    interval: Duration,
) -> Result<DateTime<Utc>, SchedulerError> {
    let invalid = |next: DateTime<Utc>| SchedulerError::LaunchTimeNotAfterNow {
        job: job.to_owned(),
        next,
        now,
    };

    let interval_ms = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX);
    if interval_ms == 0 {
        return Err(SchedulerError::EmptyInterval(job.to_owned()));
    }

    let millis = now.timestamp_millis();
    let partial = i64::from(millis.rem_euclid(interval_ms) != 0);
    let next = millis
        .div_euclid(interval_ms)
        .checked_add(partial)
        .and_then(|slots| slots.checked_mul(interval_ms))
        .and_then(DateTime::from_timestamp_millis)
        .ok_or_else(|| invalid(now))?;

    if next <= now {
        return Err(invalid(next));
    }
    Ok(next)
}
