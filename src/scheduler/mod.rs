//! Adaptive scheduler.
//!
//! Every registered job gets its own tokio task that sleeps until its
//! next fire, checks the kill switch, runs the job, and picks the next
//! interval from the `FailureTracker`: the configured cadence after a
//! success, the backoff delay after a failure. A job never overlaps
//! itself; fires missed while a run was in progress are coalesced into
//! the next future slot rather than queued.

pub mod backoff;
pub mod kill_switch;

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

pub use backoff::{BackoffPolicy, FailureState, FailureTracker};
pub use kill_switch::{FileKillSwitch, FlagKillSwitch, KillSwitch};

use crate::sources::SourceJob;
use crate::types::LinewatchError;

/// Floor for the gap between two fires of one job.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

struct JobEntry {
    id: String,
    cadence: Duration,
    job: Arc<dyn SourceJob>,
}

pub struct Scheduler {
    jobs: Vec<JobEntry>,
    tracker: Arc<FailureTracker>,
    kill_switch: Arc<dyn KillSwitch>,
    poll_interval: Duration,
    fire_on_start: bool,
}

impl Scheduler {
    pub fn new(policy: BackoffPolicy, kill_switch: Arc<dyn KillSwitch>, poll_interval: Duration) -> Self {
        Self {
            jobs: Vec::new(),
            tracker: Arc::new(FailureTracker::new(policy)),
            kill_switch,
            poll_interval,
            fire_on_start: false,
        }
    }

    /// Fire every job once immediately instead of waiting one cadence.
    pub fn fire_on_start(mut self, enabled: bool) -> Self {
        self.fire_on_start = enabled;
        self
    }

    pub fn register(
        &mut self,
        id: impl Into<String>,
        cadence: Duration,
        job: Arc<dyn SourceJob>,
    ) -> Result<(), LinewatchError> {
        let id = id.into();
        if cadence.is_zero() {
            return Err(LinewatchError::Config(format!("job {id}: cadence must be non-zero")));
        }
        if self.jobs.iter().any(|j| j.id == id) {
            return Err(LinewatchError::Config(format!("job {id} is already registered")));
        }
        debug!(job = %id, cadence_s = cadence.as_secs(), "Job registered");
        self.jobs.push(JobEntry { id, cadence, job });
        Ok(())
    }

    pub fn job_ids(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.id.as_str()).collect()
    }

    pub fn tracker(&self) -> Arc<FailureTracker> {
        Arc::clone(&self.tracker)
    }

    /// Spawn one loop per job.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let start = Instant::now();
        let count = self.jobs.len();

        let tasks = self
            .jobs
            .into_iter()
            .map(|entry| {
                let first_fire = if self.fire_on_start {
                    start
                } else {
                    start + entry.cadence
                };
                tokio::spawn(job_loop(
                    entry,
                    first_fire,
                    Arc::clone(&self.tracker),
                    Arc::clone(&self.kill_switch),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        info!(jobs = count, "Scheduler started");
        SchedulerHandle {
            shutdown: shutdown_tx,
            tasks,
            tracker: self.tracker,
            kill_switch: self.kill_switch,
            poll_interval: self.poll_interval,
        }
    }
}

pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    tracker: Arc<FailureTracker>,
    kill_switch: Arc<dyn KillSwitch>,
    poll_interval: Duration,
}

impl SchedulerHandle {
    pub fn tracker(&self) -> &FailureTracker {
        &self.tracker
    }

    /// Stop firing and wait for in-flight runs to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Job loop ended abnormally");
            }
        }
        info!("Scheduler stopped");
    }

    /// Run until `shutdown` resolves or the kill switch is seen engaged,
    /// then stop cleanly.
    pub async fn run_until<F: Future<Output = ()>>(self, shutdown: F) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = sleep(self.poll_interval) => {
                    if self.kill_switch.engaged() {
                        warn!("Kill switch engaged, shutting down");
                        break;
                    }
                }
            }
        }
        self.stop().await;
    }
}

async fn job_loop(
    entry: JobEntry,
    first_fire: Instant,
    tracker: Arc<FailureTracker>,
    kill_switch: Arc<dyn KillSwitch>,
    mut shutdown: watch::Receiver<bool>,
) {
    let JobEntry { id, cadence, job } = entry;
    let mut next_fire = first_fire;

    loop {
        tokio::select! {
            _ = sleep_until(next_fire) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        if *shutdown.borrow() {
            break;
        }

        let fired_at = Instant::now();

        if kill_switch.engaged() {
            info!(job = %id, "Kill switch engaged, skipping run");
        } else {
            let outcome = AssertUnwindSafe(job.run_once()).catch_unwind().await;
            match outcome {
                Ok(Ok(items)) => {
                    let before = tracker.record_success(&id);
                    if before.current_interval.is_some() {
                        info!(job = %id, cadence_s = cadence.as_secs(), "Job recovered, cadence restored");
                    }
                    debug!(job = %id, items, "Job run ok");
                }
                Ok(Err(e)) if e.is_skip() => {
                    info!(job = %id, reason = %e, "Job run skipped");
                }
                Ok(Err(e)) => {
                    let state = tracker.record_failure(&id);
                    warn!(
                        job = %id,
                        fails = state.consecutive_failures,
                        next_interval_s = state.current_interval.unwrap_or(cadence).as_secs(),
                        error = %e,
                        "Job failed, backing off"
                    );
                }
                Err(_) => {
                    let state = tracker.record_failure(&id);
                    warn!(
                        job = %id,
                        fails = state.consecutive_failures,
                        next_interval_s = state.current_interval.unwrap_or(cadence).as_secs(),
                        "Job panicked, backing off"
                    );
                }
            }
        }

        let interval = tracker.next_interval(&id, cadence).max(MIN_INTERVAL);
        next_fire = fired_at + interval;

        let now = Instant::now();
        if next_fire <= now {
            let behind = now - next_fire;
            let missed = u32::try_from(behind.as_nanos() / interval.as_nanos().max(1) + 1)
                .unwrap_or(u32::MAX);
            next_fire += interval * missed;
            debug!(job = %id, missed, "Run overran its interval, coalescing missed fires");
        }
    }

    debug!(job = %id, "Job loop exiting");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
