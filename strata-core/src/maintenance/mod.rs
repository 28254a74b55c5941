//! Background maintenance
//!
//! Each job runs on its own thread driven by a crossbeam timer and moves
//! through `Idle -> Running -> Idle` on every tick. Stopping cancels the
//! timer, waits a bounded time for an in-flight run, and gives jobs that
//! still owe work one final synchronous run.

mod jobs;

pub use jobs::{AgeDeletion, Flusher, PartitionReload, SizeEviction};

use crate::{Result, StoreError};
use crossbeam_channel::{after, bounded, select, tick, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Grace period polling on stop: 100 x 50ms
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);
const STOP_POLL_ATTEMPTS: usize = 100;

/// A periodic maintenance task
pub trait MaintenanceJob: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn run(&self) -> Result<()>;

    /// Whether a final run is owed when the scheduler stops
    fn runs_on_stop(&self) -> bool {
        false
    }
}

/// Lifecycle of a scheduled job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Running,
    Stopped,
}

struct ScheduledJob {
    job: Arc<dyn MaintenanceJob>,
    state: Arc<Mutex<JobState>>,
    cancel: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

/// Run the job once, keeping the state machine current
fn run_once(job: &dyn MaintenanceJob, state: &Mutex<JobState>) {
    {
        let mut s = state.lock();
        if *s == JobState::Stopped {
            return;
        }
        *s = JobState::Running;
    }
    if let Err(e) = job.run() {
        error!(job = job.name(), error = %e, "Maintenance job failed");
    }
    let mut s = state.lock();
    if *s == JobState::Running {
        *s = JobState::Idle;
    }
}

fn job_loop(job: Arc<dyn MaintenanceJob>, state: Arc<Mutex<JobState>>, cancel: Receiver<()>, delay: Duration, period: Duration) {
    let first = after(delay);
    select! {
        recv(cancel) -> _ => return,
        recv(first) -> _ => run_once(job.as_ref(), &state),
    }
    let ticker = tick(period);
    loop {
        select! {
            recv(cancel) -> _ => break,
            recv(ticker) -> _ => run_once(job.as_ref(), &state),
        }
    }
    debug!(job = job.name(), "Maintenance loop exited");
}

/// Periodic scheduler for maintenance jobs
#[derive(Default)]
pub struct Scheduler {
    jobs: Vec<ScheduledJob>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start running `job` after `delay`, then every `period`
    pub fn schedule(&mut self, job: Arc<dyn MaintenanceJob>, delay: Duration, period: Duration) -> Result<()> {
        if period.is_zero() {
            return Err(StoreError::Config(format!("{} needs a non-zero period", job.name())));
        }
        let state = Arc::new(Mutex::new(JobState::Idle));
        let (cancel_tx, cancel_rx) = bounded(0);
        let thread = thread::Builder::new()
            .name(format!("strata-{}", job.name()))
            .spawn({
                let job = job.clone();
                let state = state.clone();
                move || job_loop(job, state, cancel_rx, delay, period)
            })?;
        debug!(job = job.name(), ?delay, ?period, "Scheduled maintenance job");
        self.jobs.push(ScheduledJob {
            job,
            state,
            cancel: Some(cancel_tx),
            thread: Some(thread),
        });
        Ok(())
    }

    /// Names and states of the scheduled jobs
    pub fn states(&self) -> Vec<(&'static str, JobState)> {
        self.jobs.iter().map(|j| (j.job.name(), *j.state.lock())).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Cancel every job. Waits up to five seconds per in-flight run, then
    /// runs jobs that owe a final pass once more on the calling thread.
    pub fn stop(&mut self) {
        for scheduled in &mut self.jobs {
            // dropping the sender disconnects the cancel channel
            scheduled.cancel.take();

            let mut was_running = false;
            for _ in 0..STOP_POLL_ATTEMPTS {
                if *scheduled.state.lock() != JobState::Running {
                    break;
                }
                was_running = true;
                thread::sleep(STOP_POLL_INTERVAL);
            }

            let still_running = {
                let mut s = scheduled.state.lock();
                let running = *s == JobState::Running;
                *s = JobState::Stopped;
                running
            };
            if still_running {
                warn!(job = scheduled.job.name(), "Job still running after grace period");
            } else if !was_running && scheduled.job.runs_on_stop() {
                if let Err(e) = scheduled.job.run() {
                    error!(job = scheduled.job.name(), error = %e, "Final run failed");
                }
            }

            if let Some(handle) = scheduled.thread.take() {
                // a job may drop the last store reference on its own thread
                if !still_running && handle.thread().id() != thread::current().id() {
                    let _ = handle.join();
                }
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.jobs.iter().any(|j| j.cancel.is_some()) {
            self.stop();
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").field("jobs", &self.states()).finish()
    }
}
