//! JobEater - the cooperative scheduler
//!
//! A single dedicated thread advances every live [`Job`]. Jobs live in one
//! of two tiers:
//! - the ready queue, serviced in batches of `batch_size` pops per tick;
//! - the slow list, holding jobs that made no progress on their last step.
//!   It is swept once per tick, after the ready batch, so a job waiting
//!   on a stalled peer costs one step per tick instead of a hot spin.
//!
//! A job that progresses while on the slow list is promoted back to the
//! ready queue. Faults (errors or panics) are contained per job: the job
//! is aborted, its callback runs with [`JobOutcome::Faulted`] and the loop
//! carries on.
//!
//! External submissions travel over a bounded channel; when it is full,
//! [`JobEater::add_job`] fails with [`Error::QueueFull`] instead of
//! growing without limit.

use crate::config::SchedulerConfig;
use crate::job::{Job, JobOutcome};
use crate::{Error, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

/// Scheduler counters
#[derive(Debug, Default)]
pub struct EaterStats {
    steps: AtomicU64,
    completed: AtomicU64,
    faulted: AtomicU64,
    demoted: AtomicU64,
    promoted: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time copy of [`EaterStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EaterStatsSnapshot {
    /// Total `perform_job` calls
    pub steps: u64,
    /// Jobs that finished on their own
    pub completed: u64,
    /// Jobs torn down after an error or panic
    pub faulted: u64,
    /// Moves from the ready queue to the slow list
    pub demoted: u64,
    /// Moves from the slow list back to the ready queue
    pub promoted: u64,
    /// Submissions refused because the queue was full
    pub rejected: u64,
}

impl EaterStats {
    /// Read all counters
    pub fn snapshot(&self) -> EaterStatsSnapshot {
        EaterStatsSnapshot {
            steps: self.steps.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            faulted: self.faulted.load(Ordering::Relaxed),
            demoted: self.demoted.load(Ordering::Relaxed),
            promoted: self.promoted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Where a job goes after one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Ready,
    Slow,
    Done,
}

/// Two-tier run queues, driven by the eater thread
///
/// Exposed so the tiering policy can be exercised one tick at a time.
pub struct Scheduler {
    ready: VecDeque<Box<dyn Job>>,
    slow: Vec<Box<dyn Job>>,
    batch_size: usize,
    stats: Arc<EaterStats>,
}

impl Scheduler {
    /// Create empty queues
    pub fn new(batch_size: usize) -> Self {
        Self::with_stats(batch_size, Arc::new(EaterStats::default()))
    }

    fn with_stats(batch_size: usize, stats: Arc<EaterStats>) -> Self {
        Self {
            ready: VecDeque::new(),
            slow: Vec::new(),
            batch_size: batch_size.max(1),
            stats,
        }
    }

    /// Enqueue a job on the ready queue
    pub fn push(&mut self, job: Box<dyn Job>) {
        self.ready.push_back(job);
    }

    /// Jobs waiting on the ready queue
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Jobs parked on the slow list
    pub fn slow_len(&self) -> usize {
        self.slow.len()
    }

    /// Whether no job is left in either tier
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.slow.is_empty()
    }

    /// Counters shared with the owning eater
    pub fn stats(&self) -> EaterStatsSnapshot {
        self.stats.snapshot()
    }

    /// Pop up to `batch_size` ready jobs and step each once.
    ///
    /// Returns the number of steps taken.
    pub fn run_ready_batch(&mut self) -> usize {
        let mut steps = 0;
        while steps < self.batch_size {
            let Some(job) = self.ready.pop_front() else {
                break;
            };
            steps += 1;

            if let Some((job, placement)) = self.step(job) {
                match placement {
                    Placement::Ready => self.ready.push_back(job),
                    Placement::Slow => {
                        self.stats.demoted.fetch_add(1, Ordering::Relaxed);
                        self.slow.push(job);
                    }
                    Placement::Done => {}
                }
            }
        }
        steps
    }

    /// Step every slow job once, promoting the ones that progressed
    pub fn sweep_slow(&mut self) {
        let parked = std::mem::take(&mut self.slow);
        for job in parked {
            if let Some((job, placement)) = self.step(job) {
                match placement {
                    Placement::Ready => {
                        self.stats.promoted.fetch_add(1, Ordering::Relaxed);
                        self.ready.push_back(job);
                    }
                    Placement::Slow => self.slow.push(job),
                    Placement::Done => {}
                }
            }
        }
    }

    /// One full scheduler tick without sleeping
    pub fn tick(&mut self) {
        self.run_ready_batch();
        self.sweep_slow();
    }

    /// Abort every queued job, returning how many were dropped
    pub fn abort_all(&mut self) -> usize {
        let jobs: Vec<_> = self.ready.drain(..).chain(self.slow.drain(..)).collect();
        let count = jobs.len();
        for mut job in jobs {
            let name = job.describe();
            let cleanup = panic::catch_unwind(AssertUnwindSafe(|| {
                job.abort();
                job.execute_callback(JobOutcome::Aborted);
            }));
            if cleanup.is_err() {
                tracing::error!("Job {} panicked while aborting", name);
            }
        }
        count
    }

    fn step(&mut self, mut job: Box<dyn Job>) -> Option<(Box<dyn Job>, Placement)> {
        self.stats.steps.fetch_add(1, Ordering::Relaxed);

        let result = panic::catch_unwind(AssertUnwindSafe(|| job.perform_job()));
        let progressed = match result {
            Ok(Ok(progressed)) => progressed,
            Ok(Err(e)) => {
                tracing::error!("Job {} failed: {}", job.describe(), e);
                self.fault(job);
                return None;
            }
            Err(payload) => {
                tracing::error!(
                    "Job {} panicked: {}",
                    job.describe(),
                    panic_message(payload.as_ref())
                );
                self.fault(job);
                return None;
            }
        };

        if job.needs_requeue() {
            let placement = if progressed {
                Placement::Ready
            } else {
                Placement::Slow
            };
            return Some((job, placement));
        }

        self.stats.completed.fetch_add(1, Ordering::Relaxed);
        self.finish(job, JobOutcome::Completed);
        None
    }

    fn fault(&mut self, mut job: Box<dyn Job>) {
        self.stats.faulted.fetch_add(1, Ordering::Relaxed);
        if panic::catch_unwind(AssertUnwindSafe(|| job.abort())).is_err() {
            tracing::error!("Job {} panicked while aborting", job.describe());
        }
        self.finish(job, JobOutcome::Faulted);
    }

    fn finish(&mut self, mut job: Box<dyn Job>, outcome: JobOutcome) {
        let name = job.describe();
        if panic::catch_unwind(AssertUnwindSafe(|| job.execute_callback(outcome))).is_err() {
            tracing::error!("Callback of job {} panicked", name);
        }
        match panic::catch_unwind(AssertUnwindSafe(|| job.chain_job())) {
            Ok(Some(chain)) => {
                tracing::trace!("Job {} chained {}", name, chain.describe());
                self.ready.push_back(chain);
            }
            Ok(None) => {}
            Err(_) => tracing::error!("Job {} panicked while handing over its chain", name),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Cloneable handle for submitting jobs to a running eater
#[derive(Clone)]
pub struct JobSubmitter {
    sender: Sender<Box<dyn Job>>,
    running: Arc<AtomicBool>,
    /// Cleared under the write lock once the loop has drained its inbox
    accepting: Arc<RwLock<bool>>,
    stats: Arc<EaterStats>,
    capacity: usize,
}

impl JobSubmitter {
    /// Submit a job without blocking.
    ///
    /// A rejected job is aborted before the error is returned, so its
    /// connection does not linger.
    pub fn add_job(&self, job: Box<dyn Job>) -> Result<()> {
        let sent = {
            let accepting = self.accepting.read();
            if *accepting && self.running.load(Ordering::SeqCst) {
                self.sender.try_send(job)
            } else {
                Err(TrySendError::Disconnected(job))
            }
        };

        match sent {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(mut job)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Job queue full, rejecting {}", job.describe());
                job.abort();
                Err(Error::QueueFull(self.capacity))
            }
            Err(TrySendError::Disconnected(mut job)) => {
                job.abort();
                Err(Error::Shutdown)
            }
        }
    }
}

/// Dedicated scheduler thread
pub struct JobEater {
    submitter: JobSubmitter,
    handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    stats: Arc<EaterStats>,
}

impl JobEater {
    /// Validate `config` and spawn the eater thread
    pub fn start(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;

        let (sender, receiver) = bounded(config.queue_capacity);
        let running = Arc::new(AtomicBool::new(true));
        let accepting = Arc::new(RwLock::new(true));
        let stats = Arc::new(EaterStats::default());

        let running_clone = running.clone();
        let accepting_clone = accepting.clone();
        let stats_clone = stats.clone();
        let config_clone = config.clone();

        let handle = thread::Builder::new()
            .name("job-eater".to_string())
            .spawn(move || {
                Self::eat(
                    receiver,
                    running_clone,
                    accepting_clone,
                    stats_clone,
                    &config_clone,
                );
            })?;

        tracing::info!(
            "Job eater started (batch {}, queue {})",
            config.batch_size,
            config.queue_capacity
        );

        Ok(Self {
            submitter: JobSubmitter {
                sender,
                running: running.clone(),
                accepting,
                stats: stats.clone(),
                capacity: config.queue_capacity,
            },
            handle: Some(handle),
            running,
            stats,
        })
    }

    /// Submit a job; see [`JobSubmitter::add_job`]
    pub fn add_job(&self, job: Box<dyn Job>) -> Result<()> {
        self.submitter.add_job(job)
    }

    /// Handle for submitting jobs from other components
    pub fn submitter(&self) -> JobSubmitter {
        self.submitter.clone()
    }

    /// Whether the loop is still accepting ticks
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the loop to stop after the current tick
    pub fn stop_eating(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Stop the loop and wait for the thread to exit
    pub fn shutdown(&mut self) -> Result<()> {
        self.stop_eating();
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| Error::internal("Job eater thread panicked"))?;
        }
        Ok(())
    }

    /// Current counters
    pub fn stats(&self) -> EaterStatsSnapshot {
        self.stats.snapshot()
    }

    fn eat(
        inbox: Receiver<Box<dyn Job>>,
        running: Arc<AtomicBool>,
        accepting: Arc<RwLock<bool>>,
        stats: Arc<EaterStats>,
        config: &SchedulerConfig,
    ) {
        let mut scheduler = Scheduler::with_stats(config.batch_size, stats);

        while running.load(Ordering::SeqCst) {
            for job in inbox.try_iter() {
                scheduler.push(job);
            }

            scheduler.run_ready_batch();

            // Only pause when there is nothing hot to run; a new submission
            // ends the pause early.
            if scheduler.ready_len() == 0 {
                match inbox.recv_timeout(config.idle_sleep) {
                    Ok(job) => scheduler.push(job),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => thread::sleep(config.idle_sleep),
                }
            }

            scheduler.sweep_slow();
        }

        // No submission can be in flight once the gate is closed.
        *accepting.write() = false;
        for job in inbox.try_iter() {
            scheduler.push(job);
        }
        let aborted = scheduler.abort_all();
        tracing::info!("Job eater stopped ({} unfinished jobs aborted)", aborted);
    }
}

impl Drop for JobEater {
    fn drop(&mut self) {
        self.stop_eating();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
