//! Cooperative jobs
//!
//! A [`Job`] is a resumable unit of work advanced one step at a time by
//! the [`JobEater`](crate::eater::JobEater). Every step may perform at most
//! one non-blocking I/O attempt and reports whether it made progress.
//! Once a job stops asking to be requeued, the scheduler runs its
//! completion callback and submits its chained follow-up job, each
//! exactly once.

use crate::Result;
use std::fmt;

/// How a job left the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job finished on its own
    Completed,
    /// The job failed or panicked and was torn down by the scheduler
    Faulted,
    /// The scheduler stopped before the job finished
    Aborted,
}

/// Completion callback
pub type JobCallback = Box<dyn FnOnce(JobOutcome) + Send>;

/// Unit of cooperative scheduler work
pub trait Job: Send {
    /// Advance by at most one non-blocking step.
    ///
    /// Returns `Ok(true)` when bytes moved or the state changed. Errors
    /// are fatal for this job only.
    fn perform_job(&mut self) -> Result<bool>;

    /// Whether the job wants another step
    fn needs_requeue(&self) -> bool;

    /// Run the completion callback, if any
    fn execute_callback(&mut self, outcome: JobOutcome);

    /// Take the follow-up job to submit once this one is done
    fn chain_job(&mut self) -> Option<Box<dyn Job>>;

    /// Release resources after a fault or shutdown; must be idempotent
    fn abort(&mut self) {}

    /// Short description used in scheduler logs
    fn describe(&self) -> String {
        "job".to_string()
    }
}

/// Requeue flag, callback and chain shared by every job kind
#[derive(Default)]
pub struct JobCore {
    done: bool,
    callback: Option<JobCallback>,
    chain: Option<Box<dyn Job>>,
}

impl JobCore {
    /// Create a core for a job that still has work to do
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a completion callback
    pub fn with_callback(mut self, callback: JobCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Attach a job to run after this one
    pub fn with_chain(mut self, chain: Box<dyn Job>) -> Self {
        self.chain = Some(chain);
        self
    }

    /// Replace the completion callback
    pub fn set_callback(&mut self, callback: JobCallback) {
        self.callback = Some(callback);
    }

    /// Replace the chained job
    pub fn set_chain(&mut self, chain: Box<dyn Job>) {
        self.chain = Some(chain);
    }

    /// Mark the job as finished
    pub fn finish(&mut self) {
        self.done = true;
    }

    /// Whether the job wants another step
    pub fn needs_requeue(&self) -> bool {
        !self.done
    }

    /// Run the callback once; later calls do nothing
    pub fn execute_callback(&mut self, outcome: JobOutcome) {
        if let Some(callback) = self.callback.take() {
            callback(outcome);
        }
    }

    /// Take the chained job once
    pub fn take_chain(&mut self) -> Option<Box<dyn Job>> {
        self.chain.take()
    }

    /// Detach the callback so it can run outside a lock
    pub fn take_callback(&mut self) -> Option<JobCallback> {
        self.callback.take()
    }
}

impl fmt::Debug for JobCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobCore")
            .field("done", &self.done)
            .field("callback", &self.callback.is_some())
            .field("chain", &self.chain.is_some())
            .finish()
    }
}

/// Job driven by a closure, handy for housekeeping and tests
///
/// The closure returns `Ok(Some(progress))` to keep running and
/// `Ok(None)` once finished.
pub struct FnJob<F> {
    name: String,
    step: F,
    core: JobCore,
}

impl<F> FnJob<F>
where
    F: FnMut() -> Result<Option<bool>> + Send,
{
    /// Wrap `step` as a job
    pub fn new(name: impl Into<String>, step: F) -> Self {
        Self {
            name: name.into(),
            step,
            core: JobCore::new(),
        }
    }

    /// Attach a completion callback
    pub fn with_callback(mut self, callback: JobCallback) -> Self {
        self.core.set_callback(callback);
        self
    }

    /// Attach a follow-up job
    pub fn with_chain(mut self, chain: Box<dyn Job>) -> Self {
        self.core.set_chain(chain);
        self
    }
}

impl<F> Job for FnJob<F>
where
    F: FnMut() -> Result<Option<bool>> + Send,
{
    fn perform_job(&mut self) -> Result<bool> {
        match (self.step)()? {
            Some(progress) => Ok(progress),
            None => {
                self.core.finish();
                Ok(true)
            }
        }
    }

    fn needs_requeue(&self) -> bool {
        self.core.needs_requeue()
    }

    fn execute_callback(&mut self, outcome: JobOutcome) {
        self.core.execute_callback(outcome);
    }

    fn chain_job(&mut self) -> Option<Box<dyn Job>> {
        self.core.take_chain()
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}
