//! Backup engine configuration

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Default number of ready jobs advanced per scheduler tick
pub const DEFAULT_BATCH_SIZE: usize = 200;

/// Default pause when the ready queue runs dry
pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_millis(10);

/// Default capacity of the job submission channel
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default number of consecutive non-progressing ticks before a
/// conversation is closed
pub const DEFAULT_MAX_RETRIES: u32 = 20;

/// Default size of one socket read or one log chunk
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Default data source whose logs are replicated
pub const DEFAULT_STREAM: &str = "graph.db";

/// Scheduler (job eater) configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Ready jobs popped per tick before the slow list is swept
    pub batch_size: usize,

    /// How long the loop waits for new work when the ready queue is empty
    pub idle_sleep: Duration,

    /// Bound on externally submitted jobs waiting to enter the loop
    pub queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            idle_sleep: DEFAULT_IDLE_SLEEP,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl SchedulerConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(Error::config("queue_capacity must be at least 1"));
        }
        Ok(())
    }
}

/// Online backup configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Scheduler settings
    pub scheduler: SchedulerConfig,

    /// Consecutive stalled ticks tolerated per conversation
    pub max_retries: u32,

    /// Bytes moved per socket read and per log chunk
    pub chunk_size: usize,

    /// Data source name the master serves logs for
    pub stream: String,

    /// Address the master listens on
    pub bind_addr: SocketAddr,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            chunk_size: DEFAULT_CHUNK_SIZE,
            stream: DEFAULT_STREAM.to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], crate::DEFAULT_BACKUP_PORT)),
        }
    }
}

impl BackupConfig {
    /// Create a master configuration listening on `bind_addr`
    pub fn master(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Set the retry ceiling
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the chunk size
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the replicated data source
    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = stream.into();
        self
    }

    /// Set the scheduler configuration
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;

        if self.max_retries == 0 {
            return Err(Error::config("max_retries must be at least 1"));
        }

        if self.chunk_size == 0 {
            return Err(Error::config("chunk_size must be at least 1"));
        }

        if self.stream.is_empty() {
            return Err(Error::config("stream must not be empty"));
        }

        Ok(())
    }
}
