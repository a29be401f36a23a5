//! Slave node
//!
//! Opens conversations with a master and hands them to the job eater.
//! The caller supplies the master's current version (learned out of band,
//! e.g. from the cluster membership layer), which decides whether the
//! conversation starts by requesting missing logs.

use crate::config::BackupConfig;
use crate::connection::{Connection, TcpConnection};
use crate::eater::JobSubmitter;
use crate::handler::HandleMasterConnection;
use crate::job::JobCallback;
use crate::roles::SlaveRole;
use crate::Result;
use std::net::ToSocketAddrs;
use std::sync::Arc;

/// Slave node replicating one stream from a master
pub struct SlaveNode {
    config: BackupConfig,
    logs: Arc<dyn SlaveRole>,
}

impl SlaveNode {
    /// Create a slave node installing logs into `logs`
    pub fn new(config: BackupConfig, logs: Arc<dyn SlaveRole>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, logs })
    }

    /// Highest log version applied locally
    pub fn version(&self) -> u64 {
        self.logs.get_version()
    }

    /// Connect to the master at `addr` and start catching up to
    /// `master_version`.
    ///
    /// `callback` runs once the conversation ends, whatever the outcome.
    pub fn connect<A: ToSocketAddrs>(
        &self,
        addr: A,
        master_version: u64,
        submitter: &JobSubmitter,
        callback: Option<JobCallback>,
    ) -> Result<()> {
        let conn = TcpConnection::connect(addr)?;
        tracing::info!(
            "Connected to master {} (master version {}, local version {})",
            conn.peer(),
            master_version,
            self.version()
        );
        self.attach(Box::new(conn), master_version, submitter, callback)
    }

    /// Start a conversation over an already established connection
    pub fn attach(
        &self,
        conn: Box<dyn Connection>,
        master_version: u64,
        submitter: &JobSubmitter,
        callback: Option<JobCallback>,
    ) -> Result<()> {
        let mut job =
            HandleMasterConnection::new(conn, self.logs.clone(), master_version, &self.config);
        if let Some(callback) = callback {
            job = job.with_callback(callback);
        }
        submitter.add_job(Box::new(job))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::connection::pipe;
    use crate::eater::JobEater;
    use crate::job::JobOutcome;
    use crate::store::LogDirectory;
    use std::net::TcpListener;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_callback_runs_when_master_hangs_up() {
        let dir = TempDir::new().unwrap();
        let logs = Arc::new(LogDirectory::open(dir.path()).unwrap());
        let node = SlaveNode::new(BackupConfig::default(), logs).unwrap();
        let eater = JobEater::start(SchedulerConfig::default()).unwrap();

        let (mut master, slave) = pipe();
        let (tx, rx) = crossbeam_channel::unbounded();
        node.attach(
            Box::new(slave),
            1,
            &eater.submitter(),
            Some(Box::new(move |outcome| {
                let _ = tx.send(outcome);
            })),
        )
        .unwrap();

        master.close();
        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, JobOutcome::Completed);
    }

    #[test]
    fn test_connect_refused() {
        let dir = TempDir::new().unwrap();
        let logs = Arc::new(LogDirectory::open(dir.path()).unwrap());
        let node = SlaveNode::new(BackupConfig::default(), logs).unwrap();
        let eater = JobEater::start(SchedulerConfig::default()).unwrap();

        // Grab a free port, then release it so nothing listens there.
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        assert!(node.connect(addr, 1, &eater.submitter(), None).is_err());
        assert_eq!(node.version(), 0);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let logs = Arc::new(LogDirectory::open(dir.path()).unwrap());
        assert!(SlaveNode::new(BackupConfig::default().with_max_retries(0), logs).is_err());
    }
}
