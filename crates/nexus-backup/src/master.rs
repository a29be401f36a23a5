//! Master node
//!
//! The master node:
//! - Listens for slaves on a non-blocking TCP socket
//! - Runs one [`HandleSlaveConnection`] per accepted slave on the job eater
//! - Pushes freshly committed logs to idle slave conversations
//!
//! Accepting is itself a job, so the whole master side runs on the
//! scheduler thread; only [`MasterNode::log_committed`] is called from the
//! committing thread.

use crate::config::BackupConfig;
use crate::connection::TcpConnection;
use crate::eater::JobSubmitter;
use crate::handler::{HandleSlaveConnection, SlaveConnectionHandle};
use crate::job::{Job, JobCore, JobOutcome};
use crate::roles::MasterRole;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Master node statistics
#[derive(Debug, Clone, Default)]
pub struct MasterStats {
    /// Slave connections accepted
    pub slaves_accepted: u64,
    /// Accepted sockets dropped because the job queue was full
    pub slaves_rejected: u64,
    /// Pushed offers taken by an idle conversation
    pub logs_offered: u64,
    /// Pushed offers skipped because the conversation was busy
    pub offers_skipped: u64,
}

/// State shared between the node and its accept job
struct Shared {
    config: BackupConfig,
    store: Arc<dyn MasterRole>,
    slaves: RwLock<Vec<SlaveConnectionHandle>>,
    stats: Mutex<MasterStats>,
    running: AtomicBool,
}

/// Master node serving logs to slaves
pub struct MasterNode {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
}

impl MasterNode {
    /// Bind `config.bind_addr` and start accepting slaves on the eater
    /// behind `submitter`
    pub fn bind(
        config: BackupConfig,
        store: Arc<dyn MasterRole>,
        submitter: &JobSubmitter,
    ) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(config.bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            config,
            store,
            slaves: RwLock::new(Vec::new()),
            stats: Mutex::new(MasterStats::default()),
            running: AtomicBool::new(true),
        });

        let accept = AcceptJob {
            listener,
            local_addr,
            shared: shared.clone(),
            submitter: submitter.clone(),
            core: JobCore::new(),
        };
        submitter.add_job(Box::new(accept))?;

        tracing::info!(
            "Backup master listening on {} for stream {}",
            local_addr,
            shared.config.stream
        );

        Ok(Self { shared, local_addr })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current log version of the served stream
    pub fn current_version(&self) -> u64 {
        self.shared.store.get_version(&self.shared.config.stream)
    }

    /// Offer the freshly committed log `version` to every idle slave.
    ///
    /// Returns how many conversations took the offer. Busy conversations
    /// are skipped; they will ask for the log themselves if they need it.
    pub fn log_committed(&self, version: u64) -> usize {
        let mut slaves = self.shared.slaves.write();
        slaves.retain(|slave| !slave.is_finished());

        let mut offered = 0;
        let mut skipped = 0;
        for slave in slaves.iter() {
            match slave.offer_log_to_slave(version) {
                Ok(false) => offered += 1,
                Ok(true) => skipped += 1,
                Err(e) => {
                    tracing::warn!(
                        "Failed to offer log {} to {}: {}",
                        version,
                        slave.peer(),
                        e
                    );
                    skipped += 1;
                }
            }
        }
        drop(slaves);

        let mut stats = self.shared.stats.lock();
        stats.logs_offered += offered as u64;
        stats.offers_skipped += skipped;

        tracing::debug!(
            "Log {} committed: offered to {} slaves, {} busy",
            version,
            offered,
            skipped
        );
        offered
    }

    /// Number of live slave conversations
    pub fn connected_slaves(&self) -> usize {
        self.shared
            .slaves
            .read()
            .iter()
            .filter(|slave| !slave.is_finished())
            .count()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> MasterStats {
        self.shared.stats.lock().clone()
    }

    /// Whether the node still accepts slaves
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Stop accepting slaves.
    ///
    /// The listener closes on the accept job's next tick. Running
    /// conversations are left alone.
    pub fn stop(&self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            tracing::info!("Backup master on {} stopping", self.local_addr);
        }
    }
}

impl Drop for MasterNode {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Polls the listener and turns accepted sockets into conversations
struct AcceptJob {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    submitter: JobSubmitter,
    core: JobCore,
}

impl AcceptJob {
    fn start_conversation(&mut self, conn: TcpConnection) {
        let peer = conn
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let job = HandleSlaveConnection::new(
            Box::new(conn),
            self.shared.store.clone(),
            self.shared.config.stream.clone(),
            &self.shared.config,
        );
        let handle = job.handle();

        match self.submitter.add_job(Box::new(job)) {
            Ok(()) => {
                self.shared.slaves.write().push(handle);
                self.shared.stats.lock().slaves_accepted += 1;
                tracing::info!("Slave {} connected", peer);
            }
            Err(e) => {
                self.shared.stats.lock().slaves_rejected += 1;
                tracing::warn!("Dropping slave {}: {}", peer, e);
            }
        }
    }
}

impl Job for AcceptJob {
    fn perform_job(&mut self) -> Result<bool> {
        if !self.shared.running.load(Ordering::SeqCst) {
            self.core.finish();
            return Ok(true);
        }

        match self.listener.accept() {
            Ok((stream, _)) => {
                match TcpConnection::new(stream) {
                    Ok(conn) => self.start_conversation(conn),
                    Err(e) => tracing::warn!("Failed to set up slave socket: {}", e),
                }
                Ok(true)
            }
            Err(e) => {
                let e = Error::from(e);
                if !e.is_transient() {
                    tracing::warn!("Accept on {} failed: {}", self.local_addr, e);
                }
                Ok(false)
            }
        }
    }

    fn needs_requeue(&self) -> bool {
        self.core.needs_requeue()
    }

    fn execute_callback(&mut self, outcome: JobOutcome) {
        tracing::debug!("Listener on {} closed ({:?})", self.local_addr, outcome);
        self.core.execute_callback(outcome);
    }

    fn chain_job(&mut self) -> Option<Box<dyn Job>> {
        self.core.take_chain()
    }

    fn abort(&mut self) {
        self.core.finish();
    }

    fn describe(&self) -> String {
        format!("backup listener {}", self.local_addr)
    }
}
