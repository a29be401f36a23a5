//! Online backup integration tests
//!
//! Drives both conversation ends against real log directories:
//! - In-memory pipes ticked through a `Scheduler`, with partial writes
//! - Pull catch-up, push of new logs, and refusal of logs already present
//! - Full TCP round trip through `MasterNode`, `SlaveNode` and a `JobEater`

use nexus_backup::handler::SlaveConnectionState;
use nexus_backup::{
    BackupConfig, FileLogStore, HandleMasterConnection, HandleSlaveConnection, JobEater,
    JobOutcome, LogDirectory, MasterNode, MasterRole, Scheduler, SchedulerConfig,
    SlaveConnectionHandle, SlaveNode, SlaveRole, pipe,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

const STREAM: &str = "graph.db";

struct Fixture {
    _dir: TempDir,
    master: Arc<FileLogStore>,
    slave: Arc<LogDirectory>,
}

impl Fixture {
    fn new(master_logs: &[&[u8]]) -> Self {
        let dir = TempDir::new().unwrap();
        let master = Arc::new(FileLogStore::open(dir.path().join("master")).unwrap());
        for log in master_logs {
            master.commit(STREAM, log).unwrap();
        }
        let slave = Arc::new(LogDirectory::open(dir.path().join("slave")).unwrap());
        Self {
            _dir: dir,
            master,
            slave,
        }
    }

    fn slave_log(&self, version: u64) -> Vec<u8> {
        std::fs::read(self.slave.get_log_name(version)).unwrap()
    }

    /// Wire both ends through a pipe with small chunks and partial writes
    fn converse(&self, scheduler: &mut Scheduler) -> SlaveConnectionHandle {
        let config = BackupConfig::default()
            .with_chunk_size(5)
            .with_max_retries(100_000);
        let (master_end, slave_end) = pipe();

        let master_job = HandleSlaveConnection::new(
            Box::new(master_end.with_write_limit(3)),
            self.master.clone(),
            STREAM,
            &config,
        );
        let handle = master_job.handle();
        let slave_job = HandleMasterConnection::new(
            Box::new(slave_end.with_write_limit(7)),
            self.slave.clone(),
            self.master.get_version(STREAM),
            &config,
        );

        scheduler.push(Box::new(master_job));
        scheduler.push(Box::new(slave_job));
        handle
    }
}

/// Log output for failing runs (`RUST_LOG=nexus_backup=debug`)
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn tick_until(scheduler: &mut Scheduler, what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        scheduler.tick();
    }
    panic!("gave up waiting for {}", what);
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_slave_catches_up_over_pipe() {
    init_tracing();
    let fx = Fixture::new(&[b"first log", b"the second log entry", b"3"]);
    let mut scheduler = Scheduler::new(200);
    let handle = fx.converse(&mut scheduler);

    tick_until(&mut scheduler, "catch-up", || fx.slave.get_version() == 3);
    assert_eq!(fx.slave_log(1), b"first log");
    assert_eq!(fx.slave_log(2), b"the second log entry");
    assert_eq!(fx.slave_log(3), b"3");

    tick_until(&mut scheduler, "master idle", || {
        handle.state() == SlaveConnectionState::GetMessage
    });
    assert!(!handle.is_finished());
    assert_eq!(scheduler.stats().faulted, 0);
}

#[test]
fn test_push_after_catch_up() {
    let fx = Fixture::new(&[b"one", b"two"]);
    let mut scheduler = Scheduler::new(200);
    let handle = fx.converse(&mut scheduler);
    tick_until(&mut scheduler, "catch-up", || fx.slave.get_version() == 2);
    tick_until(&mut scheduler, "master idle", || {
        handle.state() == SlaveConnectionState::GetMessage
    });

    let version = fx.master.commit(STREAM, b"freshly committed").unwrap();
    assert_eq!(version, 3);
    assert!(!handle.offer_log_to_slave(version).unwrap());

    tick_until(&mut scheduler, "pushed log", || fx.slave.get_version() == 3);
    assert_eq!(fx.slave_log(3), b"freshly committed");
}

#[test]
fn test_present_logs_are_not_transferred() {
    let fx = Fixture::new(&[b"master one", b"master two", b"master three"]);
    // The slave already holds its own copies of 1 and 2.
    fx.slave.commit(b"local one").unwrap();
    fx.slave.commit(b"local two").unwrap();

    let mut scheduler = Scheduler::new(200);
    let handle = fx.converse(&mut scheduler);
    tick_until(&mut scheduler, "catch-up", || fx.slave.get_version() == 3);
    assert_eq!(fx.slave_log(1), b"local one");
    assert_eq!(fx.slave_log(2), b"local two");
    assert_eq!(fx.slave_log(3), b"master three");

    // Offering a log the slave has is refused without touching its copy.
    tick_until(&mut scheduler, "master idle", || {
        handle.state() == SlaveConnectionState::GetMessage
    });
    assert!(!handle.offer_log_to_slave(2).unwrap());
    tick_until(&mut scheduler, "refusal", || {
        handle.state() == SlaveConnectionState::GetMessage && handle.log_version_to_send().is_none()
    });
    assert_eq!(fx.slave_log(2), b"local two");
    assert!(!handle.is_finished());
}

#[test]
fn test_empty_master_sends_nothing() {
    let fx = Fixture::new(&[]);
    let mut scheduler = Scheduler::new(200);
    let handle = fx.converse(&mut scheduler);

    for _ in 0..50 {
        scheduler.tick();
    }
    assert_eq!(fx.slave.get_version(), 0);
    assert_eq!(handle.state(), SlaveConnectionState::GetMessage);
    assert_eq!(scheduler.ready_len(), 0);
    assert_eq!(scheduler.slow_len(), 2);
}

#[test]
fn test_tcp_round_trip() {
    init_tracing();
    let fx = Fixture::new(&[b"alpha", b"beta", b"gamma"]);
    let eater = JobEater::start(SchedulerConfig::default()).unwrap();
    let config = BackupConfig::master("127.0.0.1:0".parse().unwrap())
        .with_chunk_size(2)
        .with_max_retries(1_000_000);

    let master = MasterNode::bind(config.clone(), fx.master.clone(), &eater.submitter()).unwrap();
    assert_eq!(master.current_version(), 4);

    let slave = SlaveNode::new(config, fx.slave.clone()).unwrap();
    let (tx, rx) = crossbeam_channel::unbounded();
    slave
        .connect(
            master.local_addr(),
            master.current_version(),
            &eater.submitter(),
            Some(Box::new(move |outcome| {
                let _ = tx.send(outcome);
            })),
        )
        .unwrap();

    wait_until("catch-up", || slave.version() == 3);
    assert_eq!(fx.slave_log(2), b"beta");
    wait_until("slave registered", || master.connected_slaves() == 1);

    let version = fx.master.commit(STREAM, b"delta").unwrap();
    // The master side may still be wrapping up the last transfer.
    wait_until("offer taken", || master.log_committed(version) == 1);
    wait_until("pushed log", || slave.version() == 4);
    assert_eq!(fx.slave_log(4), b"delta");
    assert!(master.stats().logs_offered >= 1);

    master.stop();
    drop(eater);
    let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(outcome, JobOutcome::Aborted);
}
