//! Master side of a backup conversation
//!
//! Answers a slave's requests for specific log versions and streams the
//! accepted logs. The master role may also push a freshly committed log
//! through a [`SlaveConnectionHandle`] from another thread; both the
//! scheduler tick and the push go through the same lock, and a push is
//! refused while a transfer is in flight or a request is arriving.
//!
//! A request that crosses a pushed offer on the wire is read while the
//! offer's answer is awaited and served once that transfer settles.

use super::{Frame, flush_frame, peek_tag, peer_closed, read_frame, settle_flush, write_frame};
use crate::config::BackupConfig;
use crate::connection::Connection;
use crate::connection_job::ConnectionJob;
use crate::job::{Job, JobCallback, JobOutcome};
use crate::protocol::{self, ACK_LEN, MessageTag, OfferLog, REQUEST_LOG_LEN, RequestLog};
use crate::roles::{LogSource, MasterRole};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::Read;
use std::sync::Arc;

/// Requests a slave may queue behind an in-flight offer
const MAX_DEFERRED_REQUESTS: usize = 16;

/// States of the master-side conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveConnectionState {
    /// Waiting for a request
    GetMessage,
    /// Building an offer for the log being transferred
    SetupOfferLog,
    /// Flushing the offer
    SendOffer,
    /// Waiting for the slave's acceptance or refusal
    GetOk,
    /// Filling the write buffer with the next chunk of the log
    SetupSendLog,
    /// Flushing the chunk
    SendLog,
}

struct OutgoingLog {
    version: u64,
    length: u64,
    sent: u64,
    source: LogSource,
}

struct SlaveConversation {
    job: ConnectionJob,
    master: Arc<dyn MasterRole>,
    stream: String,
    state: SlaveConnectionState,
    outgoing: Option<OutgoingLog>,
    deferred: VecDeque<u64>,
}

impl SlaveConversation {
    fn step(&mut self) -> Result<bool> {
        match self.state {
            SlaveConnectionState::GetMessage => self.get_message(),
            SlaveConnectionState::SetupOfferLog => self.setup_offer_log(),
            SlaveConnectionState::SendOffer => self.send(SlaveConnectionState::GetOk),
            SlaveConnectionState::GetOk => self.get_ok(),
            SlaveConnectionState::SetupSendLog => self.setup_send_log(),
            SlaveConnectionState::SendLog => self.send(SlaveConnectionState::SetupSendLog),
        }
    }

    fn get_message(&mut self) -> Result<bool> {
        if let Some(version) = self.deferred.pop_front() {
            self.serve_request(version)?;
            return Ok(self.job.progressed());
        }

        let frame = read_frame(
            &mut self.job,
            REQUEST_LOG_LEN,
            &[MessageTag::RequestLog],
            RequestLog::decode,
        )?;

        let request = match frame {
            Frame::Busy => return Ok(self.job.stalled()),
            Frame::Pending(progress) => return Ok(self.job.settle(progress)),
            Frame::Invalid(reason) => return Ok(self.violation(&reason)),
            Frame::Ready(request) => request,
        };

        self.serve_request(request.version)?;
        Ok(self.job.progressed())
    }

    fn serve_request(&mut self, version: u64) -> Result<()> {
        let current = self.master.get_version(&self.stream);
        if version >= current {
            tracing::debug!(
                "Ignoring request for log {} from {}: master is at {}",
                version,
                self.job.peer(),
                current
            );
            Ok(())
        } else if !self.master.has_log(&self.stream, version) {
            tracing::warn!(
                "Slave {} requested log {} of {} which is not available",
                self.job.peer(),
                version,
                self.stream
            );
            Ok(())
        } else {
            self.open_transfer(version)
        }
    }

    fn open_transfer(&mut self, version: u64) -> Result<()> {
        let length = self.master.get_log_length(&self.stream, version)?;
        let source = self.master.get_log(&self.stream, version)?;
        tracing::debug!(
            "Offering log {} ({} bytes) of {} to {}",
            version,
            length,
            self.stream,
            self.job.peer()
        );

        self.outgoing = Some(OutgoingLog {
            version,
            length,
            sent: 0,
            source,
        });
        self.state = SlaveConnectionState::SetupOfferLog;
        Ok(())
    }

    fn setup_offer_log(&mut self) -> Result<bool> {
        let Some(outgoing) = self.outgoing.as_ref() else {
            return Err(Error::internal("offering a log without a transfer"));
        };
        let offer = OfferLog {
            version: outgoing.version,
            length: outgoing.length,
        };

        if !write_frame(&mut self.job, |buf| offer.encode(buf))? {
            return Ok(self.job.stalled());
        }
        self.state = SlaveConnectionState::SendOffer;
        Ok(self.job.progressed())
    }

    fn get_ok(&mut self) -> Result<bool> {
        match peek_tag(&mut self.job)? {
            Frame::Busy => return Ok(self.job.stalled()),
            Frame::Pending(progress) => return Ok(self.job.settle(progress)),
            Frame::Ready(tag) if tag == MessageTag::RequestLog as u8 => {
                return self.defer_request();
            }
            Frame::Ready(_) | Frame::Invalid(_) => {}
        }

        let frame = read_frame(
            &mut self.job,
            ACK_LEN,
            &[MessageTag::Ok, MessageTag::NotOk],
            protocol::decode_ack,
        )?;

        match frame {
            Frame::Busy => Ok(self.job.stalled()),
            Frame::Pending(progress) => Ok(self.job.settle(progress)),
            Frame::Invalid(reason) => Ok(self.violation(&reason)),
            Frame::Ready(true) => {
                self.state = SlaveConnectionState::SetupSendLog;
                Ok(self.job.progressed())
            }
            Frame::Ready(false) => {
                if let Some(outgoing) = self.outgoing.take() {
                    tracing::debug!(
                        "Slave {} declined log {}",
                        self.job.peer(),
                        outgoing.version
                    );
                }
                self.state = SlaveConnectionState::GetMessage;
                Ok(self.job.progressed())
            }
        }
    }

    /// Read a request that crossed our offer and keep it for later
    fn defer_request(&mut self) -> Result<bool> {
        let frame = read_frame(
            &mut self.job,
            REQUEST_LOG_LEN,
            &[MessageTag::RequestLog],
            RequestLog::decode,
        )?;

        match frame {
            Frame::Busy => Ok(self.job.stalled()),
            Frame::Pending(progress) => Ok(self.job.settle(progress)),
            Frame::Invalid(reason) => Ok(self.violation(&reason)),
            Frame::Ready(_) if self.deferred.len() >= MAX_DEFERRED_REQUESTS => {
                let reason = format!(
                    "more than {} requests behind an offer",
                    MAX_DEFERRED_REQUESTS
                );
                Ok(self.violation(&reason))
            }
            Frame::Ready(request) => {
                tracing::debug!(
                    "Request for log {} from {} crossed an offer, deferring",
                    request.version,
                    self.job.peer()
                );
                self.deferred.push_back(request.version);
                Ok(self.job.progressed())
            }
        }
    }

    fn setup_send_log(&mut self) -> Result<bool> {
        let Some(outgoing) = self.outgoing.as_mut() else {
            return Err(Error::internal("sending a log without a transfer"));
        };

        let remaining = outgoing.length - outgoing.sent;
        if remaining == 0 {
            tracing::info!(
                "Sent log {} ({} bytes) to {}",
                outgoing.version,
                outgoing.length,
                self.job.peer()
            );
            self.outgoing = None;
            self.state = SlaveConnectionState::GetMessage;
            return Ok(self.job.progressed());
        }

        let want = remaining.min(self.job.chunk_size() as u64) as usize;
        let filled = self.job.with_write_buffer(|lease| {
            let start = lease.len();
            lease.resize(start + want, 0);
            let n = outgoing.source.read(&mut lease[start..]);
            lease.truncate(start + *n.as_ref().unwrap_or(&0));
            Ok(n?)
        })?;

        match filled {
            None => Ok(self.job.stalled()),
            Some(0) => Err(Error::transfer(format!(
                "Log {} ended after {} of {} bytes",
                outgoing.version, outgoing.sent, outgoing.length
            ))),
            Some(n) => {
                outgoing.sent += n as u64;
                self.state = SlaveConnectionState::SendLog;
                Ok(self.job.progressed())
            }
        }
    }

    fn send(&mut self, next: SlaveConnectionState) -> Result<bool> {
        let flush = flush_frame(&mut self.job)?;
        Ok(settle_flush(&mut self.job, flush, &mut self.state, next))
    }

    fn violation(&mut self, reason: &str) -> bool {
        tracing::warn!(
            "Protocol violation from slave {} in {:?}: {}, closing",
            self.job.peer(),
            self.state,
            reason
        );
        self.job.close();
        true
    }

    fn abort_transfer(&mut self) {
        if let Some(outgoing) = self.outgoing.take() {
            tracing::debug!(
                "Abandoning log {} after {} of {} bytes",
                outgoing.version,
                outgoing.sent,
                outgoing.length
            );
        }
    }

    fn perform(&mut self) -> Result<bool> {
        if self.job.is_finished() {
            return Ok(false);
        }

        let result = peer_closed(self.step(), &mut self.job);
        match result {
            Ok(progress) => {
                if self.job.is_finished() {
                    self.abort_transfer();
                }
                Ok(progress)
            }
            Err(e) => {
                self.abort_transfer();
                self.job.close();
                Err(e)
            }
        }
    }
}

/// Master-side conversation with one slave
pub struct HandleSlaveConnection {
    inner: Arc<Mutex<SlaveConversation>>,
}

/// Thread-safe handle for pushing logs into a running conversation
#[derive(Clone)]
pub struct SlaveConnectionHandle {
    inner: Arc<Mutex<SlaveConversation>>,
}

impl HandleSlaveConnection {
    /// Serve `stream` from `master` over `conn`
    pub fn new(
        conn: Box<dyn Connection>,
        master: Arc<dyn MasterRole>,
        stream: impl Into<String>,
        config: &BackupConfig,
    ) -> Self {
        let conversation = SlaveConversation {
            job: ConnectionJob::new(conn, config),
            master,
            stream: stream.into(),
            state: SlaveConnectionState::GetMessage,
            outgoing: None,
            deferred: VecDeque::new(),
        };
        Self {
            inner: Arc::new(Mutex::new(conversation)),
        }
    }

    /// Attach a completion callback
    pub fn with_callback(self, callback: JobCallback) -> Self {
        self.inner.lock().job.set_callback(callback);
        self
    }

    /// Handle for offering logs from other threads
    pub fn handle(&self) -> SlaveConnectionHandle {
        SlaveConnectionHandle {
            inner: self.inner.clone(),
        }
    }
}

impl SlaveConnectionHandle {
    /// Push log `version` to the slave without waiting for a request.
    ///
    /// Returns `Ok(true)` when the offer was not taken: the conversation
    /// is over, busy with another transfer, or has part of a request in
    /// hand. The in-flight work is left untouched. Returns `Ok(false)`
    /// once the offer is scheduled.
    pub fn offer_log_to_slave(&self, version: u64) -> Result<bool> {
        let mut conversation = self.inner.lock();
        if conversation.job.is_finished() {
            return Ok(true);
        }
        if conversation.state != SlaveConnectionState::GetMessage
            || conversation.outgoing.is_some()
            || !conversation.deferred.is_empty()
            || conversation.job.has_buffered_input()
        {
            tracing::debug!(
                "Slave {} busy with log {:?}, not offering {}",
                conversation.job.peer(),
                conversation.outgoing.as_ref().map(|o| o.version),
                version
            );
            return Ok(true);
        }

        conversation.open_transfer(version)?;
        Ok(false)
    }

    /// Whether the conversation is over
    pub fn is_finished(&self) -> bool {
        self.inner.lock().job.is_finished()
    }

    /// Current state
    pub fn state(&self) -> SlaveConnectionState {
        self.inner.lock().state
    }

    /// Version being transferred, if any
    pub fn log_version_to_send(&self) -> Option<u64> {
        self.inner.lock().outgoing.as_ref().map(|o| o.version)
    }

    /// Declared length of the log being transferred
    pub fn log_length(&self) -> Option<u64> {
        self.inner.lock().outgoing.as_ref().map(|o| o.length)
    }

    /// Peer description
    pub fn peer(&self) -> String {
        self.inner.lock().job.peer().to_string()
    }
}

impl Job for HandleSlaveConnection {
    fn perform_job(&mut self) -> Result<bool> {
        self.inner.lock().perform()
    }

    fn needs_requeue(&self) -> bool {
        !self.inner.lock().job.is_finished()
    }

    fn execute_callback(&mut self, outcome: JobOutcome) {
        let callback = self.inner.lock().job.core_mut().take_callback();
        if let Some(callback) = callback {
            callback(outcome);
        }
    }

    fn chain_job(&mut self) -> Option<Box<dyn Job>> {
        self.inner.lock().job.core_mut().take_chain()
    }

    fn abort(&mut self) {
        let mut conversation = self.inner.lock();
        conversation.abort_transfer();
        conversation.job.close();
    }

    fn describe(&self) -> String {
        format!("slave connection {}", self.inner.lock().job.peer())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{MemoryConnection, pipe};
    use crate::store::FileLogStore;
    use bytes::BytesMut;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const STREAM: &str = "graph.db";

    fn setup(logs: &[&[u8]]) -> (HandleSlaveConnection, MemoryConnection, TempDir) {
        setup_with(logs, |conn| conn)
    }

    fn setup_with(
        logs: &[&[u8]],
        wrap: impl FnOnce(MemoryConnection) -> MemoryConnection,
    ) -> (HandleSlaveConnection, MemoryConnection, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = FileLogStore::open(dir.path()).unwrap();
        for log in logs {
            store.commit(STREAM, log).unwrap();
        }
        let (master_end, slave_end) = pipe();
        let config = BackupConfig::default().with_chunk_size(4);
        let job = HandleSlaveConnection::new(
            Box::new(wrap(master_end)),
            Arc::new(store),
            STREAM,
            &config,
        );
        (job, slave_end, dir)
    }

    fn request(slave: &mut MemoryConnection, version: u64) {
        let mut buf = BytesMut::new();
        RequestLog { version }.encode(&mut buf).unwrap();
        slave.write(&buf).unwrap();
    }

    fn read_all(slave: &mut MemoryConnection) -> Vec<u8> {
        let mut out = vec![0u8; 256];
        let n = slave.read(&mut out).unwrap();
        out.truncate(n);
        out
    }

    fn run(job: &mut HandleSlaveConnection, ticks: usize) {
        for _ in 0..ticks {
            job.perform_job().unwrap();
        }
    }

    #[test]
    fn test_request_offer_and_stream() {
        let (mut job, mut slave, _dir) =
            setup_with(&[b"first", b"second log"], |c| c.with_write_limit(3));
        let handle = job.handle();
        request(&mut slave, 2);

        run(&mut job, 3);
        assert_eq!(handle.state(), SlaveConnectionState::GetOk);
        assert_eq!(handle.log_version_to_send(), Some(2));

        let offer = read_all(&mut slave);
        let offer = OfferLog::decode(&mut &offer[..]).unwrap();
        assert_eq!(offer, OfferLog { version: 2, length: 10 });

        slave.write(&[MessageTag::Ok as u8]).unwrap();
        // Ack, then three chunks of at most 4 bytes each take two ticks.
        run(&mut job, 1 + 3 * 2 + 1);
        assert_eq!(read_all(&mut slave), b"second log");
        assert_eq!(handle.state(), SlaveConnectionState::GetMessage);
        assert_eq!(handle.log_version_to_send(), None);
    }

    #[test]
    fn test_declined_offer_returns_to_idle() {
        let (mut job, mut slave, _dir) = setup(&[b"one"]);
        let handle = job.handle();
        request(&mut slave, 1);
        run(&mut job, 3);
        read_all(&mut slave);

        slave.write(&[MessageTag::NotOk as u8]).unwrap();
        run(&mut job, 1);
        assert_eq!(handle.state(), SlaveConnectionState::GetMessage);
        assert_eq!(handle.log_version_to_send(), None);
        assert_eq!(slave.pending(), 0);
    }

    #[test]
    fn test_request_for_future_version_is_ignored() {
        let (mut job, mut slave, _dir) = setup(&[b"one"]);
        let handle = job.handle();
        request(&mut slave, 2);
        request(&mut slave, 7);
        run(&mut job, 2);
        assert_eq!(handle.state(), SlaveConnectionState::GetMessage);
        assert!(!handle.is_finished());
        assert_eq!(slave.pending(), 0);
    }

    #[test]
    fn test_missing_log_keeps_waiting() {
        let (mut job, mut slave, dir) = setup(&[b"one", b"two"]);
        std::fs::remove_file(dir.path().join(STREAM).join("nioneo_logical.log.v1")).unwrap();
        let handle = job.handle();
        request(&mut slave, 1);
        assert!(job.perform_job().unwrap());
        assert_eq!(handle.state(), SlaveConnectionState::GetMessage);
        assert!(!handle.is_finished());
    }

    #[test]
    fn test_push_offer() {
        let (mut job, mut slave, _dir) = setup(&[b"pushed"]);
        let handle = job.handle();
        assert!(!handle.offer_log_to_slave(1).unwrap());
        assert_eq!(handle.state(), SlaveConnectionState::SetupOfferLog);

        run(&mut job, 2);
        let offer = read_all(&mut slave);
        assert_eq!(
            OfferLog::decode(&mut &offer[..]).unwrap(),
            OfferLog { version: 1, length: 6 }
        );
    }

    #[test]
    fn test_busy_guard() {
        let (mut job, mut slave, _dir) = setup(&[b"aaaa", b"bbbbbbbb"]);
        let handle = job.handle();
        request(&mut slave, 1);
        run(&mut job, 2);
        assert_eq!(handle.log_version_to_send(), Some(1));

        assert!(handle.offer_log_to_slave(2).unwrap());
        assert_eq!(handle.log_version_to_send(), Some(1));
        assert_eq!(handle.log_length(), Some(4));
        assert_eq!(handle.state(), SlaveConnectionState::SendOffer);
    }

    #[test]
    fn test_push_refused_while_request_half_read() {
        let (mut job, mut slave, _dir) = setup(&[b"aaaa", b"bbbb"]);
        let handle = job.handle();
        let mut buf = BytesMut::new();
        RequestLog { version: 1 }.encode(&mut buf).unwrap();

        slave.write(&buf[..5]).unwrap();
        run(&mut job, 1);
        assert!(handle.offer_log_to_slave(2).unwrap());
        assert_eq!(handle.log_version_to_send(), None);

        slave.write(&buf[5..]).unwrap();
        run(&mut job, 1);
        assert!(!handle.is_finished());
        assert_eq!(handle.state(), SlaveConnectionState::SetupOfferLog);
        assert_eq!(handle.log_version_to_send(), Some(1));
    }

    #[test]
    fn test_request_crossing_push_is_served_after() {
        let (mut job, mut slave, _dir) = setup(&[b"aaaa", b"bbbbbb"]);
        let handle = job.handle();
        request(&mut slave, 1);
        assert!(!handle.offer_log_to_slave(2).unwrap());

        run(&mut job, 2);
        let offer = read_all(&mut slave);
        assert_eq!(
            OfferLog::decode(&mut &offer[..]).unwrap(),
            OfferLog { version: 2, length: 6 }
        );

        // The request arrives where the ack is expected.
        run(&mut job, 1);
        assert_eq!(handle.state(), SlaveConnectionState::GetOk);
        assert!(!handle.is_finished());

        slave.write(&[MessageTag::Ok as u8]).unwrap();
        // Ack, two chunks with a flush each, the end of the log, the request.
        run(&mut job, 1 + 2 * 2 + 1 + 1);
        assert_eq!(read_all(&mut slave), b"bbbbbb");
        assert_eq!(handle.state(), SlaveConnectionState::SetupOfferLog);
        assert_eq!(handle.log_version_to_send(), Some(1));
    }

    #[test]
    fn test_negative_version_closes_without_fault() {
        let (mut job, mut slave, _dir) = setup(&[b"one"]);
        let handle = job.handle();
        let mut frame = vec![MessageTag::RequestLog as u8];
        frame.extend_from_slice(&(-1i64).to_be_bytes());
        slave.write(&frame).unwrap();

        assert!(job.perform_job().unwrap());
        assert!(handle.is_finished());
        assert!(!job.needs_requeue());
    }

    #[test]
    fn test_unknown_ack_closes() {
        let (mut job, mut slave, _dir) = setup(&[b"one"]);
        let handle = job.handle();
        request(&mut slave, 1);
        run(&mut job, 3);

        slave.write(&[0x42]).unwrap();
        assert!(job.perform_job().unwrap());
        assert!(handle.is_finished());
        assert_eq!(handle.log_version_to_send(), None);
        assert!(handle.offer_log_to_slave(1).unwrap());
    }

    #[test]
    fn test_slave_hangup_ends_quietly() {
        let (mut job, mut slave, _dir) = setup(&[b"one"]);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        job = job.with_callback(Box::new(move |outcome| {
            assert_eq!(outcome, JobOutcome::Completed);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        slave.close();
        assert!(job.perform_job().unwrap());
        assert!(!job.needs_requeue());
        job.execute_callback(JobOutcome::Completed);
        job.execute_callback(JobOutcome::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_length_log() {
        let (mut job, mut slave, _dir) = setup(&[b""]);
        let handle = job.handle();
        request(&mut slave, 1);
        run(&mut job, 3);
        slave.write(&[MessageTag::Ok as u8]).unwrap();
        run(&mut job, 2);
        assert_eq!(handle.state(), SlaveConnectionState::GetMessage);
    }
}
