//! Slave side of a backup conversation
//!
//! Drives a slave's "catch me up" exchange with a master: it requests the
//! next missing log version while the slave trails the master by more
//! than one version, and otherwise waits for offers. An accepted log is
//! streamed into a temp file next to its final path and renamed into
//! place only once its full declared length has been written.

use super::{Frame, flush_frame, peer_closed, read_frame, settle_flush, write_frame};
use crate::config::BackupConfig;
use crate::connection::Connection;
use crate::connection_job::ConnectionJob;
use crate::job::{Job, JobCallback, JobOutcome};
use crate::protocol::{self, MessageTag, OFFER_LOG_LEN, OfferLog, RequestLog};
use crate::roles::SlaveRole;
use crate::{Error, Result};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tempfile::NamedTempFile;

/// States of the slave-side conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterConnectionState {
    /// Waiting for an offer
    GetMessage,
    /// Looking for the next missing version to request
    SetupRequest,
    /// Flushing a request frame
    SendRequest,
    /// Building an acceptance
    SetupOk,
    /// Building a refusal
    SetupNotOk,
    /// Flushing the acceptance
    SendOk,
    /// Flushing the refusal
    SendNotOk,
    /// Receiving the log payload
    GetLog,
}

/// Log being received into a temp file
struct IncomingLog {
    version: u64,
    length: u64,
    written: u64,
    file: NamedTempFile,
}

/// Slave-side conversation with a master
pub struct HandleMasterConnection {
    job: ConnectionJob,
    slave: Arc<dyn SlaveRole>,
    master_version_at_start: u64,
    state: MasterConnectionState,
    incoming: Option<IncomingLog>,
}

impl HandleMasterConnection {
    /// Start a conversation over `conn`.
    ///
    /// `master_version` is the master's current log version as known when
    /// the conversation starts; it decides whether the slave begins by
    /// requesting logs or by waiting for offers.
    pub fn new(
        conn: Box<dyn Connection>,
        slave: Arc<dyn SlaveRole>,
        master_version: u64,
        config: &BackupConfig,
    ) -> Self {
        let state = resume_state(slave.as_ref(), master_version);
        tracing::debug!(
            "Slave at version {} talking to master at {}, starting in {:?}",
            slave.get_version(),
            master_version,
            state
        );

        Self {
            job: ConnectionJob::new(conn, config),
            slave,
            master_version_at_start: master_version,
            state,
            incoming: None,
        }
    }

    /// Attach a completion callback
    pub fn with_callback(mut self, callback: JobCallback) -> Self {
        self.job.set_callback(callback);
        self
    }

    /// Current state
    pub fn state(&self) -> MasterConnectionState {
        self.state
    }

    /// Version being received, if a transfer is in flight
    pub fn log_version_being_written(&self) -> Option<u64> {
        self.incoming.as_ref().map(|log| log.version)
    }

    /// Declared length of the log being received
    pub fn log_length(&self) -> Option<u64> {
        self.incoming.as_ref().map(|log| log.length)
    }

    /// Path of the temp file receiving the current log
    pub fn temp_file(&self) -> Option<&Path> {
        self.incoming.as_ref().map(|log| log.file.path())
    }

    /// Consecutive stalled steps
    pub fn retries(&self) -> u32 {
        self.job.retries()
    }

    fn step(&mut self) -> Result<bool> {
        match self.state {
            MasterConnectionState::GetMessage => self.get_message(),
            MasterConnectionState::SetupRequest => self.setup_request(),
            MasterConnectionState::SendRequest => self.send(MasterConnectionState::GetMessage),
            MasterConnectionState::SetupOk => self.setup_ack(true),
            MasterConnectionState::SetupNotOk => self.setup_ack(false),
            MasterConnectionState::SendOk => self.send(MasterConnectionState::GetLog),
            MasterConnectionState::SendNotOk => self.send(MasterConnectionState::GetMessage),
            MasterConnectionState::GetLog => self.get_log(),
        }
    }

    fn get_message(&mut self) -> Result<bool> {
        let frame = read_frame(
            &mut self.job,
            OFFER_LOG_LEN,
            &[MessageTag::OfferLog],
            OfferLog::decode,
        )?;

        match frame {
            Frame::Busy => Ok(self.job.stalled()),
            Frame::Pending(progress) => Ok(self.job.settle(progress)),
            Frame::Invalid(reason) => {
                tracing::warn!(
                    "Protocol violation from master {}: {}, closing",
                    self.job.peer(),
                    reason
                );
                self.job.close();
                Ok(true)
            }
            Frame::Ready(offer) => {
                self.consider_offer(offer)?;
                Ok(self.job.progressed())
            }
        }
    }

    fn consider_offer(&mut self, offer: OfferLog) -> Result<()> {
        let local = self.slave.get_version();

        if offer.version < local {
            tracing::debug!(
                "Declining log {}: slave already at {}",
                offer.version,
                local
            );
            self.state = MasterConnectionState::SetupNotOk;
            return Ok(());
        }

        if self.slave.has_log(offer.version) {
            tracing::debug!("Declining log {}: already present", offer.version);
            self.state = MasterConnectionState::SetupNotOk;
            return Ok(());
        }

        let target = self.slave.get_log_name(offer.version);
        let dir = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let file = tempfile::Builder::new()
            .prefix(".incoming-")
            .suffix(&format!(".v{}", offer.version))
            .tempfile_in(dir)
            .map_err(|e| {
                Error::transfer(format!(
                    "Cannot create temp file for log {} in {}: {}",
                    offer.version,
                    dir.display(),
                    e
                ))
            })?;

        tracing::debug!(
            "Accepting log {} ({} bytes) into {}",
            offer.version,
            offer.length,
            file.path().display()
        );
        self.incoming = Some(IncomingLog {
            version: offer.version,
            length: offer.length,
            written: 0,
            file,
        });
        self.state = MasterConnectionState::SetupOk;
        Ok(())
    }

    fn setup_request(&mut self) -> Result<bool> {
        let local = self.slave.get_version();
        let missing = (local.saturating_add(1)..self.master_version_at_start)
            .find(|version| !self.slave.has_log(*version));

        let Some(version) = missing else {
            self.state = MasterConnectionState::GetMessage;
            return Ok(self.job.progressed());
        };

        if !write_frame(&mut self.job, |buf| RequestLog { version }.encode(buf))? {
            return Ok(self.job.stalled());
        }

        self.job.log(&format!("requesting log {}", version));
        self.state = MasterConnectionState::SendRequest;
        Ok(self.job.progressed())
    }

    fn setup_ack(&mut self, accepted: bool) -> Result<bool> {
        let written = write_frame(&mut self.job, |buf| {
            protocol::encode_ack(accepted, buf);
            Ok(())
        })?;
        if !written {
            return Ok(self.job.stalled());
        }

        self.state = if accepted {
            MasterConnectionState::SendOk
        } else {
            MasterConnectionState::SendNotOk
        };
        Ok(self.job.progressed())
    }

    fn send(&mut self, next: MasterConnectionState) -> Result<bool> {
        let flush = flush_frame(&mut self.job)?;
        Ok(settle_flush(&mut self.job, flush, &mut self.state, next))
    }

    fn get_log(&mut self) -> Result<bool> {
        let Some(incoming) = self.incoming.as_mut() else {
            return Err(Error::internal("receiving a log without a transfer"));
        };

        let remaining = incoming.length - incoming.written;
        if remaining > 0 {
            let moved = self.job.with_read_buffer(|lease| {
                if lease.is_empty() {
                    lease.read_chunk()?;
                }
                // Anything past the declared length belongs to the next message.
                let take = (lease.len() as u64).min(remaining) as usize;
                lease.push_back_after(take);
                incoming.file.write_all(&lease[..take])?;
                lease.clear();
                Ok(take)
            })?;

            match moved {
                None | Some(0) => return Ok(self.job.stalled()),
                Some(n) => incoming.written += n as u64,
            }
            if incoming.written < incoming.length {
                return Ok(self.job.progressed());
            }
        }

        self.install()?;
        Ok(self.job.progressed())
    }

    fn install(&mut self) -> Result<()> {
        let Some(incoming) = self.incoming.take() else {
            return Err(Error::internal("installing a log without a transfer"));
        };
        debug_assert_eq!(incoming.written, incoming.length);

        incoming.file.as_file().sync_all()?;
        let target = self.slave.get_log_name(incoming.version);
        incoming.file.persist_noclobber(&target).map_err(|e| {
            Error::transfer(format!(
                "Cannot install log {} at {}: {}",
                incoming.version,
                target.display(),
                e
            ))
        })?;

        tracing::info!(
            "Installed log {} ({} bytes) at {}",
            incoming.version,
            incoming.length,
            target.display()
        );

        self.slave.try_apply_new_log()?;
        self.state = resume_state(self.slave.as_ref(), self.master_version_at_start);
        Ok(())
    }

    fn discard_transfer(&mut self) {
        if let Some(incoming) = self.incoming.take() {
            tracing::debug!(
                "Discarding partial log {} ({} of {} bytes)",
                incoming.version,
                incoming.written,
                incoming.length
            );
        }
    }
}

/// Request logs while more than one version behind, otherwise wait for offers
fn resume_state(slave: &dyn SlaveRole, master_version: u64) -> MasterConnectionState {
    if master_version > slave.get_version().saturating_add(1) {
        MasterConnectionState::SetupRequest
    } else {
        MasterConnectionState::GetMessage
    }
}

impl Job for HandleMasterConnection {
    fn perform_job(&mut self) -> Result<bool> {
        if self.job.is_finished() {
            return Ok(false);
        }

        let result = self.step();
        let result = peer_closed(result, &mut self.job);
        match result {
            Ok(progress) => {
                if self.job.is_finished() {
                    self.discard_transfer();
                }
                Ok(progress)
            }
            Err(e) => {
                self.discard_transfer();
                self.job.close();
                Err(e)
            }
        }
    }

    fn needs_requeue(&self) -> bool {
        !self.job.is_finished()
    }

    fn execute_callback(&mut self, outcome: JobOutcome) {
        self.job.execute_callback(outcome);
    }

    fn chain_job(&mut self) -> Option<Box<dyn Job>> {
        self.job.core_mut().take_chain()
    }

    fn abort(&mut self) {
        self.discard_transfer();
        self.job.close();
    }

    fn describe(&self) -> String {
        format!("master connection {}", self.job.peer())
    }
}
