//! Protocol conversations
//!
//! - [`HandleMasterConnection`]: slave side, pulls missing logs from a
//!   master and accepts unsolicited offers.
//! - [`HandleSlaveConnection`]: master side, answers log requests and
//!   pushes freshly committed logs.
//!
//! Both advance by at most one wire exchange per `perform_job` call.

mod master_connection;
mod slave_connection;

pub use master_connection::{HandleMasterConnection, MasterConnectionState};
pub use slave_connection::{HandleSlaveConnection, SlaveConnectionHandle, SlaveConnectionState};

use crate::connection_job::ConnectionJob;
use crate::protocol::MessageTag;
use crate::{Error, Result};
use bytes::BytesMut;

/// Result of trying to read one fixed-size frame
enum Frame<T> {
    /// Read buffer busy
    Busy,
    /// Frame incomplete; whether any bytes arrived this step
    Pending(bool),
    /// Frame violates the protocol; the reason is for the log
    Invalid(String),
    /// Complete, decoded frame
    Ready(T),
}

/// Accumulate a `len`-byte frame whose first byte must be one of `tags`
/// and decode it once complete.
fn read_frame<T>(
    job: &mut ConnectionJob,
    len: usize,
    tags: &[MessageTag],
    decode: impl FnOnce(&mut BytesMut) -> Result<T>,
) -> Result<Frame<T>> {
    let frame = job.with_read_buffer(|lease| {
        let read = lease.fill_to(len)?;
        let Some(&first) = lease.first() else {
            return Ok(Frame::Pending(false));
        };
        if !tags.iter().any(|tag| *tag as u8 == first) {
            lease.clear();
            return Ok(Frame::Invalid(format!("unexpected tag {:#04x}", first)));
        }
        if lease.len() < len {
            return Ok(Frame::Pending(read > 0));
        }
        match decode(&mut **lease) {
            Ok(value) => Ok(Frame::Ready(value)),
            Err(Error::Protocol(reason)) => {
                lease.clear();
                Ok(Frame::Invalid(reason))
            }
            Err(e) => Err(e),
        }
    })?;
    Ok(frame.unwrap_or(Frame::Busy))
}

/// Look at the first byte of the next frame without consuming it
fn peek_tag(job: &mut ConnectionJob) -> Result<Frame<u8>> {
    let frame = job.with_read_buffer(|lease| {
        let read = lease.fill_to(1)?;
        Ok(match lease.first() {
            Some(&tag) => Frame::Ready(tag),
            None => Frame::Pending(read > 0),
        })
    })?;
    Ok(frame.unwrap_or(Frame::Busy))
}

/// Encode a frame into the (empty) write buffer.
///
/// Returns `false` when the buffer is busy.
fn write_frame(
    job: &mut ConnectionJob,
    encode: impl FnOnce(&mut BytesMut) -> Result<()>,
) -> Result<bool> {
    let written = job.with_write_buffer(|lease| {
        if !lease.is_empty() {
            return Err(Error::internal(
                "write buffer still holds an unsent frame",
            ));
        }
        encode(&mut **lease)
    })?;
    Ok(written.is_some())
}

/// Outcome of flushing the write buffer
enum Flush {
    /// Write buffer busy
    Busy,
    /// Some bytes remain; how many went out this step
    Partial(usize),
    /// Buffer fully written
    Drained,
}

fn flush_frame(job: &mut ConnectionJob) -> Result<Flush> {
    let flushed = job.with_write_buffer(|lease| {
        let n = lease.flush()?;
        Ok(if lease.is_empty() {
            Flush::Drained
        } else {
            Flush::Partial(n)
        })
    })?;
    Ok(flushed.unwrap_or(Flush::Busy))
}

/// Apply a flush outcome: advance to `next` once drained
fn settle_flush<S>(job: &mut ConnectionJob, flush: Flush, state: &mut S, next: S) -> bool {
    match flush {
        Flush::Busy => job.stalled(),
        Flush::Partial(n) => job.settle(n > 0),
        Flush::Drained => {
            *state = next;
            job.progressed()
        }
    }
}

/// End the conversation quietly when the peer hung up; keep other errors
fn peer_closed(result: Result<bool>, job: &mut ConnectionJob) -> Result<bool> {
    match result {
        Err(Error::Disconnected(reason)) => {
            tracing::info!("Conversation with {} ended: {}", job.peer(), reason);
            job.close();
            Ok(true)
        }
        other => other,
    }
}
