//! Machinery shared by connection-bound conversations
//!
//! A [`ConnectionJob`] owns one [`Connection`] for the lifetime of a
//! conversation. Its buffers are borrowed from the connection through
//! [`BufferLease`] guards: the lease is released when the guard drops, on
//! every exit path of a state function.
//!
//! Stalled steps count against a retry ceiling; once it is reached the
//! connection is closed so a silent peer cannot hold resources forever.

use crate::config::BackupConfig;
use crate::connection::{Connection, ConnectionBuffers};
use crate::job::{JobCallback, JobCore, JobOutcome};
use crate::Result;
use bytes::{Buf, BytesMut};
use parking_lot::MutexGuard;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Exclusive use of one connection buffer plus the connection itself
pub struct BufferLease<'a> {
    buffer: MutexGuard<'a, BytesMut>,
    conn: &'a mut (dyn Connection + 'static),
    chunk_size: usize,
}

impl BufferLease<'_> {
    /// Read until the buffer holds `want` bytes or the connection runs dry.
    ///
    /// Never reads past `want`, so frame headers are not over-read.
    /// Returns the number of bytes added by this call.
    pub fn fill_to(&mut self, want: usize) -> Result<usize> {
        let mut total = 0;
        while self.buffer.len() < want {
            let missing = want - self.buffer.len();
            let n = self.read_up_to(missing)?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    /// Read one chunk of whatever the connection has
    pub fn read_chunk(&mut self) -> Result<usize> {
        self.read_up_to(self.chunk_size)
    }

    /// Write out as much of the buffer as the connection accepts.
    ///
    /// Returns the number of bytes written; the buffer keeps the rest.
    pub fn flush(&mut self) -> Result<usize> {
        let mut total = 0;
        while !self.buffer.is_empty() {
            let n = self.conn.write(&self.buffer)?;
            if n == 0 {
                break;
            }
            self.buffer.advance(n);
            total += n;
        }
        Ok(total)
    }

    /// Hand everything past the first `keep` bytes back to the connection
    pub fn push_back_after(&mut self, keep: usize) {
        if self.buffer.len() > keep {
            let rest = self.buffer.split_off(keep);
            self.conn.push_back_read_data(&rest);
        }
    }

    /// Give the buffer back to the connection
    pub fn release(self) {}

    fn read_up_to(&mut self, max: usize) -> Result<usize> {
        let start = self.buffer.len();
        self.buffer.resize(start + max, 0);
        let result = self.conn.read(&mut self.buffer[start..]);
        let n = *result.as_ref().unwrap_or(&0);
        self.buffer.truncate(start + n);
        result
    }
}

impl Deref for BufferLease<'_> {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buffer
    }
}

impl DerefMut for BufferLease<'_> {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }
}

/// A job bound to one connection
pub struct ConnectionJob {
    conn: Box<dyn Connection>,
    buffers: Arc<ConnectionBuffers>,
    peer: String,
    retries: u32,
    max_retries: u32,
    chunk_size: usize,
    core: JobCore,
}

impl ConnectionJob {
    /// Bind `conn` using the retry ceiling and chunk size from `config`
    pub fn new(conn: Box<dyn Connection>, config: &BackupConfig) -> Self {
        let buffers = conn.buffers();
        let peer = conn.peer();
        Self {
            conn,
            buffers,
            peer,
            retries: 0,
            max_retries: config.max_retries,
            chunk_size: config.chunk_size,
            core: JobCore::new(),
        }
    }

    /// Lease the read buffer; `None` means try again next tick
    pub fn acquire_read_buffer(&mut self) -> Option<BufferLease<'_>> {
        let buffer = self.buffers.try_read()?;
        Some(BufferLease {
            buffer,
            conn: self.conn.as_mut(),
            chunk_size: self.chunk_size,
        })
    }

    /// Lease the write buffer; `None` means try again next tick
    pub fn acquire_write_buffer(&mut self) -> Option<BufferLease<'_>> {
        let buffer = self.buffers.try_write()?;
        Some(BufferLease {
            buffer,
            conn: self.conn.as_mut(),
            chunk_size: self.chunk_size,
        })
    }

    /// Run `f` with the read buffer leased.
    ///
    /// Returns `Ok(None)` without calling `f` when the buffer is busy. The
    /// lease is released when `f` returns, whatever the outcome.
    pub fn with_read_buffer<R>(
        &mut self,
        f: impl FnOnce(&mut BufferLease<'_>) -> Result<R>,
    ) -> Result<Option<R>> {
        let Some(mut lease) = self.acquire_read_buffer() else {
            return Ok(None);
        };
        let result = f(&mut lease);
        lease.release();
        result.map(Some)
    }

    /// Run `f` with the write buffer leased; see [`Self::with_read_buffer`]
    pub fn with_write_buffer<R>(
        &mut self,
        f: impl FnOnce(&mut BufferLease<'_>) -> Result<R>,
    ) -> Result<Option<R>> {
        let Some(mut lease) = self.acquire_write_buffer() else {
            return Ok(None);
        };
        let result = f(&mut lease);
        lease.release();
        result.map(Some)
    }

    /// Whether part of an incoming frame is already in hand.
    ///
    /// A leased read buffer counts as in hand.
    pub fn has_buffered_input(&self) -> bool {
        self.buffers.try_read().is_none_or(|buffer| !buffer.is_empty())
    }

    /// Record a step that moved bytes or changed state
    pub fn progressed(&mut self) -> bool {
        self.retries = 0;
        true
    }

    /// Record a step that made no progress.
    ///
    /// Closes the conversation once `max_retries` consecutive stalls
    /// have accumulated. Always reports no progress.
    pub fn stalled(&mut self) -> bool {
        self.retries += 1;
        if self.retries >= self.max_retries {
            tracing::warn!(
                "No progress with {} for {} ticks, closing",
                self.peer,
                self.retries
            );
            self.close();
        }
        false
    }

    /// Record a step and return its progress flag
    pub fn settle(&mut self, progressed: bool) -> bool {
        if progressed {
            self.progressed()
        } else {
            self.stalled()
        }
    }

    /// Consecutive stalled steps so far
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Close the connection and finish the job
    pub fn close(&mut self) {
        self.conn.close();
        self.core.finish();
    }

    /// Whether the conversation is over
    pub fn is_finished(&self) -> bool {
        !self.core.needs_requeue()
    }

    /// Whether the underlying connection is open
    pub fn connected(&self) -> bool {
        self.conn.connected()
    }

    /// Chunk size for payload reads and writes
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Peer description
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Diagnostic hook for per-step tracing
    pub fn log(&self, msg: &str) {
        tracing::trace!(peer = %self.peer, "{}", msg);
    }

    /// Attach a completion callback
    pub fn set_callback(&mut self, callback: JobCallback) {
        self.core.set_callback(callback);
    }

    /// Run the completion callback
    pub fn execute_callback(&mut self, outcome: JobOutcome) {
        self.core.execute_callback(outcome);
    }

    /// Mutable access to the callback, chain and finish flag
    pub fn core_mut(&mut self) -> &mut JobCore {
        &mut self.core
    }
}
