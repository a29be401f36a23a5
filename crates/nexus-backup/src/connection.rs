//! Non-blocking duplex byte channels
//!
//! A [`Connection`] never blocks: reads and writes move whatever the
//! transport accepts right now and report `Ok(0)` when nothing could be
//! moved. Bytes read past a message boundary can be pushed back and are
//! served by the next reads before any new transport data.
//!
//! Each connection owns a pair of [`ConnectionBuffers`] that conversations
//! lease one message at a time.

use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;

/// Non-blocking byte channel consumed by conversations
pub trait Connection: Send {
    /// Read available bytes into `dst`.
    ///
    /// Returns `Ok(0)` when nothing is available yet and
    /// `Err(Error::Disconnected)` once the peer has closed the channel.
    fn read(&mut self, dst: &mut [u8]) -> Result<usize>;

    /// Write as much of `src` as the transport accepts right now
    fn write(&mut self, src: &[u8]) -> Result<usize>;

    /// Return over-read bytes so the next read yields them first
    fn push_back_read_data(&mut self, data: &[u8]);

    /// Whether the channel is still open
    fn connected(&self) -> bool;

    /// Close the channel; idempotent
    fn close(&mut self);

    /// Shared buffers leased by the conversation driving this connection
    fn buffers(&self) -> Arc<ConnectionBuffers>;

    /// Human readable peer description for logs
    fn peer(&self) -> String;
}

/// Read and write staging buffers owned by a connection
#[derive(Debug, Default)]
pub struct ConnectionBuffers {
    read: Mutex<BytesMut>,
    write: Mutex<BytesMut>,
}

impl ConnectionBuffers {
    /// Create an empty buffer pair
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease the read buffer, or `None` while someone else holds it
    pub fn try_read(&self) -> Option<MutexGuard<'_, BytesMut>> {
        self.read.try_lock()
    }

    /// Lease the write buffer, or `None` while someone else holds it
    pub fn try_write(&self) -> Option<MutexGuard<'_, BytesMut>> {
        self.write.try_lock()
    }
}

/// Bytes handed back by a conversation, served before transport data
#[derive(Debug, Default)]
struct PushBack {
    data: BytesMut,
}

impl PushBack {
    fn push(&mut self, bytes: &[u8]) {
        // Pushed bytes precede anything still pending from earlier pushes.
        let mut merged = BytesMut::with_capacity(bytes.len() + self.data.len());
        merged.extend_from_slice(bytes);
        merged.extend_from_slice(&self.data);
        self.data = merged;
    }

    fn take(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.data.len());
        dst[..n].copy_from_slice(&self.data[..n]);
        self.data.advance(n);
        n
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// TCP connection in non-blocking mode
pub struct TcpConnection {
    stream: TcpStream,
    peer: String,
    open: bool,
    pushed: PushBack,
    buffers: Arc<ConnectionBuffers>,
}

impl TcpConnection {
    /// Wrap an accepted or connected stream, switching it to non-blocking mode
    pub fn new(stream: TcpStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Ok(Self {
            stream,
            peer,
            open: true,
            pushed: PushBack::default(),
            buffers: Arc::new(ConnectionBuffers::new()),
        })
    }

    /// Connect to `addr` (blocking connect), then switch to non-blocking mode
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Self::new(stream)
    }

    /// Remote address, if still known
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    fn closed_error(&self) -> Error {
        Error::disconnected(format!("connection to {} is closed", self.peer))
    }
}

impl Connection for TcpConnection {
    fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        if !self.pushed.is_empty() {
            return Ok(self.pushed.take(dst));
        }
        if !self.open {
            return Err(self.closed_error());
        }
        if dst.is_empty() {
            return Ok(0);
        }

        match self.stream.read(dst) {
            Ok(0) => {
                self.open = false;
                Err(Error::disconnected(format!("{} closed the connection", self.peer)))
            }
            Ok(n) => Ok(n),
            Err(e) if is_would_block(&e) => Ok(0),
            Err(e) => {
                self.open = false;
                Err(e.into())
            }
        }
    }

    fn write(&mut self, src: &[u8]) -> Result<usize> {
        if !self.open {
            return Err(self.closed_error());
        }
        match self.stream.write(src) {
            Ok(n) => Ok(n),
            Err(e) if is_would_block(&e) => Ok(0),
            Err(e) => {
                self.open = false;
                Err(e.into())
            }
        }
    }

    fn push_back_read_data(&mut self, data: &[u8]) {
        self.pushed.push(data);
    }

    fn connected(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            let _ = self.stream.shutdown(Shutdown::Both);
            tracing::debug!("Closed connection to {}", self.peer);
        }
    }

    fn buffers(&self) -> Arc<ConnectionBuffers> {
        self.buffers.clone()
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

fn is_would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// One direction of an in-memory pipe
#[derive(Debug, Default)]
struct Lane {
    data: VecDeque<u8>,
    closed: bool,
}

/// In-process connection, one end of a [`pipe`]
///
/// Writes land in the peer's inbound lane. A per-call write limit can
/// simulate a congested transport that only accepts partial writes.
pub struct MemoryConnection {
    name: String,
    inbound: Arc<Mutex<Lane>>,
    outbound: Arc<Mutex<Lane>>,
    open: bool,
    write_limit: Option<usize>,
    pushed: PushBack,
    buffers: Arc<ConnectionBuffers>,
}

/// Create a connected pair of in-memory connections
pub fn pipe() -> (MemoryConnection, MemoryConnection) {
    let a_to_b = Arc::new(Mutex::new(Lane::default()));
    let b_to_a = Arc::new(Mutex::new(Lane::default()));

    let a = MemoryConnection::new("pipe-a", b_to_a.clone(), a_to_b.clone());
    let b = MemoryConnection::new("pipe-b", a_to_b, b_to_a);
    (a, b)
}

impl MemoryConnection {
    fn new(name: &str, inbound: Arc<Mutex<Lane>>, outbound: Arc<Mutex<Lane>>) -> Self {
        Self {
            name: name.to_string(),
            inbound,
            outbound,
            open: true,
            write_limit: None,
            pushed: PushBack::default(),
            buffers: Arc::new(ConnectionBuffers::new()),
        }
    }

    /// Accept at most `limit` bytes per write call
    pub fn with_write_limit(mut self, limit: usize) -> Self {
        self.write_limit = Some(limit);
        self
    }

    /// Bytes written by the peer and not yet read
    pub fn pending(&self) -> usize {
        self.inbound.lock().data.len() + self.pushed.data.len()
    }
}

impl Connection for MemoryConnection {
    fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        if !self.pushed.is_empty() {
            return Ok(self.pushed.take(dst));
        }
        if !self.open {
            return Err(Error::disconnected(format!("{} is closed", self.name)));
        }

        let mut lane = self.inbound.lock();
        if lane.data.is_empty() {
            if lane.closed {
                return Err(Error::disconnected(format!(
                    "peer of {} closed the pipe",
                    self.name
                )));
            }
            return Ok(0);
        }

        let n = dst.len().min(lane.data.len());
        for (slot, byte) in dst.iter_mut().zip(lane.data.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&mut self, src: &[u8]) -> Result<usize> {
        if !self.open {
            return Err(Error::disconnected(format!("{} is closed", self.name)));
        }

        let mut lane = self.outbound.lock();
        if lane.closed {
            return Err(Error::disconnected(format!(
                "peer of {} closed the pipe",
                self.name
            )));
        }

        let n = self.write_limit.map_or(src.len(), |limit| limit.min(src.len()));
        lane.data.extend(&src[..n]);
        Ok(n)
    }

    fn push_back_read_data(&mut self, data: &[u8]) {
        self.pushed.push(data);
    }

    fn connected(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            // Both lanes close so the peer sees EOF on read and write.
            self.inbound.lock().closed = true;
            self.outbound.lock().closed = true;
        }
    }

    fn buffers(&self) -> Arc<ConnectionBuffers> {
        self.buffers.clone()
    }

    fn peer(&self) -> String {
        self.name.clone()
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.close();
    }
}
