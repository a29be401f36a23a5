//! Error types for Nexus online backup

use std::io;
use thiserror::Error;

/// Result type alias using the backup Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the replication engine
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from sockets, temp files or log sources
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the connection or it was closed locally
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// Unrecognized tag or out-of-range field on the wire
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// A log transfer could not be set up or completed
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The job queue is at capacity
    #[error("Job queue full ({0} jobs)")]
    QueueFull(usize),

    /// The scheduler has stopped and accepts no more jobs
    #[error("Job eater is shut down")]
    Shutdown,

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a disconnected error
    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::Disconnected(msg.into())
    }

    /// Create a protocol violation error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a transfer error
    pub fn transfer(msg: impl Into<String>) -> Self {
        Self::Transfer(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether retrying the same I/O step later may succeed.
    ///
    /// Only would-block style socket conditions qualify; everything else
    /// ends the conversation.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let would_block = Error::from(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(would_block.is_transient());

        let reset = Error::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(!reset.is_transient());

        assert!(!Error::protocol("bad tag").is_transient());
        assert!(!Error::disconnected("eof").is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = Error::QueueFull(16);
        assert_eq!(err.to_string(), "Job queue full (16 jobs)");
        assert!(Error::transfer("rename").to_string().contains("rename"));
    }
}
