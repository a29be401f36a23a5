//! Role objects consulted by the conversations
//!
//! The master side serves complete logs of one or more data sources
//! (streams); the slave side knows which logs it already holds, where a
//! received log must be installed and how to apply it.

use crate::Result;
use std::io::Read;
use std::path::PathBuf;

/// Readable log payload handed to a master-side conversation
pub type LogSource = Box<dyn Read + Send>;

/// Log inventory of the node that owns the authoritative logs
pub trait MasterRole: Send + Sync {
    /// Current log version of `stream`.
    ///
    /// This is the version the next committed log will carry; every
    /// version below it is complete and can be shipped.
    fn get_version(&self, stream: &str) -> u64;

    /// Whether the complete log `version` of `stream` exists
    fn has_log(&self, stream: &str, version: u64) -> bool;

    /// Open log `version` of `stream` for reading
    fn get_log(&self, stream: &str, version: u64) -> Result<LogSource>;

    /// Byte length of log `version` of `stream`
    fn get_log_length(&self, stream: &str, version: u64) -> Result<u64>;
}

/// Log inventory of a node that replicates the master's logs
pub trait SlaveRole: Send + Sync {
    /// Highest log version applied so far; 0 before the first log
    fn get_version(&self) -> u64;

    /// Whether log `version` is installed locally.
    ///
    /// This is the only authority on "already have it"; version numbers
    /// alone never imply presence.
    fn has_log(&self, version: u64) -> bool;

    /// Final path of log `version` in the local naming scheme
    fn get_log_name(&self, version: u64) -> PathBuf;

    /// Apply any newly installed logs that extend the applied sequence
    fn try_apply_new_log(&self) -> Result<()>;
}
