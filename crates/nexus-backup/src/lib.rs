//! Nexus Backup - Online Log Replication
//!
//! This crate keeps slaves near-synchronized with a master by shipping
//! immutable, sequentially numbered transaction logs:
//! - Cooperative single-thread scheduler ([`JobEater`]) with a ready
//!   queue and a slow list for stalled jobs
//! - Per-connection protocol state machines that advance one wire
//!   exchange per step
//! - Pull (slave requests a missing version) and push (master offers a
//!   freshly committed log) on the same conversation
//! - Atomic install: a received log becomes visible only once complete
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐                 ┌──────────────────────────┐
//! │        MasterNode        │                 │        SlaveNode         │
//! │  (accept job, push new   │                 │  (connect, submit job)   │
//! │   logs to idle slaves)   │                 │                          │
//! └────────────┬─────────────┘                 └────────────┬─────────────┘
//!              │                                            │
//! ┌────────────┴─────────────┐   REQUEST_LOG   ┌────────────┴─────────────┐
//! │  HandleSlaveConnection   │ ◄────────────── │  HandleMasterConnection  │
//! │      (master side)       │ ──────────────► │      (slave side)        │
//! │                          │ OFFER_LOG, log  │                          │
//! └────────────┬─────────────┘   ◄── OK/NOT_OK └────────────┬─────────────┘
//!              │                                            │
//! ┌────────────┴────────────────────────────────────────────┴─────────────┐
//! │                     JobEater (ready queue + slow list)                │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Wire Protocol
//!
//! Fixed-width frames, big-endian integers:
//!
//! ```text
//! OFFER_LOG   [0x01][version:i64][length:i64]   followed by `length` log bytes
//! REQUEST_LOG [0x02][version:i64]
//! OK          [0x03]
//! NOT_OK      [0x04]
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod connection_job;
pub mod eater;
pub mod error;
pub mod handler;
pub mod job;
pub mod master;
pub mod protocol;
pub mod roles;
pub mod slave;
pub mod store;

pub use config::{BackupConfig, SchedulerConfig};
pub use connection::{Connection, MemoryConnection, TcpConnection, pipe};
pub use eater::{JobEater, JobSubmitter, Scheduler};
pub use error::{Error, Result};
pub use handler::{HandleMasterConnection, HandleSlaveConnection, SlaveConnectionHandle};
pub use job::{Job, JobCallback, JobOutcome};
pub use master::{MasterNode, MasterStats};
pub use roles::{MasterRole, SlaveRole};
pub use slave::SlaveNode;
pub use store::{FileLogStore, LogDirectory};

/// Default online backup port
pub const DEFAULT_BACKUP_PORT: u16 = 15476;
