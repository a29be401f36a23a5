//! File-backed log store
//!
//! Logs of one data source live in a directory as
//! `nioneo_logical.log.v<N>`, numbered from 1. New files are always
//! written to a temp file in the same directory, synced, and renamed into
//! place, so a log path never refers to a partially written log.

use crate::roles::{LogSource, MasterRole, SlaveRole};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// File name prefix of every log; the version follows
pub const LOG_FILE_PREFIX: &str = "nioneo_logical.log.v";

/// Logs of a single data source
#[derive(Debug)]
pub struct LogDirectory {
    dir: PathBuf,
    /// Highest version such that every log 1..=version is present
    applied: AtomicU64,
    commit_lock: Mutex<()>,
}

impl LogDirectory {
    /// Open (creating if needed) the log directory at `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let store = Self {
            dir,
            applied: AtomicU64::new(0),
            commit_lock: Mutex::new(()),
        };
        let applied = store.advance();
        tracing::debug!(
            "Opened log directory {} at version {}",
            store.dir.display(),
            applied
        );
        Ok(store)
    }

    /// Directory holding the logs
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Highest contiguous version present
    pub fn last_version(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    /// Path of log `version`
    pub fn log_path(&self, version: u64) -> PathBuf {
        self.dir.join(format!("{}{}", LOG_FILE_PREFIX, version))
    }

    /// Whether log `version` is installed
    pub fn contains(&self, version: u64) -> bool {
        version > 0 && self.log_path(version).is_file()
    }

    /// Every installed version, ascending
    pub fn versions(&self) -> Result<Vec<u64>> {
        let mut versions = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(version) = name
                .to_str()
                .and_then(|n| n.strip_prefix(LOG_FILE_PREFIX))
                .and_then(|v| v.parse::<u64>().ok())
            else {
                continue;
            };
            if version > 0 && entry.file_type()?.is_file() {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    /// Write `data` as the next log version and return that version
    pub fn commit(&self, data: &[u8]) -> Result<u64> {
        let _guard = self.commit_lock.lock();
        let version = self.advance() + 1;
        let path = self.log_path(version);

        let mut temp = tempfile::Builder::new()
            .prefix(".commit-")
            .tempfile_in(&self.dir)?;
        temp.write_all(data)?;
        temp.as_file().sync_all()?;
        temp.persist(&path)
            .map_err(|e| Error::transfer(format!("Failed to install {}: {}", path.display(), e)))?;

        self.advance();
        tracing::debug!("Committed log {} ({} bytes)", version, data.len());
        Ok(version)
    }

    /// Move the applied version over every contiguous installed log
    fn advance(&self) -> u64 {
        let mut version = self.applied.load(Ordering::SeqCst);
        while self.contains(version + 1) {
            version += 1;
        }
        self.applied.fetch_max(version, Ordering::SeqCst);
        self.applied.load(Ordering::SeqCst)
    }
}

impl SlaveRole for LogDirectory {
    fn get_version(&self) -> u64 {
        self.last_version()
    }

    fn has_log(&self, version: u64) -> bool {
        self.contains(version)
    }

    fn get_log_name(&self, version: u64) -> PathBuf {
        self.log_path(version)
    }

    fn try_apply_new_log(&self) -> Result<()> {
        let before = self.last_version();
        let after = self.advance();
        if after > before {
            tracing::info!(
                "Applied logs {}..={} in {}",
                before + 1,
                after,
                self.dir.display()
            );
        }
        Ok(())
    }
}

/// Logs of every data source under one root directory
#[derive(Debug)]
pub struct FileLogStore {
    root: PathBuf,
    streams: RwLock<HashMap<String, Arc<LogDirectory>>>,
}

impl FileLogStore {
    /// Open (creating if needed) the store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            streams: RwLock::new(HashMap::new()),
        })
    }

    /// Log directory of `stream`, opened on first use
    pub fn stream(&self, stream: &str) -> Result<Arc<LogDirectory>> {
        if let Some(dir) = self.streams.read().get(stream) {
            return Ok(dir.clone());
        }

        if stream.is_empty()
            || stream == "."
            || stream == ".."
            || stream.contains(['/', '\\'])
        {
            return Err(Error::transfer(format!("Invalid stream name: {:?}", stream)));
        }

        let mut streams = self.streams.write();
        if let Some(dir) = streams.get(stream) {
            return Ok(dir.clone());
        }
        let dir = Arc::new(LogDirectory::open(self.root.join(stream))?);
        streams.insert(stream.to_string(), dir.clone());
        Ok(dir)
    }

    /// Commit `data` as the next log of `stream`
    pub fn commit(&self, stream: &str, data: &[u8]) -> Result<u64> {
        self.stream(stream)?.commit(data)
    }
}

impl MasterRole for FileLogStore {
    fn get_version(&self, stream: &str) -> u64 {
        match self.stream(stream) {
            Ok(dir) => dir.last_version() + 1,
            Err(e) => {
                tracing::warn!("Cannot open stream {}: {}", stream, e);
                1
            }
        }
    }

    fn has_log(&self, stream: &str, version: u64) -> bool {
        self.stream(stream)
            .map(|dir| dir.contains(version))
            .unwrap_or(false)
    }

    fn get_log(&self, stream: &str, version: u64) -> Result<LogSource> {
        let path = self.stream(stream)?.log_path(version);
        let file = File::open(&path)?;
        Ok(Box::new(file))
    }

    fn get_log_length(&self, stream: &str, version: u64) -> Result<u64> {
        let path = self.stream(stream)?.log_path(version);
        Ok(fs::metadata(&path)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn test_commit_numbers_from_one() {
        let dir = TempDir::new().unwrap();
        let logs = LogDirectory::open(dir.path()).unwrap();
        assert_eq!(logs.last_version(), 0);

        assert_eq!(logs.commit(b"first").unwrap(), 1);
        assert_eq!(logs.commit(b"second").unwrap(), 2);
        assert_eq!(logs.last_version(), 2);
        assert_eq!(fs::read(logs.log_path(2)).unwrap(), b"second");
        assert_eq!(logs.versions().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_reopen_finds_contiguous_versions() {
        let dir = TempDir::new().unwrap();
        {
            let logs = LogDirectory::open(dir.path()).unwrap();
            logs.commit(b"a").unwrap();
            logs.commit(b"b").unwrap();
        }
        // A gap at 3 stops the applied version at 2.
        fs::write(dir.path().join(format!("{}4", LOG_FILE_PREFIX)), b"d").unwrap();
        fs::write(dir.path().join("unrelated.txt"), b"x").unwrap();

        let logs = LogDirectory::open(dir.path()).unwrap();
        assert_eq!(logs.last_version(), 2);
        assert!(logs.has_log(4));
        assert!(!logs.has_log(3));
        assert_eq!(logs.versions().unwrap(), vec![1, 2, 4]);
    }

    #[test]
    fn test_try_apply_closes_gap() {
        let dir = TempDir::new().unwrap();
        let logs = LogDirectory::open(dir.path()).unwrap();
        fs::write(logs.get_log_name(2), b"two").unwrap();
        logs.try_apply_new_log().unwrap();
        assert_eq!(logs.get_version(), 0);

        fs::write(logs.get_log_name(1), b"one").unwrap();
        logs.try_apply_new_log().unwrap();
        assert_eq!(logs.get_version(), 2);
    }

    #[test]
    fn test_master_role_view() {
        let dir = TempDir::new().unwrap();
        let store = FileLogStore::open(dir.path()).unwrap();
        assert_eq!(store.get_version("graph.db"), 1);

        store.commit("graph.db", b"hello log").unwrap();
        assert_eq!(store.get_version("graph.db"), 2);
        assert!(store.has_log("graph.db", 1));
        assert!(!store.has_log("graph.db", 2));
        assert!(!store.has_log("other.db", 1));
        assert_eq!(store.get_log_length("graph.db", 1).unwrap(), 9);

        let mut content = String::new();
        store
            .get_log("graph.db", 1)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "hello log");
    }

    #[test]
    fn test_invalid_stream_name() {
        let dir = TempDir::new().unwrap();
        let store = FileLogStore::open(dir.path()).unwrap();
        assert!(store.stream("../escape").is_err());
        assert!(store.stream("").is_err());
        assert!(!store.has_log("..", 1));
    }
}
