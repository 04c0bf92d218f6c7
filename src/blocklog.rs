/// Bounded ring of recent query dispositions
///
/// Mutated only by the pump; snapshotted under a short lock for
/// persistence. Stored as a JSON array so any reader can reconstruct
/// the ring.
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GarmError, Result};
use crate::rules::Disposition;

pub const DEFAULT_CAPACITY: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLogEntry {
    pub name: String,
    pub disposition: Disposition,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub struct BlockLog {
    entries: VecDeque<BlockLogEntry>,
    capacity: usize,
}

impl Default for BlockLog {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest when full.
    pub fn append(&mut self, name: &str, disposition: Disposition) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(BlockLogEntry {
            name: name.to_string(),
            disposition,
            timestamp: Utc::now(),
        });
    }

    pub fn snapshot(&self) -> Vec<BlockLogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize the ring, oldest first.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .map_err(|e| GarmError::BlockLog(format!("failed to create {}: {e}", path.display())))?;
        serde_json::to_writer(BufWriter::new(file), &self.snapshot())
            .map_err(|e| GarmError::BlockLog(format!("failed to write {}: {e}", path.display())))?;
        Ok(())
    }

    /// Rebuild the ring from a previous run, keeping at most
    /// `capacity` newest entries.
    pub fn load(path: &Path, capacity: usize) -> Result<BlockLog> {
        let file = File::open(path)
            .map_err(|e| GarmError::BlockLog(format!("failed to open {}: {e}", path.display())))?;
        let mut entries: Vec<BlockLogEntry> = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| GarmError::BlockLog(format!("failed to parse {}: {e}", path.display())))?;

        if entries.len() > capacity {
            entries.drain(..entries.len() - capacity);
        }

        Ok(BlockLog {
            entries: entries.into(),
            capacity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_snapshot() {
        let mut log = BlockLog::new();
        log.append("ads.example", Disposition::Deny);
        log.append("www.example", Disposition::Allow);

        let snapshot = log.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].name, "ads.example");
        assert_eq!(snapshot[0].disposition, Disposition::Deny);
        assert_eq!(snapshot[1].disposition, Disposition::Allow);
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let mut log = BlockLog::with_capacity(3);
        for i in 0..5 {
            log.append(&format!("host{i}.example"), Disposition::Deny);
        }

        let snapshot = log.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].name, "host2.example");
        assert_eq!(snapshot[2].name, "host4.example");
    }

    #[test]
    fn test_persist_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocklog.json");

        let mut log = BlockLog::new();
        log.append("ads.example", Disposition::Deny);
        log.append("www.example", Disposition::Allow);
        log.persist(&path).unwrap();

        let loaded = BlockLog::load(&path, DEFAULT_CAPACITY).unwrap();
        assert_eq!(loaded.snapshot(), log.snapshot());
    }

    #[test]
    fn test_load_truncates_to_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocklog.json");

        let mut log = BlockLog::new();
        for i in 0..10 {
            log.append(&format!("host{i}.example"), Disposition::Deny);
        }
        log.persist(&path).unwrap();

        let loaded = BlockLog::load(&path, 4).unwrap();
        assert_eq!(loaded.len(), 4);
        assert_eq!(loaded.snapshot()[0].name, "host6.example");
    }

    #[test]
    fn test_load_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(BlockLog::load(&dir.path().join("missing.json"), 16).is_err());
    }
}
