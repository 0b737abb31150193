//! Log storage contract and an in-memory engine.
//!
//! The durable storage engine lives outside the consensus core. The core only
//! needs the operations of [`Storage`]: persist the hard state, append and
//! truncate entries, and read them back by index.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{RaftError, Result};
use crate::types::{HardState, Index, LogEntry, Term};

/// Storage engine used by a node.
///
/// All methods take `&self` so one engine can be shared between the node that
/// writes it and the observers that stream committed entries out of it.
/// Index 0 is a sentinel whose term is 0.
pub trait Storage: Send + Sync {
    fn hard_state(&self) -> Result<HardState>;

    fn set_hard_state(&self, hard_state: HardState) -> Result<()>;

    fn last_index(&self) -> Result<Index>;

    /// Term of the entry at `index`, `None` past the end of the log.
    fn term(&self, index: Index) -> Result<Option<Term>>;

    fn entry(&self, index: Index) -> Result<Option<LogEntry>>;

    /// Entries in `lo..=hi`, clamped to the end of the log.
    fn entries(&self, lo: Index, hi: Index) -> Result<Vec<LogEntry>>;

    /// Appends entries that extend the log without a gap.
    fn append(&self, entries: &[LogEntry]) -> Result<()>;

    /// Removes the entry at `index` and everything after it.
    fn truncate_from(&self, index: Index) -> Result<()>;

    fn last_term(&self) -> Result<Term> {
        let last = self.last_index()?;
        Ok(self.term(last)?.unwrap_or(0))
    }
}

#[derive(Default)]
struct MemStorageCore {
    hard_state: HardState,
    entries: Vec<LogEntry>,
}

/// In-memory storage engine.
///
/// Cloning shares the underlying log, so a node restarted with a clone sees
/// exactly what it persisted before it stopped.
#[derive(Clone, Default)]
pub struct MemStorage {
    core: Arc<RwLock<MemStorageCore>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a storage engine already holding `entries` and `hard_state`.
    pub fn with_entries(hard_state: HardState, entries: Vec<LogEntry>) -> Result<Self> {
        let storage = Self::new();
        storage.append(&entries)?;
        storage.set_hard_state(hard_state)?;
        Ok(storage)
    }

    fn rl(&self) -> Result<RwLockReadGuard<'_, MemStorageCore>> {
        self.core
            .read()
            .map_err(|_| RaftError::Storage("storage lock poisoned".into()))
    }

    fn wl(&self) -> Result<RwLockWriteGuard<'_, MemStorageCore>> {
        self.core
            .write()
            .map_err(|_| RaftError::Storage("storage lock poisoned".into()))
    }
}

impl MemStorageCore {
    fn last_index(&self) -> Index {
        self.entries.last().map_or(0, |entry| entry.index)
    }

    // Entries are dense from index 1, so position = index - 1.
    fn get(&self, index: Index) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }
}

impl Storage for MemStorage {
    fn hard_state(&self) -> Result<HardState> {
        Ok(self.rl()?.hard_state)
    }

    fn set_hard_state(&self, hard_state: HardState) -> Result<()> {
        self.wl()?.hard_state = hard_state;
        Ok(())
    }

    fn last_index(&self) -> Result<Index> {
        Ok(self.rl()?.last_index())
    }

    fn term(&self, index: Index) -> Result<Option<Term>> {
        if index == 0 {
            return Ok(Some(0));
        }
        Ok(self.rl()?.get(index).map(|entry| entry.term))
    }

    fn entry(&self, index: Index) -> Result<Option<LogEntry>> {
        Ok(self.rl()?.get(index).cloned())
    }

    fn entries(&self, lo: Index, hi: Index) -> Result<Vec<LogEntry>> {
        let core = self.rl()?;
        let lo = lo.max(1);
        let hi = hi.min(core.last_index());
        if lo > hi {
            return Ok(Vec::new());
        }
        Ok(core.entries[(lo - 1) as usize..hi as usize].to_vec())
    }

    fn append(&self, entries: &[LogEntry]) -> Result<()> {
        let mut core = self.wl()?;
        for entry in entries {
            let expected = core.last_index() + 1;
            if entry.index != expected {
                return Err(RaftError::Storage(format!(
                    "append at index {} leaves a gap, expected {expected}",
                    entry.index
                )));
            }
            core.entries.push(entry.clone());
        }
        Ok(())
    }

    fn truncate_from(&self, index: Index) -> Result<()> {
        let mut core = self.wl()?;
        if index <= core.hard_state.commit {
            return Err(RaftError::Storage(format!(
                "refusing to truncate committed index {index} (commit {})",
                core.hard_state.commit
            )));
        }
        core.entries.truncate(index.saturating_sub(1) as usize);
        Ok(())
    }
}
