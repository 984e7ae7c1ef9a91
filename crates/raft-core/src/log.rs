//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: used by node.rs for replication, persisted via raft-storage
//! what: LogEntry struct, LogStore trait, MemLog volatile implementation

use serde::{Deserialize, Serialize};
use std::io;

/// Leader term, a logical clock that only moves forward
pub type Term = u64;

/// Position of an entry in the log (0-based)
pub type LogIndex = u64;

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: Term,
    /// The index of this entry in the log (0-based, contiguous)
    pub index: LogIndex,
    /// The command to be applied to the state machine
    pub command: Vec<u8>,
    /// Set once the entry is known to be stored on a majority
    #[serde(default)]
    pub committed: bool,
}

impl LogEntry {
    /// Create a new, uncommitted log entry
    pub fn new(term: Term, index: LogIndex, command: Vec<u8>) -> Self {
        Self { term, index, command, committed: false }
    }
}

/// ordered storage for the log plus the node's term/vote record
///
/// implementations:
/// - `MemLog` (volatile, this crate)
/// - `FileStorage` (durable, raft-storage)
///
/// entries are addressed by their 0-based index; `append` must receive entries
/// whose indexes continue the log without gaps.
pub trait LogStore: Send {
    /// number of entries in the log
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// term of the entry at `index`, if present
    fn term_at(&self, index: LogIndex) -> Option<Term>;

    /// entries in `[from, to)`, clamped to the log bounds
    fn entries(&self, from: LogIndex, to: LogIndex) -> io::Result<Vec<LogEntry>>;

    /// append entries at the tail
    fn append(&mut self, entries: &[LogEntry]) -> io::Result<()>;

    /// drop every entry with index >= `from_index`
    fn truncate_from(&mut self, from_index: LogIndex) -> io::Result<()>;

    /// flag every entry up to and including `through` as committed
    fn mark_committed(&mut self, through: LogIndex);

    /// persist the current term and voted_for
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<u64>) -> io::Result<()>;

    /// load the persisted term and voted_for
    fn load_term_and_vote(&self) -> io::Result<(Term, Option<u64>)>;

    /// index of the last entry, `None` for an empty log
    fn last_index(&self) -> Option<LogIndex> {
        self.len().checked_sub(1)
    }

    /// term of the last entry, 0 for an empty log
    fn last_term(&self) -> Term {
        self.last_index().and_then(|i| self.term_at(i)).unwrap_or(0)
    }

    fn entry(&self, index: LogIndex) -> io::Result<Option<LogEntry>> {
        Ok(self.entries(index, index + 1)?.into_iter().next())
    }
}

/// reject entries that would leave a gap or overwrite in place
pub fn check_contiguous(len: u64, entries: &[LogEntry]) -> io::Result<()> {
    for (offset, entry) in entries.iter().enumerate() {
        let expected = len + offset as u64;
        if entry.index != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("entry index {} does not continue log at {}", entry.index, expected),
            ));
        }
    }
    Ok(())
}

/// in-memory log, no persistence across restarts
#[derive(Debug, Default, Clone)]
pub struct MemLog {
    term: Term,
    voted_for: Option<u64>,
    entries: Vec<LogEntry>,
}

impl MemLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// build a log holding the given terms, one entry per term, commands `[index]`
    pub fn with_terms(terms: &[Term]) -> Self {
        let entries = terms
            .iter()
            .enumerate()
            .map(|(i, &term)| LogEntry::new(term, i as u64, vec![i as u8]))
            .collect();
        Self { entries, ..Self::default() }
    }

    pub fn as_slice(&self) -> &[LogEntry] {
        &self.entries
    }
}

impl LogStore for MemLog {
    fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        self.entries.get(index as usize).map(|e| e.term)
    }

    fn entries(&self, from: LogIndex, to: LogIndex) -> io::Result<Vec<LogEntry>> {
        let len = self.entries.len();
        let from = (from as usize).min(len);
        let to = (to as usize).clamp(from, len);
        Ok(self.entries[from..to].to_vec())
    }

    fn append(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        check_contiguous(self.len(), entries)?;
        self.entries.extend(entries.iter().cloned());
        Ok(())
    }

    fn truncate_from(&mut self, from_index: LogIndex) -> io::Result<()> {
        self.entries.truncate(from_index as usize);
        Ok(())
    }

    fn mark_committed(&mut self, through: LogIndex) {
        for entry in self.entries.iter_mut().take(through as usize + 1) {
            entry.committed = true;
        }
    }

    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<u64>) -> io::Result<()> {
        self.term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    fn load_term_and_vote(&self) -> io::Result<(Term, Option<u64>)> {
        Ok((self.term, self.voted_for))
    }
}
