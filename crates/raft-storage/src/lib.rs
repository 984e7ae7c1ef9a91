//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: implements raft-core's LogStore so a RaftNode can survive restarts
//! what: FileStorage (meta.json + append-only log.jsonl)

use raft_core::log::check_contiguous;
use raft_core::{LogEntry, LogIndex, LogStore, Term};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

/// failures while decoding the on-disk log, surfaced as io::ErrorKind::InvalidData
#[derive(Debug, Error)]
enum LogFileError {
    #[error("corrupt log record at line {line}: {source}")]
    Corrupt {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("log record at line {line} has index {found}, expected {expected}")]
    OutOfOrder { line: usize, expected: LogIndex, found: LogIndex },
}

impl From<LogFileError> for io::Error {
    fn from(e: LogFileError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}

/// metadata structure for term and vote
#[derive(serde::Serialize, serde::Deserialize, Default)]
struct MetaData {
    term: Term,
    voted_for: Option<u64>,
}

/// file-based log store
///
/// stores raft state in a directory with:
/// - meta.json: term and voted_for, replaced atomically on every change
/// - log.jsonl: one entry per line, appended and fsynced
///
/// the whole log is cached in memory; reads never touch the disk.
#[derive(Debug)]
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
    entries: Vec<LogEntry>,
    /// byte length of log.jsonl holding exactly `entries`
    log_bytes: u64,
    term: Term,
    voted_for: Option<u64>,
}

impl FileStorage {
    /// open (or create) a store in `dir`, loading whatever a previous run left
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let mut storage = Self { dir, entries: Vec::new(), log_bytes: 0, term: 0, voted_for: None };
        let (term, voted_for) = storage.read_meta()?;
        storage.term = term;
        storage.voted_for = voted_for;
        storage.entries = storage.read_log()?;
        storage.log_bytes = match fs::metadata(storage.log_path()) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };
        debug!(dir = %storage.dir.display(), term, entries = storage.entries.len(), "opened file storage");
        Ok(storage)
    }

    /// get the path to the metadata file
    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    /// get the path to the log file
    fn log_path(&self) -> PathBuf {
        self.dir.join("log.jsonl")
    }

    fn read_meta(&self) -> io::Result<(Term, Option<u64>)> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok((0, None)); // default for new nodes
        }
        let contents = fs::read_to_string(&path)?;
        let meta: MetaData = serde_json::from_str(&contents)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok((meta.term, meta.voted_for))
    }

    fn read_log(&self) -> io::Result<Vec<LogEntry>> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&path)?);
        let lines: Vec<String> = reader.lines().collect::<io::Result<_>>()?;
        let raw = fs::read(&path)?;
        let ends_cleanly = raw.last().map_or(true, |&b| b == b'\n');

        let mut log = Vec::with_capacity(lines.len());
        for (n, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: LogEntry = match serde_json::from_str(line) {
                Ok(entry) => entry,
                // a crash mid-append leaves one torn record at the tail
                Err(_) if n + 1 == lines.len() && !ends_cleanly => {
                    warn!(line = n + 1, "dropping torn record at end of log");
                    self.rewrite_log(&log)?;
                    break;
                }
                Err(source) => return Err(LogFileError::Corrupt { line: n + 1, source }.into()),
            };
            let expected = log.len() as LogIndex;
            if entry.index != expected {
                return Err(LogFileError::OutOfOrder { line: n + 1, expected, found: entry.index }.into());
            }
            log.push(LogEntry { committed: false, ..entry });
        }
        Ok(log)
    }

    /// atomic write: write to temp file then rename
    fn write_atomically(&self, name: &str, target: PathBuf, bytes: &[u8]) -> io::Result<()> {
        let temp_path = self.dir.join(name);
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, target)?;
        Ok(())
    }

    fn encode(entries: &[LogEntry]) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        for entry in entries {
            let stored = LogEntry { committed: false, ..entry.clone() };
            serde_json::to_writer(&mut buf, &stored)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            buf.push(b'\n');
        }
        Ok(buf)
    }

    /// replace log.jsonl with `entries`, returning the new byte length
    fn rewrite_log(&self, entries: &[LogEntry]) -> io::Result<u64> {
        let bytes = Self::encode(entries)?;
        self.write_atomically("log.tmp", self.log_path(), &bytes)?;
        Ok(bytes.len() as u64)
    }

    /// remove all persisted state (for testing)
    pub fn clear(&mut self) -> io::Result<()> {
        for path in [self.meta_path(), self.log_path()] {
            match fs::remove_file(path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }
        self.entries.clear();
        self.log_bytes = 0;
        self.term = 0;
        self.voted_for = None;
        Ok(())
    }
}

impl LogStore for FileStorage {
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
        if entries.is_empty() {
            return Ok(());
        }
        check_contiguous(self.len(), entries)?;
        let bytes = Self::encode(entries)?;
        let mut file = OpenOptions::new().create(true).append(true).open(self.log_path())?;
        // bytes past the last whole record belong to a failed earlier append
        if file.metadata()?.len() != self.log_bytes {
            warn!(expected = self.log_bytes, "discarding partial record before append");
            file.set_len(self.log_bytes)?;
        }
        let written = file.write_all(&bytes).and_then(|()| file.sync_data());
        if let Err(e) = written {
            // best effort; the length check above catches whatever this leaves behind
            let _ = file.set_len(self.log_bytes);
            return Err(e);
        }
        self.log_bytes += bytes.len() as u64;
        self.entries.extend(entries.iter().cloned());
        Ok(())
    }

    fn truncate_from(&mut self, from_index: LogIndex) -> io::Result<()> {
        if from_index >= self.len() {
            return Ok(());
        }
        let kept = &self.entries[..from_index as usize];
        self.log_bytes = self.rewrite_log(kept)?;
        self.entries.truncate(from_index as usize);
        Ok(())
    }

    fn mark_committed(&mut self, through: LogIndex) {
        // commit state is volatile; only the cached copy carries the flag
        for entry in self.entries.iter_mut().take(through as usize + 1) {
            entry.committed = true;
        }
    }

    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<u64>) -> io::Result<()> {
        let meta = MetaData { term, voted_for };
        let json = serde_json::to_string_pretty(&meta)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.write_atomically("meta.tmp", self.meta_path(), json.as_bytes())?;
        self.term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    fn load_term_and_vote(&self) -> io::Result<(Term, Option<u64>)> {
        Ok((self.term, self.voted_for))
    }
}
