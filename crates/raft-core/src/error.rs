//! # error
//!
//! why: give every fallible protocol operation one error type
//! relations: returned by node.rs handlers, wrapped by raft-runtime
//! what: RaftError, Result alias

use crate::log::LogIndex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RaftError {
    /// the log store failed to read or persist; this is the only unrecoverable class
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// an incoming entry does not sit at the position the log expects
    #[error("log entry out of order: expected index {expected}, found {found}")]
    NonContiguousEntry { expected: LogIndex, found: LogIndex },

    #[error("node {0} is not a member of the cluster")]
    UnknownNode(u64),
}

pub type Result<T> = std::result::Result<T, RaftError>;
