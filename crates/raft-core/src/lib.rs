//! # raft-core
//!
//! why: implement the core raft consensus algorithm in pure, portable rust
//! relations: driven by raft-runtime over real timers and transports, persisted via raft-storage
//! what: state machine, election logic, log management, message types

pub mod config;
pub mod error;
pub mod leader;
pub mod log;
pub mod message;
pub mod node;

pub use config::RaftConfig;
pub use error::{RaftError, Result};
pub use leader::LeaderState;
pub use log::{LogEntry, LogIndex, LogStore, MemLog, Term};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, RaftMessage, RequestVoteRequest,
    RequestVoteResponse,
};
pub use node::{NodeId, NodeState, NodeStatus, RaftNode};
