//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: built and consumed by node.rs, carried by raft-runtime transports
//! what: RequestVote/AppendEntries requests and responses, RaftMessage envelope

use crate::log::{LogEntry, LogIndex, Term};
use crate::node::NodeId;
use serde::{Deserialize, Serialize};

/// Request a vote during leader election
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    /// `None` when the candidate's log is empty
    pub last_log_index: Option<LogIndex>,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// voter's term after processing the request
    pub term: Term,
    pub vote_granted: bool,
}

/// Replicate log entries (also serves as heartbeat when entries is empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    /// index of the entry preceding `entries`; `None` means "start of log"
    pub prev_log_index: Option<LogIndex>,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: Option<LogIndex>,
}

impl AppendEntriesRequest {
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }

    /// index the follower will have matched if this request succeeds
    pub fn last_index(&self) -> Option<LogIndex> {
        match (self.prev_log_index, self.entries.len() as u64) {
            (prev, 0) => prev,
            (Some(prev), n) => Some(prev + n),
            (None, n) => Some(n - 1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// on success the highest index now matching the leader,
    /// on failure the receiver's last log index as a back-off hint
    pub match_index: Option<LogIndex>,
}

/// All possible Raft messages between nodes, as framed on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum RaftMessage {
    RequestVote(RequestVoteRequest),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
}

impl RaftMessage {
    /// term carried by any message
    pub fn term(&self) -> Term {
        match self {
            RaftMessage::RequestVote(m) => m.term,
            RaftMessage::RequestVoteResponse(m) => m.term,
            RaftMessage::AppendEntries(m) => m.term,
            RaftMessage::AppendEntriesResponse(m) => m.term,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append(prev: Option<LogIndex>, n: usize) -> AppendEntriesRequest {
        AppendEntriesRequest {
            term: 1,
            leader_id: 1,
            prev_log_index: prev,
            prev_log_term: 0,
            entries: (0..n).map(|i| LogEntry::new(1, i as u64, vec![])).collect(),
            leader_commit: None,
        }
    }

    #[test]
    fn last_index_covers_start_of_log() {
        assert_eq!(append(None, 0).last_index(), None);
        assert_eq!(append(None, 3).last_index(), Some(2));
        assert_eq!(append(Some(4), 0).last_index(), Some(4));
        assert_eq!(append(Some(4), 2).last_index(), Some(6));
    }

    #[test]
    fn envelope_is_tagged_json() {
        let msg = RaftMessage::RequestVoteResponse(RequestVoteResponse { term: 3, vote_granted: true });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"RequestVoteResponse\""));
        let back: RaftMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.term(), 3);
    }
}
