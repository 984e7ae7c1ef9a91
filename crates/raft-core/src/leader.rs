//! # leader
//!
//! why: keep per-peer replication progress scoped to one leadership term
//! relations: created by RaftNode::become_leader, dropped on any step-down
//! what: LeaderState with next_index/match_index and the majority-match computation

use crate::log::LogIndex;
use crate::node::NodeId;
use std::collections::HashMap;

/// Volatile state that only exists while this node is leader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderState {
    /// next log index to send to each peer
    pub next_index: HashMap<NodeId, LogIndex>,
    /// highest index known replicated on each peer
    pub match_index: HashMap<NodeId, Option<LogIndex>>,
}

impl LeaderState {
    /// next_index starts at the leader's log length, match_index at none
    pub fn new(peers: impl IntoIterator<Item = NodeId>, log_len: u64) -> Self {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        for peer in peers {
            next_index.insert(peer, log_len);
            match_index.insert(peer, None);
        }
        Self { next_index, match_index }
    }

    pub fn next_for(&self, peer: NodeId) -> LogIndex {
        self.next_index.get(&peer).copied().unwrap_or(0)
    }

    pub fn match_for(&self, peer: NodeId) -> Option<LogIndex> {
        self.match_index.get(&peer).copied().flatten()
    }

    /// record a successful replication; match_index never moves backwards
    pub fn record_success(&mut self, peer: NodeId, matched: Option<LogIndex>) {
        let best = self.match_for(peer).max(matched);
        self.match_index.insert(peer, best);
        let next = best.map_or(0, |m| m + 1);
        self.next_index.insert(peer, next);
    }

    /// back off after a consistency-check failure
    ///
    /// `hint` is the follower's last log index; when it is shorter than
    /// `next - 1` the leader jumps straight past it.
    pub fn record_failure(&mut self, peer: NodeId, hint: Option<LogIndex>) {
        let current = self.next_for(peer);
        let stepped = current.saturating_sub(1);
        let hinted = hint.map_or(0, |h| h + 1);
        let next = stepped.min(hinted);
        // never skip below what the peer is already known to hold
        let floor = self.match_for(peer).map_or(0, |m| m + 1);
        self.next_index.insert(peer, next.max(floor));
    }

    /// highest index held by a strict majority, counting `leader_last` for the leader
    pub fn majority_match(&self, leader_last: Option<LogIndex>, quorum: usize) -> Option<LogIndex> {
        let mut indexes: Vec<Option<LogIndex>> = self.match_index.values().copied().collect();
        indexes.push(leader_last);
        indexes.sort_unstable();
        // the element at position n - quorum has `quorum` values >= it
        let pos = indexes.len().checked_sub(quorum)?;
        indexes.get(pos).copied().flatten()
    }
}
