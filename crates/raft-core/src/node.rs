//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: uses message.rs for rpc types, log.rs for entry storage, leader.rs for replication progress
//! what: NodeState enum, RaftNode struct, election/replication/commit rules
//!
//! everything here is synchronous and transport-free: handlers take a request,
//! mutate the node, persist through the LogStore and hand back a response.
//! timers and networking live in raft-runtime.

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::leader::LeaderState;
use crate::log::{LogEntry, LogIndex, LogStore, MemLog, Term};
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

pub type NodeId = u64;

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Follower => write!(f, "FOLLOWER"),
            NodeState::Candidate => write!(f, "CANDIDATE"),
            NodeState::Leader => write!(f, "LEADER"),
        }
    }
}

/// Snapshot of a node's progress, safe to hand out of the lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: NodeState,
    pub term: Term,
    pub commit_index: Option<LogIndex>,
    pub last_applied: Option<LogIndex>,
    /// last leader this node heard from in the current term
    pub leader: Option<NodeId>,
    pub log_length: u64,
}

/// A single Raft node in the cluster
#[derive(Debug)]
pub struct RaftNode<L: LogStore = MemLog> {
    /// Unique identifier for this node
    pub id: NodeId,
    /// Every member of the cluster, including this node
    pub cluster_nodes: Vec<NodeId>,
    pub config: RaftConfig,
    /// Current state (Follower, Candidate, or Leader)
    pub state: NodeState,
    /// Current term number
    pub current_term: Term,
    /// Node ID that received our vote in current term (if any)
    pub voted_for: Option<NodeId>,
    /// Highest index known committed
    pub commit_index: Option<LogIndex>,
    /// Highest index handed to the state machine
    pub last_applied: Option<LogIndex>,
    /// Votes collected in the current campaign, self included
    pub votes_received: Vec<NodeId>,
    /// Present only while leader
    pub leader_state: Option<LeaderState>,
    pub current_leader: Option<NodeId>,
    pub log: L,
}

impl RaftNode<MemLog> {
    /// Create a new Raft node in Follower state with a volatile log
    pub fn new(id: NodeId, cluster_nodes: Vec<NodeId>) -> Self {
        Self::with_config(id, cluster_nodes, RaftConfig::default())
    }

    /// `id` always counts as a member; it is added to `cluster_nodes` when missing
    pub fn with_config(id: NodeId, cluster_nodes: Vec<NodeId>, config: RaftConfig) -> Self {
        Self::from_parts(id, cluster_nodes, config, MemLog::new(), 0, None)
    }
}

impl<L: LogStore> RaftNode<L> {
    /// Open a node on top of an existing store, restoring term and vote
    pub fn with_store(
        id: NodeId,
        cluster_nodes: Vec<NodeId>,
        config: RaftConfig,
        log: L,
    ) -> Result<Self> {
        config.validate()?;
        if !cluster_nodes.contains(&id) {
            return Err(RaftError::UnknownNode(id));
        }
        let (term, voted_for) = log.load_term_and_vote()?;
        info!(node = id, term, log_len = log.len(), "restored node state");
        Ok(Self::from_parts(id, cluster_nodes, config, log, term, voted_for))
    }

    fn from_parts(
        id: NodeId,
        mut cluster_nodes: Vec<NodeId>,
        config: RaftConfig,
        log: L,
        current_term: Term,
        voted_for: Option<NodeId>,
    ) -> Self {
        // votes_received starts with our own vote, so we must be in the quorum count
        if !cluster_nodes.contains(&id) {
            warn!(node = id, "node missing from its own cluster list, adding it");
            cluster_nodes.push(id);
        }
        cluster_nodes.sort_unstable();
        cluster_nodes.dedup();
        Self {
            id,
            cluster_nodes,
            config,
            state: NodeState::Follower,
            current_term,
            voted_for,
            commit_index: None,
            last_applied: None,
            votes_received: Vec::new(),
            leader_state: None,
            current_leader: None,
            log,
        }
    }

    // -- cluster and log helpers --

    /// every member except this node
    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.cluster_nodes.iter().copied().filter(move |&n| n != self.id)
    }

    pub fn quorum_size(&self) -> usize {
        self.cluster_nodes.len() / 2 + 1
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    pub fn last_log_index(&self) -> Option<LogIndex> {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> Term {
        self.log.last_term()
    }

    /// term of the entry at `index`, 0 when absent
    pub fn get_term_at(&self, index: LogIndex) -> Term {
        self.log.term_at(index).unwrap_or(0)
    }

    pub fn get_entry(&self, index: LogIndex) -> Result<Option<LogEntry>> {
        Ok(self.log.entry(index)?)
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            role: self.state,
            term: self.current_term,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            leader: self.current_leader,
            log_length: self.log.len(),
        }
    }

    fn persist_term_and_vote(&mut self) -> Result<()> {
        self.log.save_term_and_vote(self.current_term, self.voted_for)?;
        Ok(())
    }

    // -- state transitions --

    /// Step down; adopts `term` (clearing the vote) when it is newer
    pub fn become_follower(&mut self, term: Term) -> Result<()> {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.current_leader = None;
            self.persist_term_and_vote()?;
        }
        if self.state != NodeState::Follower {
            info!(node = self.id, term = self.current_term, from = %self.state, "stepping down to follower");
        }
        self.state = NodeState::Follower;
        self.leader_state = None;
        self.votes_received.clear();
        Ok(())
    }

    /// Follower/Candidate timeout: open a new term and vote for ourselves
    pub fn start_election(&mut self) -> Result<RequestVoteRequest> {
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.persist_term_and_vote()?;

        self.state = NodeState::Candidate;
        self.leader_state = None;
        self.current_leader = None;
        self.votes_received = vec![self.id];
        info!(node = self.id, term = self.current_term, "starting election");

        let request = RequestVoteRequest {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };

        // single-node cluster: our own vote is the majority
        if self.has_quorum() {
            self.become_leader();
        }
        Ok(request)
    }

    pub fn become_leader(&mut self) {
        info!(node = self.id, term = self.current_term, "became leader");
        let peers: Vec<NodeId> = self.peers().collect();
        self.state = NodeState::Leader;
        self.current_leader = Some(self.id);
        self.leader_state = Some(LeaderState::new(peers, self.log.len()));
        self.votes_received.clear();
    }

    // -- election rpcs --

    /// Voter side of RequestVote; the bool asks the caller to reset its election timer
    pub fn handle_vote_request(
        &mut self,
        request: &RequestVoteRequest,
    ) -> Result<(RequestVoteResponse, bool)> {
        if request.term < self.current_term {
            debug!(node = self.id, candidate = request.candidate_id, term = request.term, "rejecting stale vote request");
            return Ok((self.vote_response(false), false));
        }
        if request.term > self.current_term {
            self.become_follower(request.term)?;
        }

        let can_vote = match self.voted_for {
            None => true,
            Some(v) => v == request.candidate_id,
        };
        let log_ok = self.candidate_log_up_to_date(request.last_log_term, request.last_log_index);

        if can_vote && log_ok {
            self.voted_for = Some(request.candidate_id);
            self.persist_term_and_vote()?;
            debug!(node = self.id, candidate = request.candidate_id, term = self.current_term, "granted vote");
            Ok((self.vote_response(true), true))
        } else {
            Ok((self.vote_response(false), false))
        }
    }

    fn vote_response(&self, vote_granted: bool) -> RequestVoteResponse {
        RequestVoteResponse { term: self.current_term, vote_granted }
    }

    /// compare by last term, then by last index
    fn candidate_log_up_to_date(&self, last_term: Term, last_index: Option<LogIndex>) -> bool {
        let my_term = self.last_log_term();
        if last_term != my_term {
            return last_term > my_term;
        }
        last_index >= self.last_log_index()
    }

    /// Candidate side; returns true when this response completed a majority
    pub fn handle_vote_response(&mut self, from: NodeId, response: &RequestVoteResponse) -> Result<bool> {
        if response.term > self.current_term {
            self.become_follower(response.term)?;
            return Ok(false);
        }
        if self.state != NodeState::Candidate || response.term != self.current_term {
            return Ok(false);
        }
        if response.vote_granted && !self.votes_received.contains(&from) {
            self.votes_received.push(from);
        }
        if self.has_quorum() {
            self.become_leader();
            return Ok(true);
        }
        Ok(false)
    }

    // -- replication rpcs --

    /// Leader appends a client command; `None` when this node is not leader
    pub fn append_entry(&mut self, command: Vec<u8>) -> Result<Option<LogEntry>> {
        if !self.is_leader() {
            return Ok(None);
        }
        let entry = LogEntry::new(self.current_term, self.log.len(), command);
        self.log.append(std::slice::from_ref(&entry))?;
        debug!(node = self.id, index = entry.index, term = entry.term, "appended client command");
        // a lone leader is its own majority
        self.advance_commit_index();
        Ok(Some(entry))
    }

    /// Build the next AppendEntries for `peer` (empty when it is caught up)
    pub fn create_append_entries(&self, peer: NodeId) -> Result<Option<AppendEntriesRequest>> {
        let leader = match (&self.leader_state, self.state) {
            (Some(leader), NodeState::Leader) => leader,
            _ => return Ok(None),
        };
        let next = leader.next_for(peer).min(self.log.len());
        let prev_log_index = next.checked_sub(1);
        let prev_log_term = prev_log_index.map_or(0, |i| self.get_term_at(i));
        let end = next.saturating_add(self.config.max_entries_per_append as u64);
        let entries = self.log.entries(next, end)?;
        Ok(Some(AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        }))
    }

    /// Empty AppendEntries for `peer`, asserting leadership
    pub fn create_heartbeat(&self, peer: NodeId) -> Result<Option<AppendEntriesRequest>> {
        Ok(self.create_append_entries(peer)?.map(|mut req| {
            req.entries.clear();
            req
        }))
    }

    /// Follower side of AppendEntries; the bool asks the caller to reset its election timer
    pub fn handle_append_entries(
        &mut self,
        request: &AppendEntriesRequest,
    ) -> Result<(AppendEntriesResponse, bool)> {
        // 1. stale leader
        if request.term < self.current_term {
            return Ok((self.append_response(false, self.last_log_index()), false));
        }

        // 2. newer term, or a same-term leader while we campaign
        if request.term > self.current_term || self.state == NodeState::Candidate {
            self.become_follower(request.term)?;
        } else if self.state == NodeState::Leader {
            warn!(node = self.id, other = request.leader_id, term = request.term, "second leader claims our term");
            return Ok((self.append_response(false, self.last_log_index()), false));
        }
        self.current_leader = Some(request.leader_id);

        // 3. consistency check on the preceding entry
        if let Some(prev) = request.prev_log_index {
            if self.log.term_at(prev) != Some(request.prev_log_term) {
                debug!(node = self.id, prev, "log mismatch, rejecting append");
                let hint = prev
                    .checked_sub(1)
                    .and_then(|before| self.last_log_index().map(|last| last.min(before)));
                return Ok((self.append_response(false, hint), true));
            }
        }

        // 4. merge entries, truncating only on a real conflict
        let start = request.prev_log_index.map_or(0, |p| p + 1);
        for (offset, entry) in request.entries.iter().enumerate() {
            let index = start + offset as u64;
            if entry.index != index {
                return Err(RaftError::NonContiguousEntry { expected: index, found: entry.index });
            }
            match self.log.term_at(index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if self.commit_index.is_some_and(|c| index <= c) {
                        warn!(node = self.id, index, "leader tried to overwrite a committed entry");
                        return Ok((self.append_response(false, self.commit_index), true));
                    }
                    debug!(node = self.id, index, "truncating conflicting suffix");
                    self.log.truncate_from(index)?;
                    self.append_fresh(&request.entries[offset..])?;
                    break;
                }
                None => {
                    self.append_fresh(&request.entries[offset..])?;
                    break;
                }
            }
        }

        // 5. follow the leader's commit index, capped at what we just verified
        let last_new = request.last_index();
        if request.leader_commit > self.commit_index {
            let target = request.leader_commit.min(last_new);
            if target > self.commit_index {
                self.set_commit_index(target);
            }
        }

        Ok((self.append_response(true, last_new), true))
    }

    fn append_fresh(&mut self, entries: &[LogEntry]) -> Result<()> {
        let fresh: Vec<LogEntry> = entries
            .iter()
            .cloned()
            .map(|mut e| {
                e.committed = false;
                e
            })
            .collect();
        self.log.append(&fresh)?;
        Ok(())
    }

    fn append_response(&self, success: bool, match_index: Option<LogIndex>) -> AppendEntriesResponse {
        AppendEntriesResponse { term: self.current_term, success, match_index }
    }

    /// Leader side; returns true when the commit index advanced
    pub fn handle_append_entries_response(
        &mut self,
        from: NodeId,
        response: &AppendEntriesResponse,
    ) -> Result<bool> {
        if response.term > self.current_term {
            self.become_follower(response.term)?;
            return Ok(false);
        }
        if response.term < self.current_term {
            return Ok(false);
        }
        let leader = match (&mut self.leader_state, self.state) {
            (Some(leader), NodeState::Leader) => leader,
            _ => return Ok(false),
        };
        if response.success {
            leader.record_success(from, response.match_index);
            Ok(self.advance_commit_index())
        } else {
            leader.record_failure(from, response.match_index);
            debug!(node = self.id, peer = from, next = leader.next_for(from), "peer rejected append, backing off");
            Ok(false)
        }
    }

    // -- commit and apply --

    /// Move commit_index to the majority-replicated index if it belongs to this term
    pub fn advance_commit_index(&mut self) -> bool {
        let candidate = match &self.leader_state {
            Some(leader) if self.state == NodeState::Leader => {
                leader.majority_match(self.last_log_index(), self.quorum_size())
            }
            _ => return false,
        };
        let Some(index) = candidate else {
            return false;
        };
        if Some(index) <= self.commit_index || index >= self.log.len() {
            return false;
        }
        // entries from older terms only commit indirectly
        if self.log.term_at(index) != Some(self.current_term) {
            return false;
        }
        self.set_commit_index(Some(index));
        true
    }

    fn set_commit_index(&mut self, index: Option<LogIndex>) {
        if let Some(i) = index {
            debug!(node = self.id, commit = i, "commit index advanced");
            self.log.mark_committed(i);
        }
        self.commit_index = index;
    }

    pub fn has_entries_to_apply(&self) -> bool {
        self.commit_index > self.last_applied
    }

    /// Committed entries not yet applied, in index order; advances last_applied
    pub fn get_entries_to_apply(&mut self) -> Result<Vec<LogEntry>> {
        let Some(commit) = self.commit_index else {
            return Ok(Vec::new());
        };
        let from = self.last_applied.map_or(0, |a| a + 1);
        if from > commit {
            return Ok(Vec::new());
        }
        let entries = self.log.entries(from, commit + 1)?;
        if let Some(last) = entries.last() {
            self.last_applied = Some(last.index);
        }
        Ok(entries)
    }

    /// Human-readable dump of role and log, one entry per line
    pub fn dump_log(&self) -> Result<String> {
        let mut out = format!(
            "=== node {} ===\nrole: {}, term: {}, commit: {:?}, applied: {:?}\n",
            self.id, self.state, self.current_term, self.commit_index, self.last_applied
        );
        for entry in self.log.entries(0, self.log.len())? {
            let marker = if entry.committed { "[committed]" } else { "[uncommitted]" };
            out.push_str(&format!(
                "[{}] term:{} command:{} {}\n",
                entry.index,
                entry.term,
                String::from_utf8_lossy(&entry.command),
                marker
            ));
        }
        Ok(out)
    }
}
