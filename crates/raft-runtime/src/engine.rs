//! # engine
//!
//! why: drive a RaftNode with real timers and real peers
//! relations: owns a raft-core RaftNode, an ElectionScheduler and a StateMachine;
//!            talks to peers through PeerChannel; fed by local.rs / tcp.rs servers
//! what: ConsensusEngine (cloneable handle), scheduler loop, election and replication tasks
//!
//! locking: one tokio Mutex guards node, timers and state machine. it is taken to build a
//! request, released for the network call, and re-taken to fold the response back in.
//! the state machine is invoked under the lock, so each index is applied exactly once.

use crate::channel::{with_deadline, PeerChannel};
use crate::scheduler::{ElectionScheduler, Tick};
use crate::state_machine::StateMachine;
use raft_core::{
    AppendEntriesRequest, AppendEntriesResponse, LogStore, MemLog, NodeId, NodeState,
    NodeStatus, RaftError, RaftNode, RequestVoteRequest, RequestVoteResponse, Result, Term,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Peer id -> outbound channel
pub type PeerMap = HashMap<NodeId, Arc<dyn PeerChannel>>;

struct Inner<L: LogStore> {
    node: RaftNode<L>,
    timers: ElectionScheduler,
    state_machine: Box<dyn StateMachine>,
}

struct Shared<L: LogStore> {
    id: NodeId,
    inner: Mutex<Inner<L>>,
    peers: PeerMap,
    rpc_timeout: Duration,
    /// nudges the scheduler to re-read role and deadlines
    wake: Notify,
    shutdown: watch::Sender<bool>,
}

/// Handle to one running consensus participant; clones share the same node
pub struct ConsensusEngine<L: LogStore = MemLog> {
    shared: Arc<Shared<L>>,
}

impl<L: LogStore> Clone for ConsensusEngine<L> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<L: LogStore + 'static> ConsensusEngine<L> {
    /// Wrap `node`; every peer in its cluster needs a channel
    pub fn new(node: RaftNode<L>, peers: PeerMap, state_machine: impl StateMachine) -> Result<Self> {
        node.config.validate()?;
        if let Some(missing) = node.peers().find(|p| !peers.contains_key(p)) {
            return Err(RaftError::Config(format!("no channel for peer {}", missing)));
        }
        let (shutdown, _) = watch::channel(false);
        let shared = Shared {
            id: node.id,
            rpc_timeout: node.config.rpc_deadline(),
            inner: Mutex::new(Inner {
                timers: ElectionScheduler::new(&node.config),
                node,
                state_machine: Box::new(state_machine),
            }),
            peers,
            wake: Notify::new(),
            shutdown,
        };
        Ok(Self { shared: Arc::new(shared) })
    }

    pub fn id(&self) -> NodeId {
        self.shared.id
    }

    /// Spawn the timer loop. Incoming rpcs are served regardless.
    pub fn start(&self) -> JoinHandle<()> {
        let engine = self.clone();
        info!(node = self.shared.id, peers = self.shared.peers.len(), "starting consensus engine");
        tokio::spawn(async move { engine.run().await })
    }

    /// Stop the timer loop; the node stops campaigning and heartbeating
    pub fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
    }

    async fn lock(&self) -> MutexGuard<'_, Inner<L>> {
        self.shared.inner.lock().await
    }

    // -- public operations --

    /// Append a command if this node leads; replication proceeds in the background
    pub async fn submit_command(&self, command: Vec<u8>) -> Result<bool> {
        let mut inner = self.lock().await;
        if inner.node.append_entry(command)?.is_none() {
            return Ok(false);
        }
        // a single-node cluster commits on append
        Self::apply_committed(&mut inner)?;
        drop(inner);
        self.replicate();
        Ok(true)
    }

    pub async fn status(&self) -> NodeStatus {
        self.lock().await.node.status()
    }

    pub async fn current_leader(&self) -> Option<NodeId> {
        self.lock().await.node.current_leader
    }

    /// Render the log and also emit it through tracing
    pub async fn dump_log(&self) -> Result<String> {
        let dump = self.lock().await.node.dump_log()?;
        info!(node = self.shared.id, "\n{}", dump);
        Ok(dump)
    }

    /// Voter side of RequestVote
    pub async fn handle_request_vote(&self, request: RequestVoteRequest) -> Result<RequestVoteResponse> {
        let mut inner = self.lock().await;
        let before = (inner.node.state, inner.node.current_term);
        let (response, reset) = inner.node.handle_vote_request(&request)?;
        if reset {
            inner.timers.reset_election(Instant::now());
        }
        self.settle(&mut inner, before);
        Ok(response)
    }

    /// Follower side of AppendEntries; applies anything newly committed before replying
    pub async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let mut inner = self.lock().await;
        let before = (inner.node.state, inner.node.current_term);
        let (response, reset) = inner.node.handle_append_entries(&request)?;
        if reset {
            inner.timers.reset_election(Instant::now());
        }
        self.settle(&mut inner, before);
        Self::apply_committed(&mut inner)?;
        Ok(response)
    }

    // -- scheduler --

    async fn run(self) {
        let mut shutdown = self.shared.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let wakeup = self.tick().await;
            tokio::select! {
                _ = sleep_until(wakeup) => {}
                _ = self.shared.wake.notified() => {}
                _ = shutdown.changed() => break,
            }
        }
        info!(node = self.shared.id, "scheduler stopped");
    }

    /// fire whichever timer is due, then report when to look again
    async fn tick(&self) -> Instant {
        let now = Instant::now();
        let mut inner = self.lock().await;
        let due = inner.timers.due(inner.node.state, now);
        let mut ballot = None;
        let mut heartbeat = false;
        match due {
            // no heartbeat may land between the deadline check and the term bump
            Some(Tick::Election) => ballot = self.begin_election(&mut inner),
            Some(Tick::Heartbeat) => {
                inner.timers.schedule_heartbeat(now);
                heartbeat = true;
            }
            None => {}
        }
        let next = inner.timers.next_wakeup(inner.node.state);
        drop(inner);

        if let Some(request) = ballot {
            self.request_votes(request);
        }
        if heartbeat {
            self.replicate();
        }
        next
    }

    /// re-arm timers after a role or term change seen under the lock
    fn settle(&self, inner: &mut Inner<L>, before: (NodeState, Term)) {
        let now = Instant::now();
        let (role, term) = (inner.node.state, inner.node.current_term);
        if (role, term) == before {
            return;
        }
        match role {
            NodeState::Leader => inner.timers.heartbeat_now(now),
            NodeState::Follower => inner.timers.reset_election(now),
            NodeState::Candidate => {}
        }
        self.shared.wake.notify_one();
    }

    fn apply_committed(inner: &mut Inner<L>) -> Result<()> {
        if !inner.node.has_entries_to_apply() {
            return Ok(());
        }
        for entry in inner.node.get_entries_to_apply()? {
            debug!(node = inner.node.id, index = entry.index, "applying entry");
            inner.state_machine.apply(entry.index, &entry.command);
        }
        Ok(())
    }

    // -- elections --

    /// become a candidate; `None` when there is nobody to ask
    fn begin_election(&self, inner: &mut Inner<L>) -> Option<RequestVoteRequest> {
        let before = (inner.node.state, inner.node.current_term);
        let request = match inner.node.start_election() {
            Ok(request) => request,
            Err(e) => {
                error!(node = self.shared.id, error = %e, "could not start election");
                return None;
            }
        };
        inner.timers.reset_election(Instant::now());
        self.settle(inner, before);
        if inner.node.is_leader() {
            return None;
        }
        Some(request)
    }

    fn request_votes(&self, request: RequestVoteRequest) {
        for &peer in self.shared.peers.keys() {
            let engine = self.clone();
            let request = request.clone();
            tokio::spawn(async move { engine.solicit_vote(peer, request).await });
        }
    }

    async fn solicit_vote(self, peer: NodeId, request: RequestVoteRequest) {
        let Some(channel) = self.shared.peers.get(&peer) else {
            return;
        };
        let response =
            match with_deadline(self.shared.rpc_timeout, channel.request_vote(request.clone())).await {
                Ok(response) => response,
                Err(e) => {
                    debug!(node = self.shared.id, peer, error = %e, "vote request failed");
                    return;
                }
            };

        let mut inner = self.lock().await;
        if inner.node.current_term != request.term && response.term <= inner.node.current_term {
            return; // answer to an abandoned campaign
        }
        let before = (inner.node.state, inner.node.current_term);
        let outcome = inner.node.handle_vote_response(peer, &response);
        match outcome {
            Ok(won) => {
                if won {
                    info!(node = self.shared.id, term = inner.node.current_term, "won election");
                }
                self.settle(&mut inner, before);
            }
            Err(e) => error!(node = self.shared.id, error = %e, "failed to record vote"),
        }
    }

    // -- replication --

    /// one AppendEntries round to every peer, each on its own task
    fn replicate(&self) {
        for &peer in self.shared.peers.keys() {
            let engine = self.clone();
            tokio::spawn(async move { engine.replicate_to(peer).await });
        }
    }

    async fn replicate_to(self, peer: NodeId) {
        let request = {
            let inner = self.lock().await;
            match inner.node.create_append_entries(peer) {
                Ok(Some(request)) => request,
                Ok(None) => return,
                Err(e) => {
                    error!(node = self.shared.id, peer, error = %e, "could not read log for append");
                    return;
                }
            }
        };
        let Some(channel) = self.shared.peers.get(&peer) else {
            return;
        };
        let sent = request.entries.len();
        let response =
            match with_deadline(self.shared.rpc_timeout, channel.append_entries(request.clone())).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(node = self.shared.id, peer, error = %e, "append entries failed");
                    return;
                }
            };
        debug!(node = self.shared.id, peer, sent, success = response.success, "append entries answered");

        let mut inner = self.lock().await;
        let stale = inner.node.current_term != request.term || !inner.node.is_leader();
        if stale && response.term <= inner.node.current_term {
            return;
        }
        let before = (inner.node.state, inner.node.current_term);
        let outcome = inner
            .node
            .handle_append_entries_response(peer, &response)
            .and_then(|advanced| if advanced { Self::apply_committed(&mut inner) } else { Ok(()) });
        if let Err(e) = outcome {
            error!(node = self.shared.id, peer, error = %e, "failed to process append response");
        }
        self.settle(&mut inner, before);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::TransportError;
    use async_trait::async_trait;
    use raft_core::{LogIndex, RaftConfig};

    /// a peer that never answers
    struct Silent;

    #[async_trait]
    impl PeerChannel for Silent {
        async fn request_vote(
            &self,
            _request: RequestVoteRequest,
        ) -> std::result::Result<RequestVoteResponse, TransportError> {
            Err(TransportError::Closed)
        }

        async fn append_entries(
            &self,
            _request: AppendEntriesRequest,
        ) -> std::result::Result<AppendEntriesResponse, TransportError> {
            Err(TransportError::Closed)
        }
    }

    /// node 1 of three, a follower in term 1 whose election deadline has passed
    async fn overdue_follower() -> ConsensusEngine {
        let config = RaftConfig {
            election_timeout_min: 40,
            election_timeout_max: 60,
            heartbeat_interval: 10,
            ..RaftConfig::default()
        };
        let mut node = RaftNode::with_config(1, vec![1, 2, 3], config);
        node.become_follower(1).unwrap();
        let peers: PeerMap = [2, 3]
            .into_iter()
            .map(|id| (id, Arc::new(Silent) as Arc<dyn PeerChannel>))
            .collect();
        let engine = ConsensusEngine::new(node, peers, |_: LogIndex, _: &[u8]| {}).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        engine
    }

    fn heartbeat_from_2() -> AppendEntriesRequest {
        AppendEntriesRequest {
            term: 1,
            leader_id: 2,
            prev_log_index: None,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: None,
        }
    }

    async fn settle_tasks() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn accepted_heartbeat_is_never_followed_by_a_campaign() {
        let engine = overdue_follower().await;

        // tick queues on the lock first, the heartbeat right behind it
        let guard = engine.lock().await;
        let ticker = engine.clone();
        let tick = tokio::spawn(async move { ticker.tick().await });
        settle_tasks().await;
        let follower = engine.clone();
        let heartbeat =
            tokio::spawn(async move { follower.handle_append_entries(heartbeat_from_2()).await });
        settle_tasks().await;
        drop(guard);

        tick.await.unwrap();
        let response = heartbeat.await.unwrap().unwrap();
        let status = engine.status().await;

        assert!(
            !(response.success && status.role != NodeState::Follower),
            "heartbeat accepted but node became {:?} in term {}",
            status.role,
            status.term
        );
        // the timer fired first, so the campaign wins and the old-term heartbeat is refused
        assert_eq!(status.role, NodeState::Candidate);
        assert_eq!(status.term, 2);
        assert!(!response.success);
        assert_eq!(response.term, 2);
    }

    #[tokio::test]
    async fn heartbeat_ahead_of_the_tick_cancels_the_election() {
        let engine = overdue_follower().await;

        let guard = engine.lock().await;
        let follower = engine.clone();
        let heartbeat =
            tokio::spawn(async move { follower.handle_append_entries(heartbeat_from_2()).await });
        settle_tasks().await;
        let ticker = engine.clone();
        let tick = tokio::spawn(async move { ticker.tick().await });
        settle_tasks().await;
        drop(guard);

        let response = heartbeat.await.unwrap().unwrap();
        tick.await.unwrap();
        let status = engine.status().await;

        assert!(response.success);
        assert_eq!(status.role, NodeState::Follower);
        assert_eq!(status.term, 1);
        assert_eq!(status.leader, Some(2));
    }
}
