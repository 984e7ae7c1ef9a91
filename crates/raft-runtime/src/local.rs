//! # local
//!
//! why: run whole clusters inside one process for demos and tests
//! relations: implements PeerChannel; serves requests into ConsensusEngine handlers
//! what: LocalNetwork (mpsc inbox per node, oneshot replies, partitions), LocalChannel

use crate::channel::{PeerChannel, TransportError};
use crate::engine::{ConsensusEngine, PeerMap};
use async_trait::async_trait;
use raft_core::{
    AppendEntriesRequest, AppendEntriesResponse, LogStore, NodeId, RequestVoteRequest,
    RequestVoteResponse,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const INBOX_CAPACITY: usize = 256;

enum Rpc {
    Vote(RequestVoteRequest, oneshot::Sender<RequestVoteResponse>),
    Append(AppendEntriesRequest, oneshot::Sender<AppendEntriesResponse>),
}

struct Envelope {
    from: NodeId,
    rpc: Rpc,
}

#[derive(Default)]
struct Routes {
    inboxes: HashMap<NodeId, mpsc::Sender<Envelope>>,
    isolated: HashSet<NodeId>,
}

/// In-process message router. Clones share the same routing table.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    routes: Arc<Mutex<Routes>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Channels from `id` to every other member of `cluster`
    pub fn peers_for(&self, id: NodeId, cluster: &[NodeId]) -> PeerMap {
        cluster
            .iter()
            .copied()
            .filter(|&peer| peer != id)
            .map(|peer| {
                let channel: Arc<dyn PeerChannel> = Arc::new(self.channel(id, peer));
                (peer, channel)
            })
            .collect()
    }

    pub fn channel(&self, from: NodeId, to: NodeId) -> LocalChannel {
        LocalChannel { network: self.clone(), from, to }
    }

    /// Route requests addressed to `engine` into its handlers until the network drops
    pub fn register<L: LogStore + 'static>(&self, engine: ConsensusEngine<L>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::channel::<Envelope>(INBOX_CAPACITY);
        let id = engine.id();
        self.routes().inboxes.insert(id, tx);
        tokio::spawn(async move {
            while let Some(Envelope { from, rpc }) = rx.recv().await {
                match rpc {
                    Rpc::Vote(request, reply) => match engine.handle_request_vote(request).await {
                        Ok(response) => {
                            let _ = reply.send(response);
                        }
                        Err(e) => warn!(node = id, from, error = %e, "vote handler failed"),
                    },
                    Rpc::Append(request, reply) => match engine.handle_append_entries(request).await {
                        Ok(response) => {
                            let _ = reply.send(response);
                        }
                        Err(e) => warn!(node = id, from, error = %e, "append handler failed"),
                    },
                }
            }
            debug!(node = id, "local inbox closed");
        })
    }

    /// Cut `id` off from every other node, in both directions
    pub fn isolate(&self, id: NodeId) {
        debug!(node = id, "isolating");
        self.routes().isolated.insert(id);
    }

    pub fn heal(&self, id: NodeId) {
        debug!(node = id, "healing");
        self.routes().isolated.remove(&id);
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<mpsc::Sender<Envelope>, TransportError> {
        let routes = self.routes();
        if routes.isolated.contains(&from) || routes.isolated.contains(&to) {
            return Err(TransportError::Unreachable(to));
        }
        routes.inboxes.get(&to).cloned().ok_or(TransportError::Unreachable(to))
    }

    fn connected(&self, from: NodeId, to: NodeId) -> bool {
        let routes = self.routes();
        !routes.isolated.contains(&from) && !routes.isolated.contains(&to)
    }
}

/// One direction of a LocalNetwork link
pub struct LocalChannel {
    network: LocalNetwork,
    from: NodeId,
    to: NodeId,
}

impl LocalChannel {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Rpc,
    ) -> Result<T, TransportError> {
        let inbox = self.network.route(self.from, self.to)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        inbox
            .send(Envelope { from: self.from, rpc: build(reply_tx) })
            .await
            .map_err(|_| TransportError::Closed)?;
        let response = reply_rx.await.map_err(|_| TransportError::Closed)?;
        // a partition raised mid-flight also swallows the reply
        if !self.network.connected(self.from, self.to) {
            return Err(TransportError::Unreachable(self.to));
        }
        Ok(response)
    }
}

#[async_trait]
impl PeerChannel for LocalChannel {
    async fn request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError> {
        self.call(|reply| Rpc::Vote(request, reply)).await
    }

    async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        self.call(|reply| Rpc::Append(request, reply)).await
    }
}
