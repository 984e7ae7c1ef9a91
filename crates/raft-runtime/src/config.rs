//! # config
//!
//! why: describe one process's place in a fixed cluster
//! relations: read by main.rs to build a node, its storage and its TcpChannels
//! what: ClusterConfig, PeerAddr; loaded from env vars or a json file

use crate::channel::PeerChannel;
use crate::engine::PeerMap;
use crate::tcp::TcpChannel;
use raft_core::{NodeId, RaftConfig, RaftError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddr {
    pub id: NodeId,
    pub addr: String,
}

/// Cluster configuration - can be loaded from file or env
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub node_id: NodeId,
    /// address the peer server binds to
    pub listen_addr: String,
    /// every other member of the cluster
    pub peers: Vec<PeerAddr>,
    /// where FileStorage keeps meta.json and log.jsonl; volatile log when absent
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub raft: RaftConfig,
}

impl ClusterConfig {
    /// Load from environment variables
    ///
    /// `NODE_ID` (required), `LISTEN_ADDR` (default 127.0.0.1:7001),
    /// `PEERS` as `id@host:port,id@host:port`, `DATA_DIR` (optional).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let node_id = lookup("NODE_ID")
            .ok_or_else(|| RaftError::Config("NODE_ID is not set".into()))?
            .parse::<NodeId>()
            .map_err(|e| RaftError::Config(format!("NODE_ID: {}", e)))?;
        let listen_addr = lookup("LISTEN_ADDR").unwrap_or_else(|| "127.0.0.1:7001".to_string());
        let peers = parse_peers(&lookup("PEERS").unwrap_or_default())?;
        let data_dir = lookup("DATA_DIR").filter(|d| !d.is_empty()).map(PathBuf::from);

        let config = Self { node_id, listen_addr, peers, data_dir, raft: RaftConfig::default() };
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| RaftError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| RaftError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.raft.validate()?;
        let mut seen = HashSet::from([self.node_id]);
        for peer in &self.peers {
            if !seen.insert(peer.id) {
                return Err(RaftError::Config(format!("node id {} listed twice", peer.id)));
            }
        }
        Ok(())
    }

    /// Every member, self included, sorted
    pub fn cluster_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.peers.iter().map(|p| p.id).collect();
        nodes.push(self.node_id);
        nodes.sort_unstable();
        nodes
    }

    pub fn tcp_channels(&self) -> PeerMap {
        self.peers
            .iter()
            .map(|p| {
                let channel: Arc<dyn PeerChannel> = Arc::new(TcpChannel::new(&p.addr));
                (p.id, channel)
            })
            .collect()
    }
}

/// `2@10.0.0.2:7001,3@10.0.0.3:7001`
fn parse_peers(list: &str) -> Result<Vec<PeerAddr>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|item| -> Result<PeerAddr> {
            let (id, addr) = item
                .split_once('@')
                .ok_or_else(|| RaftError::Config(format!("peer '{}' is not id@host:port", item)))?;
            let id = id
                .parse::<NodeId>()
                .map_err(|e| RaftError::Config(format!("peer id '{}': {}", id, e)))?;
            Ok(PeerAddr { id, addr: addr.to_string() })
        })
        .collect()
}
