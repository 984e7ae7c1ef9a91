//! raft-node: run a consensus cluster member, or a whole cluster in one process
//!
//! `raft-node local` simulates a cluster over in-process channels and walks through an
//! election, replication and a leader failover. `raft-node serve` runs one member over TCP;
//! every line typed on stdin is submitted as a command.

use clap::{Parser, Subcommand};
use raft_core::{LogIndex, LogStore, NodeId, NodeState, RaftConfig, RaftNode};
use raft_runtime::{serve_tcp, ClusterConfig, ConsensusEngine, LocalNetwork};
use raft_storage::FileStorage;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "raft-node", version, about = "Replicated log consensus node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate a cluster inside this process
    Local {
        /// Number of nodes
        #[arg(long, default_value_t = 3)]
        nodes: u64,

        /// Commands to submit through the first leader
        #[arg(long, default_value_t = 5)]
        commands: usize,

        /// Isolate the leader afterwards and show a re-election
        #[arg(long)]
        failover: bool,
    },
    /// Run one member over TCP (configured from NODE_ID / LISTEN_ADDR / PEERS / DATA_DIR)
    Serve {
        /// JSON cluster config, used instead of the environment
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Local { nodes, commands, failover } => run_local(nodes, commands, failover).await,
        Commands::Serve { config } => run_serve(config).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn logging_state_machine(node: NodeId) -> impl FnMut(LogIndex, &[u8]) + Send + 'static {
    move |index: LogIndex, command: &[u8]| {
        info!(node, index, command = %String::from_utf8_lossy(command), "applied");
    }
}

// -- in-process cluster --

async fn run_local(nodes: u64, commands: usize, failover: bool) -> Result<(), BoxError> {
    if nodes == 0 {
        return Err("a cluster needs at least one node".into());
    }
    let ids: Vec<NodeId> = (1..=nodes).collect();
    let network = LocalNetwork::new();
    let mut engines = Vec::with_capacity(ids.len());

    for &id in &ids {
        let node = RaftNode::with_config(id, ids.clone(), RaftConfig::default());
        let engine = ConsensusEngine::new(node, network.peers_for(id, &ids), logging_state_machine(id))?;
        network.register(engine.clone());
        engine.start();
        engines.push(engine);
    }

    let leader = wait_for_leader(&engines, None).await.ok_or("no leader elected")?;
    info!(leader, "cluster has a leader");

    for i in 0..commands {
        let command = format!("SET key{} value{}", i, i).into_bytes();
        if !engines[index_of(leader)].submit_command(command).await? {
            warn!(leader, "leader refused a command");
        }
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    if failover && nodes > 2 {
        info!(leader, "isolating leader");
        network.isolate(leader);
        let next = wait_for_leader(&engines, Some(leader)).await.ok_or("no new leader elected")?;
        info!(leader = next, "new leader elected");
        engines[index_of(next)].submit_command(b"SET after failover".to_vec()).await?;

        network.heal(leader);
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    for engine in &engines {
        engine.dump_log().await?;
        engine.shutdown();
    }
    Ok(())
}

fn index_of(id: NodeId) -> usize {
    (id - 1) as usize
}

/// poll until exactly one reachable leader is visible, ignoring `excluded`
async fn wait_for_leader<L: LogStore + 'static>(
    engines: &[ConsensusEngine<L>],
    excluded: Option<NodeId>,
) -> Option<NodeId> {
    for _ in 0..100 {
        let mut leaders = Vec::new();
        for engine in engines {
            if Some(engine.id()) == excluded {
                continue;
            }
            if engine.status().await.role == NodeState::Leader {
                leaders.push(engine.id());
            }
        }
        if let [leader] = leaders.as_slice() {
            return Some(*leader);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    None
}

// -- tcp member --

async fn run_serve(config_path: Option<PathBuf>) -> Result<(), BoxError> {
    let config = match config_path {
        Some(path) => ClusterConfig::from_json_file(path)?,
        None => ClusterConfig::from_env()?,
    };
    info!(node = config.node_id, peers = config.peers.len(), "loaded cluster config");

    match config.data_dir.clone() {
        Some(dir) => {
            let store = FileStorage::new(dir)?;
            serve_member(config, store).await
        }
        None => {
            warn!("DATA_DIR not set, log will not survive restarts");
            serve_member(config, raft_core::MemLog::new()).await
        }
    }
}

async fn serve_member<L: LogStore + 'static>(config: ClusterConfig, store: L) -> Result<(), BoxError> {
    let node = RaftNode::with_store(config.node_id, config.cluster_nodes(), config.raft.clone(), store)?;
    let engine = ConsensusEngine::new(node, config.tcp_channels(), logging_state_machine(config.node_id))?;
    let listener = TcpListener::bind(&config.listen_addr).await?;
    engine.start();

    let submitter = engine.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match submitter.submit_command(line.as_bytes().to_vec()).await {
                Ok(true) => info!("command accepted"),
                Ok(false) => {
                    let leader = submitter.current_leader().await;
                    warn!(?leader, "not the leader, command refused");
                }
                Err(e) => warn!(error = %e, "submit failed"),
            }
        }
    });

    tokio::select! {
        served = serve_tcp(listener, engine.clone()) => served?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            engine.shutdown();
            engine.dump_log().await?;
        }
    }
    Ok(())
}
