//! # raft-runtime
//!
//! why: turn the synchronous raft-core protocol into a running cluster member
//! relations: drives raft-core's RaftNode, persists through raft-storage or MemLog
//! what: ConsensusEngine, ElectionScheduler, PeerChannel transports, cluster config

pub mod channel;
pub mod config;
pub mod engine;
pub mod local;
pub mod scheduler;
pub mod state_machine;
pub mod tcp;

pub use channel::{PeerChannel, TransportError};
pub use config::{ClusterConfig, PeerAddr};
pub use engine::{ConsensusEngine, PeerMap};
pub use local::{LocalChannel, LocalNetwork};
pub use scheduler::{ElectionScheduler, Tick};
pub use state_machine::StateMachine;
pub use tcp::{serve_tcp, TcpChannel};
