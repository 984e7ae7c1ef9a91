//! # config
//!
//! why: one place for protocol timing and batching knobs
//! relations: held by RaftNode, read by raft-runtime's scheduler and engine
//! what: RaftConfig with defaults, json loading, validation

use crate::error::{RaftError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing configuration, all durations in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// lower bound of the randomized election timeout
    pub election_timeout_min: u64,
    /// upper bound (exclusive) of the randomized election timeout
    pub election_timeout_max: u64,
    /// how often a leader sends AppendEntries to every peer
    pub heartbeat_interval: u64,
    /// deadline for a single outbound rpc
    pub rpc_timeout: u64,
    /// cap on entries carried by one AppendEntries
    pub max_entries_per_append: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            rpc_timeout: 100,
            max_entries_per_append: 64,
        }
    }
}

impl RaftConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| RaftError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(RaftError::Config(format!(
                "election_timeout_min ({}) must be below election_timeout_max ({})",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval == 0 || self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::Config(format!(
                "heartbeat_interval ({}) must be non-zero and below election_timeout_min ({})",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.rpc_timeout == 0 {
            return Err(RaftError::Config("rpc_timeout must be non-zero".into()));
        }
        if self.max_entries_per_append == 0 {
            return Err(RaftError::Config("max_entries_per_append must be non-zero".into()));
        }
        Ok(())
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn rpc_deadline(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }
}
