//! # channel
//!
//! why: hide how a request reaches a peer so the engine only sees request -> response
//! relations: implemented by local.rs (in-process) and tcp.rs (json lines), called by engine.rs
//! what: PeerChannel trait, TransportError, deadline helper

use async_trait::async_trait;
use raft_core::{
    AppendEntriesRequest, AppendEntriesResponse, NodeId, RequestVoteRequest, RequestVoteResponse,
};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Why an outbound rpc produced no response. Every variant is retryable.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("rpc timed out after {0:?}")]
    Timeout(Duration),

    #[error("peer {0} is unreachable")]
    Unreachable(NodeId),

    #[error("transport io: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("peer replied with {0} where a different response was expected")]
    UnexpectedReply(&'static str),

    #[error("message line exceeds {0} bytes")]
    FrameTooLarge(u64),

    #[error("connection closed before a reply arrived")]
    Closed,
}

/// One outbound connection to one peer
#[async_trait]
pub trait PeerChannel: Send + Sync {
    async fn request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError>;

    async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError>;
}

/// bound a channel call; an elapsed deadline becomes `TransportError::Timeout`
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(deadline)),
    }
}
