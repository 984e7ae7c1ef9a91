//! # tcp
//!
//! why: carry raft rpcs between processes
//! relations: implements PeerChannel; serve_tcp feeds ConsensusEngine handlers
//! what: TcpChannel (connect per call), serve_tcp accept loop, one json RaftMessage per line

use crate::channel::{PeerChannel, TransportError};
use crate::engine::ConsensusEngine;
use async_trait::async_trait;
use raft_core::{
    AppendEntriesRequest, AppendEntriesResponse, LogStore, RaftMessage, RequestVoteRequest,
    RequestVoteResponse,
};
use std::net::SocketAddr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// longest accepted message line, newline included
pub const MAX_FRAME: u64 = 16 * 1024 * 1024;

/// read one newline-terminated frame, refusing to buffer more than `limit` bytes
async fn read_frame<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    limit: u64,
    buf: &mut String,
) -> Result<usize, TransportError> {
    let n = reader.take(limit).read_line(buf).await?;
    if n as u64 == limit && !buf.ends_with('\n') {
        return Err(TransportError::FrameTooLarge(limit));
    }
    Ok(n)
}

/// Outbound rpcs to one peer address
#[derive(Debug, Clone)]
pub struct TcpChannel {
    addr: String,
}

impl TcpChannel {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    async fn call(&self, message: RaftMessage) -> Result<RaftMessage, TransportError> {
        let stream = TcpStream::connect(&self.addr).await?;
        let (reader, mut writer) = stream.into_split();

        let mut line = serde_json::to_string(&message)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;

        let mut reader = BufReader::new(reader);
        let mut reply = String::new();
        if read_frame(&mut reader, MAX_FRAME, &mut reply).await? == 0 {
            return Err(TransportError::Closed);
        }
        Ok(serde_json::from_str(reply.trim())?)
    }
}

#[async_trait]
impl PeerChannel for TcpChannel {
    async fn request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError> {
        match self.call(RaftMessage::RequestVote(request)).await? {
            RaftMessage::RequestVoteResponse(response) => Ok(response),
            _ => Err(TransportError::UnexpectedReply("a non-vote message")),
        }
    }

    async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        match self.call(RaftMessage::AppendEntries(request)).await? {
            RaftMessage::AppendEntriesResponse(response) => Ok(response),
            _ => Err(TransportError::UnexpectedReply("a non-append message")),
        }
    }
}

/// Accept peer connections forever, answering each request line with a response line
pub async fn serve_tcp<L: LogStore + 'static>(
    listener: TcpListener,
    engine: ConsensusEngine<L>,
) -> std::io::Result<()> {
    info!(node = engine.id(), addr = %listener.local_addr()?, "peer server listening");
    loop {
        let (socket, peer_addr) = listener.accept().await?;
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, peer_addr, engine).await {
                debug!(%peer_addr, error = %e, "peer connection ended");
            }
        });
    }
}

async fn handle_connection<L: LogStore + 'static>(
    socket: TcpStream,
    peer_addr: SocketAddr,
    engine: ConsensusEngine<L>,
) -> Result<(), TransportError> {
    let (reader, mut writer) = socket.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        if read_frame(&mut reader, MAX_FRAME, &mut line).await? == 0 {
            return Ok(()); // connection closed
        }
        let message: RaftMessage = match serde_json::from_str(line.trim()) {
            Ok(message) => message,
            Err(e) => {
                warn!(%peer_addr, error = %e, "invalid message from peer");
                return Err(e.into());
            }
        };

        let reply = match message {
            RaftMessage::RequestVote(request) => match engine.handle_request_vote(request).await {
                Ok(response) => RaftMessage::RequestVoteResponse(response),
                Err(e) => {
                    warn!(%peer_addr, error = %e, "vote handler failed");
                    return Err(TransportError::Closed);
                }
            },
            RaftMessage::AppendEntries(request) => match engine.handle_append_entries(request).await {
                Ok(response) => RaftMessage::AppendEntriesResponse(response),
                Err(e) => {
                    warn!(%peer_addr, error = %e, "append handler failed");
                    return Err(TransportError::Closed);
                }
            },
            RaftMessage::RequestVoteResponse(_) | RaftMessage::AppendEntriesResponse(_) => {
                return Err(TransportError::UnexpectedReply("a response where a request belongs"));
            }
        };

        let mut out = serde_json::to_string(&reply)?;
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_split_on_newlines() {
        let mut input: &[u8] = b"{\"a\":1}\n{\"b\":2}\n";
        let mut line = String::new();
        assert_eq!(read_frame(&mut input, 64, &mut line).await.unwrap(), 8);
        assert_eq!(line, "{\"a\":1}\n");
        line.clear();
        read_frame(&mut input, 64, &mut line).await.unwrap();
        assert_eq!(line, "{\"b\":2}\n");
        line.clear();
        assert_eq!(read_frame(&mut input, 64, &mut line).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn oversized_frame_is_refused() {
        let long = vec![b'x'; 100];
        let mut input: &[u8] = &long;
        let mut line = String::new();
        let err = read_frame(&mut input, 32, &mut line).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge(32)));
        assert_eq!(line.len(), 32);
    }
}
