use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use thiserror::Error;

use super::node::RaftNode;
use super::NodeId;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("peer {0} unreachable")]
    Unreachable(NodeId),
    #[error("rpc failed: {0}")]
    Rpc(String),
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub term: u64,
    pub command: Bytes,
}

#[derive(Debug, Clone)]
pub struct VoteRequest {
    pub from: NodeId,
    pub to: NodeId,
    pub term: u64,
    pub last_log_index: i64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone)]
pub struct VoteReply {
    pub from: NodeId,
    pub to: NodeId,
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub from: NodeId,
    pub to: NodeId,
    pub term: u64,
    pub prev_index: i64,
    pub prev_term: u64,
    pub commit_index: i64,
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone)]
pub struct AppendReply {
    pub from: NodeId,
    pub to: NodeId,
    pub term: u64,
    pub entry_appended: bool,
    pub match_index: i64,
}

/// Peer RPC channel used by the consensus node.
///
/// The production implementation is gRPC (`grpc::GrpcTransport`); tests drive
/// whole clusters through `MemoryNetwork` instead.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn request_vote(
        &self,
        to: &str,
        request: VoteRequest,
    ) -> Result<VoteReply, TransportError>;

    async fn append_entries(
        &self,
        to: &str,
        request: AppendRequest,
    ) -> Result<AppendReply, TransportError>;
}

/// In-process transport wiring `RaftNode`s directly to each other.
///
/// Nodes can be isolated to simulate crashes and partitions: calls from or to
/// an isolated node fail with `Unreachable`.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<RwLock<MemoryNetworkInner>>,
}

#[derive(Default)]
struct MemoryNetworkInner {
    nodes: HashMap<NodeId, Arc<RaftNode>>,
    down: HashSet<NodeId>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: Arc<RaftNode>) {
        let mut inner = self.inner.write().unwrap();
        inner.nodes.insert(node.id().to_string(), node);
    }

    pub fn isolate(&self, id: &str) {
        self.inner.write().unwrap().down.insert(id.to_string());
    }

    pub fn restore(&self, id: &str) {
        self.inner.write().unwrap().down.remove(id);
    }

    fn lookup(&self, from: &str, to: &str) -> Result<Arc<RaftNode>, TransportError> {
        let inner = self.inner.read().unwrap();
        if inner.down.contains(from) || inner.down.contains(to) {
            return Err(TransportError::Unreachable(to.to_string()));
        }
        inner
            .nodes
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(to.to_string()))
    }
}

#[async_trait]
impl PeerTransport for MemoryNetwork {
    async fn request_vote(
        &self,
        to: &str,
        request: VoteRequest,
    ) -> Result<VoteReply, TransportError> {
        let node = self.lookup(&request.from, to)?;
        Ok(node.handle_request_vote(request).await)
    }

    async fn append_entries(
        &self,
        to: &str,
        request: AppendRequest,
    ) -> Result<AppendReply, TransportError> {
        let node = self.lookup(&request.from, to)?;
        Ok(node.handle_append_entries(request).await)
    }
}
