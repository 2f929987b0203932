use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status};
use tracing::debug;

use super::node::RaftNode;
use super::transport::{
    AppendReply, AppendRequest, Entry, PeerTransport, TransportError, VoteReply, VoteRequest,
};
use super::NodeId;

pub mod raft_proto {
    tonic::include_proto!("raft");
}

use raft_proto::raft_service_client::RaftServiceClient;
use raft_proto::raft_service_server::{RaftService, RaftServiceServer};

/// Peer-facing gRPC server, delegating to the local consensus node.
pub struct RaftGrpcService {
    node: Arc<RaftNode>,
}

impl RaftGrpcService {
    pub fn new(node: Arc<RaftNode>) -> Self {
        Self { node }
    }

    pub fn into_server(self) -> RaftServiceServer<Self> {
        RaftServiceServer::new(self)
    }
}

#[tonic::async_trait]
impl RaftService for RaftGrpcService {
    async fn request_vote(
        &self,
        request: Request<raft_proto::RequestVoteRequest>,
    ) -> Result<Response<raft_proto::RequestVoteReply>, Status> {
        let reply = self
            .node
            .handle_request_vote(request.into_inner().into())
            .await;
        Ok(Response::new(reply.into()))
    }

    async fn append_entries(
        &self,
        request: Request<raft_proto::AppendEntriesRequest>,
    ) -> Result<Response<raft_proto::AppendEntriesReply>, Status> {
        let reply = self
            .node
            .handle_append_entries(request.into_inner().into())
            .await;
        Ok(Response::new(reply.into()))
    }
}

/// gRPC transport to the other replicas, with cached channels.
///
/// A failed call drops the cached channel so the next attempt reconnects;
/// unreachable peers surface as `TransportError` and are retried by the
/// consensus node on its next tick.
pub struct GrpcTransport {
    endpoints: HashMap<NodeId, String>,
    clients: Mutex<HashMap<NodeId, RaftServiceClient<Channel>>>,
    connect_timeout: Duration,
}

impl GrpcTransport {
    pub fn new(endpoints: HashMap<NodeId, String>) -> Self {
        GrpcTransport {
            endpoints,
            clients: Mutex::new(HashMap::new()),
            connect_timeout: Duration::from_secs(1),
        }
    }

    async fn client_for(&self, to: &str) -> Result<RaftServiceClient<Channel>, TransportError> {
        if let Some(client) = self.clients.lock().await.get(to) {
            return Ok(client.clone());
        }

        let addr = self
            .endpoints
            .get(to)
            .ok_or_else(|| TransportError::Unreachable(to.to_string()))?;
        let endpoint = Endpoint::from_shared(format!("http://{}", addr))
            .map_err(|e| TransportError::Rpc(e.to_string()))?
            .connect_timeout(self.connect_timeout);
        let channel = endpoint
            .connect()
            .await
            .map_err(|_| TransportError::Unreachable(to.to_string()))?;
        let client = RaftServiceClient::new(channel);
        self.clients
            .lock()
            .await
            .insert(to.to_string(), client.clone());
        debug!(peer = %to, addr = %addr, "connected to peer");
        Ok(client)
    }

    async fn evict(&self, to: &str) {
        self.clients.lock().await.remove(to);
    }
}

#[async_trait]
impl PeerTransport for GrpcTransport {
    async fn request_vote(
        &self,
        to: &str,
        request: VoteRequest,
    ) -> Result<VoteReply, TransportError> {
        let mut client = self.client_for(to).await?;
        match client
            .request_vote(raft_proto::RequestVoteRequest::from(request))
            .await
        {
            Ok(response) => Ok(response.into_inner().into()),
            Err(status) => {
                self.evict(to).await;
                Err(TransportError::Rpc(status.to_string()))
            }
        }
    }

    async fn append_entries(
        &self,
        to: &str,
        request: AppendRequest,
    ) -> Result<AppendReply, TransportError> {
        let mut client = self.client_for(to).await?;
        match client
            .append_entries(raft_proto::AppendEntriesRequest::from(request))
            .await
        {
            Ok(response) => Ok(response.into_inner().into()),
            Err(status) => {
                self.evict(to).await;
                Err(TransportError::Rpc(status.to_string()))
            }
        }
    }
}

// Wire <-> transport message conversions.

impl From<raft_proto::RequestVoteRequest> for VoteRequest {
    fn from(m: raft_proto::RequestVoteRequest) -> Self {
        VoteRequest {
            from: m.from,
            to: m.to,
            term: m.term,
            last_log_index: m.last_log_index,
            last_log_term: m.last_log_term,
        }
    }
}

impl From<VoteRequest> for raft_proto::RequestVoteRequest {
    fn from(m: VoteRequest) -> Self {
        raft_proto::RequestVoteRequest {
            from: m.from,
            to: m.to,
            term: m.term,
            last_log_index: m.last_log_index,
            last_log_term: m.last_log_term,
        }
    }
}

impl From<raft_proto::RequestVoteReply> for VoteReply {
    fn from(m: raft_proto::RequestVoteReply) -> Self {
        VoteReply {
            from: m.from,
            to: m.to,
            term: m.term,
            vote_granted: m.vote_granted,
        }
    }
}

impl From<VoteReply> for raft_proto::RequestVoteReply {
    fn from(m: VoteReply) -> Self {
        raft_proto::RequestVoteReply {
            from: m.from,
            to: m.to,
            term: m.term,
            vote_granted: m.vote_granted,
        }
    }
}

impl From<raft_proto::AppendEntriesRequest> for AppendRequest {
    fn from(m: raft_proto::AppendEntriesRequest) -> Self {
        AppendRequest {
            from: m.from,
            to: m.to,
            term: m.term,
            prev_index: m.prev_index,
            prev_term: m.prev_term,
            commit_index: m.commit_index,
            entries: m
                .entries
                .into_iter()
                .map(|e| Entry {
                    term: e.term,
                    command: Bytes::from(e.command),
                })
                .collect(),
        }
    }
}

impl From<AppendRequest> for raft_proto::AppendEntriesRequest {
    fn from(m: AppendRequest) -> Self {
        raft_proto::AppendEntriesRequest {
            from: m.from,
            to: m.to,
            term: m.term,
            prev_index: m.prev_index,
            prev_term: m.prev_term,
            commit_index: m.commit_index,
            entries: m
                .entries
                .into_iter()
                .map(|e| raft_proto::LogEntry {
                    term: e.term,
                    command: e.command.to_vec(),
                })
                .collect(),
        }
    }
}

impl From<raft_proto::AppendEntriesReply> for AppendReply {
    fn from(m: raft_proto::AppendEntriesReply) -> Self {
        AppendReply {
            from: m.from,
            to: m.to,
            term: m.term,
            entry_appended: m.entry_appended,
            match_index: m.match_index,
        }
    }
}

impl From<AppendReply> for raft_proto::AppendEntriesReply {
    fn from(m: AppendReply) -> Self {
        raft_proto::AppendEntriesReply {
            from: m.from,
            to: m.to,
            term: m.term,
            entry_appended: m.entry_appended,
            match_index: m.match_index,
        }
    }
}
