use bytes::Bytes;
use serde::Serialize;

use crate::state_machine::CommandOutcome;

pub mod grpc;
pub mod node;
pub mod transport;

pub use node::{RaftNode, RaftStatus, RaftTiming};
pub use transport::{
    AppendReply, AppendRequest, Entry, MemoryNetwork, PeerTransport, TransportError, VoteReply,
    VoteRequest,
};

pub type NodeId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

/// One slot in the replicated log.
///
/// `result` is filled by the applier after commit; the leader hands it to the
/// submitter that is waiting on this index.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub term: u64,
    pub command: Bytes,
    pub result: Option<CommandOutcome>,
}
